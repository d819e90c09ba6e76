use crate::{
  constants::{RETRY_BACKOFF_FACTOR, RETRY_BASE_DELAY_MSEC},
  trace::*,
};
use std::{future::Future, time::Duration};

/* ---------------------------------------------------------- */
/// Retry schedule for a fallible operation.
///
/// `max_attempts` counts the initial attempt; `None` retries forever. The
/// schedule is linear and uncapped on purpose: an unbounded connectivity
/// retry is how the bridge waits for an upstream that has not started yet.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  max_attempts: Option<u32>,
  base_delay: Duration,
  backoff_factor: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::unbounded()
  }
}

impl RetryPolicy {
  /// Retry forever with the default linear backoff.
  pub fn unbounded() -> Self {
    Self {
      max_attempts: None,
      base_delay: Duration::from_millis(RETRY_BASE_DELAY_MSEC),
      backoff_factor: RETRY_BACKOFF_FACTOR,
    }
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = Some(max_attempts);
    self
  }

  pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
    self.base_delay = base_delay;
    self
  }

  pub fn with_backoff_factor(mut self, backoff_factor: u32) -> Self {
    self.backoff_factor = backoff_factor;
    self
  }

  /// Delay before the given retry (0-based). The first retry is never
  /// instantaneous: it sleeps the full base delay.
  fn delay_before_retry(&self, retry_index: u32) -> Duration {
    self.base_delay + self.base_delay * self.backoff_factor * retry_index
  }
}

/* ---------------------------------------------------------- */
/// Failure of a retried operation.
#[derive(thiserror::Error, Debug)]
pub enum RetryError<E>
where
  E: std::error::Error + 'static,
{
  /// Attempts were exhausted under a finite policy; wraps the last failure
  #[error("too many retries (max={max_attempts}): {source}")]
  Exhausted { max_attempts: u32, source: E },

  /// The error class did not match the retry predicate; never retried
  #[error(transparent)]
  Unmatched(E),
}

/* ---------------------------------------------------------- */
/// Drive `op` under `policy`, retrying failures matched by `is_retryable`.
/// Success returns immediately; a non-matching failure propagates untouched.
pub async fn run<T, E, F, Fut, P>(policy: &RetryPolicy, is_retryable: P, mut op: F) -> Result<T, RetryError<E>>
where
  E: std::error::Error + 'static,
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  P: Fn(&E) -> bool,
{
  let mut attempt: u32 = 0;
  loop {
    attempt = attempt.saturating_add(1);
    let err = match op().await {
      Ok(value) => return Ok(value),
      Err(e) if !is_retryable(&e) => return Err(RetryError::Unmatched(e)),
      Err(e) => e,
    };
    if let Some(max_attempts) = policy.max_attempts {
      if attempt >= max_attempts {
        return Err(RetryError::Exhausted { max_attempts, source: err });
      }
    }
    let delay = policy.delay_before_retry(attempt - 1);
    debug!("retry: attempt {attempt} failed ({err}), next in {delay:?}");
    tokio::time::sleep(delay).await;
  }
}

/// Same retry semantics for a blocking target; each attempt runs on the
/// blocking pool so the backoff sleep stays a cancellable suspension point.
pub async fn run_blocking<T, E, F, P>(policy: &RetryPolicy, is_retryable: P, op: F) -> Result<T, RetryError<E>>
where
  T: Send + 'static,
  E: std::error::Error + Send + 'static,
  F: Fn() -> Result<T, E> + Clone + Send + 'static,
  P: Fn(&E) -> bool,
{
  run(policy, is_retryable, move || {
    let op = op.clone();
    async move {
      match tokio::task::spawn_blocking(op).await {
        Ok(result) => result,
        Err(join_error) => match join_error.try_into_panic() {
          Ok(panic) => std::panic::resume_unwind(panic),
          // only reachable while the runtime is shutting down
          Err(join_error) => panic!("blocking retry target aborted: {join_error}"),
        },
      }
    }
  })
  .await
}

/* ---------------------------------------------------------- */
