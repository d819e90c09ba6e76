use crate::error::ChannelError;
use std::{
  collections::VecDeque,
  future::Future,
  sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
  },
};
use tokio::sync::Notify;

/* ---------------------------------------------------------- */
/// Ordered, unbounded queue of messages with a single sequential consumer.
/// One instance serves exactly one relay direction; enqueue order equals
/// dequeue order, and the consumer awaits each handler to completion before
/// taking the next message.
#[derive(Debug)]
pub struct DirectionalChannel<T> {
  inner: Arc<ChannelInner<T>>,
}

#[derive(Debug)]
struct ChannelInner<T> {
  queue: Mutex<VecDeque<T>>,
  notify: Notify,
  closed: AtomicBool,
  consumer_active: AtomicBool,
}

impl<T> Clone for DirectionalChannel<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T> Default for DirectionalChannel<T> {
  fn default() -> Self {
    Self {
      inner: Arc::new(ChannelInner {
        queue: Mutex::new(VecDeque::new()),
        notify: Notify::new(),
        closed: AtomicBool::new(false),
        consumer_active: AtomicBool::new(false),
      }),
    }
  }
}

impl<T> DirectionalChannel<T> {
  /// Append a message. Never blocks; fails only once the channel is closed.
  pub fn enqueue(&self, message: T) -> Result<(), ChannelError> {
    if self.inner.closed.load(Ordering::SeqCst) {
      return Err(ChannelError::Closed);
    }
    self.lock_queue().push_back(message);
    self.inner.notify.notify_one();
    Ok(())
  }

  /// Number of buffered (not yet dequeued) messages
  pub fn len(&self) -> usize {
    self.lock_queue().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock_queue().is_empty()
  }

  /// Atomically discard all buffered messages without running the consumer.
  pub fn drain(&self) -> Vec<T> {
    self.lock_queue().drain(..).collect()
  }

  /// Atomically discard everything buffered and refill with `messages` in
  /// order, returning the discarded backlog. A single critical section covers
  /// the discard and the refill, so no concurrent enqueue can land between
  /// the two. Used while re-injecting the prelude after a reconnect.
  pub fn replace(&self, messages: impl IntoIterator<Item = T>) -> Result<Vec<T>, ChannelError> {
    if self.inner.closed.load(Ordering::SeqCst) {
      return Err(ChannelError::Closed);
    }
    let stale = {
      let mut queue = self.lock_queue();
      let stale = queue.drain(..).collect();
      queue.extend(messages);
      stale
    };
    self.inner.notify.notify_one();
    Ok(stale)
  }

  /// Close the channel. The consumer finishes the remaining buffered messages
  /// and returns; further enqueues fail.
  pub fn close(&self) {
    self.inner.closed.store(true, Ordering::SeqCst);
    self.inner.notify.notify_waiters();
  }

  pub fn is_closed(&self) -> bool {
    self.inner.closed.load(Ordering::SeqCst)
  }

  /// Dequeue messages in insertion order, awaiting `handler` for each before
  /// taking the next. Returns once the channel is closed and emptied, or with
  /// the handler's first error. At most one consumer may run at a time.
  pub async fn run_consumer<H, Fut, E>(&self, mut handler: H) -> Result<(), E>
  where
    H: FnMut(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: From<ChannelError>,
  {
    if self.inner.consumer_active.swap(true, Ordering::SeqCst) {
      return Err(ChannelError::ConsumerActive.into());
    }
    let result = self.consume(&mut handler).await;
    self.inner.consumer_active.store(false, Ordering::SeqCst);
    result
  }

  async fn consume<H, Fut, E>(&self, handler: &mut H) -> Result<(), E>
  where
    H: FnMut(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
  {
    loop {
      let next = self.lock_queue().pop_front();
      match next {
        Some(message) => handler(message).await?,
        None => {
          if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
          }
          // a permit is stored if enqueue raced the empty check
          self.inner.notify.notified().await;
        }
      }
    }
  }

  fn lock_queue(&self) -> MutexGuard<'_, VecDeque<T>> {
    self.inner.queue.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/* ---------------------------------------------------------- */
#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn consumer_preserves_enqueue_order() {
    let channel = DirectionalChannel::default();
    for i in 0..100 {
      channel.enqueue(format!("msg-{i}")).unwrap();
    }
    channel.close();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let result: Result<(), ChannelError> = channel
      .run_consumer(move |message| {
        let sink = sink.clone();
        async move {
          sink.lock().unwrap().push(message);
          Ok(())
        }
      })
      .await;
    assert!(result.is_ok());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 100);
    for (i, message) in seen.iter().enumerate() {
      assert_eq!(message, &format!("msg-{i}"));
    }
  }

  #[tokio::test]
  async fn handler_execution_is_serialized() {
    let channel = DirectionalChannel::default();
    for i in 0..20 {
      channel.enqueue(i.to_string()).unwrap();
    }
    channel.close();

    let in_flight = Arc::new(AtomicBool::new(false));
    let flag = in_flight.clone();
    let result: Result<(), ChannelError> = channel
      .run_consumer(move |_message| {
        let flag = flag.clone();
        async move {
          assert!(!flag.swap(true, Ordering::SeqCst), "handlers overlapped");
          tokio::time::sleep(Duration::from_millis(1)).await;
          flag.store(false, Ordering::SeqCst);
          Ok(())
        }
      })
      .await;
    assert!(result.is_ok());
  }

  #[tokio::test]
  async fn consumer_wakes_on_late_enqueue() {
    let channel = DirectionalChannel::default();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let consumer = tokio::spawn({
      let channel = channel.clone();
      let sink = seen.clone();
      async move {
        channel
          .run_consumer(move |message| {
            let sink = sink.clone();
            async move {
              sink.lock().unwrap().push(message);
              Ok::<(), ChannelError>(())
            }
          })
          .await
      }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    channel.enqueue("late".to_string()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    channel.close();

    consumer.await.unwrap().unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), ["late".to_string()]);
  }

  #[tokio::test]
  async fn drain_discards_buffered_messages() {
    let channel = DirectionalChannel::default();
    channel.enqueue("a".to_string()).unwrap();
    channel.enqueue("b".to_string()).unwrap();
    assert_eq!(channel.len(), 2);

    let drained = channel.drain();
    assert_eq!(drained, ["a".to_string(), "b".to_string()]);
    assert!(channel.is_empty());
  }

  #[tokio::test]
  async fn replace_swaps_the_backlog_for_the_new_contents() {
    let channel = DirectionalChannel::default();
    channel.enqueue("a".to_string()).unwrap();
    channel.enqueue("b".to_string()).unwrap();

    let stale = channel.replace(["x".to_string(), "y".to_string()]).unwrap();
    assert_eq!(stale, ["a".to_string(), "b".to_string()]);
    assert_eq!(channel.drain(), ["x".to_string(), "y".to_string()]);

    channel.close();
    assert_eq!(channel.replace(["z".to_string()]), Err(ChannelError::Closed));
  }

  #[tokio::test]
  async fn enqueue_after_close_fails() {
    let channel = DirectionalChannel::default();
    channel.close();
    assert_eq!(channel.enqueue("x".to_string()), Err(ChannelError::Closed));
  }

  #[tokio::test]
  async fn second_consumer_is_rejected() {
    let channel = DirectionalChannel::<String>::default();
    let first = tokio::spawn({
      let channel = channel.clone();
      async move {
        channel
          .run_consumer(|_message| async move { Ok::<(), ChannelError>(()) })
          .await
      }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second: Result<(), ChannelError> = channel.run_consumer(|_message| async move { Ok(()) }).await;
    assert_eq!(second, Err(ChannelError::ConsumerActive));

    channel.close();
    first.await.unwrap().unwrap();
  }
}
