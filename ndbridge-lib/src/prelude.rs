use crate::{
  channel::DirectionalChannel,
  error::ChannelError,
  message::{SESSION_START_METHOD, method_of},
  trace::*,
};

/// Captures the client's session-initialization messages so they can be
/// replayed into a freshly reconnected upstream.
///
/// The prelude is every client frame up to and including the session-start
/// sentinel. A debug target accepts that handshake only once per connection,
/// so replaying it brings a restarted upstream to the state the client
/// originally negotiated, without the client resending anything.
#[derive(Debug)]
pub struct PreludeRecorder {
  messages: Vec<String>,
  complete: bool,
  replay_enabled: bool,
}

impl PreludeRecorder {
  pub fn new(replay_enabled: bool) -> Self {
    Self {
      messages: Vec::new(),
      complete: false,
      replay_enabled,
    }
  }

  /// Record a client frame. Once the session-start sentinel is seen the
  /// capture is complete and further frames are ignored.
  pub fn observe(&mut self, message: &str) {
    if self.complete {
      return;
    }
    self.messages.push(message.to_owned());
    if method_of(message).as_deref() == Some(SESSION_START_METHOD) {
      self.complete = true;
      debug!("prelude capture complete ({} messages)", self.messages.len());
    }
  }

  pub fn is_complete(&self) -> bool {
    self.complete
  }

  pub fn len(&self) -> usize {
    self.messages.len()
  }

  pub fn is_empty(&self) -> bool {
    self.messages.is_empty()
  }

  /// Discard whatever is buffered in `channel` and re-enqueue the captured
  /// sequence in original order, as one atomic swap; `wrap` converts each
  /// frame into the channel's payload. No-op when replay is disabled.
  pub fn replay_into<T>(
    &self,
    channel: &DirectionalChannel<T>,
    wrap: impl FnMut(String) -> T,
  ) -> Result<(), ChannelError> {
    if !self.replay_enabled {
      debug!("prelude replay disabled");
      return Ok(());
    }
    let stale = channel.replace(self.messages.iter().cloned().map(wrap))?;
    if !stale.is_empty() {
      debug!("discarded {} stale buffered messages before replay", stale.len());
    }
    info!("replayed {} prelude messages", self.messages.len());
    Ok(())
  }
}
