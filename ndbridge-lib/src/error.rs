use crate::retry::RetryError;
use tokio_tungstenite::tungstenite;

/// Errors that happen during the bridge operation
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
  /* --------------------------------------- */
  #[error("WebSocket error: {0}")]
  WebSocketError(#[from] tungstenite::Error),

  /* --------------------------------------- */
  #[error("Failed to bind the listen address: {0}")]
  BindError(RetryError<std::io::Error>),

  /// The upstream connect cycle failed with a non-retryable error
  #[error("Upstream connect failed: {0}")]
  UpstreamConnectError(RetryError<ConnectError>),

  /* --------------------------------------- */
  #[error("Message channel error: {0}")]
  ChannelError(#[from] ChannelError),

  #[error("Invalid address: {0}")]
  InvalidAddress(String),

  /// The bridge was cancelled while an operation was in flight
  #[error("Bridge stopped")]
  Stopped,
}

/// Errors of a directional message channel
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ChannelError {
  /// Enqueue on a channel that has been closed
  #[error("Channel closed")]
  Closed,

  /// A second consumer was started while one is still active
  #[error("Channel already has an active consumer")]
  ConsumerActive,
}

/// Errors of the upstream target locator
#[derive(thiserror::Error, Debug)]
pub enum LocatorError {
  /// The introspection endpoint could not be reached; the retryable class
  /// while waiting for an upstream that has not started yet
  #[error("Upstream introspection endpoint unreachable: {0}")]
  Unreachable(#[source] reqwest::Error),

  #[error("Introspection request failed: {0}")]
  RequestFailed(#[source] reqwest::Error),

  #[error("Malformed target list: {0}")]
  MalformedTargetList(String),

  #[error("Upstream reported no debug targets")]
  NoTargets,
}

impl LocatorError {
  pub fn is_connectivity(&self) -> bool {
    matches!(self, LocatorError::Unreachable(_))
  }
}

/// One attempt of the upstream connect cycle: target discovery followed by the
/// websocket handshake. Rediscovery is part of the cycle since the target id
/// changes when the upstream restarts.
#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
  #[error("Target discovery failed: {0}")]
  Discovery(#[from] RetryError<LocatorError>),

  #[error("WebSocket handshake failed: {0}")]
  Handshake(#[from] tungstenite::Error),
}

impl ConnectError {
  /// Timeouts and handshake-level failures restart the cycle; discovery
  /// failures have already exhausted their own (connectivity-only) retries.
  pub(crate) fn is_retryable(&self) -> bool {
    match self {
      ConnectError::Discovery(_) => false,
      ConnectError::Handshake(e) => matches!(
        e,
        tungstenite::Error::Io(_)
          | tungstenite::Error::Tls(_)
          | tungstenite::Error::Http(_)
          | tungstenite::Error::HttpFormat(_)
          | tungstenite::Error::Protocol(_)
      ),
    }
  }
}
