use crate::{
  bridge::Bridge,
  constants::TCP_BACKLOG,
  endpoint::Endpoint,
  error::BridgeError,
  retry::{self, RetryPolicy},
  socket::bind_tcp_socket,
  trace::*,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpStream, sync::Semaphore};
use tokio_util::sync::CancellationToken;

/* ---------------------------------------------------------- */
#[derive(Debug, Clone, derive_builder::Builder)]
/// Single-client bridge server
pub struct BridgeServer {
  /// Listen socket address
  listen_on: SocketAddr,
  /// Upstream inspector endpoint
  upstream: Endpoint,
  /// Replay the captured session prelude into a reconnected upstream
  #[builder(default = "true")]
  replay_prelude: bool,
  /// Tokio runtime handler
  #[builder(default = "tokio::runtime::Handle::current()")]
  runtime_handle: tokio::runtime::Handle,
  /// One permit: a debugging session is exclusive to a single client
  #[builder(setter(skip), default = "Arc::new(Semaphore::new(1))")]
  session_slot: Arc<Semaphore>,
}

impl BridgeServer {
  /// Start the bridge server serving the given listen address
  pub async fn start(&self, cancel_token: CancellationToken) -> Result<(), BridgeError> {
    info!("Starting bridge server on {} -> {}", self.listen_on, self.upstream);

    // a port transiently held by a previous instance clears after a few retries
    let policy = RetryPolicy::unbounded();
    let listen_on = self.listen_on;
    let listener = retry::run(&policy, |_| true, move || async move {
      bind_tcp_socket(&listen_on)?.listen(TCP_BACKLOG)
    })
    .await
    .map_err(BridgeError::BindError)?;

    let listener_service = async {
      loop {
        let (stream, src_addr) = match listener.accept().await {
          Ok(res) => res,
          Err(e) => {
            error!("Error in TCP listener: {e}");
            continue;
          }
        };
        debug!("Accepted TCP connection from: {src_addr}");

        // only one client may drive a debugging session at a time
        let Ok(permit) = self.session_slot.clone().try_acquire_owned() else {
          warn!("Another client is already attached, rejecting connection from {src_addr}");
          drop(stream);
          continue;
        };

        let server = self.clone();
        let child_token = cancel_token.child_token();
        self.runtime_handle.spawn(async move {
          if let Err(e) = server.serve_client(stream, child_token).await {
            error!("Session for {src_addr} failed: {e}");
          }
          drop(permit);
        });
      }
    };

    tokio::select! {
      _ = listener_service => {
        error!("Bridge listener service exited");
      }
      _ = cancel_token.cancelled() => {
        debug!("Bridge listener cancelled");
      }
    }
    Ok(())
  }

  /// Upgrade the accepted stream to a websocket and run the relay session
  /// until the client disconnects or the session is cancelled.
  async fn serve_client(&self, stream: TcpStream, cancel_token: CancellationToken) -> Result<(), BridgeError> {
    let client_ws = tokio_tungstenite::accept_async(stream).await?;
    info!("Debugging client attached");

    let bridge = Arc::new(Bridge::new(self.upstream.clone(), self.replay_prelude, cancel_token));
    let result = bridge.clone().run_session(client_ws).await;
    bridge.shutdown().await;
    info!("Debugging session ended");
    result
  }
}
