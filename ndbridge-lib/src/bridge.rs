use crate::{
  channel::DirectionalChannel,
  constants::UPSTREAM_CONNECT_TIMEOUT_MSEC,
  endpoint::Endpoint,
  error::{BridgeError, ConnectError, LocatorError},
  locator::TargetLocator,
  message::{CONTEXT_DESTROYED_METHOD, console_log_event, method_of},
  prelude::PreludeRecorder,
  retry::{self, RetryPolicy},
  trace::*,
};

use futures::{
  FutureExt, SinkExt, StreamExt,
  stream::{SplitSink, SplitStream},
};
use std::sync::{
  Arc, Mutex, MutexGuard,
  atomic::{AtomicBool, AtomicU64, Ordering},
};
use tokio::{
  net::TcpStream,
  time::{Duration, timeout},
};
use tokio_tungstenite::{
  MaybeTlsStream, WebSocketStream, connect_async,
  tungstenite::{self, Message as WsMessage, error::ProtocolError},
};
use tokio_util::sync::CancellationToken;

/* ---------------------------------------------------------- */
/// Downstream (accepted) websocket stream
pub(crate) type ClientWs = WebSocketStream<TcpStream>;
/// Upstream (dialed) websocket stream
type ServerWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

type ClientSink = SplitSink<ClientWs, WsMessage>;
type ServerSink = SplitSink<ServerWs, WsMessage>;
type ServerSource = SplitStream<ServerWs>;

/* ---------------------------------------------------------- */
/// Client frame queued toward the upstream, tagged with the generation it
/// was captured under. A frame outliving its generation is dropped at send
/// time; the replayed prelude has already superseded it on the new socket.
#[derive(Debug)]
struct OutboundFrame {
  generation: u64,
  frame: String,
}

/* ---------------------------------------------------------- */
/// Relay core for one downstream debugging session.
///
/// Owns both websocket connections, the two directional channels and the
/// prelude buffer. The upstream side is replaced in place on every reconnect
/// (a "generation"); the downstream side lives as long as the session. All
/// mutation happens on the bridge's own tasks; the consumers only read the
/// current upstream handle at send time and tolerate it being stale, since a
/// failed send is itself the disconnect signal.
pub struct Bridge {
  upstream: Endpoint,

  client_sink: tokio::sync::Mutex<Option<ClientSink>>,
  server_sink: tokio::sync::Mutex<Option<ServerSink>>,

  prelude: Mutex<PreludeRecorder>,

  /// client -> server direction
  client_queue: DirectionalChannel<OutboundFrame>,
  /// server -> client direction
  server_queue: DirectionalChannel<String>,

  /// Cancellation handle of the current generation's upstream read loop
  server_reader: Mutex<Option<CancellationToken>>,
  /// Bumped after every successful upstream connect
  generation: AtomicU64,
  /// Serializes reconnects; the loser of a trigger race becomes a no-op
  reconnect_gate: tokio::sync::Mutex<()>,

  consumers_started: AtomicBool,
  cancel_token: CancellationToken,
}

impl Bridge {
  pub fn new(upstream: Endpoint, replay_prelude: bool, cancel_token: CancellationToken) -> Self {
    Self {
      upstream,
      client_sink: tokio::sync::Mutex::new(None),
      server_sink: tokio::sync::Mutex::new(None),
      prelude: Mutex::new(PreludeRecorder::new(replay_prelude)),
      client_queue: DirectionalChannel::default(),
      server_queue: DirectionalChannel::default(),
      server_reader: Mutex::new(None),
      generation: AtomicU64::new(0),
      reconnect_gate: tokio::sync::Mutex::new(()),
      consumers_started: AtomicBool::new(false),
      cancel_token,
    }
  }

  /// Run one downstream session to completion: connect upstream, start both
  /// relay directions, then read the client socket until it closes.
  pub async fn run_session(self: Arc<Self>, client_ws: ClientWs) -> Result<(), BridgeError> {
    let (sink, mut source) = client_ws.split();
    *self.client_sink.lock().await = Some(sink);

    self.clone().server_connect().await?;
    self.start_consumers();

    loop {
      let next = tokio::select! {
        _ = self.cancel_token.cancelled() => return Ok(()),
        next = source.next() => next,
      };
      match next {
        Some(Ok(WsMessage::Text(frame))) => {
          let frame = frame.as_str().to_owned();
          {
            let mut prelude = self.lock_prelude();
            prelude.observe(&frame);
          }
          let generation = self.generation.load(Ordering::SeqCst);
          self.client_queue.enqueue(OutboundFrame { generation, frame })?;
        }
        Some(Ok(WsMessage::Close(_))) | None => {
          info!("downstream client disconnected");
          return Ok(());
        }
        // ping/pong are answered by the protocol layer
        Some(Ok(_)) => {}
        Some(Err(e)) => {
          debug!("downstream receive failed: {e}");
          return Ok(());
        }
      }
    }
  }

  /// Tear the session down: stop both consumers, cancel the upstream reader
  /// and close both sockets. Idempotent.
  pub async fn shutdown(&self) {
    self.cancel_token.cancel();
    self.client_queue.close();
    self.server_queue.close();
    if let Some(reader) = self.lock_server_reader().take() {
      reader.cancel();
    }
    if let Some(mut sink) = self.server_sink.lock().await.take() {
      let _ = sink.close().await;
    }
    if let Some(mut sink) = self.client_sink.lock().await.take() {
      let _ = sink.close().await;
    }
    debug!("bridge session shut down");
  }

  /* ---------------------------------------------------------- */

  fn start_consumers(self: &Arc<Self>) {
    if self.consumers_started.swap(true, Ordering::SeqCst) {
      return;
    }

    let bridge = Arc::clone(self);
    tokio::spawn(async move {
      let handler_bridge = Arc::clone(&bridge);
      let result = bridge
        .client_queue
        .run_consumer(move |message| {
          let bridge = Arc::clone(&handler_bridge);
          async move { bridge.forward_to_server(message).await }
        })
        .await;
      bridge.stop_on_fatal("client->server", result);
    });

    let bridge = Arc::clone(self);
    tokio::spawn(async move {
      let handler_bridge = Arc::clone(&bridge);
      let result = bridge
        .server_queue
        .run_consumer(move |message| {
          let bridge = Arc::clone(&handler_bridge);
          async move { bridge.forward_to_client(message).await }
        })
        .await;
      bridge.stop_on_fatal("server->client", result);
    });
  }

  /// An unmatched error class is fatal to the session and surfaced to the
  /// operator; cancellation is a clean stop.
  fn stop_on_fatal(&self, direction: &str, result: Result<(), BridgeError>) {
    match result {
      Ok(()) => debug!("{direction} consumer finished"),
      Err(BridgeError::Stopped) => {}
      Err(e) => {
        error!("{direction} relay failed: {e}");
        self.cancel_token.cancel();
      }
    }
  }

  /// client -> server channel handler. The generation check runs under the
  /// sink lock, where sink and generation only ever change together: a frame
  /// captured under a superseded generation is dropped instead of leaking
  /// onto the new socket ahead of the replayed prelude. A send failure
  /// against the current generation is the disconnect signal that triggers
  /// reconnection.
  async fn forward_to_server(self: Arc<Self>, outbound: OutboundFrame) -> Result<(), BridgeError> {
    let send_result = {
      let mut guard = self.server_sink.lock().await;
      if outbound.generation != self.generation.load(Ordering::SeqCst) {
        debug!("dropping a client frame from a superseded upstream generation");
        return Ok(());
      }
      match guard.as_mut() {
        Some(sink) => sink.send(WsMessage::text(outbound.frame)).await,
        None => Err(tungstenite::Error::AlreadyClosed),
      }
    };
    match send_result {
      Ok(()) => Ok(()),
      Err(e) if is_disconnect(&e) => {
        info!("upstream send observed a closed socket, reconnecting");
        self.server_reconnect(outbound.generation).await
      }
      Err(e) => Err(BridgeError::WebSocketError(e)),
    }
  }

  /// server -> client channel handler. The target-destroyed sentinel is never
  /// forwarded; it converts into a proactive upstream close so target
  /// teardown funnels through the same path as an unexpected disconnect.
  async fn forward_to_client(self: Arc<Self>, message: String) -> Result<(), BridgeError> {
    if method_of(&message).as_deref() == Some(CONTEXT_DESTROYED_METHOD) {
      info!("upstream execution context destroyed, closing connection to server");
      let mut guard = self.server_sink.lock().await;
      if let Some(sink) = guard.as_mut() {
        if let Err(e) = sink.close().await {
          debug!("upstream close failed: {e}");
        }
      }
      return Ok(());
    }

    let mut guard = self.client_sink.lock().await;
    match guard.as_mut() {
      None => {
        warn!("no downstream client attached, dropping upstream message");
        Ok(())
      }
      Some(sink) => match sink.send(WsMessage::text(message)).await {
        Ok(()) => Ok(()),
        Err(e) if is_disconnect(&e) => {
          debug!("downstream send observed a closed socket: {e}");
          Ok(())
        }
        Err(e) => Err(BridgeError::WebSocketError(e)),
      },
    }
  }

  /* ---------------------------------------------------------- */

  /// Resolve the current target and open a fresh upstream websocket,
  /// retrying indefinitely while the upstream is unreachable. Cancelling the
  /// bridge aborts the wait.
  async fn server_connect(self: Arc<Self>) -> Result<(), BridgeError> {
    let connect = self.clone().server_connect_inner();
    tokio::select! {
      _ = self.cancel_token.cancelled() => Err(BridgeError::Stopped),
      result = connect => result,
    }
  }

  async fn server_connect_inner(self: Arc<Self>) -> Result<(), BridgeError> {
    let policy = RetryPolicy::unbounded();
    let upstream = self.upstream.clone();

    let (server_ws, _response) = retry::run(&policy, ConnectError::is_retryable, move || {
      let locator = TargetLocator::new(upstream.clone());
      async move {
        // the discovery lookup is blocking and carries its own unbounded
        // connectivity-only retry; this is how the bridge waits for an
        // upstream that has not started yet
        let lookup = locator.clone();
        let target_id = retry::run_blocking(&policy, LocatorError::is_connectivity, move || lookup.current_target()).await?;

        let uri = locator.websocket_uri(&target_id);
        debug!("bridge: server_connect: {uri}");
        match timeout(Duration::from_millis(UPSTREAM_CONNECT_TIMEOUT_MSEC), connect_async(uri)).await {
          Ok(result) => Ok::<_, ConnectError>(result?),
          Err(_elapsed) => Err(tungstenite::Error::Io(std::io::ErrorKind::TimedOut.into()).into()),
        }
      }
    })
    .await
    .map_err(BridgeError::UpstreamConnectError)?;

    let (sink, source) = server_ws.split();

    // the whole swap happens under the sink lock: the previous reader is
    // released before the new socket is installed (two live readers must
    // never race on the same channel), and sink and generation change
    // together so the send path sees them consistently
    let generation = {
      let mut sink_guard = self.server_sink.lock().await;
      if let Some(previous) = self.lock_server_reader().take() {
        previous.cancel();
      }
      *sink_guard = Some(sink);

      let reader_token = self.cancel_token.child_token();
      *self.lock_server_reader() = Some(reader_token.clone());
      let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

      let bridge = Arc::clone(&self);
      tokio::spawn(async move { bridge.server_read_loop(generation, source, reader_token).await });
      generation
    };

    info!("connected to upstream inspector (generation {generation})");
    Ok(())
  }

  /// Reconnect after generation `observed_generation` was lost, replay the
  /// prelude and notify the client. Both relay directions can observe the
  /// same loss; the gate collapses concurrent triggers into one reconnect.
  // boxed to break the async recursion cycle through `server_read_loop`
  fn server_reconnect(
    self: Arc<Self>,
    observed_generation: u64,
  ) -> futures::future::BoxFuture<'static, Result<(), BridgeError>> {
    async move {
      let _gate = self.reconnect_gate.lock().await;
      if self.generation.load(Ordering::SeqCst) != observed_generation {
        debug!("reconnect already handled by the other direction");
        return Ok(());
      }

      self.clone().server_connect().await?;

      // tag replayed frames with the fresh generation; stale client frames
      // already queued (or in the consumer's hand) carry the old one and are
      // either swapped out here or dropped at send time
      let generation = self.generation.load(Ordering::SeqCst);
      {
        let prelude = self.lock_prelude();
        prelude.replay_into(&self.client_queue, |frame| OutboundFrame { generation, frame })?;
      }

      // sent directly on the downstream socket, ahead of any relayed traffic
      // still queued behind the replay
      let notification = console_log_event(&["%cDebug server restarted", "color: red; font-weight: bold"]);
      let mut guard = self.client_sink.lock().await;
      if let Some(sink) = guard.as_mut() {
        if let Err(e) = sink.send(WsMessage::text(notification)).await {
          debug!("failed to deliver restart notification: {e}");
        }
      }
      Ok(())
      }
    .boxed()
  }

  /// Read loop for one upstream generation. Ends when superseded (cancelled)
  /// or on upstream loss, which triggers the reconnect of its own generation.
  async fn server_read_loop(self: Arc<Self>, generation: u64, mut source: ServerSource, cancel: CancellationToken) {
    loop {
      let next = tokio::select! {
        _ = cancel.cancelled() => return,
        next = source.next() => next,
      };
      match next {
        Some(Ok(WsMessage::Text(frame))) => {
          if let Err(e) = self.server_queue.enqueue(frame.as_str().to_owned()) {
            debug!("server->client channel closed: {e}");
            return;
          }
        }
        Some(Ok(WsMessage::Close(_))) | None => {
          info!("upstream socket closed (generation {generation})");
          self.trigger_reconnect(generation).await;
          return;
        }
        Some(Ok(_)) => {}
        Some(Err(e)) if is_disconnect(&e) => {
          info!("upstream receive observed a closed socket: {e}");
          self.trigger_reconnect(generation).await;
          return;
        }
        Some(Err(e)) => {
          error!("upstream receive failed: {e}");
          self.cancel_token.cancel();
          return;
        }
      }
    }
  }

  async fn trigger_reconnect(self: &Arc<Self>, generation: u64) {
    match self.clone().server_reconnect(generation).await {
      Ok(()) => {}
      Err(BridgeError::Stopped) => {}
      Err(e) => {
        error!("upstream reconnect failed: {e}");
        self.cancel_token.cancel();
      }
    }
  }

  /* ---------------------------------------------------------- */

  fn lock_prelude(&self) -> MutexGuard<'_, PreludeRecorder> {
    self.prelude.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn lock_server_reader(&self) -> MutexGuard<'_, Option<CancellationToken>> {
    self.server_reader.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/* ---------------------------------------------------------- */
/// Errors that mean "the peer is gone" rather than a programming error
fn is_disconnect(e: &tungstenite::Error) -> bool {
  matches!(
    e,
    tungstenite::Error::ConnectionClosed
      | tungstenite::Error::AlreadyClosed
      | tungstenite::Error::Io(_)
      | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)
  )
}
