use crate::{
  BridgeServerBuilder, Endpoint,
  message::{CONSOLE_API_METHOD, CONTEXT_DESTROYED_METHOD, SESSION_START_METHOD},
};
use futures::{SinkExt, StreamExt};
use std::{
  net::SocketAddr,
  sync::{Arc, Mutex},
  time::Duration,
};
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  net::{TcpListener, TcpStream},
  sync::mpsc,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;

/* ---------------------------------------------------------- */
/// In-process stand-in for an inspector process: serves `/json/list` over
/// plain HTTP and accepts websocket sessions on the same listener, recording
/// every text frame per connection. Connections can be dropped abruptly to
/// simulate an upstream restart.
struct FakeInspector {
  endpoint: Endpoint,
  target_id: String,
  received: Arc<Mutex<Vec<Vec<String>>>>,
  current_tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
  kill: Arc<Mutex<CancellationToken>>,
  discovery_delay: Arc<Mutex<Duration>>,
}

impl FakeInspector {
  async fn spawn() -> Arc<Self> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let inspector = Arc::new(Self {
      endpoint: Endpoint::from(addr),
      target_id: "c0ffee42-target".to_string(),
      received: Arc::new(Mutex::new(Vec::new())),
      current_tx: Arc::new(Mutex::new(None)),
      kill: Arc::new(Mutex::new(CancellationToken::new())),
      discovery_delay: Arc::new(Mutex::new(Duration::ZERO)),
    });
    tokio::spawn(inspector.clone().serve(listener));
    inspector
  }

  async fn serve(self: Arc<Self>, listener: TcpListener) {
    loop {
      let (stream, _) = listener.accept().await.unwrap();
      tokio::spawn(self.clone().handle_connection(stream));
    }
  }

  async fn handle_connection(self: Arc<Self>, mut stream: TcpStream) {
    // peek the request head to tell introspection lookups from websockets
    let mut buf = [0u8; 4096];
    let head_len = loop {
      let n = stream.peek(&mut buf).await.unwrap();
      if let Some(pos) = find_subsequence(&buf[..n], b"\r\n\r\n") {
        break pos + 4;
      }
    };
    let head = String::from_utf8_lossy(&buf[..head_len]).to_string();

    if head.starts_with("GET /json/list") {
      let delay = *self.discovery_delay.lock().unwrap();
      if !delay.is_zero() {
        tokio::time::sleep(delay).await;
      }
      let mut consumed = vec![0u8; head_len];
      stream.read_exact(&mut consumed).await.unwrap();
      let body = format!(
        r#"[{{"id":"{id}","type":"node","title":"fake-target","webSocketDebuggerUrl":"ws://{ep}/{id}"}}]"#,
        id = self.target_id,
        ep = self.endpoint
      );
      let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
      );
      stream.write_all(response.as_bytes()).await.unwrap();
      stream.shutdown().await.unwrap();
      return;
    }

    let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *self.current_tx.lock().unwrap() = Some(tx);
    let connection = {
      let mut logs = self.received.lock().unwrap();
      logs.push(Vec::new());
      logs.len() - 1
    };
    let kill = self.kill.lock().unwrap().clone();

    loop {
      tokio::select! {
        // abrupt drop, no close handshake
        _ = kill.cancelled() => return,
        outbound = rx.recv() => match outbound {
          Some(frame) => {
            let _ = sink.send(WsMessage::text(frame)).await;
          }
          None => return,
        },
        inbound = source.next() => match inbound {
          Some(Ok(WsMessage::Text(frame))) => {
            self.received.lock().unwrap()[connection].push(frame.as_str().to_owned());
          }
          Some(Ok(WsMessage::Close(_))) | None => return,
          Some(Ok(_)) => {}
          Some(Err(_)) => return,
        },
      }
    }
  }

  fn connections(&self) -> usize {
    self.received.lock().unwrap().len()
  }

  fn frames(&self, connection: usize) -> Vec<String> {
    self.received.lock().unwrap().get(connection).cloned().unwrap_or_default()
  }

  /// Send a frame on the currently active websocket connection
  fn send(&self, frame: &str) {
    self
      .current_tx
      .lock()
      .unwrap()
      .as_ref()
      .expect("no active upstream connection")
      .send(frame.to_owned())
      .unwrap();
  }

  /// Stall the next introspection lookup, keeping a reconnect in flight
  fn set_discovery_delay(&self, delay: Duration) {
    *self.discovery_delay.lock().unwrap() = delay;
  }

  /// Drop all live websocket connections without a close handshake
  fn drop_connections(&self) {
    let mut kill = self.kill.lock().unwrap();
    kill.cancel();
    *kill = CancellationToken::new();
  }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  haystack.windows(needle.len()).position(|window| window == needle)
}

/* ---------------------------------------------------------- */
type ClientConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_bridge(upstream: Endpoint) -> (SocketAddr, CancellationToken) {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();

  let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let listen_on = probe.local_addr().unwrap();
  drop(probe);

  let server = BridgeServerBuilder::default()
    .listen_on(listen_on)
    .upstream(upstream)
    .build()
    .unwrap();
  let cancel_token = CancellationToken::new();
  tokio::spawn({
    let token = cancel_token.clone();
    async move { server.start(token).await }
  });

  // wait until the listener answers
  loop {
    match TcpStream::connect(listen_on).await {
      Ok(_) => break,
      Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
    }
  }
  (listen_on, cancel_token)
}

async fn attach_client(listen_on: SocketAddr) -> ClientConnection {
  let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{listen_on}/")).await.unwrap();
  ws
}

async fn next_text(client: &mut ClientConnection) -> String {
  loop {
    let next = tokio::time::timeout(Duration::from_secs(10), client.next())
      .await
      .expect("timed out waiting for a downstream frame");
    match next {
      Some(Ok(WsMessage::Text(frame))) => return frame.as_str().to_owned(),
      Some(Ok(_)) => continue,
      other => panic!("downstream connection ended: {other:?}"),
    }
  }
}

async fn wait_until(what: &str, predicate: impl Fn() -> bool) {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
  while !predicate() {
    assert!(tokio::time::Instant::now() < deadline, "timed out waiting until {what}");
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
}

fn frame_with_method(id: u32, method: &str) -> String {
  format!(r#"{{"id":{id},"method":"{method}"}}"#)
}

/* ---------------------------------------------------------- */
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relays_frames_in_both_directions_in_order() {
  let inspector = FakeInspector::spawn().await;
  let (listen_on, cancel_token) = start_bridge(inspector.endpoint.clone()).await;
  let mut client = attach_client(listen_on).await;

  for id in 1..=3 {
    client
      .send(WsMessage::text(frame_with_method(id, "Debugger.enable")))
      .await
      .unwrap();
  }
  wait_until("upstream received all frames", || inspector.frames(0).len() == 3).await;
  assert_eq!(
    inspector.frames(0),
    [
      frame_with_method(1, "Debugger.enable"),
      frame_with_method(2, "Debugger.enable"),
      frame_with_method(3, "Debugger.enable"),
    ]
  );

  inspector.send(r#"{"id":1,"result":{}}"#);
  inspector.send(r#"{"id":2,"result":{}}"#);
  assert_eq!(next_text(&mut client).await, r#"{"id":1,"result":{}}"#);
  assert_eq!(next_text(&mut client).await, r#"{"id":2,"result":{}}"#);

  cancel_token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_client_is_rejected_while_a_session_is_active() {
  let inspector = FakeInspector::spawn().await;
  let (listen_on, cancel_token) = start_bridge(inspector.endpoint.clone()).await;
  let _client = attach_client(listen_on).await;

  let second = tokio_tungstenite::connect_async(format!("ws://{listen_on}/")).await;
  assert!(second.is_err(), "second client should not complete the handshake");

  cancel_token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnects_and_replays_the_prelude_after_upstream_loss() {
  let inspector = FakeInspector::spawn().await;
  let (listen_on, cancel_token) = start_bridge(inspector.endpoint.clone()).await;
  let mut client = attach_client(listen_on).await;

  let prelude = [
    frame_with_method(1, "Debugger.enable"),
    frame_with_method(2, "Runtime.enable"),
    frame_with_method(3, SESSION_START_METHOD),
  ];
  for frame in &prelude {
    client.send(WsMessage::text(frame.clone())).await.unwrap();
  }
  wait_until("upstream received the prelude", || inspector.frames(0).len() == 3).await;

  inspector.drop_connections();

  // the bridge reconnects on its own and replays the captured prelude
  wait_until("bridge reconnected", || inspector.connections() == 2).await;
  wait_until("prelude replayed", || inspector.frames(1).len() == 3).await;
  assert_eq!(inspector.frames(1), prelude);

  // the client is told about the restart with a synthetic console event
  let notification = next_text(&mut client).await;
  assert!(notification.contains(CONSOLE_API_METHOD));
  assert!(notification.contains("%cDebug server restarted"));

  cancel_token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replayed_prelude_precedes_frames_sent_during_reconnect() {
  let inspector = FakeInspector::spawn().await;
  let (listen_on, cancel_token) = start_bridge(inspector.endpoint.clone()).await;
  let mut client = attach_client(listen_on).await;

  let prelude = [
    frame_with_method(1, "Debugger.enable"),
    frame_with_method(2, SESSION_START_METHOD),
  ];
  for frame in &prelude {
    client.send(WsMessage::text(frame.clone())).await.unwrap();
  }
  wait_until("upstream received the prelude", || inspector.frames(0).len() == 2).await;

  // stall the rediscovery so a client frame arrives while the reconnect is
  // still in flight; that frame belongs to the lost generation and must not
  // reach the new socket ahead of the replayed prelude
  inspector.set_discovery_delay(Duration::from_millis(500));
  inspector.drop_connections();
  tokio::time::sleep(Duration::from_millis(100)).await;
  client
    .send(WsMessage::text(frame_with_method(3, "Debugger.resume")))
    .await
    .unwrap();

  wait_until("bridge reconnected", || inspector.connections() == 2).await;
  let notification = next_text(&mut client).await;
  assert!(notification.contains(CONSOLE_API_METHOD));

  // traffic after the restart notification flows normally, behind the replay
  client
    .send(WsMessage::text(frame_with_method(4, "Debugger.resume")))
    .await
    .unwrap();
  wait_until("post-reconnect frame relayed", || inspector.frames(1).len() == 3).await;
  assert_eq!(
    inspector.frames(1),
    [
      prelude[0].clone(),
      prelude[1].clone(),
      frame_with_method(4, "Debugger.resume"),
    ]
  );

  cancel_token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn context_destroyed_is_swallowed_and_triggers_reconnect() {
  let inspector = FakeInspector::spawn().await;
  let (listen_on, cancel_token) = start_bridge(inspector.endpoint.clone()).await;
  let mut client = attach_client(listen_on).await;

  client
    .send(WsMessage::text(frame_with_method(1, SESSION_START_METHOD)))
    .await
    .unwrap();
  wait_until("session started upstream", || inspector.frames(0).len() == 1).await;

  inspector.send(&format!(r#"{{"method":"{CONTEXT_DESTROYED_METHOD}","params":{{}}}}"#));

  // the sentinel is not forwarded; the bridge closes upstream and reconnects
  wait_until("bridge reconnected", || inspector.connections() == 2).await;
  let next = next_text(&mut client).await;
  assert!(!next.contains(CONTEXT_DESTROYED_METHOD));
  assert!(next.contains(CONSOLE_API_METHOD));

  cancel_token.cancel();
}
