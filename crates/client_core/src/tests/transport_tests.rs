use super::*;

use std::sync::Mutex as StdMutex;

use axum::{
    extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use shared::domain::JobId;
use tokio::{net::TcpListener, sync::mpsc};

type Frame = Option<String>;

/// Socket driven by the test: `Some(text)` delivers a frame, `None` closes.
struct ScriptedSocket {
    inbound: mpsc::UnboundedReceiver<Frame>,
    sent: Arc<StdMutex<Vec<String>>>,
}

#[async_trait]
impl PushSocket for ScriptedSocket {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.sent.lock().expect("sent").push(text.to_string());
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        match self.inbound.recv().await {
            Some(Some(text)) => Some(Ok(text)),
            Some(None) | None => None,
        }
    }

    async fn close(&mut self) {}
}

#[derive(Clone, Copy)]
enum Script {
    /// Every socket closes right after opening.
    CloseImmediately,
    /// Every connect attempt fails.
    Refuse,
    /// Sockets stay open until the test pushes `None`.
    Controlled,
}

struct ScriptedConnector {
    script: Script,
    attempts: Arc<StdMutex<Vec<Instant>>>,
    sent: Arc<StdMutex<Vec<String>>>,
    feeds: Arc<StdMutex<Vec<mpsc::UnboundedSender<Frame>>>>,
}

impl ScriptedConnector {
    fn new(script: Script) -> Self {
        Self {
            script,
            attempts: Arc::new(StdMutex::new(Vec::new())),
            sent: Arc::new(StdMutex::new(Vec::new())),
            feeds: Arc::new(StdMutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl PushConnector for ScriptedConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn PushSocket>, TransportError> {
        self.attempts.lock().expect("attempts").push(Instant::now());
        let (tx, rx) = mpsc::unbounded_channel();
        match self.script {
            Script::Refuse => {
                return Err(TransportError::Connect {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                })
            }
            Script::CloseImmediately => {
                let _ = tx.send(None);
            }
            Script::Controlled => {}
        }
        self.feeds.lock().expect("feeds").push(tx);
        Ok(Box::new(ScriptedSocket {
            inbound: rx,
            sent: Arc::clone(&self.sent),
        }))
    }
}

struct Harness {
    connection: PushConnection,
    tracker: ProgressTracker,
    attempts: Arc<StdMutex<Vec<Instant>>>,
    sent: Arc<StdMutex<Vec<String>>>,
    feeds: Arc<StdMutex<Vec<mpsc::UnboundedSender<Frame>>>>,
    events: broadcast::Receiver<SessionEvent>,
}

impl Harness {
    fn new(script: Script) -> Self {
        let connector = ScriptedConnector::new(script);
        let attempts = Arc::clone(&connector.attempts);
        let sent = Arc::clone(&connector.sent);
        let feeds = Arc::clone(&connector.feeds);
        let (events_tx, events) = broadcast::channel(256);
        let timings = Timings::default();
        let tracker = ProgressTracker::new(timings.completion_retention, events_tx.clone());
        let connection = PushConnection::new(
            "ws://backend.test/ws",
            Arc::new(connector),
            tracker.clone(),
            timings,
            events_tx,
        );
        Self {
            connection,
            tracker,
            attempts,
            sent,
            feeds,
            events,
        }
    }

    fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().expect("attempts").clone()
    }

    fn push(&self, frame: Frame) {
        let feeds = self.feeds.lock().expect("feeds");
        feeds
            .last()
            .expect("an open socket")
            .send(frame)
            .expect("socket alive");
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

fn gaps(attempts: &[Instant]) -> Vec<Duration> {
    attempts.windows(2).map(|pair| pair[1] - pair[0]).collect()
}

#[tokio::test(start_paused = true)]
async fn each_closure_schedules_one_reconnect_after_fixed_delay() {
    let harness = Harness::new(Script::CloseImmediately);
    harness.connection.connect().await;

    tokio::time::sleep(Duration::from_secs(10)).await;

    let attempts = harness.attempts();
    assert_eq!(attempts.len(), 4, "attempts at 0s, 3s, 6s and 9s");
    assert!(gaps(&attempts)
        .iter()
        .all(|gap| *gap == Duration::from_secs(3)));

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(harness.attempts().len(), 104, "no retry cap and no backoff");

    harness.connection.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn failed_connects_retry_without_duplicates() {
    let harness = Harness::new(Script::Refuse);
    harness.connection.connect().await;

    tokio::time::sleep(Duration::from_millis(7_500)).await;

    let attempts = harness.attempts();
    assert_eq!(attempts.len(), 3);
    assert!(gaps(&attempts)
        .iter()
        .all(|gap| *gap == Duration::from_secs(3)));
    assert_ne!(harness.connection.state(), ConnectionState::Connected);

    harness.connection.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn connect_while_connected_is_a_noop() {
    let harness = Harness::new(Script::Controlled);
    harness.connection.connect().await;
    settle().await;
    assert!(harness.connection.is_connected());

    harness.connection.connect().await;
    harness.connection.connect().await;
    settle().await;

    assert_eq!(harness.attempts().len(), 1);
    harness.connection.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_reconnect() {
    let harness = Harness::new(Script::Controlled);
    harness.connection.connect().await;
    settle().await;

    harness.push(None);
    settle().await;
    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);

    harness.connection.disconnect().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(harness.attempts().len(), 1);
    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn explicit_disconnect_is_not_followed_by_reconnect() {
    let harness = Harness::new(Script::Controlled);
    harness.connection.connect().await;
    settle().await;

    harness.connection.disconnect().await;
    assert_eq!(harness.connection.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.attempts().len(), 1);

    // A later connect starts over.
    harness.connection.connect().await;
    settle().await;
    assert_eq!(harness.attempts().len(), 2);
    assert!(harness.connection.is_connected());
    harness.connection.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn keepalive_ping_every_thirty_seconds() {
    let harness = Harness::new(Script::Controlled);
    harness.connection.connect().await;
    settle().await;

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(harness.sent.lock().expect("sent").is_empty());

    tokio::time::sleep(Duration::from_secs(66)).await;
    assert_eq!(
        *harness.sent.lock().expect("sent"),
        vec!["ping".to_string(), "ping".to_string(), "ping".to_string()]
    );
    harness.connection.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn inbound_frames_reach_tracker_and_garbage_keeps_connection() {
    let harness = Harness::new(Script::Controlled);
    harness.connection.connect().await;
    settle().await;

    harness.push(Some("pong".to_string()));
    harness.push(Some("{broken".to_string()));
    harness.push(Some(
        r#"{"type":"progress","conversion_id":"job-7","progress":30,"status":"processing","file_name":"a.pdf"}"#
            .to_string(),
    ));
    settle().await;

    assert_eq!(harness.tracker.ids().await, vec![JobId::from("job-7")]);
    assert!(harness.connection.is_connected());
    assert_eq!(harness.attempts().len(), 1);
    harness.connection.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn connection_changes_are_published() {
    let mut harness = Harness::new(Script::Controlled);
    let mut state_rx = harness.connection.subscribe_state();
    harness.connection.connect().await;
    settle().await;
    assert_eq!(*state_rx.borrow_and_update(), ConnectionState::Connected);

    harness.push(None);
    settle().await;
    harness.connection.disconnect().await;

    let mut flags = Vec::new();
    while let Ok(event) = harness.events.try_recv() {
        if let SessionEvent::ConnectionChanged { connected } = event {
            flags.push(connected);
        }
    }
    assert_eq!(flags, vec![true, false]);
}

async fn progress_socket(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        let frame = r#"{"type":"progress","conversion_id":"live-1","progress":45,"status":"processing","current_step":"ocr","file_name":"scan.png"}"#;
        if socket
            .send(AxumMessage::Text(frame.to_string()))
            .await
            .is_err()
        {
            return;
        }
        while let Some(Ok(message)) = socket.recv().await {
            if let AxumMessage::Text(text) = message {
                if text == "ping" && socket.send(AxumMessage::Text("pong".into())).await.is_err() {
                    return;
                }
            }
        }
    })
}

#[tokio::test]
async fn websocket_connector_delivers_backend_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route("/ws", get(progress_socket));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let (events_tx, _events) = broadcast::channel(64);
    let tracker = ProgressTracker::new(Duration::from_secs(5), events_tx.clone());
    let connection = PushConnection::new(
        format!("ws://{addr}/ws"),
        Arc::new(WebSocketConnector),
        tracker.clone(),
        Timings::default(),
        events_tx,
    );
    connection.connect().await;

    let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(snapshot) = tracker.snapshot(&JobId::from("live-1")).await {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("progress frame delivered");

    assert_eq!(snapshot.percent, 45);
    assert_eq!(snapshot.current_step.as_deref(), Some("ocr"));
    assert!(connection.is_connected());

    connection.disconnect().await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}
