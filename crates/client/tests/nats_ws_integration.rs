use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use dentika_client::realtime::nats_ws::NatsWsConnector;
use dentika_client::realtime::{
    BusConnection, BusConnector, ConnectionEvent, ConnectionManager, Credentials, DisconnectReason,
    ReconnectPolicy, RealtimeSettings, TransportError,
};
use dentika_common::protocol::envelope::InboundMessage;
use dentika_common::protocol::subjects::{subject_matches, Channel};
use dentika_common::types::Identity;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const TOKEN: &str = "secret-token";

/// Minimal NATS server speaking the text protocol over WebSocket.
#[derive(Clone)]
struct FakeNats {
    max_payload: u64,
    bus: broadcast::Sender<(String, Vec<u8>)>,
    kick: broadcast::Sender<()>,
    connections: Arc<Mutex<usize>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
}

impl FakeNats {
    fn new(max_payload: u64) -> Self {
        let (bus, _) = broadcast::channel(64);
        let (kick, _) = broadcast::channel(4);
        Self { max_payload, bus, kick, connections: Arc::default(), subscriptions: Arc::default() }
    }

    fn connections(&self) -> usize {
        *self.connections.lock().unwrap()
    }

    fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }
}

enum ClientFrame {
    Connect(Value),
    Pub(String, Vec<u8>),
    Sub(String, u64),
    Unsub(u64),
    Ping,
    Pong,
}

fn next_client_frame(buffer: &mut Vec<u8>) -> Option<ClientFrame> {
    let end = buffer.windows(2).position(|w| w == b"\r\n")?;
    let line = String::from_utf8(buffer[..end].to_vec()).expect("client sends UTF-8 control lines");
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default().to_ascii_uppercase();

    if verb == "PUB" {
        let subject = parts.next().expect("PUB subject").to_string();
        let len: usize = parts.next().expect("PUB size").parse().expect("numeric PUB size");
        let start = end + 2;
        if buffer.len() < start + len + 2 {
            return None;
        }
        let payload = buffer[start..start + len].to_vec();
        buffer.drain(..start + len + 2);
        return Some(ClientFrame::Pub(subject, payload));
    }

    buffer.drain(..end + 2);
    let frame = match verb.as_str() {
        "CONNECT" => ClientFrame::Connect(serde_json::from_str(line[7..].trim()).expect("CONNECT json")),
        "SUB" => {
            let subject = parts.next().expect("SUB subject").to_string();
            ClientFrame::Sub(subject, parts.next().expect("SUB sid").parse().expect("numeric sid"))
        }
        "UNSUB" => ClientFrame::Unsub(parts.next().expect("UNSUB sid").parse().expect("numeric sid")),
        "PING" => ClientFrame::Ping,
        "PONG" => ClientFrame::Pong,
        other => panic!("unexpected client op {other}"),
    };
    Some(frame)
}

async fn upgrade(ws: WebSocketUpgrade, State(server): State<FakeNats>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, server))
}

async fn send_text(socket: &mut WebSocket, text: &str) -> bool {
    socket.send(Message::Text(text.to_string().into())).await.is_ok()
}

async fn serve_socket(mut socket: WebSocket, server: FakeNats) {
    *server.connections.lock().unwrap() += 1;
    let info = format!(r#"INFO {{"server_id":"fake","version":"2.10.0","max_payload":{}}}"#, server.max_payload);
    if !send_text(&mut socket, &format!("{info}\r\n")).await {
        return;
    }

    let mut published = server.bus.subscribe();
    let mut kick = server.kick.subscribe();
    let mut buffer = Vec::new();
    let mut subs: HashMap<u64, String> = HashMap::new();

    loop {
        tokio::select! {
            frame = socket.recv() => {
                let Some(Ok(frame)) = frame else { return };
                match frame {
                    Message::Binary(bytes) => buffer.extend_from_slice(&bytes),
                    Message::Text(text) => buffer.extend_from_slice(text.as_bytes()),
                    Message::Close(_) => return,
                    _ => continue,
                }
                while let Some(op) = next_client_frame(&mut buffer) {
                    match op {
                        ClientFrame::Connect(options) => {
                            if options.get("auth_token").and_then(Value::as_str) != Some(TOKEN) {
                                send_text(&mut socket, "-ERR 'Authorization Violation'\r\n").await;
                                return;
                            }
                        }
                        ClientFrame::Ping => {
                            send_text(&mut socket, "PONG\r\n").await;
                        }
                        ClientFrame::Pong => {}
                        ClientFrame::Sub(subject, sid) => {
                            server.subscriptions.lock().unwrap().push(subject.clone());
                            subs.insert(sid, subject);
                        }
                        ClientFrame::Unsub(sid) => {
                            subs.remove(&sid);
                        }
                        ClientFrame::Pub(subject, payload) => {
                            let _ = server.bus.send((subject, payload));
                        }
                    }
                }
            }
            Ok((subject, payload)) = published.recv() => {
                for (sid, pattern) in &subs {
                    if !subject_matches(pattern, &subject) {
                        continue;
                    }
                    let mut frame = format!("MSG {subject} {sid} {}\r\n", payload.len()).into_bytes();
                    frame.extend_from_slice(&payload);
                    frame.extend_from_slice(b"\r\n");
                    if socket.send(Message::Binary(frame.into())).await.is_err() {
                        return;
                    }
                }
            }
            Ok(()) = kick.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        }
    }
}

async fn start_server(server: FakeNats) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");
    let app = Router::new().route("/", get(upgrade)).with_state(server);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("fake nats server should run");
    });
    addr
}

fn credentials() -> Credentials {
    Credentials::new(TOKEN, Identity::new("7"))
}

async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for connection event")
        .expect("event channel should stay open")
}

#[tokio::test]
async fn manager_round_trips_notifications_over_nats_ws() {
    let server = FakeNats::new(1 << 20);
    let addr = start_server(server.clone()).await;

    let manager = ConnectionManager::new(NatsWsConnector::new(), RealtimeSettings::new(format!("ws://{addr}/")));
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.set_router(move |channel, message| {
        let _ = tx.send((channel, message));
    });

    manager.initialize(credentials()).await;
    assert!(manager.is_connected(), "manager should reach Connected");
    assert_eq!(manager.live_subjects().len(), 5);
    assert!(server.subscriptions().contains(&"dentika.user.7.notifications".to_string()));

    let notification = json!({ "id": 99, "title": "Lab results", "message": "ready" });
    assert!(manager.publish_user_notification("7", &notification).await);

    let (channel, message) = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for echoed notification")
        .expect("router channel should stay open");
    assert_eq!(channel, Channel::UserNotifications);
    let InboundMessage::Direct(raw) = message else {
        panic!("bare notification should decode as a direct message");
    };
    assert_eq!(raw.get("title"), Some(&json!("Lab results")));

    manager.disconnect().await;
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn bad_token_is_rejected_during_handshake() {
    let server = FakeNats::new(1 << 20);
    let addr = start_server(server).await;

    let result = NatsWsConnector::new().connect(&format!("ws://{addr}/"), "wrong").await;
    match result {
        Err(TransportError::Rejected(message)) => assert!(message.contains("Authorization")),
        Err(other) => panic!("expected rejection, got {other}"),
        Ok(_) => panic!("expected rejection, got a session"),
    }
}

#[tokio::test]
async fn unreachable_endpoint_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = NatsWsConnector::new().connect(&format!("ws://{addr}/"), TOKEN).await;
    assert!(matches!(result, Err(TransportError::Connect { .. })));
}

#[tokio::test]
async fn oversized_publish_is_refused_locally() {
    let server = FakeNats::new(16);
    let addr = start_server(server).await;

    let connection = NatsWsConnector::new().connect(&format!("ws://{addr}/"), TOKEN).await.expect("handshake");
    assert_eq!(connection.server_info().max_payload, Some(16));
    let error = connection.publish("dentika.x", vec![b'a'; 64]).await.unwrap_err();
    assert!(matches!(error, TransportError::Rejected(_)));
    assert!(connection.publish("dentika.x", b"{}".to_vec()).await.is_ok());
}

#[tokio::test]
async fn server_close_triggers_reconnect() {
    let server = FakeNats::new(1 << 20);
    let addr = start_server(server.clone()).await;

    let policy = ReconnectPolicy { base_delay: Duration::from_millis(50), ..ReconnectPolicy::default() };
    let manager = ConnectionManager::new(
        NatsWsConnector::new(),
        RealtimeSettings::new(format!("ws://{addr}/")).with_reconnect_policy(policy),
    );
    manager.set_router(|_, _| {});
    let mut events = manager.events();
    manager.initialize(credentials()).await;
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

    server.kick.send(()).expect("server socket should be listening for kicks");

    assert!(matches!(
        next_event(&mut events).await,
        ConnectionEvent::Disconnected { reason: DisconnectReason::Transport(_) }
    ));
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::ReconnectScheduled { attempt: 1, .. }));
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
    assert!(manager.is_connected());
    assert_eq!(server.connections(), 2);

    manager.disconnect().await;
}
