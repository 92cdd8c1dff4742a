// NATS over WebSocket transport.
//
// Handshake: server INFO → client CONNECT {auth_token} + PING → server PONG
// (or -ERR on bad credentials). After that a reader task demultiplexes MSG
// operations by subscription id and a writer task serializes outbound
// operations onto the socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dentika_common::protocol::nats::{ClientOp, ConnectOptions, Decoder, ServerInfo, ServerOp};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::transport::{BusConnection, BusConnector, BusSubscription, TransportError};

#[derive(Debug, Clone, Default)]
pub struct NatsWsConnector;

impl NatsWsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl BusConnector for NatsWsConnector {
    type Connection = NatsWsConnection;

    async fn connect(&self, endpoint: &str, token: &str) -> Result<NatsWsConnection, TransportError> {
        let (socket, _) = connect_async(endpoint).await.map_err(|error| TransportError::Connect {
            endpoint: endpoint.to_string(),
            reason: error.to_string(),
        })?;
        let (mut sink, mut stream) = socket.split();
        let mut decoder = Decoder::new();

        let server = match read_op(&mut stream, &mut decoder).await? {
            ServerOp::Info(info) => info,
            other => return Err(TransportError::Handshake(format!("expected INFO, got {other:?}"))),
        };
        if let Some(max) = server.max_payload {
            decoder.set_max_payload(usize::try_from(max).unwrap_or(usize::MAX));
        }

        let mut hello = ClientOp::Connect(ConnectOptions::with_token(token)).encode()?;
        hello.extend(ClientOp::Ping.encode()?);
        send_frame(&mut sink, hello).await?;

        loop {
            match read_op(&mut stream, &mut decoder).await? {
                ServerOp::Pong => break,
                ServerOp::Err(message) => return Err(TransportError::Rejected(message)),
                ServerOp::Ping => send_frame(&mut sink, ClientOp::Pong.encode()?).await?,
                ServerOp::Ok | ServerOp::Info(_) | ServerOp::Msg { .. } => {}
            }
        }
        info!(server_id = %server.server_id, version = %server.version, "nats session established");

        let (closed_tx, closed_rx) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let routes: Routes = Arc::default();

        let writer = tokio::spawn(write_loop(sink, outbound_rx, closed_tx.clone()));
        let reader = tokio::spawn(read_loop(stream, decoder, routes.clone(), outbound.clone(), closed_tx.clone()));

        Ok(NatsWsConnection {
            server,
            outbound,
            routes,
            next_sid: AtomicU64::new(0),
            closed_tx,
            closed: closed_rx,
            reader,
            writer,
        })
    }
}

type Routes = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>>;

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

pub struct NatsWsConnection {
    server: ServerInfo,
    outbound: mpsc::UnboundedSender<Outbound>,
    routes: Routes,
    next_sid: AtomicU64,
    closed_tx: Arc<watch::Sender<Option<String>>>,
    closed: watch::Receiver<Option<String>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl NatsWsConnection {
    pub fn server_info(&self) -> &ServerInfo {
        &self.server
    }

    fn send(&self, op: ClientOp) -> Result<(), TransportError> {
        if self.closed.borrow().is_some() {
            return Err(TransportError::Closed);
        }
        let frame = op.encode()?;
        self.outbound.send(Outbound::Frame(frame)).map_err(|_| TransportError::Closed)
    }
}

impl BusConnection for NatsWsConnection {
    async fn subscribe(&self, subject: &str) -> Result<BusSubscription, TransportError> {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        lock_routes(&self.routes).insert(sid, sender);
        if let Err(error) = self.send(ClientOp::Sub { subject: subject.to_string(), sid }) {
            lock_routes(&self.routes).remove(&sid);
            return Err(error);
        }
        Ok(BusSubscription::new(subject, receiver))
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if let Some(max) = self.server.max_payload {
            if payload.len() as u64 > max {
                return Err(TransportError::Rejected(format!(
                    "payload of {} bytes exceeds server max_payload {max}",
                    payload.len()
                )));
            }
        }
        self.send(ClientOp::Pub { subject: subject.to_string(), payload })
    }

    async fn closed(&self) -> String {
        let mut closed = self.closed.clone();
        let reason = closed.wait_for(Option::is_some).await.ok().and_then(|reason| reason.clone());
        reason.unwrap_or_else(|| "nats session dropped".to_string())
    }

    async fn close(&self) {
        mark_closed(&self.closed_tx, "closed by client");
        let _ = self.outbound.send(Outbound::Close);
        lock_routes(&self.routes).clear();
    }
}

impl Drop for NatsWsConnection {
    fn drop(&mut self) {
        self.reader.abort();
        if self.closed.borrow().is_none() {
            self.writer.abort();
        }
    }
}

fn lock_routes(routes: &Routes) -> MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks the session closed however the reader task ends, including a panic
/// or an abort.
struct CloseOnExit {
    routes: Routes,
    closed: Arc<watch::Sender<Option<String>>>,
}

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        lock_routes(&self.routes).clear();
        mark_closed(&self.closed, "nats read loop stopped");
    }
}

/// First close reason wins.
fn mark_closed(closed: &watch::Sender<Option<String>>, reason: &str) {
    closed.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(reason.to_string());
        true
    });
}

async fn send_frame<S>(sink: &mut S, frame: Vec<u8>) -> Result<(), TransportError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    sink.send(Message::Binary(frame.into()))
        .await
        .map_err(|error| TransportError::WebSocket(error.to_string()))
}

/// Read frames until the decoder yields one complete operation.
async fn read_op<S>(stream: &mut S, decoder: &mut Decoder) -> Result<ServerOp, TransportError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        if let Some(op) = decoder.next_op()? {
            return Ok(op);
        }
        match stream.next().await {
            Some(Ok(Message::Binary(bytes))) => decoder.extend(&bytes),
            Some(Ok(Message::Text(text))) => decoder.extend(text.as_bytes()),
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(TransportError::WebSocket(format!("server closed the socket: {reason}")));
            }
            Some(Ok(_)) => {}
            Some(Err(error)) => return Err(TransportError::WebSocket(error.to_string())),
            None => return Err(TransportError::Closed),
        }
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    closed: Arc<watch::Sender<Option<String>>>,
) where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                if let Err(error) = send_frame(&mut sink, frame).await {
                    warn!(error = %error, "nats write failed");
                    mark_closed(&closed, &error.to_string());
                    return;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn read_loop<S>(
    mut stream: S,
    mut decoder: Decoder,
    routes: Routes,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: Arc<watch::Sender<Option<String>>>,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let _guard = CloseOnExit { routes: routes.clone(), closed: closed.clone() };
    let reason = loop {
        let op = match read_op(&mut stream, &mut decoder).await {
            Ok(op) => op,
            Err(error) => break error.to_string(),
        };
        match op {
            ServerOp::Msg { subject, sid, payload, .. } => {
                let mut routes = lock_routes(&routes);
                let delivered = routes.get(&sid).is_some_and(|sender| sender.send(payload).is_ok());
                if !delivered && routes.remove(&sid).is_some() {
                    debug!(subject = %subject, sid, "pruning abandoned nats subscription");
                    if let Ok(frame) = (ClientOp::Unsub { sid }).encode() {
                        let _ = outbound.send(Outbound::Frame(frame));
                    }
                }
            }
            ServerOp::Ping => {
                if let Ok(frame) = ClientOp::Pong.encode() {
                    let _ = outbound.send(Outbound::Frame(frame));
                }
            }
            ServerOp::Err(message) => warn!(message = %message, "nats server error"),
            ServerOp::Info(_) | ServerOp::Pong | ServerOp::Ok => {}
        }
    };
    debug!(reason = %reason, "nats read loop ended");
    mark_closed(&closed, &reason);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::stream;

    use super::*;

    fn frames(chunks: Vec<&'static [u8]>) -> impl Stream<Item = Result<Message, WsError>> + Unpin {
        stream::iter(chunks.into_iter().map(|chunk| Ok(Message::Binary(chunk.to_vec().into()))))
            .chain(stream::pending())
    }

    #[tokio::test]
    async fn oversized_msg_closes_the_session() {
        let (closed_tx, mut closed_rx) = watch::channel(None);
        let (outbound, _outbound_rx) = mpsc::unbounded_channel();
        let routes: Routes = Arc::default();
        let (sender, _receiver) = mpsc::unbounded_channel();
        lock_routes(&routes).insert(1, sender);

        let stream = frames(vec![b"MSG a.b 1 18446744073709551615\r\nhi\r\n"]);
        let reader = tokio::spawn(read_loop(stream, Decoder::new(), routes.clone(), outbound, Arc::new(closed_tx)));

        tokio::time::timeout(Duration::from_secs(5), closed_rx.wait_for(Option::is_some))
            .await
            .expect("read loop should mark the session closed")
            .unwrap();
        let reason = closed_rx.borrow().clone().unwrap();
        assert!(reason.contains("exceeds max_payload"), "unexpected reason: {reason}");
        reader.await.unwrap();
        assert!(lock_routes(&routes).is_empty());
    }

    #[tokio::test]
    async fn aborted_reader_still_marks_closed() {
        let (closed_tx, closed_rx) = watch::channel(None);
        let (outbound, _outbound_rx) = mpsc::unbounded_channel();
        let stream = frames(Vec::new());
        let reader = tokio::spawn(read_loop(stream, Decoder::new(), Routes::default(), outbound, Arc::new(closed_tx)));

        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        reader.abort();
        assert!(reader.await.unwrap_err().is_cancelled());
        assert_eq!(closed_rx.borrow().as_deref(), Some("nats read loop stopped"));
    }

    #[tokio::test]
    async fn msg_frames_reach_their_route() {
        let (closed_tx, _closed_rx) = watch::channel(None);
        let (outbound, _outbound_rx) = mpsc::unbounded_channel();
        let routes: Routes = Arc::default();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        lock_routes(&routes).insert(3, sender);

        let stream = frames(vec![b"MSG a.b 3 2\r\n", b"hi\r\n"]);
        let reader = tokio::spawn(read_loop(stream, Decoder::new(), routes, outbound, Arc::new(closed_tx)));

        let payload = tokio::time::timeout(Duration::from_secs(5), receiver.recv()).await.unwrap();
        assert_eq!(payload.as_deref(), Some(&b"hi"[..]));
        reader.abort();
    }
}
