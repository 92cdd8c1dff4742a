// Bus transport abstraction.
//
// The connection manager only needs: open an authenticated session, publish
// bytes, subscribe to a subject as a stream of payloads, learn when the
// session dies, and close it. Production uses NATS over WebSocket; tests and
// the CLI demo mode use the in-process loopback bus.

use std::future::Future;

use dentika_common::protocol::nats::ProtocolError;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open connection to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("server rejected the session: {0}")]
    Rejected(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection is closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Opens bus sessions. One connector lives for the life of the manager.
pub trait BusConnector: Send + Sync + 'static {
    type Connection: BusConnection;

    fn connect(
        &self,
        endpoint: &str,
        token: &str,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// A live, authenticated bus session.
pub trait BusConnection: Send + Sync + 'static {
    fn subscribe(
        &self,
        subject: &str,
    ) -> impl Future<Output = Result<BusSubscription, TransportError>> + Send;

    fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Resolves with a reason once the session has died for any cause.
    fn closed(&self) -> impl Future<Output = String> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Inbound payloads for one subject, in wire order.
///
/// Dropping the subscription stops delivery; the transport prunes the
/// subject on its next delivery attempt.
#[derive(Debug)]
pub struct BusSubscription {
    subject: String,
    messages: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl BusSubscription {
    pub fn new(subject: impl Into<String>, messages: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { subject: subject.into(), messages }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next payload, or `None` once the session is gone.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.messages.recv().await
    }
}
