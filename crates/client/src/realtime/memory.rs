// In-process loopback bus.
//
// Implements the transport traits without a network: publishes are fanned
// out to every matching subscription of every live connection, including the
// publisher's own. Used by tests and by the CLI's `--loopback` mode. Test
// hooks can refuse connections, inject raw payloads and kill sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use dentika_common::protocol::subjects::subject_matches;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::transport::{BusConnection, BusConnector, BusSubscription, TransportError};

#[derive(Clone, Default)]
pub struct LoopbackBus {
    state: Arc<Mutex<BusState>>,
}

#[derive(Default)]
struct BusState {
    next_connection: u64,
    connections: HashMap<u64, watch::Sender<Option<String>>>,
    subscribers: Vec<Subscriber>,
    published: Vec<(String, Vec<u8>)>,
    connect_attempts: usize,
    refuse_reason: Option<String>,
    required_token: Option<String>,
}

struct Subscriber {
    connection: u64,
    pattern: String,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl BusState {
    fn deliver(&mut self, subject: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|sub| {
            if !subject_matches(&sub.pattern, subject) {
                return true;
            }
            match sub.sender.send(payload.to_vec()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    fn drop_connection(&mut self, id: u64, reason: &str) {
        if let Some(closed) = self.connections.remove(&id) {
            let _ = closed.send(Some(reason.to_string()));
        }
        self.subscribers.retain(|sub| sub.connection != id);
    }
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        // A poisoned bus is still consistent: every mutation is a single step.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every following `connect` fail with `reason` (or succeed again with `None`).
    pub fn refuse_connections(&self, reason: Option<&str>) {
        self.lock().refuse_reason = reason.map(str::to_string);
    }

    /// Reject sessions whose token differs from `token`.
    pub fn require_token(&self, token: impl Into<String>) {
        self.lock().required_token = Some(token.into());
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn live_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Patterns with at least one live subscription, sorted.
    pub fn subscribed_subjects(&self) -> Vec<String> {
        let state = self.lock();
        let mut subjects: Vec<String> = state
            .subscribers
            .iter()
            .filter(|sub| !sub.sender.is_closed())
            .map(|sub| sub.pattern.clone())
            .collect();
        subjects.sort();
        subjects.dedup();
        subjects
    }

    /// Every payload published through any connection, in order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().published.clone()
    }

    pub fn published_on(&self, subject: &str) -> Vec<Vec<u8>> {
        self.lock()
            .published
            .iter()
            .filter(|(published, _)| published == subject)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Deliver raw bytes as if a remote peer had published them.
    /// Returns the number of subscriptions that received the payload.
    pub fn inject(&self, subject: &str, payload: impl Into<Vec<u8>>) -> usize {
        let payload = payload.into();
        self.lock().deliver(subject, &payload)
    }

    /// Kill every live session as if the server had gone away.
    pub fn drop_connections(&self, reason: &str) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.drop_connection(id, reason);
        }
    }
}

impl BusConnector for LoopbackBus {
    type Connection = LoopbackConnection;

    async fn connect(&self, endpoint: &str, token: &str) -> Result<LoopbackConnection, TransportError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if let Some(reason) = state.refuse_reason.clone() {
            return Err(TransportError::Connect { endpoint: endpoint.to_string(), reason });
        }
        if state.required_token.as_deref().is_some_and(|required| required != token) {
            return Err(TransportError::Rejected("Authorization Violation".into()));
        }

        state.next_connection += 1;
        let id = state.next_connection;
        let (closed_tx, closed_rx) = watch::channel(None);
        state.connections.insert(id, closed_tx);
        debug!(connection = id, endpoint, "loopback session opened");
        Ok(LoopbackConnection { id, bus: self.clone(), closed: closed_rx })
    }
}

pub struct LoopbackConnection {
    id: u64,
    bus: LoopbackBus,
    closed: watch::Receiver<Option<String>>,
}

impl LoopbackConnection {
    fn ensure_live(&self, state: &BusState) -> Result<(), TransportError> {
        if state.connections.contains_key(&self.id) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

impl BusConnection for LoopbackConnection {
    async fn subscribe(&self, subject: &str) -> Result<BusSubscription, TransportError> {
        let mut state = self.bus.lock();
        self.ensure_live(&state)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber {
            connection: self.id,
            pattern: subject.to_string(),
            sender,
        });
        Ok(BusSubscription::new(subject, receiver))
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.bus.lock();
        self.ensure_live(&state)?;
        state.deliver(subject, &payload);
        state.published.push((subject.to_string(), payload));
        Ok(())
    }

    async fn closed(&self) -> String {
        let mut closed = self.closed.clone();
        let reason = closed.wait_for(Option::is_some).await.ok().and_then(|reason| reason.clone());
        reason
            .or_else(|| closed.borrow().clone())
            .unwrap_or_else(|| "loopback bus dropped".to_string())
    }

    async fn close(&self) {
        self.bus.lock().drop_connection(self.id, "closed by client");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_matching_subscribers() {
        let bus = LoopbackBus::new();
        let a = bus.connect("loopback", "t").await.unwrap();
        let b = bus.connect("loopback", "t").await.unwrap();

        let mut exact = a.subscribe("dentika.system.alerts").await.unwrap();
        let mut wildcard = b.subscribe("dentika.>").await.unwrap();

        a.publish("dentika.system.alerts", b"{}".to_vec()).await.unwrap();
        assert_eq!(exact.next().await, Some(b"{}".to_vec()));
        assert_eq!(wildcard.next().await, Some(b"{}".to_vec()));
        assert_eq!(bus.published_on("dentika.system.alerts").len(), 1);
    }

    #[tokio::test]
    async fn refused_and_rejected_connections() {
        let bus = LoopbackBus::new();
        bus.refuse_connections(Some("connection refused"));
        assert!(matches!(bus.connect("e", "t").await, Err(TransportError::Connect { .. })));

        bus.refuse_connections(None);
        bus.require_token("good");
        assert!(matches!(bus.connect("e", "bad").await, Err(TransportError::Rejected(_))));
        assert!(bus.connect("e", "good").await.is_ok());
        assert_eq!(bus.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn dropping_connections_ends_subscriptions_and_resolves_closed() {
        let bus = LoopbackBus::new();
        let conn = bus.connect("e", "t").await.unwrap();
        let mut sub = conn.subscribe("x").await.unwrap();

        bus.drop_connections("server restart");
        assert_eq!(conn.closed().await, "server restart");
        assert_eq!(sub.next().await, None);
        assert!(matches!(conn.publish("x", vec![]).await, Err(TransportError::Closed)));
        assert_eq!(bus.live_connections(), 0);
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let bus = LoopbackBus::new();
        let conn = bus.connect("e", "t").await.unwrap();
        let sub = conn.subscribe("x").await.unwrap();
        drop(sub);
        assert_eq!(bus.inject("x", b"1".to_vec()), 0);
        assert!(bus.subscribed_subjects().is_empty());
    }
}
