// Realtime connection manager: one authenticated bus session with automatic
// recovery and subject routing.
//
// The manager is an explicitly constructed service object; the application
// builds exactly one and hands clones of the handle to consumers. Routes
// (subject → handler) outlive sessions: every time a session reaches
// Connected the bootstrap subjects and all registered routes are attached,
// and every subscription is torn down together when the session dies.
//
// Transport is abstracted via `BusConnector` for testability.

pub mod backoff;
pub mod flight;
pub mod memory;
pub mod nats_ws;
pub mod transport;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use dentika_common::protocol::envelope::{EventEnvelope, InboundMessage};
use dentika_common::protocol::subjects::{validate_subject, Channel, SubjectError, Subjects};
use dentika_common::types::Identity;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use backoff::{BackoffScheduler, ReconnectPolicy};
use flight::SingleFlight;
pub use transport::{BusConnection, BusConnector, BusSubscription, TransportError};

use crate::config::{ApiConfig, RealtimeConfig};

const EVENT_CAPACITY: usize = 64;
const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Connection parameters for the bus.
#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub endpoint: String,
    pub subjects: Subjects,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl RealtimeSettings {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            subjects: Subjects::default(),
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn from_config(realtime: &RealtimeConfig, api: &ApiConfig) -> Self {
        Self {
            endpoint: realtime.resolve_endpoint(&api.base_url),
            subjects: Subjects::new(realtime.subject_prefix.clone()),
            heartbeat_interval: realtime.heartbeat_interval(),
            handshake_timeout: realtime.handshake_timeout(),
            reconnect: ReconnectPolicy::from(&realtime.reconnect),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// What the manager needs from the auth layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
    pub identity: Option<Identity>,
}

impl Credentials {
    pub fn new(token: impl Into<String>, identity: Identity) -> Self {
        Self { token: Some(token.into()), identity: Some(identity) }
    }

    fn usable_token(&self) -> Option<&str> {
        self.token.as_deref().filter(|token| !token.is_empty())
    }
}

// ── Connection state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    ClientRequested,
    /// The transport closed or failed underneath us.
    Transport(String),
}

/// Lifecycle events broadcast to any number of listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    ConnectFailed { error: String },
    Disconnected { reason: DisconnectReason },
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// The attempt budget is spent; only a manual `connect()` retries.
    ReconnectAbandoned { attempts: u32 },
}

pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;
pub type BootstrapRouter = Arc<dyn Fn(Channel, InboundMessage) + Send + Sync>;

// ── Route table ─────────────────────────────────────────────────────

/// Subject → current handler. Receive loops look the handler up per
/// message, so replacing a route takes effect without resubscribing.
#[derive(Clone, Default)]
struct RouteTable {
    routes: Arc<Mutex<HashMap<String, MessageHandler>>>,
}

impl RouteTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, MessageHandler>> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns true when an existing handler was replaced.
    fn insert(&self, subject: String, handler: MessageHandler) -> bool {
        self.lock().insert(subject, handler).is_some()
    }

    fn remove(&self, subject: &str) -> bool {
        self.lock().remove(subject).is_some()
    }

    fn handler(&self, subject: &str) -> Option<MessageHandler> {
        self.lock().get(subject).cloned()
    }

    fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self.lock().keys().cloned().collect();
        subjects.sort();
        subjects
    }
}

// ── Session ─────────────────────────────────────────────────────────

struct Session<S> {
    generation: u64,
    connection: Arc<S>,
    receivers: HashMap<String, JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl<S> Session<S> {
    fn new(generation: u64, connection: Arc<S>) -> Self {
        Self { generation, connection, receivers: HashMap::new(), heartbeat: None, watcher: None }
    }

    fn abort_tasks(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        for (_, receiver) in self.receivers.drain() {
            receiver.abort();
        }
    }
}

struct Core<S> {
    credentials: Credentials,
    router: Option<BootstrapRouter>,
    initialized: bool,
    session: Option<Session<S>>,
    backoff: BackoffScheduler,
    reconnect_timer: Option<JoinHandle<()>>,
    /// Bumped by `disconnect()`; work started under an older generation is
    /// discarded when it completes.
    generation: u64,
}

struct Inner<C: BusConnector> {
    connector: C,
    settings: RealtimeSettings,
    core: Mutex<Core<C::Connection>>,
    routes: RouteTable,
    attach_lock: tokio::sync::Mutex<()>,
    init_flight: SingleFlight,
    connect_flight: SingleFlight,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

// ── Connection manager ──────────────────────────────────────────────

/// Manages the bus connection lifecycle. Cheap to clone; clones share one
/// session.
pub struct ConnectionManager<C: BusConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: BusConnector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<C: BusConnector> ConnectionManager<C> {
    pub fn new(connector: C, settings: RealtimeSettings) -> Self {
        let backoff = BackoffScheduler::new(settings.reconnect.clone());
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector,
                settings,
                core: Mutex::new(Core {
                    credentials: Credentials::default(),
                    router: None,
                    initialized: false,
                    session: None,
                    backoff,
                    reconnect_timer: None,
                    generation: 0,
                }),
                routes: RouteTable::default(),
                attach_lock: tokio::sync::Mutex::new(()),
                init_flight: SingleFlight::new(),
                connect_flight: SingleFlight::new(),
                state,
                events,
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    pub fn settings(&self) -> &RealtimeSettings {
        &self.inner.settings
    }

    pub fn subjects(&self) -> &Subjects {
        &self.inner.settings.subjects
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.core().backoff.attempt()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.core().credentials.identity.clone()
    }

    /// Registered route subjects, sorted.
    pub fn registered_subjects(&self) -> Vec<String> {
        self.inner.routes.subjects()
    }

    /// Subjects with a live transport subscription, sorted.
    pub fn live_subjects(&self) -> Vec<String> {
        let core = self.inner.core();
        let mut subjects: Vec<String> = core
            .session
            .as_ref()
            .map(|session| session.receivers.keys().cloned().collect())
            .unwrap_or_default();
        subjects.sort();
        subjects
    }

    /// Handler for the bootstrap subjects, attached on every connect.
    pub fn set_router<R>(&self, router: R)
    where
        R: Fn(Channel, InboundMessage) + Send + Sync + 'static,
    {
        self.inner.core().router = Some(Arc::new(router));
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        self.inner.core().credentials = credentials;
    }

    /// Forget the token and identity (logout). Does not disconnect.
    pub fn clear_credentials(&self) {
        let mut core = self.inner.core();
        core.credentials = Credentials::default();
        core.initialized = false;
    }

    /// Store credentials and connect. Idempotent; concurrent callers wait
    /// for the initialization already in flight. A missing token is a normal
    /// startup state and only logged.
    pub async fn initialize(&self, credentials: Credentials) {
        let manager = self.clone();
        self.inner.init_flight.run(move || async move { manager.initialize_once(credentials).await }).await;
    }

    async fn initialize_once(&self, credentials: Credentials) {
        {
            let mut core = self.inner.core();
            if core.initialized && core.session.is_some() {
                return;
            }
            core.credentials = credentials;
            if core.credentials.usable_token().is_none() {
                warn!("cannot connect to realtime bus: no authentication token");
                return;
            }
        }
        self.connect().await;
        self.inner.core().initialized = true;
    }

    /// Connect unless already connected. Concurrent calls collapse into the
    /// attempt in flight. Always honoured, whatever the retry budget says.
    pub async fn connect(&self) {
        let inner = self.inner.clone();
        self.inner.connect_flight.run(move || async move { inner.establish().await }).await;
    }

    /// Register `handler` for `subject`. Replaces any previous handler for
    /// the same subject; a live subject is not resubscribed. While
    /// disconnected the route waits for the next session.
    pub async fn subscribe<H>(&self, subject: impl Into<String>, handler: H) -> Result<(), SubjectError>
    where
        H: Fn(InboundMessage) + Send + Sync + 'static,
    {
        let subject = subject.into();
        validate_subject(&subject)?;
        if self.inner.routes.insert(subject.clone(), Arc::new(handler)) {
            debug!(subject = %subject, "replaced realtime handler");
        }
        if self.is_connected() {
            self.inner.attach(&subject).await;
        }
        Ok(())
    }

    /// Drop the route for `subject` and its live subscription, if any.
    pub fn unsubscribe(&self, subject: &str) -> bool {
        let removed = self.inner.routes.remove(subject);
        let mut core = self.inner.core();
        if let Some(receiver) = core.session.as_mut().and_then(|session| session.receivers.remove(subject)) {
            receiver.abort();
        }
        removed
    }

    /// Publish `data` as UTF-8 JSON. Returns `false` when there is no live
    /// session or the send fails.
    pub async fn publish<T: Serialize + ?Sized>(&self, subject: &str, data: &T) -> bool {
        let connection = self.inner.core().session.as_ref().map(|session| session.connection.clone());
        let Some(connection) = connection else {
            warn!(subject, "cannot publish: realtime bus not connected");
            return false;
        };
        let payload = match serde_json::to_vec(data) {
            Ok(payload) => payload,
            Err(error) => {
                error!(subject, error = %error, "failed to serialize bus payload");
                return false;
            }
        };
        match connection.publish(subject, payload).await {
            Ok(()) => true,
            Err(error) => {
                error!(subject, error = %error, "failed to publish to realtime bus");
                false
            }
        }
    }

    /// Cancel any pending reconnect, stop the heartbeat, tear down every
    /// subscription and close the transport. Safe to call at any time.
    pub async fn disconnect(&self) {
        let session = {
            let mut core = self.inner.core();
            core.generation += 1;
            if let Some(timer) = core.reconnect_timer.take() {
                timer.abort();
            }
            core.backoff.reset();
            core.session.take()
        };

        let had_session = session.is_some();
        if let Some(mut session) = session {
            self.inner.set_state(ConnectionState::Closing);
            session.abort_tasks();
            session.connection.close().await;
            info!("realtime bus disconnected");
        }
        self.inner.set_state(ConnectionState::Disconnected);
        if had_session {
            self.inner.emit(ConnectionEvent::Disconnected { reason: DisconnectReason::ClientRequested });
        }
    }

    // ── Convenience publishers ──────────────────────────────────────

    /// `{type: "appointment_update", payload}` on the clinic's appointment subject.
    pub async fn publish_appointment_update(&self, clinic_id: &str, appointment: Map<String, Value>) -> bool {
        let subject = self.subjects().clinic_appointments(clinic_id);
        self.publish(&subject, &EventEnvelope::new("appointment_update", appointment)).await
    }

    /// `{type: "patient_update", payload}` on the clinic's patient subject.
    pub async fn publish_patient_update(&self, clinic_id: &str, patient: Map<String, Value>) -> bool {
        let subject = self.subjects().clinic_patients(clinic_id);
        self.publish(&subject, &EventEnvelope::new("patient_update", patient)).await
    }

    pub async fn publish_user_notification(&self, user_id: &str, notification: &Value) -> bool {
        let subject = self.subjects().user_notifications(user_id);
        self.publish(&subject, notification).await
    }

    pub async fn publish_clinic_notification(&self, clinic_id: &str, notification: &Value) -> bool {
        let subject = self.subjects().clinic_notifications(clinic_id);
        self.publish(&subject, notification).await
    }

    pub async fn publish_system_notification(&self, notification: &Value) -> bool {
        let subject = self.subjects().system_notifications();
        self.publish(&subject, notification).await
    }
}

impl<C: BusConnector> Inner<C> {
    fn core(&self) -> MutexGuard<'_, Core<C::Connection>> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        // No listeners is fine.
        let _ = self.events.send(event);
    }

    async fn establish(self: Arc<Self>) {
        let (token, generation, stale) = {
            let mut core = self.core();
            if core.session.is_some() && *self.state.borrow() == ConnectionState::Connected {
                debug!("realtime bus already connected");
                return;
            }
            let Some(token) = core.credentials.usable_token().map(str::to_string) else {
                warn!("cannot connect to realtime bus: no authentication token");
                return;
            };
            (token, core.generation, core.session.take())
        };

        if let Some(mut stale) = stale {
            stale.abort_tasks();
            stale.connection.close().await;
        }

        self.set_state(ConnectionState::Connecting);
        let endpoint = self.settings.endpoint.as_str();
        info!(endpoint, "connecting to realtime bus");

        let attempt = tokio::time::timeout(self.settings.handshake_timeout, self.connector.connect(endpoint, &token)).await;
        let result = attempt.unwrap_or_else(|_| {
            Err(TransportError::Handshake(format!(
                "no session within {}s",
                self.settings.handshake_timeout.as_secs()
            )))
        });

        match result {
            Ok(connection) => self.on_connected(Arc::new(connection), generation).await,
            Err(error) => self.on_connect_failed(error, generation),
        }
    }

    async fn on_connected(self: &Arc<Self>, connection: Arc<C::Connection>, generation: u64) {
        let user_id = {
            let mut core = self.core();
            if core.generation != generation {
                None
            } else {
                core.backoff.reset();
                if let Some(timer) = core.reconnect_timer.take() {
                    timer.abort();
                }
                let mut session = Session::new(generation, connection.clone());
                session.watcher = Some(self.watch_close(connection.clone(), generation));
                core.session = Some(session);
                self.install_bootstrap_routes(&core);
                // Set under the lock so disconnect cannot interleave.
                self.set_state(ConnectionState::Connected);
                Some(core.credentials.identity.as_ref().map(|identity| identity.user_id.clone()))
            }
        };
        let Some(user_id) = user_id else {
            debug!("discarding realtime session opened before disconnect");
            connection.close().await;
            self.set_state(ConnectionState::Disconnected);
            return;
        };
        info!(endpoint = %self.settings.endpoint, "realtime bus connected");

        for subject in self.routes.subjects() {
            self.attach(&subject).await;
        }

        let heartbeat = self.start_heartbeat(connection, user_id);
        let mut core = self.core();
        let orphaned = match core.session.as_mut() {
            Some(session) if session.generation == generation => {
                session.heartbeat = Some(heartbeat);
                None
            }
            _ => Some(heartbeat),
        };
        drop(core);
        match orphaned {
            None => self.emit(ConnectionEvent::Connected),
            Some(heartbeat) => heartbeat.abort(),
        }
    }

    fn on_connect_failed(self: &Arc<Self>, error: TransportError, generation: u64) {
        let mut core = self.core();
        if core.generation != generation {
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        error!(error = %error, "failed to connect to realtime bus");
        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::ConnectFailed { error: error.to_string() });
        self.schedule_reconnect(&mut core);
    }

    fn on_transport_closed(self: &Arc<Self>, generation: u64, reason: String) {
        let mut core = self.core();
        if !core.session.as_ref().is_some_and(|session| session.generation == generation) {
            return;
        }
        if let Some(mut session) = core.session.take() {
            // This runs on the watcher task itself; let it finish normally.
            session.watcher.take();
            session.abort_tasks();
        }
        warn!(reason = %reason, "realtime bus connection closed");
        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Disconnected { reason: DisconnectReason::Transport(reason) });
        self.schedule_reconnect(&mut core);
    }

    fn schedule_reconnect(self: &Arc<Self>, core: &mut Core<C::Connection>) {
        let Some(delay) = core.backoff.next_delay() else {
            let attempts = core.backoff.attempt();
            warn!(attempts, "max realtime reconnection attempts reached");
            self.emit(ConnectionEvent::ReconnectAbandoned { attempts });
            return;
        };

        let attempt = core.backoff.attempt();
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling realtime reconnect");
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                ConnectionManager { inner }.connect().await;
            }
        });
        if let Some(previous) = core.reconnect_timer.replace(timer) {
            previous.abort();
        }
        self.emit(ConnectionEvent::ReconnectScheduled { attempt, delay });
    }

    fn install_bootstrap_routes(&self, core: &Core<C::Connection>) {
        let (Some(identity), Some(router)) = (core.credentials.identity.as_ref(), core.router.as_ref()) else {
            return;
        };
        for bootstrap in self.settings.subjects.bootstrap(identity) {
            let router = router.clone();
            let channel = bootstrap.channel;
            self.routes.insert(bootstrap.subject, Arc::new(move |message| router(channel, message)));
        }
    }

    /// Open the transport subscription for `subject` unless it is already
    /// live. Failures are logged per subject.
    async fn attach(self: &Arc<Self>, subject: &str) -> bool {
        let _serial = self.attach_lock.lock().await;
        let (connection, generation) = {
            let core = self.core();
            let Some(session) = core.session.as_ref() else {
                return false;
            };
            if session.receivers.contains_key(subject) {
                return true;
            }
            (session.connection.clone(), session.generation)
        };

        let subscription = match connection.subscribe(subject).await {
            Ok(subscription) => subscription,
            Err(error) => {
                error!(subject, error = %error, "failed to subscribe on realtime bus");
                return false;
            }
        };

        let receiver = tokio::spawn(receive_loop(subscription, self.routes.clone()));
        let mut core = self.core();
        match core.session.as_mut() {
            Some(session) if session.generation == generation => {
                session.receivers.insert(subject.to_string(), receiver);
                debug!(subject, "subscribed on realtime bus");
                true
            }
            _ => {
                receiver.abort();
                false
            }
        }
    }

    fn start_heartbeat(&self, connection: Arc<C::Connection>, user_id: Option<String>) -> JoinHandle<()> {
        let subject = self.settings.subjects.heartbeat();
        let period = self.settings.heartbeat_interval.max(MIN_HEARTBEAT);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let beat = json!({ "user_id": user_id, "timestamp": Utc::now().timestamp_millis() });
                let payload = match serde_json::to_vec(&beat) {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(error = %error, "failed to encode heartbeat");
                        continue;
                    }
                };
                if let Err(error) = connection.publish(&subject, payload).await {
                    warn!(error = %error, "realtime heartbeat failed");
                }
            }
        })
    }

    fn watch_close(self: &Arc<Self>, connection: Arc<C::Connection>, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = connection.closed().await;
            drop(connection);
            if let Some(inner) = weak.upgrade() {
                inner.on_transport_closed(generation, reason);
            }
        })
    }
}

/// Drain one subject. A payload that fails to decode is logged and dropped;
/// the loop keeps going.
async fn receive_loop(mut subscription: BusSubscription, routes: RouteTable) {
    let subject = subscription.subject().to_string();
    while let Some(payload) = subscription.next().await {
        match InboundMessage::decode(&payload) {
            Ok(message) => match routes.handler(&subject) {
                Some(handler) => handler(message),
                None => debug!(subject = %subject, "no realtime handler, dropping message"),
            },
            Err(error) => error!(subject = %subject, error = %error, "failed to parse realtime message"),
        }
    }
    debug!(subject = %subject, "realtime subscription ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory::LoopbackBus;
    use tokio::sync::mpsc;

    fn manager(bus: &LoopbackBus) -> ConnectionManager<LoopbackBus> {
        ConnectionManager::new(bus.clone(), RealtimeSettings::new("wss://localhost:9222"))
    }

    fn manager_with_policy(bus: &LoopbackBus, policy: ReconnectPolicy) -> ConnectionManager<LoopbackBus> {
        ConnectionManager::new(
            bus.clone(),
            RealtimeSettings::new("wss://localhost:9222").with_reconnect_policy(policy),
        )
    }

    fn credentials() -> Credentials {
        Credentials::new("token-1", Identity::new("7").with_clinic("3"))
    }

    fn drain(events: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test]
    async fn initialize_connects_and_attaches_bootstrap_subjects() {
        let bus = LoopbackBus::new();
        let manager = manager(&bus);
        manager.set_router(|_, _| {});

        manager.initialize(credentials()).await;

        assert!(manager.is_connected());
        assert_eq!(manager.reconnect_attempt(), 0);
        let live = manager.live_subjects();
        assert_eq!(live.len(), 8);
        assert!(live.contains(&"dentika.clinic.3.patients".to_string()));
        assert!(live.contains(&"dentika.system.alerts".to_string()));
        assert_eq!(bus.subscribed_subjects(), live);
    }

    #[tokio::test]
    async fn initialize_without_token_is_not_an_error() {
        let bus = LoopbackBus::new();
        let manager = manager(&bus);

        manager.initialize(Credentials { token: None, identity: Some(Identity::new("7")) }).await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(bus.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn concurrent_initialize_opens_one_session() {
        let bus = LoopbackBus::new();
        let manager = manager(&bus);

        let calls = (0..5).map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.initialize(credentials()).await })
        });
        for call in calls.collect::<Vec<_>>() {
            call.await.unwrap();
        }
        manager.initialize(credentials()).await;
        manager.connect().await;

        assert!(manager.is_connected());
        assert_eq!(bus.connect_attempts(), 1);
        assert_eq!(bus.live_connections(), 1);
    }

    #[tokio::test]
    async fn bad_payload_does_not_kill_the_subscription() {
        let bus = LoopbackBus::new();
        let manager = manager(&bus);
        manager.initialize(credentials()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.subscribe("x", move |message| tx.send(message).unwrap()).await.unwrap();

        assert_eq!(bus.inject("x", br#"{"a":1}"#.to_vec()), 1);
        bus.inject("x", b"{not json".to_vec());
        bus.inject("x", br#"{"a":3}"#.to_vec());

        let first = rx.recv().await.unwrap().into_notification();
        assert_eq!(first.get("a"), Some(&json!(1)));
        let second = rx.recv().await.unwrap().into_notification();
        assert_eq!(second.get("a"), Some(&json!(3)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubscribing_replaces_handler_without_duplicates() {
        let bus = LoopbackBus::new();
        let manager = manager(&bus);
        manager.initialize(credentials()).await;

        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        manager.subscribe("x", move |m| old_tx.send(m).unwrap()).await.unwrap();
        manager.subscribe("x", move |m| new_tx.send(m).unwrap()).await.unwrap();

        assert_eq!(bus.inject("x", br#"{"n":1}"#.to_vec()), 1);
        assert!(new_rx.recv().await.is_some());
        assert!(old_rx.try_recv().is_err());
        assert_eq!(manager.registered_subjects(), vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn routes_registered_while_disconnected_attach_on_connect() {
        let bus = LoopbackBus::new();
        let manager = manager(&bus);
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.subscribe("later", move |m| tx.send(m).unwrap()).await.unwrap();
        assert!(manager.live_subjects().is_empty());

        manager.initialize(credentials()).await;
        bus.inject("later", br#"{"ok":true}"#.to_vec());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn invalid_subject_is_rejected() {
        let manager = manager(&LoopbackBus::new());
        assert!(manager.subscribe("a..b", |_| {}).await.is_err());
    }

    #[tokio::test]
    async fn bootstrap_messages_reach_router_with_channel() {
        let bus = LoopbackBus::new();
        let manager = manager(&bus);
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.set_router(move |channel, message| tx.send((channel, message)).unwrap());
        manager.initialize(credentials()).await;

        bus.inject("dentika.user.7.appointments", br#"{"type":"appointment_update","payload":{"id":1}}"#.to_vec());
        let (channel, message) = rx.recv().await.unwrap();
        assert_eq!(channel, Channel::UserAppointments);
        assert!(matches!(message, InboundMessage::Event(ref env) if env.kind == "appointment_update"));
    }

    #[tokio::test]
    async fn publish_requires_live_session() {
        let bus = LoopbackBus::new();
        let manager = manager(&bus);
        assert!(!manager.publish("x", &json!({"a": 1})).await);

        manager.initialize(credentials()).await;
        assert!(manager.publish("x", &json!({"a": 1})).await);
        assert_eq!(bus.published_on("x"), vec![br#"{"a":1}"#.to_vec()]);
    }

    #[tokio::test]
    async fn convenience_publishers_use_clinic_subjects() {
        let bus = LoopbackBus::new();
        let manager = manager(&bus);
        manager.initialize(credentials()).await;

        let appointment = json!({"id": 5, "clinic_id": 3}).as_object().cloned().unwrap();
        assert!(manager.publish_appointment_update("3", appointment).await);

        let published = bus.published_on("dentika.clinic.3.appointments");
        let value: Value = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(value["type"], "appointment_update");
        assert_eq!(value["payload"]["id"], 5);

        assert!(manager.publish_system_notification(&json!({"title": "t"})).await);
        assert_eq!(bus.published_on("dentika.system.notifications").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_publishes_every_interval() {
        let bus = LoopbackBus::new();
        let manager = manager(&bus);
        manager.initialize(credentials()).await;

        tokio::time::sleep(Duration::from_secs(61)).await;

        let beats = bus.published_on("dentika.heartbeat");
        assert_eq!(beats.len(), 2);
        let beat: Value = serde_json::from_slice(&beats[0]).unwrap();
        assert_eq!(beat["user_id"], "7");
        assert!(beat["timestamp"].is_i64());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_close_schedules_reconnect_and_resubscribes() {
        let bus = LoopbackBus::new();
        let manager = manager(&bus);
        manager.set_router(|_, _| {});
        manager.initialize(credentials()).await;
        let mut events = manager.events();

        bus.drop_connections("server restart");
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert!(manager.is_connected());
        assert_eq!(bus.connect_attempts(), 2);
        assert_eq!(manager.live_subjects().len(), 8);
        assert_eq!(
            drain(&mut events),
            vec![
                ConnectionEvent::Disconnected {
                    reason: DisconnectReason::Transport("server restart".into())
                },
                ConnectionEvent::ReconnectScheduled { attempt: 1, delay: Duration::from_secs(1) },
                ConnectionEvent::Connected,
            ]
        );
        assert_eq!(manager.reconnect_attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let bus = LoopbackBus::new();
        bus.refuse_connections(Some("connection refused"));
        let manager = manager(&bus);
        manager.set_credentials(credentials());

        manager.connect().await;
        assert_eq!(bus.connect_attempts(), 1);
        assert_eq!(manager.reconnect_attempt(), 1);

        manager.disconnect().await;
        tokio::time::sleep(Duration::from_secs(40)).await;

        assert_eq!(bus.connect_attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.reconnect_attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_stops_scheduling_but_manual_connect_is_honoured() {
        let bus = LoopbackBus::new();
        bus.refuse_connections(Some("connection refused"));
        let manager = manager_with_policy(&bus, ReconnectPolicy { max_attempts: Some(3), ..ReconnectPolicy::default() });
        manager.set_credentials(credentials());
        let mut events = manager.events();

        manager.connect().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(bus.connect_attempts(), 3);
        assert!(drain(&mut events).contains(&ConnectionEvent::ReconnectAbandoned { attempts: 3 }));

        manager.connect().await;
        assert_eq!(bus.connect_attempts(), 4);

        bus.refuse_connections(None);
        manager.connect().await;
        assert!(manager.is_connected());
        assert_eq!(manager.reconnect_attempt(), 0);
    }

    #[tokio::test]
    async fn disconnect_is_always_safe() {
        let bus = LoopbackBus::new();
        let manager = manager(&bus);
        manager.disconnect().await;

        manager.initialize(credentials()).await;
        let mut events = manager.events();
        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.live_subjects().is_empty());
        assert_eq!(bus.live_connections(), 0);
        assert_eq!(
            drain(&mut events),
            vec![ConnectionEvent::Disconnected { reason: DisconnectReason::ClientRequested }]
        );
        assert!(!manager.publish("x", &json!({})).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_disconnect_never_leaves_a_sessionless_connected_state() {
        let bus = LoopbackBus::new();
        let manager = manager(&bus);
        manager.initialize(credentials()).await;

        for _ in 0..200 {
            manager.disconnect().await;
            let connecting = tokio::spawn({
                let manager = manager.clone();
                async move { manager.connect().await }
            });
            let disconnecting = tokio::spawn({
                let manager = manager.clone();
                async move { manager.disconnect().await }
            });
            connecting.await.unwrap();
            disconnecting.await.unwrap();

            assert_eq!(manager.is_connected(), bus.live_connections() == 1);
        }
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn rejected_token_reports_connect_failure() {
        let bus = LoopbackBus::new();
        bus.require_token("other");
        let manager = manager(&bus);
        let mut events = manager.events();

        manager.initialize(credentials()).await;
        manager.disconnect().await;

        let seen = drain(&mut events);
        assert!(matches!(seen.first(), Some(ConnectionEvent::ConnectFailed { .. })));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn unsubscribe_drops_route_and_live_subscription() {
        let bus = LoopbackBus::new();
        let manager = manager(&bus);
        manager.initialize(credentials()).await;
        manager.subscribe("x", |_| {}).await.unwrap();
        assert!(manager.live_subjects().contains(&"x".to_string()));

        assert!(manager.unsubscribe("x"));
        assert!(!manager.live_subjects().contains(&"x".to_string()));
        assert!(manager.registered_subjects().is_empty());
    }
}
