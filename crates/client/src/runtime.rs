// Composition root: one connection manager, one notification store and one
// health monitor wired together.
//
// The bus router feeds notification channels into the store and rebroadcasts
// domain events. A supervisor task turns connection events and HTTP signals
// into health updates, and signs out when the server rejects the session.

use std::sync::Arc;

use anyhow::{Context, Result};
use dentika_common::protocol::envelope::InboundMessage;
use dentika_common::protocol::subjects::Channel;
use dentika_common::types::{Identity, Notification, RawNotification};
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::auth::TokenStore;
use crate::config::ClientConfig;
use crate::health::{ConnectionHealthMonitor, HealthProbe, HealthSettings};
use crate::notifications::{AddOptions, NotificationBackfill, NotificationStore, StoreSettings};
use crate::realtime::nats_ws::NatsWsConnector;
use crate::realtime::{
    BusConnector, ConnectionEvent, ConnectionManager, Credentials, DisconnectReason, RealtimeSettings,
};

const DOMAIN_EVENT_CAPACITY: usize = 256;

/// Bus traffic that is not a stored notification, plus a copy of every
/// notification that arrived over the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    Notification { channel: Channel, notification: Notification },
    AppointmentUpdated(Map<String, Value>),
    AppointmentReminder(Map<String, Value>),
    PatientUpdated(Map<String, Value>),
    SystemNotification(RawNotification),
    SystemAlert(RawNotification),
}

/// What the HTTP layer reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpSignal {
    Unauthorized,
    NetworkError,
    NetworkRecovery,
}

/// Dispatch one bootstrap-channel message.
pub fn route_inbound<B: NotificationBackfill>(
    store: &NotificationStore<B>,
    events: &broadcast::Sender<DomainEvent>,
    channel: Channel,
    message: InboundMessage,
) {
    let event = match channel {
        Channel::UserNotifications | Channel::ClinicNotifications => {
            let notification = store.add_notification(message.into_notification(), AddOptions::realtime());
            DomainEvent::Notification { channel, notification }
        }
        Channel::UserAppointments | Channel::ClinicAppointments => match message {
            InboundMessage::Event(envelope) if envelope.kind == "appointment_update" => {
                DomainEvent::AppointmentUpdated(envelope.payload)
            }
            InboundMessage::Event(envelope) if envelope.kind == "appointment_reminder" => {
                DomainEvent::AppointmentReminder(envelope.payload)
            }
            InboundMessage::Event(envelope) => {
                debug!(kind = %envelope.kind, "unknown appointment message type");
                return;
            }
            InboundMessage::Direct(_) => {
                debug!(?channel, "appointment message without envelope, dropping");
                return;
            }
        },
        Channel::UserPatients | Channel::ClinicPatients => match message {
            InboundMessage::Event(envelope) => DomainEvent::PatientUpdated(envelope.payload),
            InboundMessage::Direct(_) => {
                debug!(?channel, "patient message without envelope, dropping");
                return;
            }
        },
        Channel::SystemNotifications => DomainEvent::SystemNotification(message.into_notification()),
        Channel::SystemAlerts => DomainEvent::SystemAlert(message.into_notification()),
    };
    // No listeners is fine.
    let _ = events.send(event);
}

struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct NotificationPipeline<C: BusConnector, B: NotificationBackfill, P: HealthProbe> {
    realtime: ConnectionManager<C>,
    store: NotificationStore<B>,
    health: ConnectionHealthMonitor<P>,
    tokens: Arc<dyn TokenStore>,
    events: broadcast::Sender<DomainEvent>,
    signals: mpsc::UnboundedSender<HttpSignal>,
    supervisor: Arc<TaskGuard>,
}

impl<C: BusConnector, B: NotificationBackfill, P: HealthProbe> Clone for NotificationPipeline<C, B, P> {
    fn clone(&self) -> Self {
        Self {
            realtime: self.realtime.clone(),
            store: self.store.clone(),
            health: self.health.clone(),
            tokens: self.tokens.clone(),
            events: self.events.clone(),
            signals: self.signals.clone(),
            supervisor: self.supervisor.clone(),
        }
    }
}

impl<C: BusConnector, B: NotificationBackfill, P: HealthProbe> NotificationPipeline<C, B, P> {
    /// Wire the parts together. Must be called inside a tokio runtime.
    pub fn new(
        realtime: ConnectionManager<C>,
        store: NotificationStore<B>,
        health: ConnectionHealthMonitor<P>,
        tokens: Arc<dyn TokenStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(DOMAIN_EVENT_CAPACITY);
        let router_store = store.clone();
        let router_events = events.clone();
        realtime.set_router(move |channel, message| route_inbound(&router_store, &router_events, channel, message));

        let (signals, signal_rx) = mpsc::unbounded_channel();
        let supervisor = tokio::spawn(supervise(
            realtime.events(),
            signal_rx,
            realtime.clone(),
            store.clone(),
            health.clone(),
            tokens.clone(),
        ));

        Self { realtime, store, health, tokens, events, signals, supervisor: Arc::new(TaskGuard(supervisor)) }
    }

    pub fn realtime(&self) -> &ConnectionManager<C> {
        &self.realtime
    }

    pub fn store(&self) -> &NotificationStore<B> {
        &self.store
    }

    pub fn health(&self) -> &ConnectionHealthMonitor<P> {
        &self.health
    }

    pub fn tokens(&self) -> &Arc<dyn TokenStore> {
        &self.tokens
    }

    pub fn events(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    /// Report an HTTP-layer observation.
    pub fn signal(&self, signal: HttpSignal) {
        if self.signals.send(signal).is_err() {
            debug!(?signal, "pipeline supervisor gone, dropping signal");
        }
    }

    /// Connect the bus and backfill the store for `identity`, using the
    /// stored token. Without a token this only logs.
    pub async fn start(&self, identity: Identity) -> Result<()> {
        let Some(token) = self.tokens.get().context("failed to read auth token")? else {
            info!("not signed in, realtime notifications stay off");
            return Ok(());
        };
        self.realtime.initialize(Credentials::new(token, identity)).await;
        self.store.initialize().await;
        Ok(())
    }

    /// Store a fresh token and start.
    pub async fn login(&self, token: &str, identity: Identity) -> Result<()> {
        self.tokens.set(token).context("failed to store auth token")?;
        self.start(identity).await
    }

    /// Forget the token, close the bus and clear the store.
    pub async fn logout(&self) {
        sign_out(&self.realtime, &self.store, self.tokens.as_ref()).await;
    }
}

impl NotificationPipeline<NatsWsConnector, ApiClient, ApiClient> {
    /// Production wiring: NATS over WebSocket plus the REST API.
    pub fn from_config(config: &ClientConfig, tokens: Arc<dyn TokenStore>) -> Result<Self> {
        let api = ApiClient::new(&config.api, &config.health, tokens.clone()).context("invalid API configuration")?;
        let realtime = ConnectionManager::new(NatsWsConnector::new(), RealtimeSettings::from_config(&config.realtime, &config.api));
        let store = NotificationStore::new(api.clone(), StoreSettings::from_config(&config.notifications));
        let health = ConnectionHealthMonitor::new(api.clone(), HealthSettings::from_config(&config.health));
        let pipeline = Self::new(realtime, store, health, tokens);
        pipeline.attach_api(&api);
        Ok(pipeline)
    }
}

impl<C: BusConnector, B: NotificationBackfill, P: HealthProbe> NotificationPipeline<C, B, P> {
    /// Route the API client's hooks into this pipeline.
    pub fn attach_api(&self, api: &ApiClient) {
        let signals = self.signals.clone();
        api.on_unauthorized(move || {
            let _ = signals.send(HttpSignal::Unauthorized);
        });
        let signals = self.signals.clone();
        api.on_network_error(move || {
            let _ = signals.send(HttpSignal::NetworkError);
        });
        let signals = self.signals.clone();
        api.on_network_recovery(move || {
            let _ = signals.send(HttpSignal::NetworkRecovery);
        });
    }
}

async fn sign_out<C: BusConnector, B: NotificationBackfill>(
    realtime: &ConnectionManager<C>,
    store: &NotificationStore<B>,
    tokens: &dyn TokenStore,
) {
    if let Err(error) = tokens.remove() {
        warn!(error = %error, "failed to remove auth token");
    }
    realtime.clear_credentials();
    realtime.disconnect().await;
    store.reset();
    info!("signed out");
}

async fn supervise<C: BusConnector, B: NotificationBackfill, P: HealthProbe>(
    mut connection_events: broadcast::Receiver<ConnectionEvent>,
    mut signals: mpsc::UnboundedReceiver<HttpSignal>,
    realtime: ConnectionManager<C>,
    store: NotificationStore<B>,
    health: ConnectionHealthMonitor<P>,
    tokens: Arc<dyn TokenStore>,
) {
    loop {
        tokio::select! {
            event = connection_events.recv() => match event {
                Ok(ConnectionEvent::Connected) => health.handle_network_recovery(),
                Ok(ConnectionEvent::Disconnected { reason: DisconnectReason::Transport(_) }) => {
                    health.handle_network_error();
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "connection events lagged"),
                Err(RecvError::Closed) => return,
            },
            Some(signal) = signals.recv() => match signal {
                HttpSignal::Unauthorized => {
                    warn!("session rejected by server, signing out");
                    sign_out(&realtime, &store, tokens.as_ref()).await;
                }
                HttpSignal::NetworkError => health.handle_network_error(),
                HttpSignal::NetworkRecovery => health.handle_network_recovery(),
            },
        }
    }
}
