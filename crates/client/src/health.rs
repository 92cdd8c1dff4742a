// Connection health: host online flag plus last-known server reachability.
//
// Fed by the HTTP layer (network errors / responses) and by the connection
// manager's events. While the server is unreachable a poller probes the
// health endpoint until it answers again.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;

/// Result of one health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Any status below 500.
    Reachable(u16),
    ServerError(u16),
    /// Timeout or transport failure.
    NoResponse(String),
}

pub trait HealthProbe: Send + Sync + 'static {
    fn probe(&self) -> impl Future<Output = ProbeOutcome> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Offline,
    ServerDown,
    Connected,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::ServerDown => "server_down",
            Self::Connected => "connected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthState {
    pub browser_online: bool,
    pub server_reachable: bool,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self { browser_online: true, server_reachable: true, consecutive_failures: 0, last_checked_at: None }
    }
}

impl HealthState {
    pub fn connected(&self) -> bool {
        self.browser_online && self.server_reachable
    }

    pub fn status(&self) -> HealthStatus {
        if !self.browser_online {
            HealthStatus::Offline
        } else if !self.server_reachable {
            HealthStatus::ServerDown
        } else {
            HealthStatus::Connected
        }
    }

    pub fn should_show_overlay(&self, max_retries: u32) -> bool {
        !self.connected() && self.consecutive_failures >= max_retries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    pub probe_interval: Duration,
    pub max_retries: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self::from_config(&HealthConfig::default())
    }
}

impl HealthSettings {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self { probe_interval: config.probe_interval(), max_retries: config.max_retries }
    }
}

struct MonitorInner<P> {
    probe: P,
    settings: HealthSettings,
    state: watch::Sender<HealthState>,
    checking: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl<P> Drop for MonitorInner<P> {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner()).take() {
            poller.abort();
        }
    }
}

pub struct ConnectionHealthMonitor<P: HealthProbe> {
    inner: Arc<MonitorInner<P>>,
}

impl<P: HealthProbe> Clone for ConnectionHealthMonitor<P> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<P: HealthProbe> ConnectionHealthMonitor<P> {
    pub fn new(probe: P, settings: HealthSettings) -> Self {
        let (state, _) = watch::channel(HealthState::default());
        Self {
            inner: Arc::new(MonitorInner {
                probe,
                settings,
                state,
                checking: AtomicBool::new(false),
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> HealthState {
        self.inner.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<HealthState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().connected()
    }

    pub fn status(&self) -> HealthStatus {
        self.inner.state.borrow().status()
    }

    pub fn should_show_overlay(&self) -> bool {
        self.inner.state.borrow().should_show_overlay(self.inner.settings.max_retries)
    }

    pub fn is_polling(&self) -> bool {
        self.lock_poller().as_ref().is_some_and(|poller| !poller.is_finished())
    }

    /// A request got no response: mark unreachable and start probing.
    pub fn handle_network_error(&self) {
        let cap = self.inner.settings.max_retries.saturating_add(1);
        self.inner.state.send_modify(|state| {
            state.server_reachable = false;
            state.consecutive_failures = (state.consecutive_failures + 1).min(cap);
            state.last_checked_at = Some(Utc::now());
        });
        debug!(failures = self.inner.state.borrow().consecutive_failures, "server marked unreachable");
        self.start_polling();
    }

    /// A request got a response: mark reachable and stop probing.
    pub fn handle_network_recovery(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            let changed = !state.server_reachable || state.consecutive_failures != 0;
            state.server_reachable = true;
            state.consecutive_failures = 0;
            changed
        });
        if changed {
            info!("server reachable again");
        }
        self.stop_polling();
    }

    /// Probe the health endpoint once. Concurrent calls do not stack; they
    /// return the current reachability.
    pub async fn check_server_health(&self) -> bool {
        if self.inner.checking.swap(true, Ordering::AcqRel) {
            return self.inner.state.borrow().server_reachable;
        }
        let outcome = self.inner.probe.probe().await;
        self.inner.checking.store(false, Ordering::Release);

        match outcome {
            ProbeOutcome::Reachable(status) => {
                debug!(status, "health probe answered");
                self.inner.state.send_modify(|state| state.last_checked_at = Some(Utc::now()));
                self.handle_network_recovery();
            }
            ProbeOutcome::ServerError(status) => {
                warn!(status, "health probe got a server error");
                self.inner.state.send_modify(|state| state.last_checked_at = Some(Utc::now()));
            }
            ProbeOutcome::NoResponse(reason) => {
                warn!(reason = %reason, "health probe got no response");
                self.handle_network_error();
            }
        }
        self.inner.state.borrow().server_reachable
    }

    /// Host connectivity changed. Coming back online probes immediately.
    pub async fn set_browser_online(&self, online: bool) {
        let mut came_online = false;
        self.inner.state.send_if_modified(|state| {
            if state.browser_online == online {
                return false;
            }
            came_online = online;
            state.browser_online = online;
            true
        });
        if came_online {
            info!("host back online, probing server");
            self.check_server_health().await;
        }
    }

    fn lock_poller(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.poller.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_polling(&self) {
        let mut poller = self.lock_poller();
        if poller.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let weak: Weak<MonitorInner<P>> = Arc::downgrade(&self.inner);
        let period = self.inner.settings.probe_interval;
        *poller = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let monitor = ConnectionHealthMonitor { inner };
                if monitor.check_server_health().await {
                    return;
                }
            }
        }));
        debug!(interval_secs = period.as_secs(), "health polling started");
    }

    fn stop_polling(&self) {
        if let Some(poller) = self.lock_poller().take() {
            poller.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct ScriptedProbe {
        outcomes: Mutex<VecDeque<ProbeOutcome>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedProbe {
        fn with(outcomes: Vec<ProbeOutcome>) -> Self {
            Self { outcomes: Mutex::new(outcomes.into()), ..Self::default() }
        }
    }

    impl HealthProbe for Arc<ScriptedProbe> {
        async fn probe(&self) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.outcomes.lock().unwrap().pop_front().unwrap_or(ProbeOutcome::Reachable(200))
        }
    }

    fn monitor(probe: ScriptedProbe) -> (ConnectionHealthMonitor<Arc<ScriptedProbe>>, Arc<ScriptedProbe>) {
        let probe = Arc::new(probe);
        (ConnectionHealthMonitor::new(probe.clone(), HealthSettings::default()), probe)
    }

    #[test]
    fn derived_status() {
        let mut state = HealthState::default();
        assert_eq!(state.status(), HealthStatus::Connected);
        state.server_reachable = false;
        assert_eq!(state.status(), HealthStatus::ServerDown);
        state.browser_online = false;
        assert_eq!(state.status(), HealthStatus::Offline);
        assert!(!state.should_show_overlay(3));
        state.consecutive_failures = 3;
        assert!(state.should_show_overlay(3));
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_the_server_answers() {
        let (monitor, probe) = monitor(ScriptedProbe::with(vec![ProbeOutcome::NoResponse("refused".into())]));

        monitor.handle_network_error();
        assert_eq!(monitor.status(), HealthStatus::ServerDown);
        assert!(monitor.is_polling());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.state().consecutive_failures, 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
        assert!(monitor.is_connected());
        assert_eq!(monitor.state().consecutive_failures, 0);
        assert!(monitor.state().last_checked_at.is_some());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
        assert!(!monitor.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_saturate_and_show_overlay() {
        let (monitor, _) = monitor(ScriptedProbe::default());
        for _ in 0..10 {
            monitor.handle_network_error();
        }
        assert_eq!(monitor.state().consecutive_failures, 4);
        assert!(monitor.should_show_overlay());

        monitor.handle_network_recovery();
        assert!(!monitor.should_show_overlay());
        assert!(!monitor.is_polling());
    }

    #[tokio::test]
    async fn server_error_leaves_reachability_unchanged() {
        let (monitor, _) = monitor(ScriptedProbe::with(vec![
            ProbeOutcome::ServerError(503),
            ProbeOutcome::ServerError(500),
        ]));
        assert!(monitor.check_server_health().await);
        assert!(monitor.state().last_checked_at.is_some());

        monitor.inner.state.send_modify(|state| state.server_reachable = false);
        assert!(!monitor.check_server_health().await);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_checks_share_one_probe() {
        let probe = ScriptedProbe { delay: Some(Duration::from_secs(2)), ..ScriptedProbe::default() };
        let (monitor, probe) = monitor(probe);

        let (a, b) = tokio::join!(monitor.check_server_health(), monitor.check_server_health());
        assert!(a && b);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn coming_back_online_probes_immediately() {
        let (monitor, probe) = monitor(ScriptedProbe::default());
        let mut changes = monitor.watch();

        monitor.set_browser_online(false).await;
        assert_eq!(monitor.status(), HealthStatus::Offline);
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);

        monitor.set_browser_online(true).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert!(monitor.is_connected());

        monitor.set_browser_online(true).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }
}
