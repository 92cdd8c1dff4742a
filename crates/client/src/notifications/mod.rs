// Notification store: the single in-memory ledger of notifications.
//
// Every producer (realtime bus, REST backfill, local UI actions) goes through
// `add_notification`, which normalizes, deduplicates and then either merges
// into an existing entry or prepends a new one. The list view and the toast
// view are two projections of the same entries.
//
// Invariants held under the state lock:
//   - `unread` == number of entries with `is_read == false`
//   - at most `max_entries` entries, newest first
//   - every mutation queues exactly one observer change before unlocking

pub mod backfill;
pub mod observer;
mod producers;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use dentika_common::types::{Notification, NotificationId, NotificationSource, RawNotification, ReadFilter};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use backfill::{NoBackfill, NotificationBackfill, NotificationPage, PageQuery, Pagination};
pub use observer::{StoreChange, StoreEvent, Subscription};
pub use producers::{AppointmentSummary, AppointmentUpdateKind, PatientSummary, PatientUpdateKind};

use crate::config::NotificationsConfig;
use crate::realtime::flight::SingleFlight;
use observer::ObserverBus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub max_entries: usize,
    pub toast_dismiss_delay: Duration,
    /// Fuzzy-dedup window around `created_at`.
    pub dedup_window: Duration,
    pub page_size: u32,
    pub recent_count: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::from_config(&NotificationsConfig::default())
    }
}

impl StoreSettings {
    pub fn from_config(config: &NotificationsConfig) -> Self {
        Self {
            max_entries: config.max_entries.max(1),
            toast_dismiss_delay: config.toast_dismiss_delay(),
            dedup_window: config.dedup_window(),
            page_size: config.page_size,
            recent_count: config.recent_count,
        }
    }
}

/// How a producer wants a notification handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOptions {
    pub source: NotificationSource,
    pub show_as_toast: bool,
    /// Keep the entry in the list once its toast times out.
    pub persist: bool,
    /// Start the toast timeout.
    pub auto_remove: bool,
}

impl AddOptions {
    pub fn realtime() -> Self {
        Self { source: NotificationSource::Realtime, show_as_toast: true, persist: true, auto_remove: true }
    }

    pub fn backfill() -> Self {
        Self { source: NotificationSource::Api, show_as_toast: false, persist: true, auto_remove: false }
    }

    /// Transient local toast: gone from the list once the toast times out.
    pub fn local() -> Self {
        Self { source: NotificationSource::Local, show_as_toast: true, persist: false, auto_remove: true }
    }

    /// Stays until the user deals with it.
    pub fn sticky(self) -> Self {
        Self { persist: true, auto_remove: false, ..self }
    }
}

#[derive(Default)]
struct StoreState {
    entries: Vec<Notification>,
    unread: usize,
    remote_unread: Option<u64>,
    initialized: bool,
    toast_timers: HashMap<NotificationId, JoinHandle<()>>,
}

impl StoreState {
    fn position(&self, id: &NotificationId) -> Option<usize> {
        self.entries.iter().position(|entry| &entry.id == id)
    }

    /// Exact id first, then same title and message with `created_at`
    /// inside the window. The fuzzy rule can merge two distinct
    /// notifications that share their text and arrive within the window.
    fn find_match(&self, incoming: &Notification, window: Duration) -> Option<usize> {
        let window_ms = window.as_millis() as i64;
        self.position(&incoming.id).or_else(|| {
            self.entries.iter().position(|entry| {
                entry.title == incoming.title
                    && entry.message == incoming.message
                    && (entry.created_at - incoming.created_at).num_milliseconds().abs() <= window_ms
            })
        })
    }

    fn remove_at(&mut self, index: usize) -> Notification {
        let removed = self.entries.remove(index);
        if !removed.is_read {
            self.unread = self.unread.saturating_sub(1);
        }
        if let Some(timer) = self.toast_timers.remove(&removed.id) {
            timer.abort();
        }
        removed
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.unread = 0;
        for (_, timer) in self.toast_timers.drain() {
            timer.abort();
        }
    }
}

/// Fold a duplicate into the stored entry. The stored id and creation time
/// win; read and dismissed flags never revert.
fn merge(existing: &mut Notification, incoming: Notification) {
    existing.title = incoming.title;
    existing.message = incoming.message;
    existing.kind = incoming.kind;
    existing.icon = incoming.icon;
    existing.color = incoming.color;
    if !incoming.actions.is_empty() {
        existing.actions = incoming.actions;
    }
    existing.payload.extend(incoming.payload);
    existing.is_read |= incoming.is_read;
    existing.show_as_toast |= incoming.show_as_toast;
    if incoming.source.is_server_known() {
        existing.source = incoming.source;
    }
}

struct StoreInner<B> {
    backfill: B,
    settings: StoreSettings,
    state: Mutex<StoreState>,
    observers: ObserverBus,
    init_flight: SingleFlight,
}

impl<B> StoreInner<B> {
    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expire_toast(&self, id: &NotificationId, persist: bool) {
        let mut guard = self.state();
        let state = &mut *guard;
        // This runs on the timer task; detach rather than abort it.
        state.toast_timers.remove(id);
        let Some(index) = state.position(id) else {
            return;
        };
        if !persist {
            let removed = state.remove_at(index);
            debug!(id = %removed.id, "toast expired, removing notification");
            self.observers.emit(StoreEvent::Removed, Some(removed));
            return;
        }
        let entry = &mut state.entries[index];
        if entry.dismissed_from_toast {
            return;
        }
        entry.dismissed_from_toast = true;
        self.observers.emit(StoreEvent::Dismissed, Some(entry.clone()));
    }
}

/// Cheap to clone; clones share one ledger.
pub struct NotificationStore<B: NotificationBackfill> {
    inner: Arc<StoreInner<B>>,
}

impl<B: NotificationBackfill> Clone for NotificationStore<B> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<B: NotificationBackfill> NotificationStore<B> {
    /// Must be called inside a tokio runtime.
    pub fn new(backfill: B, settings: StoreSettings) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backfill,
                settings,
                state: Mutex::new(StoreState::default()),
                observers: ObserverBus::new(),
                init_flight: SingleFlight::new(),
            }),
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.inner.settings
    }

    pub fn backfill(&self) -> &B {
        &self.inner.backfill
    }

    /// Register an observer for every mutation.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(callback)
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Snapshot of the list, newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.state().entries.clone()
    }

    pub fn get(&self, id: &NotificationId) -> Option<Notification> {
        let state = self.inner.state();
        state.position(id).map(|index| state.entries[index].clone())
    }

    pub fn len(&self) -> usize {
        self.inner.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unread_count(&self) -> usize {
        self.inner.state().unread
    }

    pub fn has_unread(&self) -> bool {
        self.unread_count() > 0
    }

    /// Last count reported by the server, if fetched.
    pub fn remote_unread_count(&self) -> Option<u64> {
        self.inner.state().remote_unread
    }

    pub fn recent(&self) -> Vec<Notification> {
        self.recent_n(self.inner.settings.recent_count)
    }

    pub fn recent_n(&self, count: usize) -> Vec<Notification> {
        self.inner.state().entries.iter().take(count).cloned().collect()
    }

    /// Entries the toast view should show.
    pub fn toasts(&self) -> Vec<Notification> {
        self.inner.state().entries.iter().filter(|entry| entry.is_toast_visible()).cloned().collect()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state().initialized
    }

    // ── Mutations ───────────────────────────────────────────────────

    /// The single ingestion path. Returns the stored notification (the
    /// merged entry when the input was a duplicate).
    pub fn add_notification(&self, raw: RawNotification, options: AddOptions) -> Notification {
        let mut incoming = Notification::from_raw(&raw, options.source, Utc::now());
        incoming.show_as_toast = options.show_as_toast;

        let mut guard = self.inner.state();
        let state = &mut *guard;

        if let Some(index) = state.find_match(&incoming, self.inner.settings.dedup_window) {
            let entry = &mut state.entries[index];
            let was_unread = !entry.is_read;
            merge(entry, incoming);
            let merged = entry.clone();
            if was_unread && merged.is_read {
                state.unread = state.unread.saturating_sub(1);
            }
            debug!(id = %merged.id, source = ?options.source, "merged duplicate notification");
            let needs_timer = options.auto_remove
                && options.show_as_toast
                && merged.is_toast_visible()
                && !state.toast_timers.contains_key(&merged.id);
            if needs_timer {
                self.schedule_toast_expiry(state, merged.id.clone(), options.persist);
            }
            self.inner.observers.emit(StoreEvent::Updated, Some(merged.clone()));
            return merged;
        }

        let stored = incoming;
        state.entries.insert(0, stored.clone());
        if !stored.is_read {
            state.unread += 1;
        }
        while state.entries.len() > self.inner.settings.max_entries {
            let last = state.entries.len() - 1;
            let evicted = state.remove_at(last);
            debug!(id = %evicted.id, "evicted oldest notification");
        }
        if options.auto_remove && options.show_as_toast {
            self.schedule_toast_expiry(state, stored.id.clone(), options.persist);
        }
        self.inner.observers.emit(StoreEvent::Added, Some(stored.clone()));
        stored
    }

    fn schedule_toast_expiry(&self, state: &mut StoreState, id: NotificationId, persist: bool) {
        let weak: Weak<StoreInner<B>> = Arc::downgrade(&self.inner);
        let delay = self.inner.settings.toast_dismiss_delay;
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_toast(&timer_id, persist);
            }
        });
        if let Some(previous) = state.toast_timers.insert(id, timer) {
            previous.abort();
        }
    }

    /// Mark one entry read. Returns false if it is unknown or already read.
    /// Server-known entries are synced best-effort.
    pub async fn mark_as_read(&self, id: &NotificationId) -> bool {
        let source = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            let Some(entry) = state.entries.iter_mut().find(|entry| &entry.id == id) else {
                return false;
            };
            if entry.is_read {
                return false;
            }
            entry.is_read = true;
            let snapshot = entry.clone();
            state.unread = state.unread.saturating_sub(1);
            let source = snapshot.source;
            self.inner.observers.emit(StoreEvent::Read, Some(snapshot));
            source
        };

        if source.is_server_known() {
            if let Err(error) = self.inner.backfill.mark_read(id).await {
                warn!(id = %id, error = %error, "failed to sync read state");
            }
        }
        true
    }

    pub async fn mark_all_as_read(&self) {
        {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            for entry in state.entries.iter_mut() {
                entry.is_read = true;
            }
            state.unread = 0;
            self.inner.observers.emit(StoreEvent::AllRead, None);
        }

        match self.inner.backfill.mark_all_read().await {
            Ok(()) => self.inner.state().remote_unread = Some(0),
            Err(error) => warn!(error = %error, "failed to sync mark-all-read"),
        }
    }

    /// Hide from the toast view; the list keeps the entry.
    pub fn dismiss_from_toast(&self, id: &NotificationId) -> bool {
        let mut guard = self.inner.state();
        let state = &mut *guard;
        let Some(index) = state.position(id) else {
            return false;
        };
        if let Some(timer) = state.toast_timers.remove(id) {
            timer.abort();
        }
        let entry = &mut state.entries[index];
        if entry.dismissed_from_toast {
            return true;
        }
        entry.dismissed_from_toast = true;
        self.inner.observers.emit(StoreEvent::Dismissed, Some(entry.clone()));
        true
    }

    /// Delete from the list. Server-known entries are dismissed server-side
    /// best-effort.
    pub async fn remove_notification(&self, id: &NotificationId) -> bool {
        let removed = {
            let mut state = self.inner.state();
            let Some(index) = state.position(id) else {
                return false;
            };
            let removed = state.remove_at(index);
            self.inner.observers.emit(StoreEvent::Removed, Some(removed.clone()));
            removed
        };

        if removed.source.is_server_known() {
            if let Err(error) = self.inner.backfill.dismiss(id).await {
                warn!(id = %id, error = %error, "failed to dismiss notification on server");
            }
        }
        true
    }

    pub fn clear_all(&self) {
        let mut state = self.inner.state();
        state.clear();
        self.inner.observers.emit(StoreEvent::Cleared, None);
    }

    /// Clear everything and allow `initialize` to run again (logout).
    pub fn reset(&self) {
        let mut state = self.inner.state();
        state.clear();
        state.remote_unread = None;
        state.initialized = false;
        self.inner.observers.emit(StoreEvent::Cleared, None);
    }

    // ── Backfill ────────────────────────────────────────────────────

    /// Pull one page from the server through the normal ingestion path.
    /// Failures are logged and yield an empty page.
    pub async fn fetch_notifications(&self, page: u32, limit: u32, filter: ReadFilter) -> Vec<Notification> {
        let query = PageQuery { page, limit, filter };
        match self.inner.backfill.fetch_page(query).await {
            Ok(page) => {
                // Pages come newest first; ingest oldest first so the list
                // keeps that order after prepending.
                let mut stored: Vec<Notification> = page
                    .notifications
                    .into_iter()
                    .rev()
                    .map(|raw| self.add_notification(raw, AddOptions::backfill()))
                    .collect();
                stored.reverse();
                stored
            }
            Err(error) => {
                warn!(page, error = %error, "failed to fetch notifications");
                Vec::new()
            }
        }
    }

    /// Failures are logged and reported as zero.
    pub async fn fetch_unread_count(&self) -> u64 {
        match self.inner.backfill.unread_count().await {
            Ok(count) => {
                self.inner.state().remote_unread = Some(count);
                count
            }
            Err(error) => {
                warn!(error = %error, "failed to fetch unread count");
                0
            }
        }
    }

    /// One-time bootstrap: clear, backfill the first page, fetch the unread
    /// count. Later calls are no-ops; concurrent calls share one run.
    pub async fn initialize(&self) {
        if self.is_initialized() {
            return;
        }
        let store = self.clone();
        self.inner.init_flight.run(move || async move { store.initialize_once().await }).await;
    }

    async fn initialize_once(&self) {
        if self.is_initialized() {
            return;
        }
        self.clear_all();
        let page_size = self.inner.settings.page_size;
        let fetched = self.fetch_notifications(1, page_size, ReadFilter::All).await;
        let remote_unread = self.fetch_unread_count().await;
        self.inner.state().initialized = true;
        info!(fetched = fetched.len(), remote_unread, "notification store initialized");
    }

    /// Ask the server for a test notification. The notification itself
    /// arrives over the bus.
    pub async fn send_test_notification(&self) -> bool {
        match self.inner.backfill.send_test().await {
            Ok(()) => true,
            Err(error) => {
                warn!(error = %error, "failed to request test notification");
                false
            }
        }
    }
}
