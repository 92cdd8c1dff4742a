// Observer registry for store mutations.
//
// Changes are queued while the store lock is held and delivered by a single
// dispatcher task, so observers run after the mutation is visible and always
// in mutation order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dentika_common::types::Notification;
use tokio::sync::mpsc;
use tracing::debug;

/// Kind of store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreEvent {
    Added,
    Updated,
    Read,
    AllRead,
    Dismissed,
    Removed,
    Cleared,
}

impl StoreEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Read => "read",
            Self::AllRead => "all_read",
            Self::Dismissed => "dismissed",
            Self::Removed => "removed",
            Self::Cleared => "cleared",
        }
    }
}

/// One delivered change. Bulk events (`AllRead`, `Cleared`) carry no entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub event: StoreEvent,
    pub notification: Option<Notification>,
}

type Callback = Arc<dyn Fn(&StoreChange) + Send + Sync>;
type Registry = Arc<Mutex<BTreeMap<u64, Callback>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, BTreeMap<u64, Callback>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ObserverBus {
    registry: Registry,
    next_id: Mutex<u64>,
    queue: mpsc::UnboundedSender<StoreChange>,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl ObserverBus {
    /// Must be called inside a tokio runtime; spawns the dispatcher.
    pub fn new() -> Self {
        let registry: Registry = Arc::default();
        let (queue, changes) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(changes, registry.clone()));
        Self { registry, next_id: Mutex::new(0), queue, dispatcher }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            *next += 1;
            *next
        };
        lock(&self.registry).insert(id, Arc::new(callback));
        Subscription { id, registry: Arc::downgrade(&self.registry) }
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Queue a change for delivery. Call while holding the lock that
    /// guarded the mutation.
    pub fn emit(&self, event: StoreEvent, notification: Option<Notification>) {
        if self.queue.send(StoreChange { event, notification }).is_err() {
            debug!(event = event.as_str(), "observer dispatcher gone, dropping change");
        }
    }
}

impl Drop for ObserverBus {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Handle returned by `subscribe`. Dropping it keeps the observer
/// registered; call `unsubscribe` to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<BTreeMap<u64, Callback>>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(&self.id);
        }
    }
}

async fn dispatch(mut changes: mpsc::UnboundedReceiver<StoreChange>, registry: Registry) {
    while let Some(change) = changes.recv().await {
        let callbacks: Vec<Callback> = lock(&registry).values().cloned().collect();
        for callback in callbacks {
            callback(&change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn delivers_in_emit_order() {
        let bus = ObserverBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bus.subscribe(move |change| tx.send(change.event).unwrap());

        bus.emit(StoreEvent::Added, None);
        bus.emit(StoreEvent::Read, None);
        bus.emit(StoreEvent::Removed, None);

        assert_eq!(rx.recv().await, Some(StoreEvent::Added));
        assert_eq!(rx.recv().await, Some(StoreEvent::Read));
        assert_eq!(rx.recv().await, Some(StoreEvent::Removed));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = ObserverBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let counted = calls.clone();
        let sub = bus.subscribe(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        let _probe = bus.subscribe(move |change| tx.send(change.event).unwrap());

        bus.emit(StoreEvent::Added, None);
        rx.recv().await.unwrap();
        sub.unsubscribe();
        assert_eq!(bus.observer_count(), 1);

        bus.emit(StoreEvent::Cleared, None);
        rx.recv().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
