// Single-flight guard.
//
// The first caller spawns the work; callers arriving while it runs await the
// same shared completion instead of starting a second run. The work runs on
// its own task, so it finishes even if every caller is cancelled.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::warn;

#[derive(Clone)]
struct Flight {
    completion: Shared<BoxFuture<'static, ()>>,
    finished: Arc<AtomicBool>,
}

impl Flight {
    fn is_live(&self) -> bool {
        !self.finished.load(Ordering::Acquire)
    }
}

#[derive(Default)]
pub struct SingleFlight {
    slot: Mutex<Option<Flight>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a run is currently in flight.
    pub fn is_running(&self) -> bool {
        self.slot.lock().map(|slot| slot.as_ref().is_some_and(Flight::is_live)).unwrap_or(false)
    }

    /// Run `make()` unless a run is already in flight, then wait for
    /// whichever run is current to finish.
    pub async fn run<F, Fut>(&self, make: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let flight = {
            let Ok(mut slot) = self.slot.lock() else {
                warn!("single-flight slot poisoned, running inline");
                make().await;
                return;
            };
            match slot.as_ref() {
                Some(flight) if flight.is_live() => flight.clone(),
                _ => {
                    let finished = Arc::new(AtomicBool::new(false));
                    let work = make();
                    let done = finished.clone();
                    let task = tokio::spawn(async move {
                        work.await;
                        done.store(true, Ordering::Release);
                    });
                    let completion = async move {
                        if let Err(error) = task.await {
                            warn!(?error, "single-flight task ended abnormally");
                        }
                    }
                    .boxed()
                    .shared();
                    let flight = Flight { completion, finished };
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };

        flight.completion.clone().await;
        flight.finished.store(true, Ordering::Release);

        if let Ok(mut slot) = self.slot.lock() {
            if slot.as_ref().is_some_and(|current| current.completion.ptr_eq(&flight.completion)) {
                *slot = None;
            }
        }
    }
}

impl std::fmt::Debug for SingleFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight").field("running", &self.is_running()).finish()
    }
}
