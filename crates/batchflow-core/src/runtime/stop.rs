//! Cooperative stop signal shared by all runners of a job execution.

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Notified once, synchronously, when a stop is requested.
pub trait StopObserver: Send + Sync {
    fn on_stop(&self);
}

/// A job-wide stop flag.
///
/// Chunk loops poll `is_stop_requested` at checkpoint boundaries; batchlet
/// runners await `cancelled` to forward the request to `Batchlet::stop`.
#[derive(Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    observers: Arc<Mutex<Vec<Arc<dyn StopObserver>>>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. If a stop was already requested it is notified
    /// immediately.
    pub fn register(&self, observer: Arc<dyn StopObserver>) {
        if self.token.is_cancelled() {
            observer.on_stop();
            return;
        }
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Request a stop. Only the first call notifies observers.
    pub fn request_stop(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        let observers = std::mem::take(
            &mut *self.observers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for observer in observers {
            observer.on_stop();
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop is requested.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("stop_requested", &self.token.is_cancelled())
            .finish()
    }
}
