//! Cross-thread stop signal for a single run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// A shared flag for requesting a cooperative stop.
///
/// The atomic is what synchronous code polls; the watch channel wakes async waiters on the
/// execution thread. Both are set together and never reset, a fresh signal is made per run.
#[derive(Clone)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request a stop. Idempotent.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.tx.send_replace(true);
    }

    /// Whether a stop was requested.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once a stop is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Err only if every sender is gone, which cannot happen while `self` holds one
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}
