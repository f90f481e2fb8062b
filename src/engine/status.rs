//! Run status and the status cell shared between the engine and its run thread.
//!
//! # State Machine
//!
//! ```text
//! Idle ──start──> Running ──stop──> Stopping
//!                   │                  │
//!                   ├──────────────────┴──> Finished
//!                   └──────────────────┴──> Error
//! ```
//!
//! `Finished` and `Error` are terminal for a run; `start` is accepted again from there.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

/// Execution status of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// No run has been started
    Idle,
    /// A run is executing
    Running,
    /// Stop was requested, teardown pending
    Stopping,
    /// The last run ended without error
    Finished,
    /// The last run failed
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "IDLE"),
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::Stopping => write!(f, "STOPPING"),
            RunStatus::Finished => write!(f, "FINISHED"),
            RunStatus::Error => write!(f, "ERROR"),
        }
    }
}

impl RunStatus {
    /// Whether a new run may start.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            RunStatus::Idle | RunStatus::Finished | RunStatus::Error
        )
    }

    /// Whether a run is in flight (running or stopping).
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Stopping)
    }

    /// Whether this is an end state of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Finished | RunStatus::Error)
    }
}

/// Status listener callback.
pub type StatusListener = Arc<dyn Fn(RunStatus) + Send + Sync>;

/// Identifies one run's claim on the status cell.
///
/// Handed out by [`StatusCell::begin_run`]. Only the holder of the newest epoch can end a run,
/// so a detached lifecycle from an earlier run cannot overwrite the status of the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunEpoch(u64);

struct Inner {
    status: RunStatus,
    last_error: Option<String>,
    epoch: u64,
}

/// The single authoritative status, plus the last captured error and listeners.
#[derive(Clone)]
pub struct StatusCell {
    inner: Arc<Mutex<Inner>>,
    listeners: Arc<Mutex<Vec<StatusListener>>>,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCell {
    /// A cell in `Idle` with no error.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                status: RunStatus::Idle,
                last_error: None,
                epoch: 0,
            })),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Current status.
    pub fn get(&self) -> RunStatus {
        self.inner.lock().status
    }

    /// Last captured error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Whether `epoch` belongs to the most recently started run.
    pub fn is_current(&self, epoch: RunEpoch) -> bool {
        self.inner.lock().epoch == epoch.0
    }

    /// Register a listener called on every transition.
    pub fn subscribe(&self, listener: StatusListener) {
        self.listeners.lock().push(listener);
    }

    /// Set `to` only if the current status satisfies `allowed`. Returns whether it changed.
    pub fn transition_if(&self, allowed: impl Fn(RunStatus) -> bool, to: RunStatus) -> bool {
        {
            let mut inner = self.inner.lock();
            if !allowed(inner.status) {
                return false;
            }
            debug!(from = %inner.status, to = %to, "Status transition");
            inner.status = to;
        }
        self.notify(to);
        true
    }

    /// Clear the error and enter `Running` under a fresh epoch. `None` if a run is active.
    pub fn begin_run(&self) -> Option<RunEpoch> {
        let epoch = {
            let mut inner = self.inner.lock();
            if !inner.status.can_start() {
                return None;
            }
            inner.epoch += 1;
            inner.last_error = None;
            inner.status = RunStatus::Running;
            inner.epoch
        };
        self.notify(RunStatus::Running);
        Some(RunEpoch(epoch))
    }

    /// Record an error and enter `Error`, unless a newer run has started since `epoch`.
    pub fn fail_run(&self, epoch: RunEpoch, message: impl Into<String>) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch.0 {
                debug!(stale = epoch.0, current = inner.epoch, "Ignoring failure of an earlier run");
                return false;
            }
            inner.last_error = Some(message.into());
            inner.status = RunStatus::Error;
        }
        self.notify(RunStatus::Error);
        true
    }

    /// Enter `Finished` unless the run failed or a newer run has started since `epoch`.
    pub fn finish_run(&self, epoch: RunEpoch) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch.0 {
                debug!(stale = epoch.0, current = inner.epoch, "Ignoring end of an earlier run");
                return false;
            }
            if inner.status == RunStatus::Error {
                return false;
            }
            debug!(from = %inner.status, "Status transition to FINISHED");
            inner.status = RunStatus::Finished;
        }
        self.notify(RunStatus::Finished);
        true
    }

    fn notify(&self, status: RunStatus) {
        // Clone out so listeners may call back into the engine
        let listeners: Vec<StatusListener> = self.listeners.lock().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(status))).is_err() {
                error!(%status, "Status listener panicked");
            }
        }
    }
}
