//! Dedicated OS thread hosting a single-threaded tokio scheduler for one run.

use crate::error::{LabError, LabResult};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Asks an [`ExecutionThread`] to leave its scheduler loop.
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    /// Fire the shutdown. Tasks still pending on the scheduler are dropped.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    /// Fire when the returned guard goes out of scope, including on unwind.
    pub fn guard(&self) -> ShutdownGuard {
        ShutdownGuard(self.clone())
    }
}

/// Fires its trigger on drop.
pub struct ShutdownGuard(ShutdownTrigger);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.0.fire();
    }
}

/// A thread running a current-thread runtime until its shutdown trigger fires.
pub struct ExecutionThread {
    name: String,
    handle: Handle,
    trigger: ShutdownTrigger,
    join: Option<JoinHandle<()>>,
}

impl ExecutionThread {
    /// Spawn the thread and wait until its scheduler accepts work.
    pub fn spawn(name: impl Into<String>) -> LabResult<Self> {
        let name = name.into();
        let (handle_tx, handle_rx) = sync_channel::<Result<Handle, String>>(1);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                if handle_tx.send(Ok(rt.handle().clone())).is_err() {
                    return;
                }
                rt.block_on(async move {
                    // Err means every trigger is gone; nothing can schedule work any more
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                });
                debug!("Execution thread scheduler stopped");
            })
            .map_err(|e| LabError::Thread(format!("Cannot spawn '{name}': {e}")))?;

        let handle = handle_rx
            .recv()
            .map_err(|_| LabError::Thread(format!("'{name}' exited during startup")))?
            .map_err(|e| LabError::Thread(format!("Cannot build runtime for '{name}': {e}")))?;

        debug!(thread = %name, "Execution thread started");
        Ok(Self {
            name,
            handle,
            trigger: ShutdownTrigger {
                tx: Arc::new(shutdown_tx),
            },
            join: Some(join),
        })
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scheduler handle for spawning work onto this thread.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// A trigger that can be moved into scheduled work.
    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Whether the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the thread to exit. Returns `true` if it was joined.
    ///
    /// On timeout the thread is detached and left for process exit to reclaim.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        let Some(join) = self.join.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !join.is_finished() {
            if Instant::now() >= deadline {
                warn!(thread = %self.name, ?timeout, "Execution thread did not exit in time; detaching");
                return false;
            }
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }
        if join.join().is_err() {
            warn!(thread = %self.name, "Execution thread panicked");
        }
        debug!(thread = %self.name, "Execution thread joined");
        true
    }
}
