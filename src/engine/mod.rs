//! Experiment execution engine.
//!
//! The engine owns the run state machine and everything a single run needs: a dedicated
//! execution thread with its own scheduler, the stop signal, the sync clock, the row writer
//! and the data channel the consumer polls.
//!
//! # Architecture
//!
//! ```text
//! Consumer ──start/stop/sync──> ExperimentEngine ──spawn──> ExecutionThread
//!    ▲                                 │                         │
//!    │                                 │ schedules               ▼
//!    │                                 └───────────────────> Lifecycle
//!    │                                                           │
//!    └──── try_recv_row / drain_rows <── data channel <── rows ──┤──> RowWriter (.csv)
//!    └──── on_status_change <────────── StatusCell <─────────────┘
//! ```
//!
//! None of the public operations block on the run. `stop()` only requests cancellation; the
//! lifecycle notices it at the procedure's next suspension point, runs teardown and reports
//! `Finished`.
//!
//! # Example
//!
//! ```rust,no_run
//! use labrun::{config::Settings, engine::ExperimentEngine, params::ParamValues, samples};
//! use std::sync::Arc;
//!
//! let engine = ExperimentEngine::new(Arc::new(Settings::default()));
//! engine.on_status_change(|status| println!("status: {status}"));
//!
//! let registry = samples::registry();
//! let walk = registry.find("random-walk")?;
//! engine.start(&walk.experiment, &ParamValues::new(), true)?;
//!
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! for row in engine.drain_rows() {
//!     println!("{row:?}");
//! }
//! engine.stop();
//! engine.shutdown();
//! # Ok::<(), labrun::error::LabError>(())
//! ```

mod clock;
mod lifecycle;
mod status;
mod stop;
mod thread;

pub use clock::{RunClock, DERIVED_COLUMNS, SYNC_T_COLUMN, TIME_COLUMN, T_COLUMN};
pub use status::{RunEpoch, RunStatus, StatusCell, StatusListener};
pub use stop::StopSignal;
pub use thread::{ExecutionThread, ShutdownGuard, ShutdownTrigger};

use crate::config::Settings;
use crate::error::{LabError, LabResult};
use crate::experiment::{ExperimentContext, ExperimentType, Row};
use crate::log_buffer::{LogBuffer, RunLog};
use crate::params::ParamValues;
use crate::storage::{RowWriter, RunLogWriter, RunMetadata, RunPaths};
use chrono::{DateTime, Local};
use lifecycle::{Lifecycle, RowSink};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Level};
use uuid::Uuid;

/// Read-only description of the current (or last) run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Experiment type id
    pub experiment_type: String,
    /// Experiment display name
    pub experiment_name: String,
    /// Resolved parameters
    pub params: ParamValues,
    /// Whether the run writes no files
    pub debug: bool,
    /// Row file, absent in debug mode
    pub row_file: Option<PathBuf>,
    /// Wall-clock start
    pub started_at: DateTime<Local>,
}

struct ActiveRun {
    snapshot: RunSnapshot,
    stop: StopSignal,
    clock: RunClock,
    log: RunLog,
    rows: mpsc::UnboundedReceiver<Row>,
    release: watch::Sender<bool>,
    thread: Option<ExecutionThread>,
}

impl ActiveRun {
    /// Cut the drain delay short and wait for the execution thread.
    fn release_thread(&mut self, timeout: std::time::Duration) {
        self.release.send_replace(true);
        if let Some(thread) = self.thread.take() {
            thread.join_timeout(timeout);
        }
    }
}

/// Runs one experiment at a time on a dedicated thread.
pub struct ExperimentEngine {
    settings: Arc<Settings>,
    status: StatusCell,
    log_buffer: LogBuffer,
    current: Mutex<Option<ActiveRun>>,
    start_guard: Mutex<()>,
}

impl ExperimentEngine {
    /// Create an idle engine.
    pub fn new(settings: Arc<Settings>) -> Self {
        let log_buffer = LogBuffer::new(settings.engine.log_buffer_capacity);
        Self {
            settings,
            status: StatusCell::new(),
            log_buffer,
            current: Mutex::new(None),
            start_guard: Mutex::new(()),
        }
    }

    /// Settings in use
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Start a run of `experiment` with parameter `overrides`.
    ///
    /// Does nothing (with a warning) while a run is active. Parameter and persistence errors
    /// are returned before any thread exists and leave the status unchanged. In `debug` mode
    /// no files are written.
    pub fn start(
        &self,
        experiment: &ExperimentType,
        overrides: &ParamValues,
        debug: bool,
    ) -> LabResult<()> {
        let _serialized = self.start_guard.lock();

        let status = self.status.get();
        if status.is_active() {
            warn!(%status, "Start ignored: a run is already active");
            return Ok(());
        }

        let info = experiment.info();
        let params = experiment.resolve(overrides)?;
        let instance = experiment.instantiate(&params).map_err(|e| {
            LabError::Configuration(format!("Cannot create '{}': {e:#}", info.name))
        })?;

        let previous = self.current.lock().take();
        if let Some(mut previous) = previous {
            previous.release_thread(self.settings.engine.join_timeout());
        }

        let run_id = Uuid::new_v4();
        let started_at = Local::now();
        let files = if debug {
            None
        } else {
            let paths = RunPaths::allocate(&self.settings.data, &info.name, started_at)?;
            let metadata = RunMetadata {
                run_id,
                experiment_name: info.name.clone(),
                experiment_type: info.type_id.clone(),
                parameters: params.clone(),
                plotters: info.plotters.clone(),
                start_time: started_at,
                columns: info.columns.clone(),
                row_file: format!("{}.{}", paths.stem, crate::storage::ROW_EXT),
                software_version: env!("CARGO_PKG_VERSION").to_string(),
            };
            Some(open_run_files(paths, &info.columns, &metadata)?)
        };

        let short_id: String = run_id.simple().to_string().chars().take(8).collect();
        let thread = match ExecutionThread::spawn(format!("labrun-{short_id}")) {
            Ok(thread) => thread,
            Err(e) => {
                if let Some(files) = files {
                    files.discard();
                }
                return Err(e);
            }
        };
        let (writer, log_files, row_file) = match files {
            Some(RunFiles { writer, log }) => {
                let row_file = writer.row_path();
                (Some(writer), Some(log), Some(row_file))
            }
            None => (None, None, None),
        };

        let clock = RunClock::start();
        let stop = StopSignal::new();
        let log = RunLog::new(self.log_buffer.clone(), clock.clone(), log_files);
        let params = Arc::new(params);
        let ctx = ExperimentContext::new(params.clone(), clock.clone(), stop.clone(), log.clone());
        let (row_tx, row_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = watch::channel(false);

        *self.current.lock() = Some(ActiveRun {
            snapshot: RunSnapshot {
                run_id,
                experiment_type: info.type_id.clone(),
                experiment_name: info.name.clone(),
                params: params.as_ref().clone(),
                debug,
                row_file: row_file.clone(),
                started_at,
            },
            stop: stop.clone(),
            clock: clock.clone(),
            log: log.clone(),
            rows: row_rx,
            release: release_tx,
            thread: None,
        });

        let Some(epoch) = self.status.begin_run() else {
            // Unreachable while starts are serialized; keep the thread from leaking anyway
            thread.trigger().fire();
            thread.join_timeout(self.settings.engine.join_timeout());
            return Err(LabError::Thread("engine state changed during start".to_string()));
        };

        let lifecycle = Lifecycle {
            run_id,
            epoch,
            name: info.name.clone(),
            experiment: instance,
            ctx,
            stop,
            status: self.status.clone(),
            sink: RowSink {
                clock,
                writer,
                tx: row_tx,
                produced: 0,
            },
            log,
            drain_delay: self.settings.engine.drain_delay(),
            release: release_rx,
            shutdown: thread.trigger(),
        };

        let debug_mode = debug;
        info!(
            %run_id,
            experiment = %info.name,
            debug = debug_mode,
            row_file = ?row_file,
            "Run starting"
        );
        thread.handle().spawn(lifecycle.run());
        if let Some(run) = self.current.lock().as_mut() {
            run.thread = Some(thread);
        }
        Ok(())
    }

    /// Request the running experiment to stop. Non-blocking; ignored unless `Running`.
    pub fn stop(&self) {
        let Some((stop, log)) = self
            .current
            .lock()
            .as_ref()
            .map(|run| (run.stop.clone(), run.log.clone()))
        else {
            debug!("Stop ignored: no run");
            return;
        };
        if !self
            .status
            .transition_if(|s| s == RunStatus::Running, RunStatus::Stopping)
        {
            debug!(status = %self.status.get(), "Stop ignored");
            return;
        }
        log.system(Level::INFO, "Stop requested");
        stop.trigger();
    }

    /// Mark now as the sync reference for `sync_t`. Ignored unless `Running`.
    pub fn sync(&self) {
        if self.status.get() != RunStatus::Running {
            debug!("Sync ignored: not running");
            return;
        }
        if let Some(run) = self.current.lock().as_ref() {
            run.clock.sync();
            run.log.system(Level::DEBUG, "Sync marker set");
        }
    }

    /// Current status
    pub fn status(&self) -> RunStatus {
        self.status.get()
    }

    /// Error captured from the last run, if it failed.
    pub fn last_error(&self) -> Option<String> {
        self.status.last_error()
    }

    /// Description of the current or most recent run.
    pub fn current_run(&self) -> Option<RunSnapshot> {
        self.current.lock().as_ref().map(|run| run.snapshot.clone())
    }

    /// Register a listener invoked on every status transition.
    ///
    /// Listeners run synchronously on whichever thread made the transition, so they should
    /// be quick. A panicking listener is logged and skipped.
    pub fn on_status_change<F>(&self, listener: F)
    where
        F: Fn(RunStatus) + Send + Sync + 'static,
    {
        self.status.subscribe(Arc::new(listener));
    }

    /// Next row from the current run's data channel, if one is ready.
    pub fn try_recv_row(&self) -> Option<Row> {
        self.current
            .lock()
            .as_mut()
            .and_then(|run| run.rows.try_recv().ok())
    }

    /// All rows that are ready, in production order.
    pub fn drain_rows(&self) -> Vec<Row> {
        let mut guard = self.current.lock();
        let mut rows = Vec::new();
        if let Some(run) = guard.as_mut() {
            while let Ok(row) = run.rows.try_recv() {
                rows.push(row);
            }
        }
        rows
    }

    /// Operator log buffer shared by all runs of this engine.
    pub fn log_buffer(&self) -> LogBuffer {
        self.log_buffer.clone()
    }

    /// Stop any active run, skip the drain delay and join the execution thread (bounded).
    ///
    /// Rows already in the data channel stay readable.
    pub fn shutdown(&self) {
        self.stop();
        let thread = {
            let mut guard = self.current.lock();
            guard.as_mut().and_then(|run| {
                run.release.send_replace(true);
                run.thread.take()
            })
        };
        if let Some(thread) = thread {
            debug!(thread = %thread.name(), "Joining execution thread");
            thread.join_timeout(self.settings.engine.join_timeout());
        }
    }
}

impl Drop for ExperimentEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Files of a recorded run, open and ready for rows.
struct RunFiles {
    writer: RowWriter,
    log: RunLogWriter,
}

impl RunFiles {
    /// Close and delete everything, for a run that never started.
    fn discard(self) {
        let paths = self.writer.paths().clone();
        drop(self);
        paths.remove_files();
    }
}

/// Write the metadata sidecar, open the row file and the log files.
///
/// On failure whatever was already created is removed again, so no sidecar is left behind
/// for a run that never started.
fn open_run_files(
    paths: RunPaths,
    columns: &[String],
    metadata: &RunMetadata,
) -> LabResult<RunFiles> {
    let mut writer = RowWriter::new(paths.clone(), columns);
    let opened = writer
        .save_metadata(metadata)
        .and_then(|()| writer.start_writing())
        .and_then(|()| RunLogWriter::create(&paths));
    match opened {
        Ok(log) => Ok(RunFiles { writer, log }),
        Err(e) => {
            drop(writer);
            warn!(stem = %paths.stem, error = %e, "Could not prepare run files; removing them");
            paths.remove_files();
            Err(e)
        }
    }
}
