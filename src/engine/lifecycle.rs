//! The per-run lifecycle task: setup, cancellable step driving, teardown, drain, shutdown.

use super::clock::RunClock;
use super::status::{RunEpoch, StatusCell};
use super::stop::StopSignal;
use super::thread::ShutdownTrigger;
use crate::experiment::{Experiment, ExperimentContext, Row};
use crate::log_buffer::RunLog;
use crate::storage::RowWriter;
use anyhow::{anyhow, Context};
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, Level};
use uuid::Uuid;

/// Everything a run needs on its execution thread. Built by the engine, consumed by [`Lifecycle::run`].
pub(crate) struct Lifecycle {
    pub run_id: Uuid,
    pub epoch: RunEpoch,
    pub name: String,
    pub experiment: Box<dyn Experiment>,
    pub ctx: ExperimentContext,
    pub stop: StopSignal,
    pub status: StatusCell,
    pub sink: RowSink,
    pub log: RunLog,
    pub drain_delay: Duration,
    pub release: watch::Receiver<bool>,
    pub shutdown: ShutdownTrigger,
}

/// Where stamped rows go: the row file (unless debug mode) and the consumer channel.
pub(crate) struct RowSink {
    pub clock: RunClock,
    pub writer: Option<RowWriter>,
    pub tx: mpsc::UnboundedSender<Row>,
    pub produced: u64,
}

impl RowSink {
    fn accept(&mut self, row: Row) -> anyhow::Result<()> {
        let row = self.clock.stamp(row);
        if let Some(writer) = self.writer.as_mut() {
            writer
                .write_data(&row)
                .with_context(|| format!("Failed to persist row {}", self.produced))?;
        }
        if self.tx.send(row).is_err() {
            trace!("Row receiver dropped");
        }
        self.produced += 1;
        Ok(())
    }

    fn close(&mut self, log: &RunLog) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.stop_writing() {
                log.system(Level::WARN, format!("Failed to close row file: {e}"));
            }
        }
    }
}

impl Lifecycle {
    pub async fn run(self) {
        let Lifecycle {
            run_id,
            epoch,
            name,
            mut experiment,
            ctx,
            stop,
            status,
            mut sink,
            log,
            drain_delay,
            mut release,
            shutdown,
        } = self;
        // Thread shutdown must follow even if this task unwinds
        let _shutdown = shutdown.guard();

        log.system(Level::INFO, format!("Started {name} (run {run_id})"));

        if let Err(e) = execute(experiment.as_mut(), &ctx, &stop, &mut sink).await {
            let message = format!("{e:#}");
            log.system(Level::ERROR, format!("Run failed: {message}"));
            status.fail_run(epoch, message);
        }

        match AssertUnwindSafe(experiment.teardown(&ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => debug!(%run_id, "Teardown complete"),
            Ok(Err(e)) => log.system(Level::ERROR, format!("Teardown failed: {e:#}")),
            Err(panic) => log.system(
                Level::ERROR,
                format!("Teardown panicked: {}", panic_message(panic.as_ref())),
            ),
        }

        sink.close(&log);
        if status.finish_run(epoch) {
            log.system(
                Level::INFO,
                format!("Finished {name} after {} rows", sink.produced),
            );
        }
        log.close();

        tokio::select! {
            _ = tokio::time::sleep(drain_delay) => {}
            _ = release.wait_for(|released| *released) => {}
        }
        debug!(%run_id, "Lifecycle done, shutting down execution thread");
    }
}

/// Setup, then the step stream raced against the stop signal.
///
/// `Ok` covers natural completion and stop. Errors and panics from setup or the stream,
/// and persistence failures, come back as `Err`.
async fn execute(
    experiment: &mut dyn Experiment,
    ctx: &ExperimentContext,
    stop: &StopSignal,
    sink: &mut RowSink,
) -> anyhow::Result<()> {
    match AssertUnwindSafe(experiment.setup(ctx)).catch_unwind().await {
        Ok(result) => result.context("Setup failed")?,
        Err(panic) => return Err(anyhow!("Setup panicked: {}", panic_message(panic.as_ref()))),
    }

    let steps = AssertUnwindSafe(drive_steps(experiment, ctx.clone(), stop, sink)).catch_unwind();
    tokio::select! {
        biased;
        _ = stop.cancelled() => {
            debug!("Step task cancelled");
            Ok(())
        }
        result = steps => match result {
            Ok(result) => result,
            Err(panic) => Err(anyhow!("Step panicked: {}", panic_message(panic.as_ref()))),
        },
    }
}

async fn drive_steps(
    experiment: &mut dyn Experiment,
    ctx: ExperimentContext,
    stop: &StopSignal,
    sink: &mut RowSink,
) -> anyhow::Result<()> {
    let mut steps = experiment.steps(ctx);
    loop {
        if stop.is_triggered() {
            return Ok(());
        }
        let Some(next) = steps.next().await else {
            return Ok(());
        };
        let row = next?;
        // A row that lands after the stop request is discarded
        if stop.is_triggered() {
            return Ok(());
        }
        sink.accept(row)?;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExecutionThread, RunStatus};
    use crate::experiment::RowStream;
    use crate::log_buffer::LogBuffer;
    use crate::params::ParamValues;
    use crate::storage::RunPaths;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct Emitter {
        rows: i32,
        torn_down: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Experiment for Emitter {
        fn steps(&mut self, _ctx: ExperimentContext) -> RowStream<'_> {
            futures::stream::iter((0..self.rows).map(|i| Ok::<_, anyhow::Error>(Row::new().with("n", i))))
                .boxed()
        }

        async fn teardown(&mut self, _ctx: &ExperimentContext) -> anyhow::Result<()> {
            self.torn_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Run `experiment` to completion on its own execution thread.
    fn run_to_end(
        experiment: Emitter,
        writer: Option<RowWriter>,
        status: &StatusCell,
        epoch: RunEpoch,
    ) -> mpsc::UnboundedReceiver<Row> {
        let thread = ExecutionThread::spawn("test-lifecycle").unwrap();
        let clock = RunClock::start();
        let stop = StopSignal::new();
        let log = RunLog::new(LogBuffer::new(16), clock.clone(), None);
        let ctx = ExperimentContext::new(
            Arc::new(ParamValues::new()),
            clock.clone(),
            stop.clone(),
            log.clone(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let (_release, release) = watch::channel(false);

        let lifecycle = Lifecycle {
            run_id: Uuid::new_v4(),
            epoch,
            name: "emitter".to_string(),
            experiment: Box::new(experiment),
            ctx,
            stop,
            status: status.clone(),
            sink: RowSink {
                clock,
                writer,
                tx,
                produced: 0,
            },
            log,
            drain_delay: Duration::ZERO,
            release,
            shutdown: thread.trigger(),
        };
        thread.handle().spawn(lifecycle.run());
        assert!(thread.join_timeout(Duration::from_secs(2)));
        rx
    }

    #[test]
    fn persistence_failure_ends_the_run_in_error() {
        let dir = tempdir().unwrap();
        // Never opened, so the first row is refused
        let writer = RowWriter::new(RunPaths::new(dir.path(), "run"), &["n".to_string()]);
        let torn_down = Arc::new(AtomicBool::new(false));
        let status = StatusCell::new();
        let epoch = status.begin_run().unwrap();

        let emitter = Emitter {
            rows: 3,
            torn_down: torn_down.clone(),
        };
        let mut rows = run_to_end(emitter, Some(writer), &status, epoch);

        assert_eq!(status.get(), RunStatus::Error);
        let error = status.last_error().unwrap();
        assert!(error.contains("Failed to persist row 0"), "{error}");
        assert!(torn_down.load(Ordering::SeqCst));
        // Nothing unpersisted reaches the consumer
        assert!(rows.try_recv().is_err());
    }

    #[test]
    fn late_lifecycle_leaves_newer_run_alone() {
        let status = StatusCell::new();
        let stale = status.begin_run().unwrap();
        status.fail_run(stale, "setup failed");
        let current = status.begin_run().unwrap();

        let torn_down = Arc::new(AtomicBool::new(false));
        let emitter = Emitter {
            rows: 2,
            torn_down: torn_down.clone(),
        };
        let mut rows = run_to_end(emitter, None, &status, stale);

        assert!(torn_down.load(Ordering::SeqCst));
        assert_eq!(status.get(), RunStatus::Running);
        assert!(status.last_error().is_none());
        assert!(status.is_current(current));
        assert!(rows.try_recv().is_ok());
    }

    #[test]
    fn panic_message_handles_both_payload_kinds() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("static");
        let other: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "static");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
