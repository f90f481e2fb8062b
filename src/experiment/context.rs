//! Handle passed to every experiment phase.

use crate::engine::{RunClock, StopSignal};
use crate::log_buffer::RunLog;
use crate::params::ParamValues;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

/// What a running procedure may see and do.
///
/// Cloning is cheap; step streams typically move a clone into their async blocks.
#[derive(Clone)]
pub struct ExperimentContext {
    params: Arc<ParamValues>,
    clock: RunClock,
    stop: StopSignal,
    log: RunLog,
}

impl ExperimentContext {
    pub(crate) fn new(
        params: Arc<ParamValues>,
        clock: RunClock,
        stop: StopSignal,
        log: RunLog,
    ) -> Self {
        Self {
            params,
            clock,
            stop,
            log,
        }
    }

    /// Resolved parameters of this run.
    pub fn params(&self) -> &ParamValues {
        &self.params
    }

    /// Seconds since run start.
    pub fn t(&self) -> f64 {
        self.clock.elapsed()
    }

    /// Whether the operator asked the run to stop.
    pub fn is_stopping(&self) -> bool {
        self.stop.is_triggered()
    }

    /// Sleep cooperatively.
    ///
    /// Returns `true` after the full duration, `false` as soon as a stop is requested.
    /// Negative or non-finite durations only yield to the scheduler.
    pub async fn sleep(&self, seconds: f64) -> bool {
        if self.stop.is_triggered() {
            return false;
        }
        let duration = if seconds.is_finite() && seconds > 0.0 {
            Duration::from_secs_f64(seconds)
        } else {
            Duration::ZERO
        };
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Operator-visible info line.
    pub fn log(&self, message: impl Into<String>) {
        self.log.user(Level::INFO, message);
    }

    /// Operator-visible line at a chosen level.
    pub fn log_at(&self, level: Level, message: impl Into<String>) {
        self.log.user(level, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_buffer::{LogBuffer, LogSource};
    use std::time::Instant;

    fn context() -> (ExperimentContext, StopSignal, LogBuffer) {
        let stop = StopSignal::new();
        let buffer = LogBuffer::new(16);
        let clock = RunClock::start();
        let log = RunLog::new(buffer.clone(), clock.clone(), None);
        let params = Arc::new(ParamValues::new().with("gain", 2.0));
        (
            ExperimentContext::new(params, clock, stop.clone(), log),
            stop,
            buffer,
        )
    }

    #[tokio::test]
    async fn sleep_completes_without_stop() {
        let (ctx, _stop, _) = context();
        assert!(ctx.sleep(0.01).await);
        assert!(ctx.sleep(-1.0).await);
        assert_eq!(ctx.params().f64("gain").unwrap(), 2.0);
    }

    #[tokio::test]
    async fn sleep_returns_early_on_stop() {
        let (ctx, stop, _) = context();
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stop.trigger();
        });

        let started = Instant::now();
        assert!(!ctx.sleep(10.0).await);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(ctx.is_stopping());
        trigger.await.unwrap();
    }

    #[test]
    fn log_is_user_sourced() {
        let (ctx, _stop, buffer) = context();
        ctx.log("measuring");
        let entries = buffer.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, LogSource::User);
        assert_eq!(entries[0].level, Level::INFO);
    }
}
