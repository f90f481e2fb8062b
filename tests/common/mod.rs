//! Shared fixtures for engine integration tests.
#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use labrun::config::Settings;
use labrun::engine::{ExperimentEngine, RunStatus};
use labrun::experiment::{
    Experiment, ExperimentContext, ExperimentInfo, ExperimentType, Row, RowStream,
};
use labrun::params::{ParamSchema, ParamSpec};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Settings writing into `base`, with a short drain delay.
pub fn test_settings(base: &Path) -> Arc<Settings> {
    let mut settings = Settings::default();
    settings.data.base_dir = base.to_path_buf();
    settings.engine.drain_delay_ms = 20;
    settings.engine.join_timeout_ms = 2000;
    Arc::new(settings)
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Wait for `Finished` or `Error`.
pub fn wait_terminal(engine: &ExperimentEngine) -> RunStatus {
    assert!(
        wait_until(Duration::from_secs(5), || engine.status().is_terminal()),
        "run did not end, status {}",
        engine.status()
    );
    engine.status()
}

/// What the scripted experiment observed.
#[derive(Clone, Default)]
pub struct Witness {
    pub setup: Arc<AtomicBool>,
    pub teardowns: Arc<AtomicUsize>,
}

impl Witness {
    pub fn teardown_seen(&self) -> bool {
        self.teardowns.load(Ordering::SeqCst) > 0
    }
}

/// Behaviour of the scripted experiment.
#[derive(Clone)]
pub struct Script {
    pub rows: Vec<Row>,
    pub interval: f64,
    pub fail_at: Option<usize>,
    pub panic_at: Option<usize>,
    pub setup_fails: bool,
    pub teardown_fails: bool,
    /// Seconds teardown takes before it reports
    pub teardown_delay: f64,
}

impl Script {
    /// `count` rows `{n: i}` spaced by `interval` seconds.
    pub fn counting(count: usize, interval: f64) -> Self {
        Self::rows((0..count).map(|i| Row::new().with("n", i as u64)).collect(), interval)
    }

    pub fn rows(rows: Vec<Row>, interval: f64) -> Self {
        Self {
            rows,
            interval,
            fail_at: None,
            panic_at: None,
            setup_fails: false,
            teardown_fails: false,
            teardown_delay: 0.0,
        }
    }
}

struct Scripted {
    script: Script,
    witness: Witness,
}

#[async_trait]
impl Experiment for Scripted {
    async fn setup(&mut self, _ctx: &ExperimentContext) -> anyhow::Result<()> {
        self.witness.setup.store(true, Ordering::SeqCst);
        if self.script.setup_fails {
            return Err(anyhow!("instrument not found"));
        }
        Ok(())
    }

    fn steps(&mut self, ctx: ExperimentContext) -> RowStream<'_> {
        let Script {
            rows,
            interval,
            fail_at,
            panic_at,
            ..
        } = self.script.clone();
        futures::stream::iter(rows.into_iter().enumerate())
            .then(move |(i, row)| {
                let ctx = ctx.clone();
                async move {
                    if i > 0 {
                        ctx.sleep(interval).await;
                    }
                    if fail_at == Some(i) {
                        return Err(anyhow!("step {i} failed"));
                    }
                    if panic_at == Some(i) {
                        panic!("step {i} exploded");
                    }
                    Ok(row)
                }
            })
            .boxed()
    }

    async fn teardown(&mut self, ctx: &ExperimentContext) -> anyhow::Result<()> {
        if self.script.teardown_delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(self.script.teardown_delay)).await;
        }
        self.witness.teardowns.fetch_add(1, Ordering::SeqCst);
        ctx.log("teardown ran");
        if self.script.teardown_fails {
            return Err(anyhow!("could not park the stage"));
        }
        Ok(())
    }
}

/// An experiment type following `script`, reporting into `witness`.
pub fn scripted(name: &str, columns: &[&str], script: Script, witness: &Witness) -> ExperimentType {
    let witness = witness.clone();
    ExperimentType::new(
        ExperimentInfo::new(name, name)
            .columns(columns.iter().copied())
            .plotters(["transient"])
            .params(ParamSchema::new().with(ParamSpec::float("gain").default_value(1.0))),
        move |_| {
            Ok(Box::new(Scripted {
                script: script.clone(),
                witness: witness.clone(),
            }) as Box<dyn Experiment>)
        },
    )
}

/// Lines of a text file.
pub fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}
