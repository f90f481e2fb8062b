//! Bundled sample experiments.
//!
//! These double as templates for real procedures and as fixtures for the CLI. None of them
//! touches hardware; values are simulated.

use crate::experiment::{
    Experiment, ExperimentContext, ExperimentInfo, ExperimentRegistry, ExperimentType, Row,
    RowStream,
};
use crate::params::{ParamSchema, ParamSpec, ParamValues};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::Level;

/// Registry with every bundled sample.
pub fn registry() -> ExperimentRegistry {
    ExperimentRegistry::new()
        .register(random_walk())
        .register(ramp())
        .register_group(
            "recipes",
            ExperimentRegistry::new()
                .register(ctx_sleep())
                .register(raise_error())
                .register(do_nothing()),
        )
}

// =============================================================================
// random-walk
// =============================================================================

struct RandomWalk {
    x: f64,
    step: f64,
    interval: f64,
    rng: StdRng,
}

/// One-dimensional random walk, one row per `interval` seconds.
pub fn random_walk() -> ExperimentType {
    ExperimentType::new(
        ExperimentInfo::new("random-walk", "random-walk")
            .describe("Random walk of x with a fixed step")
            .columns(["x"])
            .plotters(["transient", "histogram"])
            .params(
                ParamSchema::new()
                    .with(ParamSpec::float("initial").default_value(0.0))
                    .with(ParamSpec::float("step").default_value(1.0).min(0.0))
                    .with(
                        ParamSpec::float("interval")
                            .default_value(0.2)
                            .min(0.01)
                            .units("s"),
                    )
                    .with(
                        ParamSpec::int("seed")
                            .default_value(0)
                            .min(0.0)
                            .describe("0 seeds from entropy"),
                    ),
            ),
        |params: &ParamValues| {
            let step = params.f64("step")?;
            if step <= 0.0 {
                bail!("step must be positive, got {step}");
            }
            let rng = match params.i64("seed")? {
                0 => StdRng::from_entropy(),
                seed => StdRng::seed_from_u64(seed.unsigned_abs()),
            };
            Ok(Box::new(RandomWalk {
                x: params.f64("initial")?,
                step,
                interval: params.f64("interval")?,
                rng,
            }) as Box<dyn Experiment>)
        },
    )
}

impl Experiment for RandomWalk {
    fn steps(&mut self, ctx: ExperimentContext) -> RowStream<'_> {
        futures::stream::unfold((self, ctx, true), |(walk, ctx, first)| async move {
            if !first && !ctx.sleep(walk.interval).await {
                return None;
            }
            let row = Row::new().with("x", walk.x);
            ctx.log_at(Level::DEBUG, format!("x = {}", walk.x));
            walk.x += if walk.rng.gen_bool(0.5) {
                walk.step
            } else {
                -walk.step
            };
            Some((Ok::<_, anyhow::Error>(row), (walk, ctx, false)))
        })
        .boxed()
    }
}

// =============================================================================
// ramp
// =============================================================================

const RAMP_LOAD_OHMS: f64 = 1000.0;

struct Ramp {
    voltages: Vec<f64>,
    interval: f64,
}

/// Linear voltage sweep across a simulated 1 kΩ load.
pub fn ramp() -> ExperimentType {
    ExperimentType::new(
        ExperimentInfo::new("ramp", "ramp")
            .describe("Linear voltage sweep over a simulated resistor")
            .columns(["V", "I"])
            .plotters(["iv"])
            .params(
                ParamSchema::new()
                    .with(ParamSpec::float("start").default_value(0.0).units("V"))
                    .with(ParamSpec::float("stop").default_value(1.0).units("V"))
                    .with(ParamSpec::int("points").default_value(11).min(2.0).max(100_000.0))
                    .with(
                        ParamSpec::float("interval")
                            .default_value(0.1)
                            .min(0.0)
                            .units("s"),
                    )
                    .with(ParamSpec::select("mode", ["up", "updown"])),
            ),
        |params: &ParamValues| {
            let voltages = sweep(
                params.f64("start")?,
                params.f64("stop")?,
                usize::try_from(params.i64("points")?)?,
                params.str("mode")? == "updown",
            );
            Ok(Box::new(Ramp {
                voltages,
                interval: params.f64("interval")?,
            }) as Box<dyn Experiment>)
        },
    )
}

fn sweep(start: f64, stop: f64, points: usize, round_trip: bool) -> Vec<f64> {
    let last = (points.max(2) - 1) as f64;
    let mut values: Vec<f64> = (0..points.max(2))
        .map(|i| start + (stop - start) * i as f64 / last)
        .collect();
    if round_trip {
        let back: Vec<f64> = values.iter().rev().skip(1).copied().collect();
        values.extend(back);
    }
    values
}

#[async_trait]
impl Experiment for Ramp {
    async fn setup(&mut self, ctx: &ExperimentContext) -> anyhow::Result<()> {
        ctx.log(format!("Sweeping {} points", self.voltages.len()));
        Ok(())
    }

    fn steps(&mut self, ctx: ExperimentContext) -> RowStream<'_> {
        let interval = self.interval;
        futures::stream::iter(self.voltages.iter().copied().enumerate())
            .then(move |(i, v)| {
                let ctx = ctx.clone();
                async move {
                    if i > 0 {
                        ctx.sleep(interval).await;
                    }
                    Ok::<_, anyhow::Error>(Row::new().with("V", v).with("I", v / RAMP_LOAD_OHMS))
                }
            })
            .boxed()
    }

    async fn teardown(&mut self, ctx: &ExperimentContext) -> anyhow::Result<()> {
        ctx.log("Output returned to 0 V");
        Ok(())
    }
}

// =============================================================================
// recipes
// =============================================================================

struct CtxSleep {
    time: f64,
}

/// Sleeps cooperatively; stops promptly when asked. Produces no rows.
pub fn ctx_sleep() -> ExperimentType {
    ExperimentType::new(
        ExperimentInfo::new("ctx-sleep", "ctx-sleep")
            .describe("Sleep in one-second slices using the context")
            .params(
                ParamSchema::new().with(
                    ParamSpec::float("time")
                        .default_value(10.0)
                        .min(0.0)
                        .units("s"),
                ),
            ),
        |params: &ParamValues| {
            Ok(Box::new(CtxSleep {
                time: params.f64("time")?,
            }) as Box<dyn Experiment>)
        },
    )
}

impl Experiment for CtxSleep {
    fn steps(&mut self, ctx: ExperimentContext) -> RowStream<'_> {
        let total = self.time;
        futures::stream::once(async move {
            let mut remaining = total;
            while remaining > 0.0 {
                let slice = remaining.min(1.0);
                if !ctx.sleep(slice).await {
                    ctx.log("Sleep interrupted");
                    return;
                }
                remaining -= slice;
            }
            ctx.log(format!("Slept {total} s"));
        })
        .filter_map(|()| futures::future::ready(None::<anyhow::Result<Row>>))
        .boxed()
    }
}

struct RaiseError;

/// Fails on its first step.
pub fn raise_error() -> ExperimentType {
    ExperimentType::new(
        ExperimentInfo::new("raise-error", "raise-error")
            .describe("Fails immediately, for checking error handling")
            .columns(["x"]),
        |_: &ParamValues| Ok(Box::new(RaiseError) as Box<dyn Experiment>),
    )
}

impl Experiment for RaiseError {
    fn steps(&mut self, _ctx: ExperimentContext) -> RowStream<'_> {
        futures::stream::once(async { Err::<Row, _>(anyhow!("Intentional failure from raise-error")) })
            .boxed()
    }
}

struct DoNothing;

/// Ends at once without rows.
pub fn do_nothing() -> ExperimentType {
    ExperimentType::new(
        ExperimentInfo::new("do-nothing", "do-nothing").describe("Does nothing"),
        |_: &ParamValues| Ok(Box::new(DoNothing) as Box<dyn Experiment>),
    )
}

impl Experiment for DoNothing {
    fn steps(&mut self, _ctx: ExperimentContext) -> RowStream<'_> {
        futures::stream::empty().boxed()
    }
}
