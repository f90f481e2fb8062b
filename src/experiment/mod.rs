//! Experiment contract.
//!
//! An experiment is a user-supplied measurement procedure with three phases:
//!
//! ```text
//! setup ──> steps (stream of rows) ──> teardown
//! ```
//!
//! The engine owns the sequencing. `setup` runs once, the step stream is then driven until it
//! ends, fails or the run is stopped, and `teardown` always runs last, whatever happened before.
//!
//! Step streams should suspend regularly (`ctx.sleep(..)`, awaiting I/O). Cancellation only
//! takes effect at a suspension point, so a busy loop that never awaits cannot be interrupted
//! until it yields its next row.
//!
//! # Example
//!
//! ```rust
//! use labrun::experiment::{Experiment, ExperimentContext, ExperimentInfo, ExperimentType, Row, RowStream};
//! use labrun::params::{ParamSchema, ParamSpec, ParamValues};
//! use futures::StreamExt;
//!
//! struct Counter {
//!     points: i64,
//! }
//!
//! impl Experiment for Counter {
//!     fn steps(&mut self, ctx: ExperimentContext) -> RowStream<'_> {
//!         let points = self.points;
//!         futures::stream::iter(0..points)
//!             .then(move |i| {
//!                 let ctx = ctx.clone();
//!                 async move {
//!                     ctx.sleep(0.1).await;
//!                     Ok::<_, anyhow::Error>(Row::new().with("n", i))
//!                 }
//!             })
//!             .boxed()
//!     }
//! }
//!
//! let counter = ExperimentType::new(
//!     ExperimentInfo::new("counter", "Counter")
//!         .columns(["n"])
//!         .params(ParamSchema::new().with(ParamSpec::int("points").default_value(5).min(1.0))),
//!     |params: &ParamValues| Ok(Box::new(Counter { points: params.i64("points")? }) as Box<dyn Experiment>),
//! );
//! assert_eq!(counter.info().name, "Counter");
//! ```

mod context;
mod registry;

pub use context::ExperimentContext;
pub use registry::{ExperimentRegistry, RegistryEntry};

use crate::error::LabResult;
use crate::params::{ParamSchema, ParamValues};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Stream of rows produced by the step phase.
pub type RowStream<'a> = BoxStream<'a, anyhow::Result<Row>>;

/// One step's output: ordered column name → scalar value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    /// Empty row
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    /// Insert or replace a column value
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(column.into(), value.into());
    }

    /// Value of a column
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Column names in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the row has no columns
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Underlying JSON map
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Row {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A measurement procedure driven by the engine.
#[async_trait]
pub trait Experiment: Send {
    /// Prepare instruments. Runs once before any step.
    async fn setup(&mut self, _ctx: &ExperimentContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// The lazily evaluated row stream. Called once per run.
    fn steps(&mut self, ctx: ExperimentContext) -> RowStream<'_>;

    /// Return instruments to a safe state. Runs exactly once per run, even after a failure or
    /// a stop. Errors are logged by the engine and never change the run's outcome.
    async fn teardown(&mut self, _ctx: &ExperimentContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Static description of an experiment type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentInfo {
    /// Stable identifier
    pub type_id: String,
    /// Display name, also used for file naming
    pub name: String,
    /// One-line description
    pub description: String,
    /// Declared data columns, in file order
    pub columns: Vec<String>,
    /// Parameter schema
    pub params: ParamSchema,
    /// Plotter identifiers recorded with each run
    pub plotters: Vec<String>,
}

impl ExperimentInfo {
    /// New description with no columns, parameters or plotters.
    pub fn new(type_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            name: name.into(),
            description: String::new(),
            columns: Vec::new(),
            params: ParamSchema::new(),
            plotters: Vec::new(),
        }
    }

    /// Set the description
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the declared columns
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the parameter schema
    pub fn params(mut self, params: ParamSchema) -> Self {
        self.params = params;
        self
    }

    /// Set the plotter identifiers
    pub fn plotters<I, S>(mut self, plotters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plotters = plotters.into_iter().map(Into::into).collect();
        self
    }
}

/// Factory building an experiment from resolved parameters.
pub type ExperimentFactory =
    Arc<dyn Fn(&ParamValues) -> anyhow::Result<Box<dyn Experiment>> + Send + Sync>;

/// An experiment description plus the factory that instantiates it.
#[derive(Clone)]
pub struct ExperimentType {
    info: Arc<ExperimentInfo>,
    factory: ExperimentFactory,
}

impl fmt::Debug for ExperimentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentType")
            .field("type_id", &self.info.type_id)
            .field("name", &self.info.name)
            .finish_non_exhaustive()
    }
}

impl ExperimentType {
    /// Couple a description with a factory.
    pub fn new<F>(info: ExperimentInfo, factory: F) -> Self
    where
        F: Fn(&ParamValues) -> anyhow::Result<Box<dyn Experiment>> + Send + Sync + 'static,
    {
        Self {
            info: Arc::new(info),
            factory: Arc::new(factory),
        }
    }

    /// Static description
    pub fn info(&self) -> &ExperimentInfo {
        &self.info
    }

    /// Resolve overrides against the schema without instantiating.
    pub fn resolve(&self, overrides: &ParamValues) -> LabResult<ParamValues> {
        self.info.params.resolve(overrides)
    }

    /// Build an instance from already resolved parameters.
    pub fn instantiate(&self, resolved: &ParamValues) -> anyhow::Result<Box<dyn Experiment>> {
        (self.factory)(resolved)
    }
}
