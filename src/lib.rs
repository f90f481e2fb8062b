//! # labrun
//!
//! A laboratory experiment runner. It executes a user-supplied, long-running measurement
//! procedure on a dedicated thread, streams the procedure's rows to a polling consumer, records
//! them durably as they are produced, and lets an operator interrupt the run safely at any time.
//!
//! ## Crate Structure
//!
//! - **`engine`**: The `ExperimentEngine`: run state machine, per-run execution thread, stop
//!   signal, sync clock and the data channel. See `engine::ExperimentEngine`.
//! - **`experiment`**: The `Experiment` trait (setup, step stream, teardown), `ExperimentType`,
//!   the `ExperimentContext` handed to procedures, and the `ExperimentRegistry`.
//! - **`params`**: Statically declared, typed parameter schemas and their validation.
//! - **`storage`**: Run file naming, the CSV row writer, metadata sidecars, per-run log files.
//! - **`history`**: Listing and loading recorded runs; operator comments.
//! - **`log_buffer`**: The bounded operator log that consumers display.
//! - **`samples`**: Bundled sample experiments.
//! - **`config`**: `Settings` loaded with figment from `labrun.toml` and `LABRUN_*` variables.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: The `LabError` enum used across the library.

pub mod config;
pub mod engine;
pub mod error;
pub mod experiment;
pub mod history;
pub mod log_buffer;
pub mod logging;
pub mod params;
pub mod samples;
pub mod storage;

pub use engine::{ExperimentEngine, RunSnapshot, RunStatus};
pub use error::{LabError, LabResult};
pub use experiment::{Experiment, ExperimentContext, ExperimentInfo, ExperimentType, Row, RowStream};
