//! Custom error types for the experiment runner.
//!
//! This module defines the primary error type, `LabError`. Using the `thiserror` crate, it
//! provides a centralized and consistent way to handle the errors the engine can raise
//! synchronously to its caller, from configuration issues to persistence failures.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches in
//!   `labrun.toml` or `LABRUN_*` environment variables.
//! - **`Configuration`**: Semantic errors in the configuration that pass parsing but are
//!   logically wrong (e.g. an unknown log level). Caught during `Settings::validate`.
//! - **`Parameter`**: A missing or invalid experiment parameter. Raised by `start` before a
//!   run thread exists.
//! - **`Io`**, **`Csv`**, **`Serialization`**, **`Storage`**, **`WriterClosed`**: Persistence
//!   failures. Inside a running lifecycle these are fatal to the run and surface as
//!   `RunStatus::Error` instead of being returned.
//! - **`Thread`**: The execution thread or its scheduler could not be created.
//!
//! Errors raised by procedure code itself are `anyhow::Error`; the engine never re-raises them
//! in the caller's thread, it records them as the run's last error.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum LabError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Invalid parameter '{name}': {reason}")]
    Parameter { name: String, reason: String },

    #[error("Unknown experiment: {0}")]
    UnknownExperiment(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Row writer is not open")]
    WriterClosed,

    #[error("Execution thread error: {0}")]
    Thread(String),

    #[error("History error: {0}")]
    History(String),
}

impl From<figment::Error> for LabError {
    fn from(value: figment::Error) -> Self {
        LabError::Config(Box::new(value))
    }
}

impl LabError {
    /// Shorthand for a parameter error.
    pub fn parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        LabError::Parameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error was raised before any run resources were allocated.
    ///
    /// Configuration-class errors leave the engine state untouched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            LabError::Config(_)
                | LabError::Configuration(_)
                | LabError::Parameter { .. }
                | LabError::UnknownExperiment(_)
        )
    }
}
