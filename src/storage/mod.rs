//! Run persistence: file naming, the row writer, metadata sidecars and per-run log files.

mod naming;
mod row_writer;
mod run_log;

pub use naming::{RunPaths, COMMENT_SUFFIX, DEBUG_LOG_SUFFIX, LOG_EXT, METADATA_EXT, ROW_EXT};
pub use row_writer::{RowWriter, RunMetadata};
pub use run_log::RunLogWriter;
