//! Incremental CSV persistence of run rows plus the write-once metadata sidecar.

use super::naming::RunPaths;
use crate::engine::DERIVED_COLUMNS;
use crate::error::{LabError, LabResult};
use crate::experiment::Row;
use crate::params::ParamValues;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Captures the run description written next to the row file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Display name of the experiment type
    pub experiment_name: String,
    /// Stable experiment type id
    pub experiment_type: String,
    /// Resolved parameters
    pub parameters: ParamValues,
    /// Plotter identifiers
    pub plotters: Vec<String>,
    /// Wall-clock start time
    pub start_time: DateTime<Local>,
    /// Declared data columns (derived columns excluded)
    pub columns: Vec<String>,
    /// Row file name, relative to the metadata file
    pub row_file: String,
    /// Version of the software that recorded the run
    pub software_version: String,
}

/// Writes one run's rows, flushing after each one.
pub struct RowWriter {
    paths: RunPaths,
    header: Vec<String>,
    writer: Option<csv::Writer<File>>,
    started: bool,
    metadata_saved: bool,
}

impl RowWriter {
    /// Writer for `paths` with the given declared columns. Nothing is opened yet.
    pub fn new(paths: RunPaths, declared_columns: &[String]) -> Self {
        let header = DERIVED_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(declared_columns.iter().cloned())
            .collect();
        Self {
            paths,
            header,
            writer: None,
            started: false,
            metadata_saved: false,
        }
    }

    /// Full header: derived columns, then declared ones.
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Paths of the run this writer belongs to.
    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Path of the row file.
    pub fn row_path(&self) -> PathBuf {
        self.paths.row_file()
    }

    /// Whether rows can currently be written.
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Create the row file and write the header.
    pub fn start_writing(&mut self) -> LabResult<()> {
        if self.started {
            warn!(path = %self.paths.row_file().display(), "Row writer already started");
            return Ok(());
        }
        let path = self.paths.row_file();
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(&self.header)?;
        writer.flush()?;
        self.writer = Some(writer);
        self.started = true;
        info!(path = %path.display(), "Row file opened");
        Ok(())
    }

    /// Append one row in header order. Absent columns become empty fields.
    pub fn write_data(&mut self, row: &Row) -> LabResult<()> {
        let writer = self.writer.as_mut().ok_or(LabError::WriterClosed)?;
        let record: Vec<String> = self
            .header
            .iter()
            .map(|column| field(row.get(column)))
            .collect();
        writer.write_record(&record)?;
        writer.flush()?;
        Ok(())
    }

    /// Write the metadata sidecar. Only the first call writes; an existing file is never replaced.
    pub fn save_metadata(&mut self, metadata: &RunMetadata) -> LabResult<()> {
        if self.metadata_saved {
            warn!(path = %self.paths.metadata_file().display(), "Metadata already saved");
            return Ok(());
        }
        let path = self.paths.metadata_file();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                LabError::Storage(format!("Cannot create metadata {}: {e}", path.display()))
            })?;
        serde_json::to_writer_pretty(file, metadata)?;
        self.metadata_saved = true;
        debug!(path = %path.display(), "Metadata saved");
        Ok(())
    }

    /// Flush and close the row file. Safe to call repeatedly.
    pub fn stop_writing(&mut self) -> LabResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(path = %self.paths.row_file().display(), "Row file closed");
        }
        Ok(())
    }
}

impl Drop for RowWriter {
    fn drop(&mut self) {
        if let Err(e) = self.stop_writing() {
            warn!(error = %e, "Failed to close row file on drop");
        }
    }
}

fn field(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
    }
}
