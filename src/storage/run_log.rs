//! Per-run log files: `<stem>.log` (info and above) and `<stem>.debug.log` (everything).

use super::naming::RunPaths;
use crate::error::LabResult;
use crate::log_buffer::LogEntry;
use std::fs::File;
use std::io::{BufWriter, Write};
use tracing::Level;

/// Appends log entries to a run's two log files.
pub struct RunLogWriter {
    info: BufWriter<File>,
    debug: BufWriter<File>,
}

impl RunLogWriter {
    /// Create both files.
    pub fn create(paths: &RunPaths) -> LabResult<Self> {
        Ok(Self {
            info: BufWriter::new(File::create(paths.log_file())?),
            debug: BufWriter::new(File::create(paths.debug_log_file())?),
        })
    }

    /// Append one entry, flushing so the files are current while the run is live.
    pub fn append(&mut self, entry: &LogEntry) -> LabResult<()> {
        let line = format!("{entry} ({})\n", entry.source);
        self.debug.write_all(line.as_bytes())?;
        self.debug.flush()?;
        // More verbose levels compare greater
        if entry.level <= Level::INFO {
            self.info.write_all(line.as_bytes())?;
            self.info.flush()?;
        }
        Ok(())
    }

    /// Flush both files.
    pub fn close(&mut self) -> LabResult<()> {
        self.info.flush()?;
        self.debug.flush()?;
        Ok(())
    }
}
