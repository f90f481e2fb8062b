//! File naming for run artefacts.

use crate::config::DataSettings;
use crate::error::{LabError, LabResult};
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use strfmt::strfmt;
use tracing::{debug, warn};

/// Row file extension
pub const ROW_EXT: &str = "csv";
/// Metadata sidecar extension
pub const METADATA_EXT: &str = "json";
/// Info-level log extension
pub const LOG_EXT: &str = "log";
/// Full log suffix
pub const DEBUG_LOG_SUFFIX: &str = ".debug.log";
/// Comment sidecar suffix
pub const COMMENT_SUFFIX: &str = ".comment.json";

/// All file paths belonging to one run. They share a directory and a stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    /// Directory holding the run files
    pub dir: PathBuf,
    /// Common file stem
    pub stem: String,
}

impl RunPaths {
    /// Paths for an existing stem.
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
        }
    }

    /// Paths derived from a row file path (`<dir>/<stem>.csv`).
    pub fn from_row_file(path: &Path) -> Option<Self> {
        if path.extension()?.to_str()? != ROW_EXT {
            return None;
        }
        let stem = path.file_stem()?.to_str()?.to_string();
        let dir = path.parent()?.to_path_buf();
        Some(Self { dir, stem })
    }

    /// Pick fresh paths for a new run of `name` started at `now`.
    ///
    /// Layout is `<base_dir>/<date folder>/<filename_format>.*`. If any file with the resulting
    /// stem already exists a `_2`, `_3`, ... suffix is appended. The directory is created.
    pub fn allocate(settings: &DataSettings, name: &str, now: DateTime<Local>) -> LabResult<Self> {
        let mut dir = settings.base_dir.clone();
        if settings.use_date_subfolder {
            dir.push(now.format(&settings.date_folder_format).to_string());
        }
        std::fs::create_dir_all(&dir).map_err(|e| {
            LabError::Storage(format!("Cannot create data folder {}: {e}", dir.display()))
        })?;

        let mut vars = HashMap::new();
        vars.insert("name".to_string(), sanitize(name));
        vars.insert(
            "timestamp".to_string(),
            now.format(&settings.timestamp_format).to_string(),
        );
        let base = strfmt(&settings.filename_format, &vars).map_err(|e| {
            LabError::Configuration(format!(
                "Invalid filename_format '{}': {e}",
                settings.filename_format
            ))
        })?;
        let base = sanitize(&base);

        let mut candidate = Self::new(&dir, base.clone());
        let mut n = 2;
        while candidate.is_taken() {
            candidate = Self::new(&dir, format!("{base}_{n}"));
            n += 1;
        }
        Ok(candidate)
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{suffix}", self.stem))
    }

    /// `<stem>.csv`
    pub fn row_file(&self) -> PathBuf {
        self.with_suffix(&format!(".{ROW_EXT}"))
    }

    /// `<stem>.json`
    pub fn metadata_file(&self) -> PathBuf {
        self.with_suffix(&format!(".{METADATA_EXT}"))
    }

    /// `<stem>.log`
    pub fn log_file(&self) -> PathBuf {
        self.with_suffix(&format!(".{LOG_EXT}"))
    }

    /// `<stem>.debug.log`
    pub fn debug_log_file(&self) -> PathBuf {
        self.with_suffix(DEBUG_LOG_SUFFIX)
    }

    /// `<stem>.comment.json`
    pub fn comment_file(&self) -> PathBuf {
        self.with_suffix(COMMENT_SUFFIX)
    }

    /// Delete the row, metadata and log files of this run. Missing files are skipped.
    pub fn remove_files(&self) {
        for path in self.run_files() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed run file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Could not remove run file"),
            }
        }
    }

    fn run_files(&self) -> [PathBuf; 4] {
        [
            self.row_file(),
            self.metadata_file(),
            self.log_file(),
            self.debug_log_file(),
        ]
    }

    fn is_taken(&self) -> bool {
        self.run_files().iter().any(|p| p.exists())
    }
}

/// Replace characters that are not portable in file names.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}
