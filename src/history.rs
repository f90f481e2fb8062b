//! Browsing recorded runs.
//!
//! A recorded run is a row file with a readable metadata sidecar next to it. The history scans
//! the data directory (the base folder and its per-day subfolders) on every call; there is no
//! cache to go stale while runs are being written.
//!
//! Operator comments live in a separate `<stem>.comment.json` so the metadata record stays
//! exactly as it was written at run start.

use crate::error::{LabError, LabResult};
use crate::storage::{RunMetadata, RunPaths, ROW_EXT};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One recorded run.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// File stem, unique within the data directory
    pub id: String,
    /// Metadata as written at run start
    pub metadata: RunMetadata,
    /// Row file path
    pub row_file: PathBuf,
    /// Metadata sidecar path
    pub metadata_file: PathBuf,
    /// Operator comment, empty if none
    pub comment: String,
}

impl HistoryEntry {
    /// Experiment display name
    pub fn name(&self) -> &str {
        &self.metadata.experiment_name
    }

    /// Wall-clock start
    pub fn started_at(&self) -> DateTime<Local> {
        self.metadata.start_time
    }
}

/// A recorded run's contents.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    /// The history entry
    pub entry: HistoryEntry,
    /// Row file header
    pub header: Vec<String>,
    /// Data rows as raw CSV fields
    pub rows: Vec<Vec<String>>,
}

impl RunRecord {
    /// Values of one column, `None` if the header lacks it.
    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let index = self.header.iter().position(|h| h == name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(index).map_or("", String::as_str))
                .collect(),
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CommentRecord {
    comment: String,
    updated_at: DateTime<Local>,
}

/// Recorded runs under a data directory.
#[derive(Debug, Clone)]
pub struct RunHistory {
    base_dir: PathBuf,
}

impl RunHistory {
    /// History rooted at `base_dir` (normally `settings.data.base_dir`).
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// All recorded runs, newest first.
    pub fn list(&self) -> LabResult<Vec<HistoryEntry>> {
        if !self.base_dir.is_dir() {
            warn!(dir = %self.base_dir.display(), "Data directory does not exist");
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        self.scan_dir(&self.base_dir, &mut entries)?;
        for dir_entry in fs::read_dir(&self.base_dir)? {
            let path = dir_entry?.path();
            if path.is_dir() {
                self.scan_dir(&path, &mut entries)?;
            }
        }

        entries.sort_by(|a, b| {
            b.metadata
                .start_time
                .cmp(&a.metadata.start_time)
                .then_with(|| b.id.cmp(&a.id))
        });
        debug!(count = entries.len(), "Run history scanned");
        Ok(entries)
    }

    /// The run with file stem `id`.
    pub fn get(&self, id: &str) -> LabResult<HistoryEntry> {
        self.list()?
            .into_iter()
            .find(|entry| entry.id == id)
            .ok_or_else(|| LabError::History(format!("no recorded run '{id}'")))
    }

    /// Metadata, header and rows of run `id`.
    pub fn load(&self, id: &str) -> LabResult<RunRecord> {
        let entry = self.get(id)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&entry.row_file)?;
        let header = reader.headers()?.iter().map(str::to_string).collect();
        let rows = reader
            .records()
            .map(|record| record.map(|r| r.iter().map(str::to_string).collect()))
            .collect::<Result<Vec<Vec<String>>, csv::Error>>()?;
        Ok(RunRecord {
            entry,
            header,
            rows,
        })
    }

    /// Set the operator comment of run `id`.
    pub fn update_comment(&self, id: &str, comment: &str) -> LabResult<()> {
        let entry = self.get(id)?;
        let paths = RunPaths::from_row_file(&entry.row_file)
            .ok_or_else(|| LabError::History(format!("bad row file for '{id}'")))?;
        let record = CommentRecord {
            comment: comment.to_string(),
            updated_at: Local::now(),
        };
        let text = serde_json::to_string_pretty(&record)?;
        // Write-then-rename so readers never see a half-written comment
        let target = paths.comment_file();
        let tmp = target.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &target)?;
        info!(%id, "Comment updated");
        Ok(())
    }

    fn scan_dir(&self, dir: &Path, out: &mut Vec<HistoryEntry>) -> LabResult<()> {
        for dir_entry in fs::read_dir(dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ROW_EXT) {
                continue;
            }
            let Some(paths) = RunPaths::from_row_file(&path) else {
                continue;
            };
            let metadata_file = paths.metadata_file();
            if !metadata_file.is_file() {
                debug!(path = %path.display(), "Skipping row file without metadata");
                continue;
            }
            let metadata = match read_metadata(&metadata_file) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %metadata_file.display(), error = %e, "Skipping unreadable metadata");
                    continue;
                }
            };
            out.push(HistoryEntry {
                id: paths.stem.clone(),
                comment: read_comment(&paths.comment_file()),
                metadata,
                row_file: path,
                metadata_file,
            });
        }
        Ok(())
    }
}

fn read_metadata(path: &Path) -> LabResult<RunMetadata> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn read_comment(path: &Path) -> String {
    if !path.is_file() {
        return String::new();
    }
    match fs::read_to_string(path)
        .map_err(LabError::from)
        .and_then(|text| serde_json::from_str::<CommentRecord>(&text).map_err(LabError::from))
    {
        Ok(record) => record.comment,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable comment");
            String::new()
        }
    }
}
