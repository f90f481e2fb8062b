//! Operator-visible log lines.
//!
//! A bounded, thread-safe ring of [`LogEntry`] values that a consumer reads on its own schedule,
//! and [`RunLog`], the per-run handle that the engine and the procedure write through. A `RunLog`
//! fans every entry out to the ring, to `tracing`, and (outside debug mode) to the per-run
//! `.log`/`.debug.log` files.

use crate::engine::RunClock;
use crate::storage::RunLogWriter;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn, Level};

/// `tracing` target of operator log lines, so a console consumer can filter the duplicates.
pub const OPERATOR_TARGET: &str = "labrun::operator";

/// Who wrote a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogSource {
    /// The engine itself
    System,
    /// The running procedure via `ExperimentContext::log`
    User,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::System => write!(f, "system"),
            LogSource::User => write!(f, "user"),
        }
    }
}

/// Represents a single log entry.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Position in the buffer's total history; strictly increasing
    pub seq: u64,
    /// Wall-clock time of the entry
    pub timestamp: DateTime<Local>,
    /// Severity
    #[serde(serialize_with = "serialize_level")]
    pub level: Level,
    /// Origin
    pub source: LogSource,
    /// Seconds since run start, if the entry belongs to a run
    pub elapsed: Option<f64>,
    /// Text
    pub message: String,
}

fn serialize_level<S: serde::Serializer>(level: &Level, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(level.as_str())
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<5}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level
        )?;
        if let Some(elapsed) = self.elapsed {
            write!(f, " [{elapsed:>9.3}s]")?;
        }
        write!(f, " {}", self.message)
    }
}

struct Ring {
    entries: VecDeque<LogEntry>,
    next_seq: u64,
}

/// A thread-safe, fixed-capacity log buffer.
#[derive(Clone)]
pub struct LogBuffer {
    ring: Arc<Mutex<Ring>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl LogBuffer {
    /// Create a buffer holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Arc::new(Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                next_seq: 0,
            })),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when full. Returns the stored entry.
    pub fn push(
        &self,
        level: Level,
        source: LogSource,
        elapsed: Option<f64>,
        message: impl Into<String>,
    ) -> LogEntry {
        let mut ring = self.ring.lock();
        let entry = LogEntry {
            seq: ring.next_seq,
            timestamp: Local::now(),
            level,
            source,
            elapsed,
            message: message.into(),
        };
        ring.next_seq += 1;
        if ring.entries.len() >= self.capacity {
            ring.entries.pop_front();
        }
        ring.entries.push_back(entry.clone());
        entry
    }

    /// Copy of all retained entries, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.ring.lock().entries.iter().cloned().collect()
    }

    /// Retained entries with `seq >= from`, for consumers that poll incrementally.
    pub fn since(&self, from: u64) -> Vec<LogEntry> {
        self.ring
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.seq >= from)
            .cloned()
            .collect()
    }

    /// Sequence number the next entry will get.
    pub fn next_seq(&self) -> u64 {
        self.ring.lock().next_seq
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.ring.lock().entries.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.ring.lock().entries.is_empty()
    }

    /// Drop all retained entries. Sequence numbers keep counting.
    pub fn clear(&self) {
        self.ring.lock().entries.clear();
    }
}

/// Per-run log handle shared by the engine and the procedure context.
#[derive(Clone)]
pub struct RunLog {
    buffer: LogBuffer,
    clock: RunClock,
    files: Arc<Mutex<Option<RunLogWriter>>>,
}

impl RunLog {
    /// Log into `buffer`, stamping entries with `clock`, and append to `files` if given.
    pub fn new(buffer: LogBuffer, clock: RunClock, files: Option<RunLogWriter>) -> Self {
        Self {
            buffer,
            clock,
            files: Arc::new(Mutex::new(files)),
        }
    }

    /// Engine message.
    pub fn system(&self, level: Level, message: impl Into<String>) {
        self.record(level, LogSource::System, message.into());
    }

    /// Procedure message.
    pub fn user(&self, level: Level, message: impl Into<String>) {
        self.record(level, LogSource::User, message.into());
    }

    /// Flush and close the log files. Later entries still reach the buffer.
    pub fn close(&self) {
        if let Some(mut files) = self.files.lock().take() {
            if let Err(e) = files.close() {
                warn!(error = %e, "Failed to close run log files");
            }
        }
    }

    fn record(&self, level: Level, source: LogSource, message: String) {
        let elapsed = self.clock.elapsed();
        match level {
            Level::ERROR => error!(target: OPERATOR_TARGET, %source, elapsed, "{message}"),
            Level::WARN => warn!(target: OPERATOR_TARGET, %source, elapsed, "{message}"),
            Level::INFO => info!(target: OPERATOR_TARGET, %source, elapsed, "{message}"),
            Level::DEBUG => debug!(target: OPERATOR_TARGET, %source, elapsed, "{message}"),
            _ => trace!(target: OPERATOR_TARGET, %source, elapsed, "{message}"),
        }

        let entry = self.buffer.push(level, source, Some(elapsed), message);

        let mut files = self.files.lock();
        if let Some(writer) = files.as_mut() {
            if let Err(e) = writer.append(&entry) {
                warn!(error = %e, "Run log write failed; continuing without log files");
                *files = None;
            }
        }
    }
}
