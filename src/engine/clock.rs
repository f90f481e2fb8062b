//! Run clock: elapsed time since start and since the last sync marker.

use crate::experiment::Row;
use chrono::Local;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Column holding seconds since run start.
pub const T_COLUMN: &str = "t";
/// Column holding seconds since the last sync marker, `-1` before the first one.
pub const SYNC_T_COLUMN: &str = "sync_t";
/// Column holding the local wall-clock time.
pub const TIME_COLUMN: &str = "time";
/// Columns the engine adds to every row, in file order.
pub const DERIVED_COLUMNS: [&str; 3] = [T_COLUMN, SYNC_T_COLUMN, TIME_COLUMN];

const WALL_CLOCK_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Monotonic clock for one run. Cheap to clone, shared with the consumer side for `sync()`.
#[derive(Clone, Debug)]
pub struct RunClock {
    start: Instant,
    sync: Arc<Mutex<Option<Instant>>>,
}

impl Default for RunClock {
    fn default() -> Self {
        Self::start()
    }
}

impl RunClock {
    /// Start a clock now, with no sync marker.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            sync: Arc::new(Mutex::new(None)),
        }
    }

    /// Seconds since start.
    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Record now as the sync reference.
    pub fn sync(&self) {
        *self.sync.lock() = Some(Instant::now());
    }

    /// Seconds since the last sync marker, or `-1.0` if none was set.
    pub fn since_sync(&self) -> f64 {
        match *self.sync.lock() {
            Some(marker) => marker.elapsed().as_secs_f64(),
            None => -1.0,
        }
    }

    /// Prefix a procedure row with the derived columns.
    ///
    /// Procedure-supplied values under a derived name are dropped.
    pub fn stamp(&self, row: Row) -> Row {
        let mut stamped = Row::new();
        stamped.insert(T_COLUMN, self.elapsed());
        stamped.insert(SYNC_T_COLUMN, self.since_sync());
        stamped.insert(
            TIME_COLUMN,
            Local::now().format(WALL_CLOCK_FORMAT).to_string(),
        );
        for (key, value) in row.into_inner() {
            if DERIVED_COLUMNS.contains(&key.as_str()) {
                continue;
            }
            stamped.insert(key, value);
        }
        stamped
    }
}
