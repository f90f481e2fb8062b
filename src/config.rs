//! Configuration System using Figment
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. `labrun.toml` (found by walking up from the working directory, or an explicit path)
//! 3. Environment variables prefixed with `LABRUN_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use labrun::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Data goes to {}", settings.data.base_dir.display());
//! # Ok::<(), labrun::error::LabError>(())
//! ```

use crate::error::{LabError, LabResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the settings file searched for by [`Settings::load`].
pub const CONFIG_FILE_NAME: &str = "labrun.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where and how run files are written
    #[serde(default)]
    pub data: DataSettings,
    /// Execution engine tuning
    #[serde(default)]
    pub engine: EngineSettings,
}

/// Data persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSettings {
    /// Base directory for row files and sidecars
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// File stem format; `{name}` and `{timestamp}` are substituted
    #[serde(default = "default_filename_format")]
    pub filename_format: String,
    /// chrono format for the `{timestamp}` placeholder
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
    /// Group runs into one folder per day
    #[serde(default = "default_true")]
    pub use_date_subfolder: bool,
    /// chrono format for the per-day folder name
    #[serde(default = "default_date_folder_format")]
    pub date_folder_format: String,
}

/// Execution engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Delay between the end of teardown and the execution thread shutdown,
    /// leaving the consumer time to drain the data channel
    #[serde(default = "default_drain_delay")]
    pub drain_delay_ms: u64,
    /// Upper bound for joining an execution thread
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
    /// Number of operator log entries kept in memory
    #[serde(default = "default_log_buffer_capacity")]
    pub log_buffer_capacity: usize,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_filename_format() -> String {
    "{name}-{timestamp}".to_string()
}

fn default_timestamp_format() -> String {
    "%Y%m%d-%H%M%S".to_string()
}

fn default_true() -> bool {
    true
}

fn default_date_folder_format() -> String {
    "%y%m%d".to_string()
}

fn default_drain_delay() -> u64 {
    500
}

fn default_join_timeout() -> u64 {
    2000
}

fn default_log_buffer_capacity() -> usize {
    1000
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            filename_format: default_filename_format(),
            timestamp_format: default_timestamp_format(),
            use_date_subfolder: default_true(),
            date_folder_format: default_date_folder_format(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            drain_delay_ms: default_drain_delay(),
            join_timeout_ms: default_join_timeout(),
            log_buffer_capacity: default_log_buffer_capacity(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data: DataSettings::default(),
            engine: EngineSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Drain delay as a `Duration`
    pub fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.drain_delay_ms)
    }

    /// Join timeout as a `Duration`
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Settings {
    /// Load settings from the nearest `labrun.toml` and `LABRUN_*` environment variables.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> LabResult<Self> {
        let cwd = std::env::current_dir()?;
        Self::figment(find_config_file(&cwd).as_deref())
            .extract()
            .map_err(LabError::from)
    }

    /// Load settings from a specific file path (plus environment overrides)
    pub fn load_from<P: AsRef<Path>>(path: P) -> LabResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LabError::Configuration(format!(
                "settings file {} does not exist",
                path.display()
            )));
        }
        Self::figment(Some(path)).extract().map_err(LabError::from)
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("LABRUN_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> LabResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(LabError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        let data = &self.data;
        if data.filename_format.trim().is_empty() {
            return Err(LabError::Configuration(
                "data.filename_format must not be empty".to_string(),
            ));
        }
        if !data.filename_format.contains("{name}") && !data.filename_format.contains("{timestamp}")
        {
            return Err(LabError::Configuration(format!(
                "data.filename_format '{}' must contain {{name}} or {{timestamp}}",
                data.filename_format
            )));
        }
        if data.timestamp_format.trim().is_empty() {
            return Err(LabError::Configuration(
                "data.timestamp_format must not be empty".to_string(),
            ));
        }
        if data.use_date_subfolder && data.date_folder_format.trim().is_empty() {
            return Err(LabError::Configuration(
                "data.date_folder_format must not be empty when use_date_subfolder is set"
                    .to_string(),
            ));
        }

        if self.engine.log_buffer_capacity == 0 {
            return Err(LabError::Configuration(
                "engine.log_buffer_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Write these settings as TOML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> LabResult<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| LabError::Configuration(format!("Failed to serialize settings: {e}")))?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// Walk from `start` towards the filesystem root looking for `labrun.toml`.
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}
