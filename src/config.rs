//! # IDE Settings
//!
//! JSON settings file under `<config dir>/iotide/settings.json`. Every field
//! has a default, so a missing or partial file is valid. The location can be
//! overridden with `IOTIDE_CONFIG` or `--config`.

use iotide_serial::serial::{BackendPreference, LineEnding, ReplTimings, DEFAULT_BAUD_RATE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "IOTIDE_CONFIG";
pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No configuration directory available")]
    NoConfigDir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdeSettings {
    #[serde(default)]
    pub backend: BackendPreference,
    /// Explicit bridge executable; looked up on `PATH` when unset.
    #[serde(default)]
    pub bridge_path: Option<PathBuf>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub line_ending: LineEnding,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_program_line_timeout_ms")]
    pub program_line_timeout_ms: u64,
    #[serde(default = "default_inter_line_delay_ms")]
    pub inter_line_delay_ms: u64,
    /// Directory for the last-device record; the data dir when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_monitor_capacity")]
    pub monitor_capacity: usize,
    #[serde(default)]
    pub assistant_endpoint: Option<String>,
    #[serde(default)]
    pub assistant_api_key: Option<String>,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}
fn default_command_timeout_ms() -> u64 {
    2000
}
fn default_program_line_timeout_ms() -> u64 {
    5000
}
fn default_inter_line_delay_ms() -> u64 {
    50
}
fn default_monitor_capacity() -> usize {
    iotide_serial::serial::monitor::DEFAULT_CAPACITY
}

impl Default for IdeSettings {
    fn default() -> Self {
        Self {
            backend: BackendPreference::default(),
            bridge_path: None,
            baud_rate: default_baud_rate(),
            line_ending: LineEnding::default(),
            command_timeout_ms: default_command_timeout_ms(),
            program_line_timeout_ms: default_program_line_timeout_ms(),
            inter_line_delay_ms: default_inter_line_delay_ms(),
            data_dir: None,
            monitor_capacity: default_monitor_capacity(),
            assistant_endpoint: None,
            assistant_api_key: None,
        }
    }
}

impl IdeSettings {
    /// Resolve the settings path: explicit path, then `IOTIDE_CONFIG`, then
    /// the platform config dir.
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(path));
        }
        dirs::config_dir()
            .map(|dir| dir.join("iotide").join(SETTINGS_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load settings from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(&Self::resolve_path(explicit)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write { path: path.to_path_buf(), source };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(write_err)
    }

    pub fn repl_timings(&self) -> ReplTimings {
        ReplTimings {
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            program_line_timeout: Duration::from_millis(self.program_line_timeout_ms),
            inter_line_delay: Duration::from_millis(self.inter_line_delay_ms),
            ..ReplTimings::default()
        }
    }
}
