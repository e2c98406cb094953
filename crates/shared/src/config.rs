use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Period of the schema persistence tick, in seconds.
pub const DEFAULT_SCHEMA_PERSIST_INTERVAL_SECS: f64 = 1.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse config file: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

/// Database settings. The data root is the only required piece; everything
/// else has a default and can be overridden from a RON settings file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Root directory; `data/` and `data/index/` live underneath it.
    pub data_root: PathBuf,
    /// Period of the schema persistence tick.
    #[serde(default = "default_persist_interval")]
    pub schema_persist_interval_secs: f64,
}

fn default_persist_interval() -> f64 {
    DEFAULT_SCHEMA_PERSIST_INTERVAL_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::default_data_root())
    }
}

impl Config {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Config {
            data_root: data_root.into(),
            schema_persist_interval_secs: DEFAULT_SCHEMA_PERSIST_INTERVAL_SECS,
        }
    }

    /// Loads settings from a RON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(ron::from_str(&contents)?)
    }

    /// Platform data directory used when no root is given explicitly.
    pub fn default_data_root() -> PathBuf {
        ProjectDirs::from("com", "lodestore", "lodestore")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| {
                log::warn!("no platform data directory, falling back to the working directory");
                PathBuf::from(".")
            })
    }

    /// Directory holding the shared KV store.
    pub fn data_dir(&self) -> PathBuf {
        self.data_root.join("data")
    }

    /// Directory holding the per-collection index segments.
    pub fn index_dir(&self) -> PathBuf {
        self.data_dir().join("index")
    }

    pub fn schema_persist_interval(&self) -> Duration {
        // Guard against a zero or negative interval from a hand-edited file.
        let floor = DEFAULT_SCHEMA_PERSIST_INTERVAL_SECS / 100.0;
        if self.schema_persist_interval_secs < floor {
            log::warn!(
                "schema persist interval {}s is too small, using {floor}s",
                self.schema_persist_interval_secs
            );
        }
        Duration::from_secs_f64(self.schema_persist_interval_secs.max(floor))
    }
}
