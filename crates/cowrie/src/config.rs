//! Session configuration

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading a [`SessionConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// The file is not valid configuration JSON
    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },
}

/// Configuration for a sandbox session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directories the session may touch
    pub roots: Vec<PathBuf>,
    /// Initial working directory, defaults to the first root
    pub workdir: Option<PathBuf>,
    /// Grace period between interrupt and kill when a run is cancelled
    #[serde(
        rename = "max_timeout_ms",
        with = "duration_ms_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_timeout: Option<Duration>,
    /// Initial session environment
    pub env: BTreeMap<String, serde_json::Value>,
    /// Whether the in-process coreutils are enabled
    pub builtins: bool,
    /// Glob patterns of commands that may not run
    pub deny: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            workdir: None,
            max_timeout: None,
            env: BTreeMap::new(),
            builtins: true,
            deny: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Helper for serializing an optional Duration as milliseconds
mod duration_ms_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}
