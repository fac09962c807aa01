use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DaemonError;

/// Built-in location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/layerd/config.toml";

/// Top-level snapshotter configuration (maps to `config.toml`).
///
/// Every section is optional; unknown keys are ignored so that a config file
/// shared with other tooling still decodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub snapshotter: SnapshotterConfig,
}

/// Engine behaviour knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotterConfig {
    /// Drop persisted snapshots whose directories disappeared while the daemon
    /// was down instead of refusing to start.
    pub allow_invalid_mounts_on_restart: bool,
    /// Extra options appended to every overlay mount.
    pub overlay_options: Vec<String>,
    /// Remove snapshot directories inline on `Remove`.
    pub sync_remove: bool,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            allow_invalid_mounts_on_restart: false,
            overlay_options: vec!["index=off".into()],
            sync_remove: true,
        }
    }
}

/// Load the configuration at `path`, tolerating absence only at
/// [`DEFAULT_CONFIG_PATH`].
pub fn resolve(path: &Path) -> Result<Config, DaemonError> {
    resolve_with_default(path, Path::new(DEFAULT_CONFIG_PATH))
}

/// Load the configuration at `path`.
///
/// A missing file yields [`Config::default`] only when `path` equals
/// `default_path`; every other failure is a [`DaemonError::ConfigLoad`].
pub fn resolve_with_default(path: &Path, default_path: &Path) -> Result<Config, DaemonError> {
    let load_err = |reason: String| DaemonError::ConfigLoad {
        path: PathBuf::from(path),
        reason,
    };

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && path == default_path => {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Config::default());
        }
        Err(e) => return Err(load_err(e.to_string())),
    };

    toml::from_str(&content).map_err(|e| load_err(e.to_string()))
}
