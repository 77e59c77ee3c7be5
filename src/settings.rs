//! Supervisor settings and the optional TOML settings file

use crate::config::TunnelSpec;
use crate::error::{Result, SupervisorError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings injected into [`crate::ServerRegistry`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Directory holding one rendered config per tunnel
    pub config_dir: PathBuf,

    /// Installed rathole binary
    pub executable: PathBuf,

    /// Name looked up in `PATH` when `executable` is missing
    pub fallback_executable: String,

    /// How long a fresh process must survive to count as started
    pub startup_grace_ms: u64,

    /// How long to wait after SIGTERM before SIGKILL
    pub stop_timeout_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/var/lib/tunneld/rathole"),
            executable: PathBuf::from("/usr/local/bin/rathole"),
            fallback_executable: "rathole".to_string(),
            startup_grace_ms: 500,
            stop_timeout_ms: 5000,
        }
    }
}

impl SupervisorSettings {
    /// Defaults with a different config directory
    pub fn with_config_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            ..Self::default()
        }
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Contents of a `tunneld` settings file
///
/// ```toml
/// config_dir = "/var/lib/tunneld/rathole"
/// executable = "/usr/local/bin/rathole"
///
/// [[tunnels]]
/// id = "t1"
/// remote_addr = "panel.example.com:23333"
/// token = "secret"
/// proxy_port = 8989
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsFile {
    #[serde(flatten)]
    pub supervisor: SupervisorSettings,

    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,
}

impl SettingsFile {
    /// Read and parse a settings file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SupervisorError::io("failed to read settings file", path, e))?;
        Self::parse(path, &contents)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| SupervisorError::Settings {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}
