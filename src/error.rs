//! Error types for the tunnel supervisor

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by [`crate::ServerRegistry::try_start`] and the settings loader.
///
/// Stopping and cleanup never produce these; problems on those paths are
/// logged as warnings and absorbed.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Malformed identifier, address or port. Raised before any file or
    /// process is created.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The executable could not be launched at all.
    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited during the startup grace window.
    #[error("rathole server exited during startup ({status}): {output}")]
    EarlyExit { status: String, output: String },

    /// Filesystem failure while preparing the config artifact.
    #[error("{context} {path:?}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The settings file could not be read or parsed.
    #[error("invalid settings file {path:?}: {reason}")]
    Settings { path: PathBuf, reason: String },
}

impl SupervisorError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        SupervisorError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SupervisorError::Io {
            context,
            path: path.into(),
            source,
        }
    }

    /// True for errors raised before anything touched the filesystem.
    pub fn is_validation(&self) -> bool {
        matches!(self, SupervisorError::Validation { .. })
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
