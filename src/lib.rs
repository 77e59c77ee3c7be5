//! tunneld - Per-tunnel supervisor for rathole servers
//!
//! This library renders rathole server configurations, launches one rathole
//! process per tunnel identifier and keeps a registry reconciling which
//! tunnels should run against which processes are actually alive.

pub mod cli;
pub mod config;
pub mod error;
pub mod process;
pub mod registry;
pub mod settings;

pub use config::{RenderedConfig, ServerDocument, TunnelSpec};
pub use error::{Result, SupervisorError};
pub use process::{LaunchSpec, ProcessState, ServerProcess};
pub use registry::{ServerInfo, ServerRegistry};
pub use settings::{SettingsFile, SupervisorSettings};
