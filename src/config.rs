//! Rathole server configuration rendering
//!
//! Turns a [`TunnelSpec`] into the TOML document rathole expects in server
//! mode and writes it to `<config_dir>/<id>.toml`. All values are validated
//! before anything touches the disk, and the token is escaped as a TOML
//! basic string so it cannot break out of its value.

use crate::error::{Result, SupervisorError};
use serde::Deserialize;
use std::fmt::{self, Write as _};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Address rathole listens on; the caller-supplied host is always replaced by it.
pub const WILDCARD_HOST: &str = "0.0.0.0";

/// Extension of rendered config files.
pub const CONFIG_EXTENSION: &str = "toml";

const MAX_ID_LEN: usize = 64;

/// Everything needed to run one tunnel server
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct TunnelSpec {
    /// Tunnel identifier, also the rathole service name
    pub id: String,

    /// Address clients use to reach the control channel (e.g. "panel.example.com:23333")
    pub remote_addr: String,

    /// Shared authentication token
    pub token: String,

    /// Port where the tunneled service is exposed
    pub proxy_port: u16,
}

impl TunnelSpec {
    pub fn new(
        id: impl Into<String>,
        remote_addr: impl Into<String>,
        token: impl Into<String>,
        proxy_port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            remote_addr: remote_addr.into(),
            token: token.into(),
            proxy_port,
        }
    }
}

impl fmt::Debug for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSpec")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("token", &"<redacted>")
            .field("proxy_port", &self.proxy_port)
            .finish()
    }
}

/// Parameters of a config file that has been written to disk
#[derive(Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub remote_addr: String,
    pub bind_addr: String,
    pub token: String,
    pub proxy_port: u16,
    pub config_path: PathBuf,
}

impl fmt::Debug for RenderedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderedConfig")
            .field("remote_addr", &self.remote_addr)
            .field("bind_addr", &self.bind_addr)
            .field("token", &"<redacted>")
            .field("proxy_port", &self.proxy_port)
            .field("config_path", &self.config_path)
            .finish()
    }
}

/// One `[server.services.<name>]` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSection {
    pub name: String,
    pub bind_addr: String,
}

/// Structured form of a rathole server config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDocument {
    pub bind_addr: String,
    pub token: String,
    pub services: Vec<ServiceSection>,
}

impl ServerDocument {
    /// Build the single-service document for a tunnel.
    pub fn for_tunnel(spec: &TunnelSpec) -> Result<Self> {
        validate_id(&spec.id)?;
        let remote_port = parse_remote_port(&spec.remote_addr)?;
        validate_port("proxy_port", spec.proxy_port)?;

        Ok(Self {
            bind_addr: wildcard_addr(remote_port),
            token: spec.token.clone(),
            services: vec![ServiceSection {
                name: spec.id.clone(),
                bind_addr: wildcard_addr(spec.proxy_port),
            }],
        })
    }

    /// Serialize to the on-disk format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[server]\n");
        let _ = writeln!(out, "bind_addr = {}", quote(&self.bind_addr));
        let _ = writeln!(out, "token = {}", quote(&self.token));

        for service in &self.services {
            let _ = writeln!(out, "\n[server.services.{}]", service.name);
            let _ = writeln!(out, "bind_addr = {}", quote(&service.bind_addr));
        }

        out
    }
}

/// Path of the config artifact for `id` inside `config_dir`.
pub fn config_path(config_dir: &Path, id: &str) -> PathBuf {
    config_dir.join(format!("{}.{}", id, CONFIG_EXTENSION))
}

/// Validate `spec`, render it and write it to `config_dir`.
///
/// The document is written to a temporary sibling and renamed into place,
/// so a failure never leaves a partial file at the final path.
pub fn write_config(config_dir: &Path, spec: &TunnelSpec) -> Result<RenderedConfig> {
    let document = ServerDocument::for_tunnel(spec)?;
    let path = config_path(config_dir, &spec.id);
    let tmp_path = path.with_extension(format!("{}.tmp", CONFIG_EXTENSION));

    if let Err(e) = fs::write(&tmp_path, document.render()) {
        let _ = fs::remove_file(&tmp_path);
        return Err(SupervisorError::io("failed to write config", tmp_path, e));
    }
    if let Err(e) = fs::rename(&tmp_path, &path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(SupervisorError::io("failed to move config into place", path, e));
    }

    debug!(tunnel = %spec.id, path = ?path, "Wrote rathole config");

    Ok(RenderedConfig {
        remote_addr: spec.remote_addr.clone(),
        bind_addr: document.bind_addr,
        token: document.token,
        proxy_port: spec.proxy_port,
        config_path: path,
    })
}

/// Identifiers become both a TOML bare key and a file stem.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(SupervisorError::validation("identifier", "must not be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(SupervisorError::validation(
            "identifier",
            format!("longer than {} characters", MAX_ID_LEN),
        ));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(SupervisorError::validation(
            "identifier",
            format!("{:?} contains unsupported character {:?}", id, c),
        ));
    }
    Ok(())
}

/// Extract the port from `host:port`. The host is discarded.
pub fn parse_remote_port(remote_addr: &str) -> Result<u16> {
    let (_, port) = remote_addr.rsplit_once(':').ok_or_else(|| {
        SupervisorError::validation("remote_addr", format!("missing ':' in {:?}", remote_addr))
    })?;

    let port: u16 = port.parse().map_err(|_| {
        SupervisorError::validation("remote_addr", format!("invalid port in {:?}", remote_addr))
    })?;
    validate_port("remote_addr", port)?;
    Ok(port)
}

fn validate_port(field: &'static str, port: u16) -> Result<()> {
    if port == 0 {
        return Err(SupervisorError::validation(field, "port must be between 1 and 65535"));
    }
    Ok(())
}

fn wildcard_addr(port: u16) -> String {
    format!("{}:{}", WILDCARD_HOST, port)
}

/// Quote `value` as a TOML basic string.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{8}' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\u{c}' => out.push_str("\\f"),
            '\r' => out.push_str("\\r"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
