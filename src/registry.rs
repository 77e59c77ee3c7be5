//! Registry of running rathole servers, keyed by tunnel identifier

use crate::config::{self, RenderedConfig, TunnelSpec};
use crate::error::{Result, SupervisorError};
use crate::process::{LaunchSpec, ServerProcess};
use crate::settings::SupervisorSettings;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// One running tunnel server
pub struct ServerEntry {
    process: ServerProcess,
    config: RenderedConfig,
    started_at: u64,
}

impl ServerEntry {
    fn info(&self, id: &str) -> ServerInfo {
        ServerInfo {
            id: id.to_string(),
            pid: self.process.pid(),
            remote_addr: self.config.remote_addr.clone(),
            bind_addr: self.config.bind_addr.clone(),
            proxy_port: self.config.proxy_port,
            config_path: self.config.config_path.clone(),
            started_at: self.started_at,
        }
    }
}

/// Diagnostic snapshot of a registered server. Never carries the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub id: String,
    pub pid: u32,
    pub remote_addr: String,
    pub bind_addr: String,
    pub proxy_port: u16,
    pub config_path: PathBuf,
    /// Seconds since the Unix epoch
    pub started_at: u64,
}

/// Owns every rathole server process and its config file
///
/// All operations take a single lock over the whole map, so concurrent
/// callers are serialized. Spawning and stopping block the calling thread.
pub struct ServerRegistry {
    servers: Mutex<HashMap<String, ServerEntry>>,
    settings: SupervisorSettings,
}

impl ServerRegistry {
    /// Create a registry, creating the config directory if needed
    pub fn new(settings: SupervisorSettings) -> Result<Self> {
        fs::create_dir_all(&settings.config_dir).map_err(|e| {
            SupervisorError::io("failed to create config directory", &settings.config_dir, e)
        })?;

        Ok(Self {
            servers: Mutex::new(HashMap::new()),
            settings,
        })
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ServerEntry>> {
        self.servers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start a server, replacing any existing one for the same identifier.
    ///
    /// Returns `false` on any failure; the reason is logged.
    pub fn start(&self, id: &str, remote_addr: &str, token: &str, proxy_port: u16) -> bool {
        let spec = TunnelSpec::new(id, remote_addr, token, proxy_port);
        match self.try_start(&spec) {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to start rathole server for tunnel {}: {}", id, e);
                false
            }
        }
    }

    /// Like [`ServerRegistry::start`], returning the failure reason.
    ///
    /// On error nothing is registered and no config file is left behind.
    pub fn try_start(&self, spec: &TunnelSpec) -> Result<ServerInfo> {
        // Reject bad input before touching an existing server.
        config::ServerDocument::for_tunnel(spec)?;

        let mut servers = self.lock();

        if servers.contains_key(&spec.id) {
            warn!(
                "Rathole server for tunnel {} already exists, stopping it first",
                spec.id
            );
            self.stop_locked(&mut servers, &spec.id);
        }

        let config = config::write_config(&self.settings.config_dir, spec)?;

        let launch = LaunchSpec::rathole_server(
            self.settings.executable.clone(),
            self.settings.fallback_executable.clone(),
            &config.config_path,
            self.settings.config_dir.clone(),
        );

        let process = match ServerProcess::start(&spec.id, &launch, self.settings.startup_grace()) {
            Ok(process) => process,
            Err(e) => {
                remove_config(&spec.id, &config.config_path);
                return Err(e);
            }
        };

        let entry = ServerEntry {
            process,
            config,
            started_at: unix_now(),
        };
        let info = entry.info(&spec.id);
        servers.insert(spec.id.clone(), entry);

        info!(
            "✓ Started rathole server for tunnel {} on {}, proxy port: {}",
            spec.id, info.bind_addr, info.proxy_port
        );

        Ok(info)
    }

    /// Stop the server for `id`. Does nothing if there is none.
    pub fn stop(&self, id: &str) {
        let mut servers = self.lock();
        self.stop_locked(&mut servers, id);
    }

    fn stop_locked(&self, servers: &mut HashMap<String, ServerEntry>, id: &str) {
        match servers.remove(id) {
            Some(mut entry) => {
                entry.process.terminate(self.settings.stop_timeout());
                info!("Stopped rathole server for tunnel {}", id);
                remove_config(id, &entry.config.config_path);
            }
            None => {
                // A stray file at the derived path would otherwise outlive us.
                if config::validate_id(id).is_ok() {
                    let path = config::config_path(&self.settings.config_dir, id);
                    if path.exists() {
                        debug!(tunnel = %id, "Removing config without a registered server");
                        remove_config(id, &path);
                    }
                }
            }
        }
    }

    /// Whether a registered server for `id` is currently alive
    pub fn is_running(&self, id: &str) -> bool {
        let mut servers = self.lock();
        servers
            .get_mut(id)
            .map(|entry| entry.process.is_alive())
            .unwrap_or(false)
    }

    /// Identifiers whose process is alive right now.
    ///
    /// Entries whose process has exited are dropped, along with their config
    /// files.
    pub fn list_active(&self) -> BTreeSet<String> {
        let mut servers = self.lock();

        let dead: Vec<String> = servers
            .iter_mut()
            .filter_map(|(id, entry)| (!entry.process.is_alive()).then(|| id.clone()))
            .collect();

        for id in &dead {
            if let Some(entry) = servers.remove(id) {
                info!("Rathole server for tunnel {} exited, removing it", id);
                remove_config(id, &entry.config.config_path);
            }
        }

        servers.keys().cloned().collect()
    }

    /// Stop every registered server
    pub fn cleanup_all(&self) {
        let mut servers = self.lock();
        let ids: Vec<String> = servers.keys().cloned().collect();
        if !ids.is_empty() {
            info!("Stopping {} rathole server(s)", ids.len());
        }
        for id in ids {
            self.stop_locked(&mut servers, &id);
        }
    }

    /// Snapshot of the entry for `id`, if registered
    pub fn info(&self, id: &str) -> Option<ServerInfo> {
        self.lock().get(id).map(|entry| entry.info(id))
    }

    /// Number of registered entries, alive or not
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ServerRegistry {
    fn drop(&mut self) {
        self.cleanup_all();
    }
}

fn remove_config(id: &str, path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(tunnel = %id, path = ?path, "Removed config file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete config file {:?}: {}", path, e),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
