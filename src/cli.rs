// CLI definition and command handlers for tunneld

use crate::config::{ServerDocument, TunnelSpec};
use crate::registry::ServerRegistry;
use crate::settings::{SettingsFile, SupervisorSettings};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// tunneld - Run rathole tunnel servers, one process per tunnel
#[derive(Debug, Parser)]
#[command(name = "tunneld", author, version, about, long_about = None)]
pub struct Cli {
    /// Settings file (TOML) with supervisor options and [[tunnels]]
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Directory for rendered rathole configs (overrides the settings file)
    #[arg(short = 'd', long)]
    pub config_dir: Option<PathBuf>,

    /// Path to the rathole binary (overrides the settings file)
    #[arg(short = 'e', long)]
    pub executable: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// tunneld subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start every tunnel from the settings file and supervise until Ctrl+C
    Run,

    /// Print the rathole config that would be written for a tunnel
    Render {
        /// Tunnel identifier
        id: String,

        /// Address clients connect to (host:port)
        #[arg(short, long)]
        remote_addr: String,

        /// Authentication token
        #[arg(short, long)]
        token: String,

        /// Port where the tunneled service is exposed
        #[arg(short, long)]
        proxy_port: u16,
    },

    /// Validate the settings file and every tunnel in it
    Check,
}

impl Cli {
    /// Load the settings file (if any) and apply command-line overrides
    pub fn settings(&self) -> Result<SettingsFile> {
        let mut file = match &self.config {
            Some(path) => SettingsFile::load(path)?,
            None => SettingsFile::default(),
        };

        if let Some(dir) = &self.config_dir {
            file.supervisor.config_dir = dir.clone();
        }
        if let Some(exe) = &self.executable {
            file.supervisor.executable = exe.clone();
        }

        Ok(file)
    }
}

/// Execute a parsed command line
pub async fn execute(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Run => {
            let file = cli.settings()?;
            handle_run(file.supervisor, file.tunnels).await
        }
        Command::Render {
            id,
            remote_addr,
            token,
            proxy_port,
        } => handle_render(TunnelSpec::new(id, remote_addr, token, *proxy_port)),
        Command::Check => handle_check(cli.settings()?),
    }
}

fn handle_render(spec: TunnelSpec) -> Result<()> {
    let document = ServerDocument::for_tunnel(&spec).context("Invalid tunnel")?;
    print!("{}", document.render());
    Ok(())
}

/// Identifiers that appear more than once, in first-seen order
fn duplicate_ids(tunnels: &[TunnelSpec]) -> Vec<&str> {
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for spec in tunnels {
        if !seen.insert(spec.id.as_str()) && !duplicates.contains(&spec.id.as_str()) {
            duplicates.push(spec.id.as_str());
        }
    }
    duplicates
}

fn handle_check(file: SettingsFile) -> Result<()> {
    let duplicates = duplicate_ids(&file.tunnels);
    let mut reported = HashSet::new();
    let mut invalid = 0;
    for spec in &file.tunnels {
        if duplicates.contains(&spec.id.as_str()) {
            if reported.insert(spec.id.as_str()) {
                println!("✗ {}: duplicate tunnel id", spec.id);
                invalid += 1;
            }
            continue;
        }
        match ServerDocument::for_tunnel(spec) {
            Ok(_) => println!("✓ {}", spec.id),
            Err(e) => {
                println!("✗ {}: {}", spec.id, e);
                invalid += 1;
            }
        }
    }

    if invalid > 0 {
        bail!("{} of {} tunnel(s) are invalid", invalid, file.tunnels.len());
    }
    println!("{} tunnel(s) OK", file.tunnels.len());
    Ok(())
}

async fn handle_run(settings: SupervisorSettings, tunnels: Vec<TunnelSpec>) -> Result<()> {
    if tunnels.is_empty() {
        bail!("No [[tunnels]] configured; pass a settings file with --config");
    }
    let duplicates = duplicate_ids(&tunnels);
    if !duplicates.is_empty() {
        bail!("Duplicate tunnel id(s): {}", duplicates.join(", "));
    }

    info!("=== tunneld ===");
    info!("  Config directory: {:?}", settings.config_dir);
    info!("  Executable: {:?}", settings.executable);
    info!("  Tunnels: {}", tunnels.len());

    let registry = Arc::new(ServerRegistry::new(settings).context("Failed to create registry")?);

    let mut started = 0;
    for spec in tunnels {
        let registry = Arc::clone(&registry);
        let id = spec.id.clone();
        let result = tokio::task::spawn_blocking(move || registry.try_start(&spec))
            .await
            .context("Start task panicked")?;
        match result {
            Ok(server) => {
                info!("✓ {} running (PID: {})", id, server.pid);
                started += 1;
            }
            Err(e) => error!("✗ {}: {}", id, e),
        }
    }

    if started == 0 {
        bail!("No tunnel could be started");
    }

    info!("Press Ctrl+C to shut down...");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down...");
    let blocking = Arc::clone(&registry);
    let active = tokio::task::spawn_blocking(move || {
        let active = blocking.list_active();
        blocking.cleanup_all();
        active
    })
    .await
    .context("Shutdown task panicked")?;

    if active.len() < started {
        warn!(
            "{} tunnel(s) had exited before shutdown",
            started - active.len()
        );
    }
    info!("Stopped {} tunnel(s)", active.len());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["tunneld", "--config", "/etc/tunneld.toml", "run"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/tunneld.toml")));
        assert!(matches!(cli.command, Command::Run));

        let cli = Cli::try_parse_from([
            "tunneld",
            "render",
            "t1",
            "--remote-addr",
            "0.0.0.0:23333",
            "--token",
            "secret",
            "--proxy-port",
            "8989",
        ])
        .unwrap();
        match cli.command {
            Command::Render { id, proxy_port, .. } => {
                assert_eq!(id, "t1");
                assert_eq!(proxy_port, 8989);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_bad_port() {
        let result = Cli::try_parse_from([
            "tunneld", "render", "t1", "-r", "0.0.0.0:1", "-t", "x", "-p", "99999",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_ids() {
        let tunnels = vec![
            TunnelSpec::new("a", "0.0.0.0:1", "x", 1),
            TunnelSpec::new("b", "0.0.0.0:2", "x", 2),
            TunnelSpec::new("a", "0.0.0.0:3", "x", 3),
            TunnelSpec::new("a", "0.0.0.0:4", "x", 4),
        ];
        assert_eq!(duplicate_ids(&tunnels), vec!["a"]);
        assert!(duplicate_ids(&tunnels[..2]).is_empty());
    }

    #[test]
    fn test_overrides_apply_without_file() {
        let cli = Cli::try_parse_from([
            "tunneld",
            "--config-dir",
            "/tmp/rathole",
            "--executable",
            "/opt/rathole",
            "check",
        ])
        .unwrap();

        let file = cli.settings().unwrap();
        assert_eq!(file.supervisor.config_dir, PathBuf::from("/tmp/rathole"));
        assert_eq!(file.supervisor.executable, PathBuf::from("/opt/rathole"));
        assert_eq!(file.supervisor.fallback_executable, "rathole");
        assert!(file.tunnels.is_empty());
    }
}
