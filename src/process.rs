//! Rathole process management
//!
//! This module spawns a rathole server against a rendered config file,
//! checks that it survives its startup grace window, answers liveness
//! queries and shuts it down (SIGTERM, then SIGKILL after a timeout).

use crate::error::{Result, SupervisorError};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lines of stdout/stderr kept per stream for failure reports
const OUTPUT_TAIL_LINES: usize = 64;

/// How often the stop sequence re-checks the process
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a failed start waits for its output readers to catch up
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// How to launch one rathole server
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Installed rathole binary, tried first
    pub executable: PathBuf,

    /// Name resolved through `PATH` when `executable` does not exist
    pub fallback_executable: String,

    /// Arguments passed to rathole
    pub args: Vec<String>,

    /// Working directory (the config directory)
    pub working_dir: PathBuf,
}

impl LaunchSpec {
    /// Launch rathole in server mode: `<exe> -s <config_path>`
    pub fn rathole_server(
        executable: PathBuf,
        fallback_executable: impl Into<String>,
        config_path: &Path,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            executable,
            fallback_executable: fallback_executable.into(),
            args: vec!["-s".to_string(), config_path.to_string_lossy().into_owned()],
            working_dir,
        }
    }

    fn command(&self, program: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Spawn the primary executable, falling back to a `PATH` lookup only
    /// when the primary is missing.
    fn spawn(&self) -> Result<Child> {
        if !self.executable.exists() {
            debug!(
                "{:?} not found, falling back to {:?} from PATH",
                self.executable, self.fallback_executable
            );
            return self
                .command(Path::new(&self.fallback_executable))
                .spawn()
                .map_err(|source| SupervisorError::Spawn {
                    executable: self.fallback_executable.clone(),
                    source,
                });
        }

        self.command(&self.executable)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                executable: self.executable.display().to_string(),
                source,
            })
    }
}

/// Last lines written by the process to one of its streams
#[derive(Debug, Clone, Default)]
pub struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        if lines.len() == OUTPUT_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Captured lines joined with newlines
    pub fn contents(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Drain `stream` on a background thread, logging each line.
    fn follow<R: Read + Send + 'static>(
        &self,
        tunnel: &str,
        stream_name: &'static str,
        stream: R,
    ) -> Option<JoinHandle<()>> {
        let tail = self.clone();
        let reader_tunnel = tunnel.to_string();
        thread::Builder::new()
            .name(format!("rathole-{}-{}", tunnel, stream_name))
            .spawn(move || {
                // Keep reading until EOF: closing the pipe early would SIGPIPE the child.
                let mut reader = BufReader::new(stream);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf) {
                        Ok(0) => break,
                        Ok(_) => {
                            let line = String::from_utf8_lossy(&buf);
                            let line = line.trim_end_matches(['\n', '\r']).to_string();
                            debug!(tunnel = %reader_tunnel, stream = stream_name, "{}", line);
                            tail.push(line);
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            debug!(tunnel = %reader_tunnel, stream = stream_name, error = %e, "Output reader stopped");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| warn!(tunnel = %tunnel, error = %e, "Failed to start output reader"))
            .ok()
    }
}

/// Lifecycle of a spawned process
#[derive(Debug)]
pub enum ProcessState {
    /// Spawned and not yet observed to exit
    Alive(Child),
    /// Exited on its own
    Exited(ExitStatus),
    /// Shut down by [`ServerProcess::terminate`]
    Stopped,
}

/// Why [`ServerProcess::poll`] considers a process gone
#[derive(Debug)]
enum Gone {
    Exited(ExitStatus),
    Stopped,
    Unknown(std::io::Error),
}

/// A rathole server process owned by the registry
pub struct ServerProcess {
    tunnel: String,
    pid: u32,
    state: ProcessState,
    stdout: OutputTail,
    stderr: OutputTail,
    readers: Vec<JoinHandle<()>>,
}

impl ServerProcess {
    /// Spawn rathole for `tunnel` with the given launch spec
    pub fn spawn(tunnel: &str, spec: &LaunchSpec) -> Result<Self> {
        info!("Spawning rathole server for tunnel {}", tunnel);
        info!("  Executable: {:?}", spec.executable);
        info!("  Working directory: {:?}", spec.working_dir);
        info!("  Args: {:?}", spec.args);

        let mut child = spec.spawn()?;
        let pid = child.id();

        let stdout = OutputTail::default();
        let stderr = OutputTail::default();
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.extend(stdout.follow(tunnel, "stdout", out));
        }
        if let Some(err) = child.stderr.take() {
            readers.extend(stderr.follow(tunnel, "stderr", err));
        }

        info!("Rathole server spawned with PID: {}", pid);

        Ok(Self {
            tunnel: tunnel.to_string(),
            pid,
            state: ProcessState::Alive(child),
            stdout,
            stderr,
            readers,
        })
    }

    /// Spawn and confirm the process is still running after `grace`.
    ///
    /// A process that exits inside the window is reported as
    /// [`SupervisorError::EarlyExit`] carrying its captured output.
    pub fn start(tunnel: &str, spec: &LaunchSpec, grace: Duration) -> Result<Self> {
        let mut process = Self::spawn(tunnel, spec)?;

        thread::sleep(grace);

        match process.poll() {
            None => Ok(process),
            Some(gone) => Err(process.early_exit(gone)),
        }
    }

    /// Get the process ID
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn tunnel(&self) -> &str {
        &self.tunnel
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    /// Non-blocking liveness check; re-polls the OS every call.
    pub fn is_alive(&mut self) -> bool {
        self.poll().is_none()
    }

    /// `None` while alive; otherwise why the process is gone.
    fn poll(&mut self) -> Option<Gone> {
        let child = match &mut self.state {
            ProcessState::Alive(child) => child,
            ProcessState::Exited(status) => return Some(Gone::Exited(*status)),
            ProcessState::Stopped => return Some(Gone::Stopped),
        };

        match child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => {
                debug!(tunnel = %self.tunnel, pid = self.pid, %status, "Process exited");
                self.state = ProcessState::Exited(status);
                Some(Gone::Exited(status))
            }
            Err(e) => {
                warn!(tunnel = %self.tunnel, pid = self.pid, error = %e, "Error checking process");
                Some(Gone::Unknown(e))
            }
        }
    }

    fn early_exit(mut self, gone: Gone) -> SupervisorError {
        let status = match gone {
            Gone::Exited(status) => status.to_string(),
            Gone::Stopped => "stopped".to_string(),
            Gone::Unknown(e) => format!("unknown ({})", e),
        };

        // Descendants may still hold the pipes open; don't wait on them.
        let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
        while self.readers.iter().any(|r| !r.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        for reader in self.readers.drain(..) {
            if reader.is_finished() {
                let _ = reader.join();
            }
        }

        let stderr = self.stderr.contents();
        let output = if stderr.trim().is_empty() {
            self.stdout.contents()
        } else {
            stderr
        };
        let output = match output.trim() {
            "" => "no output".to_string(),
            trimmed => trimmed.to_string(),
        };

        SupervisorError::EarlyExit { status, output }
    }

    /// Stop the process: SIGTERM, wait up to `timeout`, then SIGKILL and reap.
    ///
    /// Never fails; problems are logged and the process always ends up
    /// [`ProcessState::Stopped`].
    pub fn terminate(&mut self, timeout: Duration) {
        let mut child = match std::mem::replace(&mut self.state, ProcessState::Stopped) {
            ProcessState::Alive(child) => child,
            ProcessState::Exited(status) => {
                debug!(tunnel = %self.tunnel, %status, "Process already exited");
                return;
            }
            ProcessState::Stopped => return,
        };

        info!("Shutting down rathole server for tunnel {} (PID: {})...", self.tunnel, self.pid);

        if request_shutdown(&mut child) {
            match wait_until(&mut child, Instant::now() + timeout) {
                Ok(Some(status)) => {
                    info!(tunnel = %self.tunnel, %status, "Rathole server stopped");
                    return;
                }
                Ok(None) => warn!(
                    tunnel = %self.tunnel,
                    pid = self.pid,
                    "Rathole server ignored SIGTERM for {:?}, killing it", timeout
                ),
                Err(e) => warn!(tunnel = %self.tunnel, error = %e, "Error waiting for rathole server"),
            }
        }

        if let Err(e) = child.kill() {
            warn!(tunnel = %self.tunnel, error = %e, "Failed to kill rathole server");
        }
        match child.wait() {
            Ok(status) => info!(tunnel = %self.tunnel, %status, "Rathole server killed"),
            Err(e) => warn!(tunnel = %self.tunnel, error = %e, "Failed to reap rathole server"),
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if let ProcessState::Alive(child) = &mut self.state {
            warn!(tunnel = %self.tunnel, pid = self.pid, "Dropping live rathole server, killing it");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Send SIGTERM. Returns false if the caller should go straight to SIGKILL.
#[cfg(unix)]
fn request_shutdown(child: &mut Child) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
        Ok(()) => true,
        // Already gone but not reaped; the wait below picks it up.
        Err(Errno::ESRCH) => true,
        Err(e) => {
            warn!(pid = child.id(), error = %e, "Failed to send SIGTERM");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_shutdown(_child: &mut Child) -> bool {
    false
}

/// Poll until the child exits or `deadline` passes.
fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
    }
}
