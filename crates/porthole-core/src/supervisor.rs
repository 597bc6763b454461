//! Tunnel process lifecycle supervisor.
//!
//! Owns at most one `ngrok` child process at a time and manages spawning,
//! liveness checks, and graceful shutdown with a bounded wait.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Parameters for a tunnel to expose one local port.
///
/// Immutable once handed to [`TunnelSupervisor::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    /// Local port to expose.
    pub port: u16,
    /// Reserved domain to bind instead of a dynamically assigned URL.
    pub domain: Option<String>,
}

impl TunnelRequest {
    /// Request a tunnel with a dynamically assigned public URL.
    pub const fn new(port: u16) -> Self {
        Self { port, domain: None }
    }

    /// Request a tunnel bound to a reserved domain.
    pub fn with_domain(port: u16, domain: impl Into<String>) -> Self {
        Self {
            port,
            domain: Some(domain.into()),
        }
    }

    /// Derive the argument vector passed to the tunnel binary.
    ///
    /// Always an argument vector, never a shell string, so the domain field
    /// cannot smuggle shell syntax into the spawn.
    pub fn to_args(&self) -> Vec<String> {
        match &self.domain {
            Some(domain) => vec![
                "http".to_string(),
                format!("--domain={domain}"),
                self.port.to_string(),
            ],
            None => vec!["http".to_string(), self.port.to_string()],
        }
    }
}

/// Snapshot of a running tunnel process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    /// OS process id of the spawned child.
    pub pid: u32,
    /// The request the child was spawned for.
    pub request: TunnelRequest,
}

/// Errors from supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("tunnel binary '{}' not found on PATH", .binary.display())]
    NotInstalled { binary: PathBuf },

    #[error("Failed to spawn tunnel process: {reason}")]
    SpawnFailed { reason: String },

    #[error("Failed to terminate tunnel process: {reason}")]
    TerminationFailed { reason: String },
}

struct RunningTunnel {
    child: Child,
    handle: TunnelHandle,
}

/// Supervisor for a single tunnel child process.
///
/// Invariant: at most one child is live at a time. Starting a new tunnel
/// terminates any previous one first.
pub struct TunnelSupervisor {
    /// Tunnel binary, resolved via `PATH` when not an absolute path.
    binary: PathBuf,
    /// Timeout for graceful termination before SIGKILL.
    terminate_timeout: Duration,
    current: Option<RunningTunnel>,
}

impl TunnelSupervisor {
    /// Create a supervisor for the `ngrok` binary with a 5 second
    /// termination timeout.
    pub fn new() -> Self {
        Self::with_options(PathBuf::from("ngrok"), 5)
    }

    /// Create a supervisor with full configuration.
    pub fn with_options(binary: PathBuf, terminate_timeout_secs: u64) -> Self {
        Self {
            binary,
            terminate_timeout: Duration::from_secs(terminate_timeout_secs),
            current: None,
        }
    }

    /// Whether the tunnel binary is resolvable on the execution search path.
    ///
    /// Pure query, no side effect.
    pub fn is_available(&self) -> bool {
        which::which(&self.binary).is_ok()
    }

    /// Spawn a tunnel process for `request`, replacing any running one.
    ///
    /// The previous child (if any) is stopped first so at most one tunnel is
    /// ever live. A second `start` with the identical request still restarts
    /// the process.
    pub async fn start(
        &mut self,
        request: TunnelRequest,
    ) -> Result<TunnelHandle, SupervisorError> {
        if !self.is_available() {
            return Err(SupervisorError::NotInstalled {
                binary: self.binary.clone(),
            });
        }

        self.stop().await?;

        let args = request.to_args();
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Own process group so the tunnel's forked helpers can be signalled
        // together with it on shutdown.
        #[cfg(unix)]
        cmd.process_group(0);

        info!(binary = %self.binary.display(), ?args, "Spawning tunnel process");

        let child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| SupervisorError::SpawnFailed {
            reason: "process exited before its pid could be read".to_string(),
        })?;

        info!(pid, port = request.port, domain = ?request.domain, "Tunnel process started");

        let handle = TunnelHandle { pid, request };
        self.current = Some(RunningTunnel {
            child,
            handle: handle.clone(),
        });
        Ok(handle)
    }

    /// Terminate the current tunnel process, if any.
    ///
    /// Idempotent: succeeds as a no-op when nothing is running. Otherwise the
    /// child's process group gets SIGTERM, then up to the configured timeout
    /// to exit, then SIGKILL. The handle is cleared on every path; only a
    /// signal that cannot be delivered is an error.
    pub async fn stop(&mut self) -> Result<(), SupervisorError> {
        let Some(mut running) = self.current.take() else {
            return Ok(());
        };
        let pid = running.handle.pid;
        debug!(pid, "Terminating tunnel process");

        // The child may have exited on its own since the last check.
        if let Ok(Some(status)) = running.child.try_wait() {
            info!(pid, ?status, "Tunnel process had already exited");
            return Ok(());
        }

        #[cfg(unix)]
        signal_group(pid, libc::SIGTERM)?;
        #[cfg(not(unix))]
        running
            .child
            .start_kill()
            .map_err(|e| SupervisorError::TerminationFailed {
                reason: e.to_string(),
            })?;

        match tokio::time::timeout(self.terminate_timeout, running.child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid, ?status, "Tunnel process exited");
            }
            Ok(Err(e)) => {
                warn!(pid, error = %e, "Error waiting for tunnel process");
                running.child.kill().await.ok();
            }
            Err(_) => {
                warn!(pid, "Timeout waiting for graceful shutdown, killing");
                #[cfg(unix)]
                let _ = signal_group(pid, libc::SIGKILL);
                running.child.kill().await.ok();
            }
        }
        Ok(())
    }

    /// Whether the supervised child is still alive.
    ///
    /// A child observed to have exited clears the handle, so supervisor state
    /// and OS process state cannot stay divergent past one check.
    pub fn is_running(&mut self) -> bool {
        let Some(running) = self.current.as_mut() else {
            return false;
        };
        match running.child.try_wait() {
            Ok(Some(status)) => {
                let pid = running.handle.pid;
                self.current = None;
                info!(pid, ?status, "Tunnel process exited on its own");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = running.handle.pid, error = %e, "Failed to query tunnel process state");
                true
            }
        }
    }

    /// Handle of the currently running tunnel, after a liveness check.
    pub fn handle(&mut self) -> Option<TunnelHandle> {
        if self.is_running() {
            self.current.as_ref().map(|r| r.handle.clone())
        } else {
            None
        }
    }
}

impl Default for TunnelSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TunnelSupervisor {
    fn drop(&mut self) {
        if let Some(running) = self.current.as_mut() {
            warn!(
                pid = running.handle.pid,
                "Supervisor dropped with tunnel still running, killing child process"
            );
            let _ = running.child.start_kill();
        }
    }
}

/// Deliver `signal` to the child's whole process group.
///
/// ESRCH means the group is already gone and counts as success; anything
/// else (e.g. EPERM) is a delivery failure.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> Result<(), SupervisorError> {
    // SAFETY: pid identifies a process group created by our own spawn.
    // kill(2) with a negative pid signals every member of that group.
    #[allow(unsafe_code)]
    #[allow(clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(-(pid as i32), signal) };
    if ret == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(SupervisorError::TerminationFailed {
        reason: err.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn args_without_domain() {
        let request = TunnelRequest::new(8080);
        assert_eq!(request.to_args(), vec!["http", "8080"]);
    }

    #[test]
    fn args_with_domain() {
        let request = TunnelRequest::with_domain(8080, "custom.ngrok.io");
        assert_eq!(
            request.to_args(),
            vec!["http", "--domain=custom.ngrok.io", "8080"]
        );
    }

    #[test]
    fn unavailable_binary_is_not_installed() {
        let supervisor =
            TunnelSupervisor::with_options("porthole_nonexistent_binary_12345".into(), 5);
        assert!(!supervisor.is_available());
    }

    #[cfg(unix)]
    #[test]
    fn available_binary_is_found() {
        // `ls` exists on all Unix systems
        let supervisor = TunnelSupervisor::with_options("ls".into(), 5);
        assert!(supervisor.is_available());
    }

    #[tokio::test]
    async fn stop_without_handle_is_a_noop() {
        let mut supervisor = TunnelSupervisor::new();
        assert!(supervisor.stop().await.is_ok());
        assert!(!supervisor.is_running());
        assert!(supervisor.handle().is_none());
    }

    #[tokio::test]
    async fn start_without_binary_fails_not_installed() {
        let mut supervisor =
            TunnelSupervisor::with_options("porthole_nonexistent_binary_12345".into(), 5);
        let err = supervisor.start(TunnelRequest::new(8080)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotInstalled { .. }));
    }

    // `yes` ignores its arguments and runs until signalled, standing in for a
    // long-lived tunnel binary.
    #[cfg(unix)]
    #[tokio::test]
    async fn start_records_pid_and_stop_terminates() {
        let mut supervisor = TunnelSupervisor::with_options("yes".into(), 5);
        let handle = supervisor.start(TunnelRequest::new(8080)).await.unwrap();
        assert!(handle.pid > 0);
        assert_eq!(handle.request.port, 8080);
        assert!(supervisor.is_running());

        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_running());
        assert!(supervisor.handle().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_start_replaces_first_handle() {
        let mut supervisor = TunnelSupervisor::with_options("yes".into(), 5);
        let first = supervisor.start(TunnelRequest::new(8080)).await.unwrap();
        let second = supervisor
            .start(TunnelRequest::with_domain(9090, "custom.ngrok.io"))
            .await
            .unwrap();
        assert_ne!(first.pid, second.pid);

        let current = supervisor.handle().expect("second tunnel should be live");
        assert_eq!(current.pid, second.pid);
        assert_eq!(current.request.port, 9090);

        supervisor.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_child_clears_handle() {
        // `true` exits immediately regardless of arguments.
        let mut supervisor = TunnelSupervisor::with_options("true".into(), 5);
        supervisor.start(TunnelRequest::new(8080)).await.unwrap();

        // Wait for the exit to become observable.
        for _ in 0..50 {
            if !supervisor.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!supervisor.is_running());
        assert!(supervisor.handle().is_none());
    }
}
