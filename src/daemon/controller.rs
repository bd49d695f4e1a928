//! Daemon Process Controller
//!
//! Starts the daemon binary in the configured backend mode, stops it with
//! SIGTERM (escalating to SIGKILL after a deadline) and clears whatever a
//! previous instance left behind.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::adapters::command::run_tool;
use crate::adapters::DeviceMapperCleaner;
use crate::config::{BackendMode, HarnessConfig};
use crate::domain::DaemonSupervisor;
use crate::error::{Error, Result};

/// A running daemon process.
#[derive(Debug)]
pub struct DaemonProcess {
    child: Child,
    pid: u32,
    started_at: DateTime<Utc>,
}

impl DaemonProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Supervisor for the real daemon binary.
#[derive(Debug, Clone)]
pub struct DaemonController {
    daemon_path: PathBuf,
    mode: BackendMode,
    stop_timeout: Duration,
    pkill: PathBuf,
    dm: DeviceMapperCleaner,
}

impl DaemonController {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            daemon_path: config.daemon_path.clone(),
            mode: config.mode,
            stop_timeout: config.stop_timeout,
            pkill: config.tools.pkill.clone(),
            dm: DeviceMapperCleaner::new(config.tools.dmsetup.clone()),
        }
    }

    /// Controller for loopback scenarios.
    ///
    /// The simulated backend never sees block devices, so the real backend is
    /// used whatever mode the configuration asks for.
    pub fn for_loopback(config: &HarnessConfig) -> Self {
        let mut controller = Self::new(config);
        if controller.mode != BackendMode::Real {
            warn!(configured = %controller.mode, "Loopback scenarios need the real backend");
            controller.mode = BackendMode::Real;
        }
        controller
    }

    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    /// Executable name used to find stray instances.
    fn process_name(&self) -> Option<String> {
        self.daemon_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    fn daemon_command(&self) -> Command {
        let mut command = Command::new(&self.daemon_path);
        command
            .arg(self.mode.daemon_flag())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    async fn kill_stray_instances(&self) -> Result<()> {
        let Some(name) = self.process_name() else {
            return Ok(());
        };
        let output = run_tool(&self.pkill, ["-KILL", "-x", name.as_str()]).await?;
        match output.status {
            Some(0) => warn!(process = %name, "Killed stray daemon instance"),
            // 1: nothing matched
            Some(1) => debug!(process = %name, "No stray daemon instance"),
            _ => {
                return Err(Error::Daemon(format!(
                    "{}: {}",
                    output.command,
                    output.failure_reason()
                )))
            }
        }
        Ok(())
    }
}

/// Send SIGTERM. Returns false when the process is already gone.
fn send_sigterm(pid: u32) -> Result<bool> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| Error::Daemon(format!("pid {} out of range", pid)))?;
    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(false);
        }
        return Err(Error::Daemon(format!("SIGTERM to {}: {}", pid, err)));
    }
    Ok(true)
}

#[async_trait]
impl DaemonSupervisor for DaemonController {
    type Handle = DaemonProcess;

    #[instrument(skip(self))]
    async fn clear_stale_state(&mut self) -> Result<()> {
        self.kill_stray_instances().await?;
        let left = self.dm.remove_all().await?;
        if !left.is_empty() {
            warn!(count = left.len(), "Continuing with leftover device-mapper tables");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start(&mut self) -> Result<DaemonProcess> {
        let child = self.daemon_command().spawn().map_err(|e| {
            Error::Daemon(format!("spawn {}: {}", self.daemon_path.display(), e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Daemon("daemon exited during spawn".into()))?;

        info!(pid, mode = %self.mode, path = %self.daemon_path.display(), "Daemon started");
        Ok(DaemonProcess {
            child,
            pid,
            started_at: Utc::now(),
        })
    }

    #[instrument(skip_all)]
    async fn stop(&mut self, mut handle: DaemonProcess) -> Result<()> {
        if let Some(status) = handle.child.try_wait()? {
            warn!(pid = handle.pid, %status, "Daemon had already exited");
            return Ok(());
        }

        if !send_sigterm(handle.pid)? {
            // Exited between try_wait and the signal
            let status = handle.child.wait().await?;
            warn!(pid = handle.pid, %status, "Daemon had already exited");
            return Ok(());
        }
        match timeout(self.stop_timeout, handle.child.wait()).await {
            Ok(status) => {
                let status = status?;
                let uptime = Utc::now() - handle.started_at;
                info!(pid = handle.pid, %status, %uptime, "Daemon stopped");
            }
            Err(_) => {
                warn!(timeout = ?self.stop_timeout, "Daemon ignored SIGTERM, killing");
                handle.child.kill().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn controller(daemon: &str) -> DaemonController {
        DaemonController::new(&HarnessConfig {
            daemon_path: PathBuf::from(daemon),
            stop_timeout: Duration::from_secs(2),
            ..HarnessConfig::default()
        })
    }

    #[tokio::test]
    async fn test_spawn_failure_is_daemon_error() {
        let mut ctl = controller("/nonexistent/stratisd");
        assert_matches!(ctl.start().await, Err(Error::Daemon(_)));
    }

    #[tokio::test]
    async fn test_stop_tolerates_exited_daemon() {
        // `sh --sim` rejects the flag and exits straight away
        let mut ctl = controller("sh");
        let handle = ctl.start().await.unwrap();
        assert!(handle.pid() > 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        ctl.stop(handle).await.unwrap();
    }

    #[test]
    fn test_loopback_controller_uses_real_backend() {
        let config = HarnessConfig::default();
        assert_eq!(config.mode, BackendMode::Simulated);

        let ctl = DaemonController::for_loopback(&config);
        assert_eq!(ctl.mode(), BackendMode::Real);
        let command = ctl.daemon_command();
        let args: Vec<_> = command.as_std().get_args().collect();
        assert_eq!(args, ["--debug"]);
    }

    #[test]
    fn test_sigterm_to_reaped_process() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(!send_sigterm(pid).unwrap());
    }

    #[test]
    fn test_process_name_from_path() {
        let ctl = controller("/usr/libexec/stratisd");
        assert_eq!(ctl.process_name().as_deref(), Some("stratisd"));
        assert_eq!(ctl.mode(), BackendMode::Simulated);
    }
}
