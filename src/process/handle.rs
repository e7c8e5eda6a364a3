use crate::config::ManagedProcessConfig;
use crate::error::{Result, VigilError};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// How a managed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    /// Normal exit with a status code
    Code(i32),
    /// Terminated by a signal
    Signal(i32),
}

impl ExitStatus {
    /// Synthetic status recorded when the process could not be spawned at all
    pub const SPAWN_FAILED: ExitStatus = ExitStatus::Code(-1);

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit code {}", code),
            ExitStatus::Signal(sig) => write!(f, "signal {}", sig),
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => ExitStatus::Code(code),
            (None, Some(sig)) => ExitStatus::Signal(sig),
            (None, None) => ExitStatus::Code(-1),
        }
    }
}

/// Resolves once the OS reports that the process terminated
pub type ExitFuture = Pin<Box<dyn Future<Output = ExitStatus> + Send>>;

/// A freshly spawned process: its pid and a future for its exit
pub struct SpawnedProcess {
    pub pid: u32,
    pub exit: ExitFuture,
}

impl fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Starts managed processes
pub trait ProcessLauncher: Send + Sync {
    fn spawn(&self, config: &ManagedProcessConfig) -> Result<SpawnedProcess>;
}

/// Delivers signals to managed processes
pub trait SignalSender: Send + Sync {
    fn send(&self, pid: u32, signal: Signal) -> Result<()>;
}

/// Signal delivery through `kill(2)`
#[derive(Debug, Default, Clone, Copy)]
pub struct NixSignals;

impl SignalSender for NixSignals {
    fn send(&self, pid: u32, sig: Signal) -> Result<()> {
        let raw = i32::try_from(pid)
            .map_err(|_| VigilError::SignalError(format!("Invalid PID: {}", pid)))?;

        match signal::kill(Pid::from_raw(raw), sig) {
            Ok(()) => Ok(()),
            // Already gone; the exit future reports the outcome
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(VigilError::SignalError(format!(
                "Failed to send {} to PID {}: {}",
                sig, pid, e
            ))),
        }
    }
}

/// The single live process owned by a supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: u32,
    started_at: DateTime<Utc>,
}

impl ProcessHandle {
    pub fn new(pid: u32, started_at: DateTime<Utc>) -> Self {
        Self { pid, started_at }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[test]
    fn test_exit_status_display() {
        assert_eq!(ExitStatus::Code(3).to_string(), "exit code 3");
        assert_eq!(ExitStatus::Signal(9).to_string(), "signal 9");
        assert!(ExitStatus::Code(0).success());
        assert!(!ExitStatus::SPAWN_FAILED.success());
    }

    #[tokio::test]
    async fn test_exit_status_from_os() {
        let status = Command::new("/bin/sh")
            .args(["-c", "exit 7"])
            .status()
            .await
            .unwrap();
        assert_eq!(ExitStatus::from(status), ExitStatus::Code(7));

        let status = Command::new("/bin/sh")
            .args(["-c", "kill -9 $$"])
            .status()
            .await
            .unwrap();
        assert_eq!(ExitStatus::from(status), ExitStatus::Signal(9));
    }

    #[tokio::test]
    async fn test_nix_signals_terminates_process() {
        let mut child = Command::new("/bin/sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();

        NixSignals.send(pid, Signal::SIGTERM).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(ExitStatus::from(status), ExitStatus::Signal(15));

        // Reaped process: ESRCH is swallowed
        assert!(NixSignals.send(pid, Signal::SIGTERM).is_ok());
    }

    #[test]
    fn test_process_handle_uptime() {
        let started = Utc::now();
        let handle = ProcessHandle::new(42, started);
        assert_eq!(handle.pid(), 42);
        assert_eq!(
            handle.uptime(started + chrono::Duration::seconds(90)),
            Duration::from_secs(90)
        );
        assert_eq!(
            handle.uptime(started - chrono::Duration::seconds(1)),
            Duration::ZERO
        );
    }
}
