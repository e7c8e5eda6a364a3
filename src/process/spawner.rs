use crate::config::ManagedProcessConfig;
use crate::error::{Result, VigilError};
use crate::logs::{forward_lines, LogSinks};
use crate::process::handle::{ExitStatus, ProcessLauncher, SpawnedProcess};
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error};

/// Launches managed processes with `tokio::process`
///
/// Output is appended to the configured log files; streams without a file
/// are inherited from the supervisor. Children are killed if their exit
/// future is dropped, so an abandoned supervisor never leaks its process.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl ProcessLauncher for OsLauncher {
    fn spawn(&self, config: &ManagedProcessConfig) -> Result<SpawnedProcess> {
        // Open log files first so a bad path fails before anything runs
        let sinks = if config.logs.captures_output() {
            LogSinks::open(&config.logs)?
        } else {
            LogSinks::default()
        };

        let mut command = Command::new(&config.program);
        command.args(&config.args);

        if let Some(ref cwd) = config.cwd {
            command.current_dir(cwd);
        }

        command.envs(&config.env);
        command.stdin(Stdio::null());
        command.stdout(if sinks.stdout.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        command.stderr(if sinks.stderr.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            let reason = match e.kind() {
                ErrorKind::NotFound => "command not found".to_string(),
                ErrorKind::PermissionDenied => "permission denied".to_string(),
                _ => e.to_string(),
            };
            VigilError::SpawnError(format!(
                "'{}' ({}): {}",
                config.name,
                config.program.display(),
                reason
            ))
        })?;

        let pid = child.id().ok_or_else(|| {
            VigilError::SpawnError(format!("Failed to get PID for app '{}'", config.name))
        })?;

        if let (Some(stdout), Some(writer)) = (child.stdout.take(), sinks.stdout) {
            forward_lines(config.name.clone(), stdout, writer);
        }
        if let (Some(stderr), Some(writer)) = (child.stderr.take(), sinks.stderr) {
            forward_lines(config.name.clone(), stderr, writer);
        }

        debug!("Spawned '{}' as PID {}", config.name, pid);

        let name = config.name.clone();
        let exit = Box::pin(async move {
            match child.wait().await {
                Ok(status) => ExitStatus::from(status),
                Err(e) => {
                    error!("Failed to wait for app '{}' (PID {}): {}", name, pid, e);
                    ExitStatus::Code(-1)
                }
            }
        });

        Ok(SpawnedProcess { pid, exit })
    }
}
