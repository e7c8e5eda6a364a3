// In-memory stand-ins for the OS and the clock, used by unit tests

use crate::config::ManagedProcessConfig;
use crate::error::{Result, VigilError};
use crate::process::clock::Clock;
use crate::process::handle::{ExitStatus, ProcessLauncher, SignalSender, SpawnedProcess};
use crate::process::monitor::MemorySampler;
use crate::process::supervisor::Backend;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

#[derive(Default)]
struct FakeOsState {
    next_pid: u32,
    exits: HashMap<u32, oneshot::Sender<ExitStatus>>,
    signals: Vec<(u32, Signal)>,
    memory: u64,
    fail_spawns: usize,
    spawn_count: usize,
    ignore_term: bool,
    ignore_kill: bool,
}

/// Fake processes that exit when told to, or when signalled
#[derive(Clone, Default)]
pub(crate) struct FakeOs(Arc<Mutex<FakeOsState>>);

impl FakeOs {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeOsState> {
        self.0.lock().unwrap()
    }

    pub fn backend(&self, clock: Arc<dyn Clock>) -> Backend {
        Backend {
            launcher: Arc::new(self.clone()),
            signals: Arc::new(self.clone()),
            sampler: Arc::new(self.clone()),
            clock,
        }
    }

    /// Make the live process `pid` exit with `status`
    pub fn exit(&self, pid: u32, status: ExitStatus) {
        if let Some(tx) = self.state().exits.remove(&pid) {
            let _ = tx.send(status);
        }
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.state().exits.contains_key(&pid)
    }

    pub fn signals(&self) -> Vec<(u32, Signal)> {
        self.state().signals.clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.state().spawn_count
    }

    pub fn set_memory(&self, bytes: u64) {
        self.state().memory = bytes;
    }

    pub fn fail_next_spawns(&self, count: usize) {
        self.state().fail_spawns = count;
    }

    pub fn ignore_term(&self, ignore: bool) {
        self.state().ignore_term = ignore;
    }

    pub fn ignore_kill(&self, ignore: bool) {
        self.state().ignore_kill = ignore;
    }
}

impl ProcessLauncher for FakeOs {
    fn spawn(&self, config: &ManagedProcessConfig) -> Result<SpawnedProcess> {
        let mut state = self.state();
        state.spawn_count += 1;

        if state.fail_spawns > 0 {
            state.fail_spawns -= 1;
            return Err(VigilError::SpawnError(format!(
                "'{}': command not found",
                config.name
            )));
        }

        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        let (tx, rx) = oneshot::channel();
        state.exits.insert(pid, tx);

        Ok(SpawnedProcess {
            pid,
            exit: Box::pin(async move { rx.await.unwrap_or(ExitStatus::Signal(9)) }),
        })
    }
}

impl SignalSender for FakeOs {
    fn send(&self, pid: u32, signal: Signal) -> Result<()> {
        let (obeys, tx) = {
            let mut state = self.state();
            state.signals.push((pid, signal));
            let obeys = match signal {
                Signal::SIGKILL => !state.ignore_kill,
                _ => !state.ignore_term,
            };
            let tx = if obeys { state.exits.remove(&pid) } else { None };
            (obeys, tx)
        };

        if let (true, Some(tx)) = (obeys, tx) {
            let _ = tx.send(ExitStatus::Signal(signal as i32));
        }
        Ok(())
    }
}

impl MemorySampler for FakeOs {
    fn sample(&self, pid: u32) -> Option<u64> {
        let state = self.state();
        state.exits.contains_key(&pid).then_some(state.memory)
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now(), start + chrono::Duration::minutes(5));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
