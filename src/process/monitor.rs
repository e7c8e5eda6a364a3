use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

/// Reads the resident memory of a process
///
/// Called from inside a supervisor's event loop, so an implementation must
/// only do short blocking work (a single-process query, no scans).
pub trait MemorySampler: Send + Sync {
    /// Resident bytes, or `None` when the process cannot be queried
    fn sample(&self, pid: u32) -> Option<u64>;
}

/// Memory sampling backed by `sysinfo`
///
/// Each sample refreshes one pid from `/proc` under a short-held lock. One
/// sampler is shared by every supervisor of a backend.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn sample(&self, pid: u32) -> Option<u64> {
        // A panic elsewhere must not switch memory checks off for every app
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        let sys_pid = Pid::from_u32(pid);

        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        system.process(sys_pid).map(|process| process.memory())
    }
}

/// Watches one process's memory against a ceiling
pub struct ResourceMonitor {
    ceiling: Option<u64>,
    interval: Duration,
    sampler: Arc<dyn MemorySampler>,
    /// Set once a breach has been reported for the current run
    breached: bool,
    last_sample: Option<u64>,
}

impl ResourceMonitor {
    pub fn new(ceiling: Option<u64>, interval: Duration, sampler: Arc<dyn MemorySampler>) -> Self {
        Self {
            ceiling,
            interval,
            sampler,
            breached: false,
            last_sample: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn ceiling(&self) -> Option<u64> {
        self.ceiling
    }

    pub fn last_sample(&self) -> Option<u64> {
        self.last_sample
    }

    /// Sample `pid`; returns the usage when it newly exceeds the ceiling
    ///
    /// A breach is reported once per run; `rearm` must be called after the
    /// process has been restarted before another one is reported.
    pub fn check(&mut self, pid: u32) -> Option<u64> {
        let Some(bytes) = self.sampler.sample(pid) else {
            // Vanished between checks; the exit future has the final word
            debug!("Memory sample for PID {} unavailable, skipping", pid);
            return None;
        };
        self.last_sample = Some(bytes);

        match self.ceiling {
            Some(ceiling) if bytes > ceiling && !self.breached => {
                self.breached = true;
                Some(bytes)
            }
            _ => None,
        }
    }

    /// Clear breach state for a new run
    pub fn rearm(&mut self) {
        self.breached = false;
        self.last_sample = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    const MB: u64 = 1024 * 1024;

    struct FixedSampler(Mutex<Option<u64>>);

    impl FixedSampler {
        fn set(&self, value: Option<u64>) {
            *self.0.lock().unwrap() = value;
        }
    }

    impl MemorySampler for FixedSampler {
        fn sample(&self, _pid: u32) -> Option<u64> {
            *self.0.lock().unwrap()
        }
    }

    fn monitor(ceiling: Option<u64>) -> (ResourceMonitor, Arc<FixedSampler>) {
        let sampler = Arc::new(FixedSampler(Mutex::new(None)));
        let monitor = ResourceMonitor::new(ceiling, Duration::from_secs(15), sampler.clone());
        (monitor, sampler)
    }

    #[test]
    fn test_breach_reported_once_per_run() {
        let (mut monitor, sampler) = monitor(Some(200 * MB));

        sampler.set(Some(250 * MB));
        assert_eq!(monitor.check(1), Some(250 * MB));
        assert_eq!(monitor.check(1), None);
        assert_eq!(monitor.check(1), None);
        assert_eq!(monitor.last_sample(), Some(250 * MB));

        monitor.rearm();
        assert_eq!(monitor.last_sample(), None);
        assert_eq!(monitor.check(2), Some(250 * MB));
    }

    #[test]
    fn test_ceiling_is_exclusive() {
        let (mut monitor, sampler) = monitor(Some(200 * MB));

        sampler.set(Some(200 * MB));
        assert_eq!(monitor.check(1), None);

        sampler.set(Some(200 * MB + 1));
        assert_eq!(monitor.check(1), Some(200 * MB + 1));
    }

    #[test]
    fn test_sampling_failure_is_skipped() {
        let (mut monitor, sampler) = monitor(Some(200 * MB));

        sampler.set(None);
        assert_eq!(monitor.check(1), None);
        assert_eq!(monitor.last_sample(), None);

        sampler.set(Some(300 * MB));
        assert_eq!(monitor.check(1), Some(300 * MB));
    }

    #[test]
    fn test_no_ceiling_only_records() {
        let (mut monitor, sampler) = monitor(None);

        sampler.set(Some(10 * 1024 * MB));
        assert_eq!(monitor.check(1), None);
        assert_eq!(monitor.last_sample(), Some(10 * 1024 * MB));
    }

    #[tokio::test]
    async fn test_sysinfo_sampler_reads_live_process() {
        let sampler = SysinfoSampler::new();

        let mut child = Command::new("/bin/sleep")
            .arg("5")
            .spawn()
            .expect("Failed to spawn process");
        let pid = child.id().expect("Failed to get PID");

        let memory = sampler.sample(pid);
        assert!(memory.unwrap_or(0) > 0);

        child.kill().await.expect("Failed to kill process");
        let _ = child.wait().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(sampler.sample(pid), None);
    }

    #[test]
    fn test_sysinfo_sampler_survives_poisoned_lock() {
        let sampler = Arc::new(SysinfoSampler::new());

        let holder = sampler.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.system.lock().unwrap();
            panic!("panicked while sampling");
        })
        .join();
        assert!(sampler.system.is_poisoned());

        assert!(sampler.sample(std::process::id()).unwrap_or(0) > 0);
    }
}
