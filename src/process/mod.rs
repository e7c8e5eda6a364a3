// Process module - Supervision of managed processes

pub mod clock;
mod handle;
mod monitor;
mod registry;
mod restart;
mod schedule;
mod spawner;
mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, SystemClock};
pub use handle::{
    ExitFuture, ExitStatus, NixSignals, ProcessHandle, ProcessLauncher, SignalSender,
    SpawnedProcess,
};
pub use monitor::{MemorySampler, ResourceMonitor, SysinfoSampler};
pub use registry::SupervisorRegistry;
pub use restart::{BackoffStrategy, RestartDecision, RestartPolicy, RestartState};
pub use schedule::ScheduleTrigger;
pub use spawner::OsLauncher;
pub use supervisor::{Backend, Supervisor, SupervisorState, SupervisorStatus};
