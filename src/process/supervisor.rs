use crate::config::{InvalidCronPolicy, ManagedProcessConfig};
use crate::error::{Result, VigilError};
use crate::events::{EventEmitter, EventKind, GiveUpReason, SupervisorEvent};
use crate::process::clock::{Clock, SystemClock};
use crate::process::handle::{
    ExitFuture, ExitStatus, NixSignals, ProcessHandle, ProcessLauncher, SignalSender,
};
use crate::process::monitor::{MemorySampler, ResourceMonitor, SysinfoSampler};
use crate::process::restart::{RestartDecision, RestartPolicy, RestartState};
use crate::process::schedule::ScheduleTrigger;
use crate::process::spawner::OsLauncher;
use chrono::{DateTime, Local, Utc};
use nix::sys::signal::Signal;
use serde::Serialize;
use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How often the cron schedule is checked against the clock
const SCHEDULE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long to wait for the exit after SIGKILL before giving up on a process
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a supervised app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SupervisorState {
    /// Not running and not scheduled to run
    Idle,
    Starting,
    Running,
    /// Stop signal sent, waiting for the process to exit
    Stopping,
    Exited,
    /// Waiting out the restart delay
    Restarting,
    /// Terminal until started again
    GivenUp,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Exited => "exited",
            SupervisorState::Restarting => "restarting",
            SupervisorState::GivenUp => "given-up",
        };
        write!(f, "{}", name)
    }
}

/// Snapshot of a supervisor, republished on every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart: RestartState,
    /// Most recent resident memory sample in bytes
    pub memory_usage: Option<u64>,
}

/// The OS-facing services a supervisor runs against
#[derive(Clone)]
pub struct Backend {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub signals: Arc<dyn SignalSender>,
    pub sampler: Arc<dyn MemorySampler>,
    pub clock: Arc<dyn Clock>,
}

impl Backend {
    /// Real processes, real signals, real clock
    pub fn os() -> Self {
        Self {
            launcher: Arc::new(OsLauncher),
            signals: Arc::new(NixSignals),
            sampler: Arc::new(SysinfoSampler::new()),
            clock: Arc::new(SystemClock),
        }
    }
}

enum Command {
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<Result<()>>),
}

/// Handle to one supervised app
///
/// The supervision itself runs in a background task; this handle sends it
/// commands and reads its published status. Dropping the handle ends the
/// task, which kills the child if one is still running.
pub struct Supervisor {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SupervisorStatus>,
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Create the supervisor task for `config`, initially Idle
    ///
    /// Fails when the cron expression is invalid and the app's policy is
    /// `abort`.
    pub fn spawn(
        config: ManagedProcessConfig,
        backend: Backend,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<Self> {
        let schedule = build_trigger(&config, backend.clock.as_ref())?;
        let name = config.name.clone();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SupervisorStatus {
            state: SupervisorState::Idle,
            pid: None,
            started_at: None,
            restart: RestartState::new(),
            memory_usage: None,
        });

        let monitor = ResourceMonitor::new(
            config.memory_ceiling,
            config.memory_check_interval,
            backend.sampler.clone(),
        );
        let mut memory_tick = interval(monitor.interval());
        memory_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let core = SupervisorCore {
            policy: RestartPolicy::from_config(&config),
            restart: RestartState::new(),
            monitor,
            memory_tick,
            schedule,
            events: EventEmitter::new(name.clone(), events, backend.clock.clone()),
            status: status_tx,
            state: SupervisorState::Idle,
            handle: None,
            exit: None,
            timer: None,
            stable_at: None,
            stopping: None,
            stop_waiters: Vec::new(),
            config,
            backend,
        };

        debug!("Supervisor for app '{}' created", name);
        let task = tokio::spawn(core.run(command_rx));

        Ok(Self {
            name,
            commands: command_tx,
            status: status_rx,
            task,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the app; resolves with the outcome of the first spawn attempt
    pub async fn start(&self) -> Result<()> {
        self.request(Command::Start).await
    }

    /// Stop the app and resolve once it has exited
    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change
    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    /// Stop the app and wait for the supervisor task to finish
    pub async fn shutdown(self) -> Result<()> {
        let result = self.stop().await;
        drop(self.commands);
        if let Err(e) = self.task.await {
            error!("Supervisor task for app '{}' failed: {}", self.name, e);
        }
        result
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .map_err(|_| VigilError::SupervisorClosed(self.name.clone()))?;
        reply_rx
            .await
            .map_err(|_| VigilError::SupervisorClosed(self.name.clone()))?
    }
}

/// Parse the app's cron expression, applying its invalid-expression policy
fn build_trigger(
    config: &ManagedProcessConfig,
    clock: &dyn Clock,
) -> Result<Option<ScheduleTrigger<Local>>> {
    let Some(ref expression) = config.cron_restart else {
        return Ok(None);
    };

    let now = clock.now().with_timezone(&Local);
    match ScheduleTrigger::new(expression, &now) {
        Ok(trigger) => {
            debug!(
                "App '{}' scheduled for restart at {:?}",
                config.name,
                trigger.next_fire()
            );
            Ok(Some(trigger))
        }
        Err(e) => match config.on_invalid_cron {
            InvalidCronPolicy::Abort => Err(e),
            InvalidCronPolicy::Ignore => {
                warn!(
                    "Ignoring cron_restart for app '{}': {}",
                    config.name, e
                );
                Ok(None)
            }
        },
    }
}

/// Pending deadline of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    RestartDue,
    GraceExpired,
    KillExpired,
}

/// What happens once a process being stopped has exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopIntent {
    Halt,
    /// Forced restart: respawn right away without restart evaluation
    Restart,
}

struct SupervisorCore {
    config: ManagedProcessConfig,
    backend: Backend,
    policy: RestartPolicy,
    restart: RestartState,
    monitor: ResourceMonitor,
    memory_tick: Interval,
    schedule: Option<ScheduleTrigger<Local>>,
    events: EventEmitter,
    status: watch::Sender<SupervisorStatus>,
    state: SupervisorState,
    handle: Option<ProcessHandle>,
    exit: Option<ExitFuture>,
    timer: Option<(Instant, Timer)>,
    /// Deadline after which the current run counts as stable
    stable_at: Option<Instant>,
    stopping: Option<StopIntent>,
    stop_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl SupervisorCore {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut schedule_tick = interval(SCHEDULE_POLL_INTERVAL);
        schedule_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let has_schedule = self.schedule.is_some();

        loop {
            let timer_at = self.timer.map(|(at, _)| at);
            let monitoring = self.state == SupervisorState::Running;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                status = wait_exit(&mut self.exit) => self.handle_exit(status),
                _ = sleep_until_opt(timer_at) => self.fire_timer(),
                _ = sleep_until_opt(self.stable_at) => self.mark_stable(),
                _ = self.memory_tick.tick(), if monitoring => self.check_memory(),
                _ = schedule_tick.tick(), if has_schedule => self.poll_schedule(),
            }
        }

        if let Some(handle) = self.handle.take() {
            // Dropping the exit future kills the child
            debug!(
                "Supervisor for app '{}' closing, killing PID {}",
                self.config.name,
                handle.pid()
            );
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start());
            }
            Command::Stop(reply) => self.stop(reply),
        }
    }

    fn start(&mut self) -> Result<()> {
        match self.state {
            SupervisorState::Idle | SupervisorState::GivenUp => {
                info!("Starting app '{}'", self.config.name);
                // A manual start never inherits the previous restart history
                self.restart = RestartState::new();
                self.spawn_process()
            }
            state => Err(VigilError::InvalidState(
                self.config.name.clone(),
                format!("cannot start while {}", state),
            )),
        }
    }

    fn stop(&mut self, reply: oneshot::Sender<Result<()>>) {
        match self.state {
            SupervisorState::Running => {
                info!("Stopping app '{}'", self.config.name);
                self.stop_waiters.push(reply);
                self.begin_stop(StopIntent::Halt);
            }
            SupervisorState::Stopping => {
                self.stop_waiters.push(reply);
                if self.stopping == Some(StopIntent::Restart) {
                    self.stopping = Some(StopIntent::Halt);
                    if matches!(self.timer, Some((_, Timer::GraceExpired))) {
                        self.escalate_kill();
                    }
                }
            }
            SupervisorState::Restarting => {
                info!(
                    "Stopping app '{}', pending restart cancelled",
                    self.config.name
                );
                self.timer = None;
                self.set_state(SupervisorState::Idle);
                self.events.emit(EventKind::Stopped);
                let _ = reply.send(Ok(()));
            }
            SupervisorState::Idle | SupervisorState::GivenUp => {
                let _ = reply.send(Ok(()));
            }
            state @ (SupervisorState::Starting | SupervisorState::Exited) => {
                let _ = reply.send(Err(VigilError::InvalidState(
                    self.config.name.clone(),
                    format!("cannot stop while {}", state),
                )));
            }
        }
    }

    /// Spawn a new process; a failed spawn counts as an immediate exit
    fn spawn_process(&mut self) -> Result<()> {
        self.set_state(SupervisorState::Starting);

        match self.backend.launcher.spawn(&self.config) {
            Ok(spawned) => {
                let pid = spawned.pid;
                self.handle = Some(ProcessHandle::new(pid, self.backend.clock.now()));
                self.exit = Some(spawned.exit);
                self.stable_at = Some(Instant::now() + self.config.stability_window);
                self.monitor.rearm();
                self.memory_tick.reset();

                info!("App '{}' started (PID: {})", self.config.name, pid);
                self.set_state(SupervisorState::Running);
                self.events.emit(EventKind::Started { pid });
                Ok(())
            }
            Err(e) => {
                error!("Failed to start app '{}': {}", self.config.name, e);
                self.on_exit(ExitStatus::SPAWN_FAILED);
                Err(e)
            }
        }
    }

    fn handle_exit(&mut self, status: ExitStatus) {
        self.exit = None;
        self.stable_at = None;
        let handle = self.handle.take();

        match self.stopping.take() {
            Some(intent) => {
                self.timer = None;
                self.record_exit(status);
                match intent {
                    StopIntent::Restart => {
                        info!("Restarting app '{}' immediately", self.config.name);
                        // Spawn failures feed back into restart evaluation
                        let _ = self.spawn_process();
                    }
                    StopIntent::Halt => {
                        info!("App '{}' stopped", self.config.name);
                        self.set_state(SupervisorState::Idle);
                        self.events.emit(EventKind::Stopped);
                        for waiter in self.stop_waiters.drain(..) {
                            let _ = waiter.send(Ok(()));
                        }
                    }
                }
            }
            None => {
                if let Some(handle) = handle {
                    warn!(
                        "App '{}' (PID: {}) exited with {} after {:?}",
                        self.config.name,
                        handle.pid(),
                        status,
                        handle.uptime(self.backend.clock.now())
                    );
                }
                self.on_exit(status);
            }
        }
    }

    fn on_exit(&mut self, status: ExitStatus) {
        self.record_exit(status);

        if self.config.autorestart {
            self.evaluate_restart();
        } else {
            info!(
                "App '{}' has autorestart disabled, not restarting",
                self.config.name
            );
            self.set_state(SupervisorState::Idle);
        }
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.restart.record_exit(status, self.backend.clock.now());
        self.set_state(SupervisorState::Exited);
        self.events.emit(EventKind::Exited { status });
    }

    fn evaluate_restart(&mut self) {
        match self.policy.evaluate(&mut self.restart) {
            RestartDecision::RestartAfter(delay) => {
                let attempt = self.restart.consecutive_restarts;
                info!(
                    "Restarting app '{}' in {:?} (attempt {})",
                    self.config.name, delay, attempt
                );
                self.timer = Some((Instant::now() + delay, Timer::RestartDue));
                self.set_state(SupervisorState::Restarting);
                self.events.emit(EventKind::Restarting { delay, attempt });
            }
            RestartDecision::GiveUp => {
                let limit = self.policy.max_restarts.unwrap_or_default();
                error!(
                    "{}",
                    VigilError::MaxRestartsExceeded(self.config.name.clone(), limit)
                );
                self.set_state(SupervisorState::GivenUp);
                self.events.emit(EventKind::GaveUp {
                    reason: GiveUpReason::MaxRestartsExceeded,
                });
            }
        }
    }

    fn fire_timer(&mut self) {
        let Some((_, timer)) = self.timer.take() else {
            return;
        };

        match timer {
            Timer::RestartDue => {
                let _ = self.spawn_process();
            }
            Timer::GraceExpired => self.escalate_kill(),
            Timer::KillExpired => self.declare_unresponsive(),
        }
    }

    /// Send the stop signal and arm the grace period
    fn begin_stop(&mut self, intent: StopIntent) {
        let Some(pid) = self.handle.as_ref().map(ProcessHandle::pid) else {
            return;
        };

        self.stopping = Some(intent);
        self.stable_at = None;
        self.set_state(SupervisorState::Stopping);

        debug!(
            "Sending {} to app '{}' (PID: {})",
            self.config.stop_signal, self.config.name, pid
        );
        match self.backend.signals.send(pid, self.config.stop_signal) {
            Ok(()) => {
                self.timer = Some((
                    Instant::now() + self.config.grace_period,
                    Timer::GraceExpired,
                ));
            }
            Err(e) => {
                warn!("{}", e);
                self.escalate_kill();
            }
        }
    }

    fn escalate_kill(&mut self) {
        let Some(pid) = self.handle.as_ref().map(ProcessHandle::pid) else {
            return;
        };

        warn!(
            "App '{}' (PID: {}) did not exit in time, sending SIGKILL",
            self.config.name, pid
        );
        if let Err(e) = self.backend.signals.send(pid, Signal::SIGKILL) {
            error!("{}", e);
        }
        self.timer = Some((Instant::now() + KILL_CONFIRM_TIMEOUT, Timer::KillExpired));
    }

    fn declare_unresponsive(&mut self) {
        let pid = self.handle.take().map(|handle| handle.pid());
        error!(
            "App '{}' (PID: {:?}) still running {:?} after SIGKILL, giving up",
            self.config.name, pid, KILL_CONFIRM_TIMEOUT
        );

        self.exit = None;
        self.stopping = None;
        self.set_state(SupervisorState::GivenUp);
        self.events.emit(EventKind::GaveUp {
            reason: GiveUpReason::UnresponsiveProcess,
        });
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(Err(VigilError::UnresponsiveProcess(
                self.config.name.clone(),
            )));
        }
    }

    fn check_memory(&mut self) {
        let Some(pid) = self.handle.as_ref().map(ProcessHandle::pid) else {
            return;
        };

        if let Some(bytes) = self.monitor.check(pid) {
            let ceiling = self.monitor.ceiling().unwrap_or_default();
            warn!(
                "App '{}' (PID: {}) uses {} bytes, above its limit of {} bytes",
                self.config.name, pid, bytes, ceiling
            );
            self.events
                .emit(EventKind::MemoryLimitExceeded { bytes, ceiling });
            self.begin_stop(StopIntent::Restart);
        }
        self.publish();
    }

    fn poll_schedule(&mut self) {
        let now = self.backend.clock.now().with_timezone(&Local);
        let Some(ref mut trigger) = self.schedule else {
            return;
        };
        if !trigger.poll_due(&now) {
            return;
        }

        if self.state != SupervisorState::Running {
            debug!(
                "Scheduled restart of app '{}' skipped while {}",
                self.config.name, self.state
            );
            return;
        }

        info!(
            "Scheduled restart of app '{}' ({})",
            self.config.name,
            trigger.expression()
        );
        self.events.emit(EventKind::ScheduledRestart);
        self.begin_stop(StopIntent::Restart);
    }

    fn mark_stable(&mut self) {
        self.stable_at = None;
        if self.restart.consecutive_restarts > 0 {
            info!(
                "App '{}' stable for {:?}, resetting restart counter",
                self.config.name, self.config.stability_window
            );
        }
        self.restart.reset();
        self.publish();
    }

    fn set_state(&mut self, state: SupervisorState) {
        if self.state != state {
            debug!("App '{}': {} -> {}", self.config.name, self.state, state);
        }
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(SupervisorStatus {
            state: self.state,
            pid: self.handle.as_ref().map(ProcessHandle::pid),
            started_at: self.handle.as_ref().map(ProcessHandle::started_at),
            restart: self.restart.clone(),
            memory_usage: self.monitor.last_sample(),
        });
    }
}

async fn wait_exit(exit: &mut Option<ExitFuture>) -> ExitStatus {
    match exit {
        Some(exit) => exit.await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
