use crate::process::clock::Clock;
use crate::process::ExitStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default capacity of the event channel handed to supervisors
pub const EVENT_BUFFER: usize = 256;

/// A lifecycle event of one managed app
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorEvent {
    pub app: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    Started { pid: u32 },
    Exited { status: ExitStatus },
    Restarting { delay: Duration, attempt: usize },
    MemoryLimitExceeded { bytes: u64, ceiling: u64 },
    ScheduledRestart,
    /// An external stop request completed
    Stopped,
    GaveUp { reason: GiveUpReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpReason {
    MaxRestartsExceeded,
    UnresponsiveProcess,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Started { pid } => write!(f, "started (PID: {})", pid),
            EventKind::Exited { status } => write!(f, "exited with {}", status),
            EventKind::Restarting { delay, attempt } => {
                write!(f, "restarting in {:?} (attempt {})", delay, attempt)
            }
            EventKind::MemoryLimitExceeded { bytes, ceiling } => write!(
                f,
                "memory limit exceeded: {} bytes (limit: {} bytes)",
                bytes, ceiling
            ),
            EventKind::ScheduledRestart => write!(f, "scheduled restart"),
            EventKind::Stopped => write!(f, "stopped"),
            EventKind::GaveUp { reason } => match reason {
                GiveUpReason::MaxRestartsExceeded => write!(f, "gave up: restart limit reached"),
                GiveUpReason::UnresponsiveProcess => write!(f, "gave up: process unresponsive"),
            },
        }
    }
}

/// Stamps and sends events for one app without ever blocking
#[derive(Clone)]
pub struct EventEmitter {
    app: String,
    tx: mpsc::Sender<SupervisorEvent>,
    clock: Arc<dyn Clock>,
}

impl EventEmitter {
    pub fn new(app: impl Into<String>, tx: mpsc::Sender<SupervisorEvent>, clock: Arc<dyn Clock>) -> Self {
        Self {
            app: app.into(),
            tx,
            clock,
        }
    }

    pub fn emit(&self, kind: EventKind) {
        let event = SupervisorEvent {
            app: self.app.clone(),
            timestamp: self.clock.now(),
            kind,
        };

        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(
                    "Event buffer full, dropping '{}' event for app '{}'",
                    event.kind, event.app
                );
            }
            Err(TrySendError::Closed(event)) => {
                debug!("No event consumer, dropping '{}' for '{}'", event.kind, event.app);
            }
        }
    }
}

/// Drain `events` into the tracing log until every sender is gone
pub fn spawn_event_logger(mut events: mpsc::Receiver<SupervisorEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event.kind {
                EventKind::GaveUp { .. } => error!(app = %event.app, "{}", event.kind),
                EventKind::MemoryLimitExceeded { .. } => warn!(app = %event.app, "{}", event.kind),
                EventKind::Exited { status } if !status.success() => {
                    warn!(app = %event.app, "{}", event.kind)
                }
                _ => info!(app = %event.app, "{}", event.kind),
            }
        }
    })
}
