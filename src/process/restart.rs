use crate::config::ManagedProcessConfig;
use crate::process::handle::ExitStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of a restart evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Spawn again once the delay has elapsed
    RestartAfter(Duration),
    /// Stop supervising; the restart budget is spent
    GiveUp,
}

/// Backoff strategy for restart delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Fixed delay between restarts
    Fixed,
    /// Exponential backoff with maximum delay
    Exponential { max_delay: Duration },
}

impl BackoffStrategy {
    /// Calculate the delay for a given restart attempt
    pub fn calculate_delay(&self, base: Duration, restart_count: usize) -> Duration {
        match self {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential { max_delay } => {
                // delay = base * 2^restart_count, capped
                let exponent = u32::try_from(restart_count).unwrap_or(u32::MAX);
                let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
                let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
                Duration::from_millis(delay_ms).min(*max_delay)
            }
        }
    }
}

/// Mutable restart bookkeeping owned by a supervisor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartState {
    /// Restarts since the last stable run
    pub consecutive_restarts: usize,
    /// Delay chosen by the most recent decision
    pub current_delay: Duration,
    pub last_exit_at: Option<DateTime<Utc>>,
    pub last_exit_status: Option<ExitStatus>,
}

impl RestartState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exit(&mut self, status: ExitStatus, at: DateTime<Utc>) {
        self.last_exit_status = Some(status);
        self.last_exit_at = Some(at);
    }

    /// Zero the counters after a stable run; exit history is kept
    pub fn reset(&mut self) {
        self.consecutive_restarts = 0;
        self.current_delay = Duration::ZERO;
    }
}

/// Restart policy derived from an app's configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Delay before the first restart
    pub base_delay: Duration,
    pub backoff_strategy: BackoffStrategy,
    /// Consecutive restarts allowed before giving up
    pub max_restarts: Option<usize>,
}

impl RestartPolicy {
    pub fn from_config(config: &ManagedProcessConfig) -> Self {
        let backoff_strategy = if config.exponential_backoff {
            BackoffStrategy::Exponential {
                max_delay: config.max_backoff_delay,
            }
        } else {
            BackoffStrategy::Fixed
        };

        Self {
            base_delay: config.restart_delay,
            backoff_strategy,
            max_restarts: config.max_restarts,
        }
    }

    /// Decide what to do after a failure, without touching the state
    pub fn decide(&self, state: &RestartState) -> RestartDecision {
        if let Some(max) = self.max_restarts {
            if state.consecutive_restarts >= max {
                return RestartDecision::GiveUp;
            }
        }

        RestartDecision::RestartAfter(
            self.backoff_strategy
                .calculate_delay(self.base_delay, state.consecutive_restarts),
        )
    }

    /// Decide and account for the restart in `state`
    pub fn evaluate(&self, state: &mut RestartState) -> RestartDecision {
        let decision = self.decide(state);
        if let RestartDecision::RestartAfter(delay) = decision {
            state.consecutive_restarts += 1;
            state.current_delay = delay;
        }
        decision
    }
}
