//! Drives one long-running provider action to a terminal state.
//!
//! The loop queries immediately, then sleeps a fixed interval between
//! queries. Time is read through [`Clock`] so tests can simulate hours of
//! polling without waiting.

use std::time::{Duration, Instant};

use crate::api::{Action, ActionStatus, BackupApi};
use crate::error::Result;

pub trait Clock {
    /// Monotonic time since an arbitrary origin.
    fn now(&self) -> Duration;
    fn sleep(&self, d: Duration);
}

pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed,
    Errored,
    TimedOut,
    /// Any status other than `in-progress` that is not terminal.
    Unexpected(String),
}

impl PollOutcome {
    pub fn label(&self) -> &str {
        match self {
            PollOutcome::Completed => "completed",
            PollOutcome::Errored => "errored",
            PollOutcome::TimedOut => "timeout",
            PollOutcome::Unexpected(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub outcome: PollOutcome,
    pub elapsed: Duration,
    pub last_status: ActionStatus,
    pub last_detail: Option<String>,
    pub polls: u32,
}

impl PollResult {
    pub fn is_success(&self) -> bool {
        self.outcome == PollOutcome::Completed
    }
}

/// Decide what a freshly observed status means. `None` keeps polling.
pub fn evaluate(status: &ActionStatus, elapsed: Duration, timeout: Duration) -> Option<PollOutcome> {
    match status {
        ActionStatus::Completed => Some(PollOutcome::Completed),
        ActionStatus::Errored => Some(PollOutcome::Errored),
        _ if elapsed > timeout => Some(PollOutcome::TimedOut),
        ActionStatus::InProgress => None,
        ActionStatus::Other(s) => Some(PollOutcome::Unexpected(s.clone())),
    }
}

/// Poll `action_id` until it completes, errors, reports an unexpected
/// status, or `config.timeout` has elapsed.
///
/// Terminal failures are returned as a normal [`PollResult`]; only a failed
/// status query is an `Err`. `observer` sees every status but cannot change
/// the decision.
pub fn poll_action(
    api: &dyn BackupApi,
    action_id: u64,
    config: PollConfig,
    clock: &dyn Clock,
    observer: &mut dyn FnMut(&Action),
) -> Result<PollResult> {
    let start = clock.now();
    let mut polls = 0u32;
    loop {
        let action = api.action(action_id)?;
        polls = polls.saturating_add(1);
        observer(&action);

        let elapsed = clock.now().saturating_sub(start);
        if let Some(outcome) = evaluate(&action.status, elapsed, config.timeout) {
            tracing::debug!(
                action_id,
                polls,
                outcome = outcome.label(),
                elapsed_secs = elapsed.as_secs(),
                "poll finished"
            );
            return Ok(PollResult {
                outcome,
                elapsed,
                last_status: action.status,
                last_detail: action.progress.current_step_detail,
                polls,
            });
        }
        clock.sleep(config.interval);
    }
}
