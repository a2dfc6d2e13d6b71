//! Failure classification and restart policy.
//!
//! A failed or killed worker is either restarted after an exponential
//! backoff or escalated. Retryable failures get at most `max_retries`
//! restarts per task; exhausting them blocks the task. Permanent failures
//! are never restarted.

use crate::core::{BlockReason, TaskId};
use crate::Error;
use chrono::{DateTime, Utc};
use regex::RegexSet;
use std::collections::HashMap;
use std::time::Duration;

/// `min(2^attempt, cap)` seconds. Non-decreasing in `attempt` and never above `cap`.
pub fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let secs = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(cap)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    Permanent,
}

/// Classifies failures reported as text by external workers.
///
/// Crate errors carry their own classification through
/// [`Error::is_retryable`]; free-form reports are matched against known
/// transient patterns and default to permanent.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    transient: RegexSet,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new(&[
            r"(?i)rate.?limit",
            r"(?i)too many requests",
            r"(?i)timed? ?out",
            r"(?i)connection (refused|reset)",
            r"(?i)temporar(y|ily)",
            r"(?i)try again",
            r"(?i)exited with (code|signal)",
        ])
        .unwrap_or_else(|_| Self {
            transient: RegexSet::empty(),
        })
    }
}

impl FailureClassifier {
    pub fn new(patterns: &[&str]) -> crate::Result<Self> {
        Ok(Self {
            transient: RegexSet::new(patterns)?,
        })
    }

    pub fn classify(&self, error: &Error) -> FailureClass {
        if error.is_retryable() {
            FailureClass::Retryable
        } else {
            FailureClass::Permanent
        }
    }

    pub fn classify_report(&self, message: &str) -> FailureClass {
        if self.transient.is_match(message) {
            FailureClass::Retryable
        } else {
            FailureClass::Permanent
        }
    }
}

/// Tracks restart counts per task.
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    retries: HashMap<TaskId, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restarts performed so far; 0 for unknown tasks.
    pub fn get_retries(&self, task_id: &TaskId) -> u32 {
        self.retries.get(task_id).copied().unwrap_or(0)
    }

    /// Returns the new count.
    pub fn increment(&mut self, task_id: &TaskId) -> u32 {
        let count = self.retries.entry(task_id.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset(&mut self, task_id: &TaskId) {
        self.retries.remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.retries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retries.is_empty()
    }
}

/// What to do with a task whose worker failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDecision {
    /// Restart after `delay`; `attempt` is 1-based.
    Restart {
        attempt: u32,
        delay: Duration,
        due: DateTime<Utc>,
    },
    /// Budget exhausted: block the task and escalate.
    Block(BlockReason),
    /// Permanent failure: fail the task and escalate.
    Fail(String),
}

impl RecoveryDecision {
    pub fn is_escalation(&self) -> bool {
        !matches!(self, RecoveryDecision::Restart { .. })
    }
}

/// Decide the next step for a failure, recording the restart if one is granted.
pub fn decide(
    tracker: &mut RetryTracker,
    task_id: &TaskId,
    class: FailureClass,
    error: &str,
    max_retries: u32,
    backoff_cap: Duration,
    now: DateTime<Utc>,
) -> RecoveryDecision {
    match class {
        FailureClass::Permanent => RecoveryDecision::Fail(error.to_string()),
        FailureClass::Retryable => {
            let done = tracker.get_retries(task_id);
            if done >= max_retries {
                return RecoveryDecision::Block(BlockReason::RetriesExhausted {
                    attempts: done,
                    last_error: error.to_string(),
                });
            }
            let delay = backoff_delay(done, backoff_cap);
            let attempt = tracker.increment(task_id);
            RecoveryDecision::Restart {
                attempt,
                delay,
                due: crate::util::add_duration(now, delay),
            }
        }
    }
}
