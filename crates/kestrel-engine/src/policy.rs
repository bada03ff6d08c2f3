//! Seed-ratio governance rules evaluated on every worker tick.
//!
//! Evaluation is pure; the worker dispatches the returned action on a
//! detached task so the stop/delete path can take the task lock itself.

use chrono::{DateTime, Utc};
use kestrel_config::EngineConfig;

/// Fields of a task the policy looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Standing {
    /// Upload ratio reported by the protocol engine.
    pub ratio: f64,
    /// Whether the task is transferring.
    pub started: bool,
    /// Whether the last start was explicit.
    pub manual_started: bool,
    /// Whether every byte has been transferred.
    pub done: bool,
    /// When the task was last stopped.
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Action requested by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Stop a finished task that exceeded the seed ratio.
    Stop,
    /// Delete a finished, stopped task whose grace period elapsed.
    Delete,
}

impl PolicyAction {
    /// Metric and event label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "auto_stop",
            Self::Delete => "auto_delete",
        }
    }
}

/// Decide whether a task should be stopped or deleted.
#[must_use]
pub fn evaluate(task: &Standing, config: &EngineConfig, now: DateTime<Utc>) -> Option<PolicyAction> {
    let threshold = config.seed_ratio_threshold()?;

    if task.done && task.started && !task.manual_started && task.ratio > threshold {
        return Some(PolicyAction::Stop);
    }

    let grace = config.stale_removal()?;
    if task.done && !task.started && task.ratio >= threshold {
        let stopped_at = task.stopped_at?;
        let elapsed = now.signed_duration_since(stopped_at).to_std().ok()?;
        if elapsed > grace {
            return Some(PolicyAction::Delete);
        }
    }
    None
}
