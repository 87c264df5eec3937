//! Conversion task lifecycle types
//!
//! Task status progresses: PENDING → PROCESSING → COMPLETED | FAILED | CANCELLED,
//! with FAILED → PROCESSING allowed for bounded retries. CANCELLED is final.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::platform::Platform;
use crate::Error;

/// Task workflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, pipeline not yet started
    Pending,
    /// Pipeline running
    Processing,
    /// Finished, result persisted
    Completed,
    /// Pipeline could not run to completion
    Failed,
    /// Stopped on request between tracks
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the state machine permits moving from `self` to `next`
    ///
    /// Retry bounds for FAILED → PROCESSING are enforced by the
    /// task tracker, not here.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Failed, Processing)
        )
    }

    /// Whether no pipeline is running for the task
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether a resubmission may restart the task
    pub fn is_retryable(&self) -> bool {
        *self == TaskStatus::Failed
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("Unknown task status: {}", other))),
        }
    }
}

/// Machine-readable error kind carried by failed tasks and error events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unsupported host or malformed link
    LinkParse,
    /// Platform outage, missing credentials or rate limiting
    Adapter,
    /// Source playlist could not be enumerated or the store is unavailable
    TaskFatal,
    /// Internal ordering or state invariant was violated
    Invariant,
    /// Conversion was cancelled on request
    Cancelled,
}

/// Summary reported when a playlist conversion completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneSummary {
    /// Idempotency checksum, also the key of the persisted conversion
    pub checksum: String,
    /// Number of source tracks processed
    pub track_count: usize,
    /// Matched track count per target platform
    pub matched: BTreeMap<Platform, usize>,
    /// Number of omission records (one per unmatched track per platform)
    pub omitted: usize,
    pub short_url: Option<String>,
}

/// Failure reason persisted with a failed task and sent in error events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub reason: String,
}

/// Result blob stored with a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum TaskOutcome {
    Completed(DoneSummary),
    Failed(TaskFailure),
    Cancelled {
        processed: usize,
        total: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Processing));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Processing));
        assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Processing));
        assert!(!TaskStatus::Cancelled.is_retryable());
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let outcome = TaskOutcome::Failed(TaskFailure {
            kind: ErrorKind::TaskFatal,
            reason: "playlist not found".to_string(),
        });
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["kind"], "task_fatal");
    }
}
