//! Error types for tunebridge-core
//!
//! Propagation policy: adapter and matcher failures are recovered where the
//! unit of work is a single track/platform; only failures that prevent
//! enumerating a playlist (or persisting its result) fail a task.

use thiserror::Error;
use tunebridge_common::{ErrorKind, Platform, TaskStatus};
use uuid::Uuid;

use crate::adapters::AdapterError;
use crate::link_parser::LinkParseError;

/// Conversion engine / task tracker error
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Link could not be parsed (never retried)
    #[error(transparent)]
    LinkParse(#[from] LinkParseError),

    /// A platform adapter call failed after retries
    #[error("{platform} adapter failed: {source}")]
    Adapter {
        platform: Platform,
        #[source]
        source: AdapterError,
    },

    /// Request cannot be served (wrong entity kind, no target platforms, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unrecoverable pipeline failure (task is marked failed)
    #[error("Task failed: {0}")]
    TaskFatal(String),

    /// Programming defect, e.g. events emitted out of order
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// Task state machine refused the transition
    #[error("Task {task_id} cannot move from {from} to {to}")]
    TransitionRejected {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Task store error
    #[error("Store error: {0}")]
    Store(#[from] tunebridge_common::Error),
}

impl ConvertError {
    /// Machine-readable kind persisted with failed tasks
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::LinkParse(_) | ConvertError::InvalidRequest(_) => ErrorKind::LinkParse,
            ConvertError::Adapter { .. } => ErrorKind::Adapter,
            ConvertError::TaskFatal(_) | ConvertError::Store(_) | ConvertError::TaskNotFound(_) => {
                ErrorKind::TaskFatal
            }
            ConvertError::Invariant(_) | ConvertError::TransitionRejected { .. } => {
                ErrorKind::Invariant
            }
        }
    }

    pub fn adapter(platform: Platform, source: AdapterError) -> Self {
        ConvertError::Adapter { platform, source }
    }
}

pub type ConvertResult<T> = Result<T, ConvertError>;
