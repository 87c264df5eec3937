//! Durable conversion task record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tunebridge_common::{EntityKind, Platform, TaskOutcome, TaskStatus};
use uuid::Uuid;

/// Durable projection of one asynchronous conversion
///
/// `status` and `retry_count` are only ever written by the task tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Idempotency key; unique across tasks
    pub checksum: String,
    pub source_platform: Platform,
    pub entity_id: String,
    pub kind: EntityKind,
    pub targets: Vec<Platform>,
    pub status: TaskStatus,
    pub outcome: Option<TaskOutcome>,
    pub retry_count: u32,
    pub app_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// New pending task
    pub fn new(
        checksum: String,
        source_platform: Platform,
        entity_id: impl Into<String>,
        kind: EntityKind,
        targets: Vec<Platform>,
        app_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            checksum,
            source_platform,
            entity_id: entity_id.into(),
            kind,
            targets,
            status: TaskStatus::Pending,
            outcome: None,
            retry_count: 0,
            app_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Idempotency checksum of a conversion request
///
/// Hex SHA-256 over source platform, source entity ID, the target platform
/// set (order and duplicates ignored) and the owning app.
pub fn conversion_checksum(
    source_platform: Platform,
    entity_id: &str,
    targets: &[Platform],
    app_id: Option<&str>,
) -> String {
    let mut targets = targets.to_vec();
    targets.sort();
    targets.dedup();
    let targets = targets
        .iter()
        .map(Platform::as_str)
        .collect::<Vec<_>>()
        .join(",");

    let mut hasher = Sha256::new();
    hasher.update(source_platform.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(entity_id.as_bytes());
    hasher.update(b"|");
    hasher.update(targets.as_bytes());
    hasher.update(b"|");
    hasher.update(app_id.unwrap_or("").as_bytes());
    format!("{:x}", hasher.finalize())
}
