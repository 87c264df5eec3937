//! SQLite task store
//!
//! Create-once uses `INSERT ... ON CONFLICT(checksum) DO NOTHING`; CAS is a
//! conditional `UPDATE` whose row count tells whether the swap happened.
//! Timestamps are stored as RFC 3339 text, which round-trips exactly, so
//! `updated_at` can take part in the CAS condition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tunebridge_common::{EntityKind, Error, Platform, Result, TaskOutcome, TaskStatus};
use uuid::Uuid;

use super::store::TaskStore;
use crate::models::{PlaylistConversion, Task};
use crate::utils::retry_on_lock;

const TASK_COLUMNS: &str = "id, checksum, source_platform, entity_id, kind, targets, status, \
                            outcome, retry_count, app_id, created_at, updated_at";

/// Task store over a SQLite pool
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl SqliteTaskStore {
    /// Store over an initialized pool (see [`super::init_database_pool`])
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            max_lock_wait_ms,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_timestamp(value: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let id: String = row.get("id");
    let id = Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("Invalid task id {}: {}", id, e)))?;

    let source_platform: String = row.get("source_platform");
    let kind: String = row.get("kind");
    let status: String = row.get("status");

    let targets: String = row.get("targets");
    let targets: Vec<Platform> = serde_json::from_str(&targets)?;

    let outcome: Option<String> = row.get("outcome");
    let outcome: Option<TaskOutcome> = outcome.map(|o| serde_json::from_str(&o)).transpose()?;

    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Task {
        id,
        checksum: row.get("checksum"),
        source_platform: Platform::from_str(&source_platform)?,
        entity_id: row.get("entity_id"),
        kind: EntityKind::from_str(&kind)?,
        targets,
        status: TaskStatus::from_str(&status)?,
        outcome,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        app_id: row.get("app_id"),
        created_at: parse_timestamp(&created_at, "created_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_if_absent(&self, task: Task) -> Result<(Task, bool)> {
        let id = task.id.to_string();
        let targets = serde_json::to_string(&task.targets)?;
        let outcome = task.outcome.as_ref().map(serde_json::to_string).transpose()?;
        let created_at = task.created_at.to_rfc3339();
        let updated_at = task.updated_at.to_rfc3339();

        let inserted = retry_on_lock("insert_task", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                INSERT INTO tasks (
                    id, checksum, source_platform, entity_id, kind, targets,
                    status, outcome, retry_count, app_id, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(checksum) DO NOTHING
                "#,
            )
            .bind(&id)
            .bind(&task.checksum)
            .bind(task.source_platform.as_str())
            .bind(&task.entity_id)
            .bind(task.kind.as_str())
            .bind(&targets)
            .bind(task.status.as_str())
            .bind(&outcome)
            .bind(task.retry_count as i64)
            .bind(&task.app_id)
            .bind(&created_at)
            .bind(&updated_at)
            .execute(&self.pool)
            .await?;

            Ok::<_, Error>(result.rows_affected() == 1)
        })
        .await?;

        if inserted {
            return Ok((task, true));
        }

        let existing = self
            .get_by_checksum(&task.checksum)
            .await?
            .ok_or_else(|| Error::Internal(format!("task for checksum {} vanished after conflict", task.checksum)))?;
        Ok((existing, false))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn get_by_checksum(&self, checksum: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE checksum = ?", TASK_COLUMNS))
            .bind(checksum)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn compare_and_swap(&self, expected: &Task, updated: &Task) -> Result<bool> {
        let id = updated.id.to_string();
        let outcome = updated.outcome.as_ref().map(serde_json::to_string).transpose()?;
        let updated_at = updated.updated_at.to_rfc3339();
        let expected_updated_at = expected.updated_at.to_rfc3339();

        let swapped = retry_on_lock("update_task", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE tasks
                SET status = ?, outcome = ?, retry_count = ?, updated_at = ?
                WHERE id = ? AND status = ? AND retry_count = ? AND updated_at = ?
                "#,
            )
            .bind(updated.status.as_str())
            .bind(&outcome)
            .bind(updated.retry_count as i64)
            .bind(&updated_at)
            .bind(&id)
            .bind(expected.status.as_str())
            .bind(expected.retry_count as i64)
            .bind(&expected_updated_at)
            .execute(&self.pool)
            .await?;

            Ok::<_, Error>(result.rows_affected() == 1)
        })
        .await?;

        if !swapped && self.get(updated.id).await?.is_none() {
            return Err(Error::NotFound(format!("task {}", updated.id)));
        }

        Ok(swapped)
    }

    async fn put_conversion(&self, conversion: &PlaylistConversion) -> Result<()> {
        let result = serde_json::to_string(conversion)?;
        let updated_at = Utc::now().to_rfc3339();

        retry_on_lock("put_conversion", self.max_lock_wait_ms, || async {
            sqlx::query(
                r#"
                INSERT INTO playlist_conversions (checksum, status, result, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(checksum) DO UPDATE SET
                    status = excluded.status,
                    result = excluded.result,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&conversion.id)
            .bind(conversion.status.as_str())
            .bind(&result)
            .bind(&updated_at)
            .execute(&self.pool)
            .await?;

            Ok::<_, Error>(())
        })
        .await
    }

    async fn get_conversion(&self, checksum: &str) -> Result<Option<PlaylistConversion>> {
        let result: Option<String> =
            sqlx::query_scalar("SELECT result FROM playlist_conversions WHERE checksum = ?")
                .bind(checksum)
                .fetch_optional(&self.pool)
                .await?;

        result
            .map(|blob| serde_json::from_str(&blob).map_err(Error::from))
            .transpose()
    }
}
