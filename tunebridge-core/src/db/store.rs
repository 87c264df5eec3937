//! Task store abstraction and the in-memory implementation

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tunebridge_common::{Error, Result};
use uuid::Uuid;

use crate::models::{PlaylistConversion, Task};

/// Durable task and result storage
///
/// Implementations must make `insert_if_absent` and `compare_and_swap`
/// linearizable per checksum / task ID.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert `task` unless a task with its checksum exists
    ///
    /// Returns the stored task and whether this call created it.
    async fn insert_if_absent(&self, task: Task) -> Result<(Task, bool)>;

    async fn get(&self, id: Uuid) -> Result<Option<Task>>;

    async fn get_by_checksum(&self, checksum: &str) -> Result<Option<Task>>;

    /// Replace the stored task with `updated` iff it is unchanged since
    /// `expected` was read
    ///
    /// Every write stamps `updated_at`, so status, retry count and
    /// `updated_at` together identify a version of the row.
    async fn compare_and_swap(&self, expected: &Task, updated: &Task) -> Result<bool>;

    /// Upsert a finished playlist conversion under its checksum
    async fn put_conversion(&self, conversion: &PlaylistConversion) -> Result<()>;

    async fn get_conversion(&self, checksum: &str) -> Result<Option<PlaylistConversion>>;
}

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<Uuid, Task>,
    by_checksum: HashMap<String, Uuid>,
    conversions: HashMap<String, PlaylistConversion>,
}

/// Task store backed by a mutex-guarded map
///
/// For tests and embedding; contents are lost on drop.
#[derive(Default)]
pub struct MemoryTaskStore {
    state: Mutex<MemoryState>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert_if_absent(&self, task: Task) -> Result<(Task, bool)> {
        let mut state = self.state.lock().await;

        if let Some(existing_id) = state.by_checksum.get(&task.checksum) {
            let existing = state
                .tasks
                .get(existing_id)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("checksum index points at missing task {}", existing_id)))?;
            return Ok((existing, false));
        }

        state.by_checksum.insert(task.checksum.clone(), task.id);
        state.tasks.insert(task.id, task.clone());
        Ok((task, true))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.state.lock().await.tasks.get(&id).cloned())
    }

    async fn get_by_checksum(&self, checksum: &str) -> Result<Option<Task>> {
        let state = self.state.lock().await;
        Ok(state
            .by_checksum
            .get(checksum)
            .and_then(|id| state.tasks.get(id))
            .cloned())
    }

    async fn compare_and_swap(&self, expected: &Task, updated: &Task) -> Result<bool> {
        let mut state = self.state.lock().await;

        let current = state
            .tasks
            .get_mut(&updated.id)
            .ok_or_else(|| Error::NotFound(format!("task {}", updated.id)))?;

        if current.status != expected.status
            || current.retry_count != expected.retry_count
            || current.updated_at != expected.updated_at
        {
            return Ok(false);
        }

        *current = updated.clone();
        Ok(true)
    }

    async fn put_conversion(&self, conversion: &PlaylistConversion) -> Result<()> {
        self.state
            .lock()
            .await
            .conversions
            .insert(conversion.id.clone(), conversion.clone());
        Ok(())
    }

    async fn get_conversion(&self, checksum: &str) -> Result<Option<PlaylistConversion>> {
        Ok(self.state.lock().await.conversions.get(checksum).cloned())
    }
}
