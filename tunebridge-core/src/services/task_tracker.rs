//! Task tracker
//!
//! Sole writer of task `status` and `retry_count`. Every transition is a
//! read / validate / compare-and-swap loop against the store, so concurrent
//! writers for one task are linearized by the store.
//!
//! A running pipeline renews its task's lease by rewriting `updated_at`. A
//! processing task that nobody in this process runs and whose lease has
//! expired was abandoned by a stopped process; it may be failed (and then
//! retried) or cancelled by anyone.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tunebridge_common::{ErrorKind, TaskFailure, TaskOutcome, TaskStatus};
use uuid::Uuid;

use crate::db::TaskStore;
use crate::error::{ConvertError, ConvertResult};
use crate::models::Task;

/// CAS attempts before giving up on a contended task
const MAX_CAS_ATTEMPTS: usize = 16;

const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// Renewals per lease period
const RENEWALS_PER_LEASE: u32 = 3;

/// Cancellation token shared by everyone trying to start one run of a task
struct RunEntry {
    token: CancellationToken,
    generation: u64,
    holders: usize,
}

/// One caller's hold on a task's cancellation token
///
/// Taken before the task is moved to processing, so a cancel request that
/// arrives while the run is starting is never lost. Give it back with
/// [`TaskTracker::release_cancellation`].
#[derive(Debug)]
pub struct RunClaim {
    task_id: Uuid,
    generation: u64,
    token: CancellationToken,
}

impl RunClaim {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Result of resubmitting a failed task
#[derive(Debug, Clone, PartialEq)]
pub enum Restart {
    /// Retry counted and the task is processing again
    Started(Task),
    /// Retry budget spent; the task stays failed
    Exhausted(Task),
    /// Task was not failed (another caller restarted it first)
    NotFailed(Task),
}

/// Task lifecycle owner
pub struct TaskTracker {
    store: Arc<dyn TaskStore>,
    max_retries: u32,
    lease: Duration,
    /// Runs started (or starting) in this process
    runs: Arc<RwLock<HashMap<Uuid, RunEntry>>>,
    next_generation: AtomicU64,
}

impl TaskTracker {
    pub fn new(store: Arc<dyn TaskStore>, max_retries: u32) -> Self {
        Self {
            store,
            max_retries,
            lease: DEFAULT_LEASE,
            runs: Arc::new(RwLock::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// How long a processing task survives without renewal
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease.max(Duration::from_millis(1));
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// How often a running pipeline should call [`TaskTracker::renew`]
    pub fn renewal_interval(&self) -> Duration {
        (self.lease / RENEWALS_PER_LEASE).max(Duration::from_millis(1))
    }

    /// Return the task for `candidate.checksum`, creating `candidate` if none exists
    ///
    /// Concurrent callers for one checksum get exactly one creator; the flag is
    /// `true` for everyone else (the task already existed).
    pub async fn get_or_create(&self, candidate: Task) -> ConvertResult<(Task, bool)> {
        let (task, created) = self.store.insert_if_absent(candidate).await?;
        if created {
            tracing::info!(task_id = %task.id, checksum = %task.checksum, "Task created");
        }
        Ok((task, !created))
    }

    pub async fn get(&self, id: Uuid) -> ConvertResult<Task> {
        self.store
            .get(id)
            .await?
            .ok_or(ConvertError::TaskNotFound(id))
    }

    pub async fn get_by_checksum(&self, checksum: &str) -> ConvertResult<Option<Task>> {
        Ok(self.store.get_by_checksum(checksum).await?)
    }

    fn contended(id: Uuid) -> ConvertError {
        ConvertError::TaskFatal(format!(
            "task {} still contended after {} update attempts",
            id, MAX_CAS_ATTEMPTS
        ))
    }

    /// Move a task to `new_status`, recording `outcome`
    ///
    /// Rejects transitions the state machine forbids, and retries
    /// (failed → processing) once the retry count is over the limit.
    pub async fn advance(
        &self,
        id: Uuid,
        new_status: TaskStatus,
        outcome: Option<TaskOutcome>,
    ) -> ConvertResult<Task> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(id).await?;

            let over_limit = current.status.is_retryable()
                && new_status == TaskStatus::Processing
                && current.retry_count > self.max_retries;

            if !current.status.can_transition_to(new_status) || over_limit {
                return Err(ConvertError::TransitionRejected {
                    task_id: id,
                    from: current.status,
                    to: new_status,
                });
            }

            let mut updated = current.clone();
            updated.status = new_status;
            updated.outcome = outcome.clone();
            updated.updated_at = Utc::now();

            if self.store.compare_and_swap(&current, &updated).await? {
                tracing::debug!(
                    task_id = %id,
                    from = %current.status,
                    to = %new_status,
                    "Task transitioned"
                );
                if new_status.is_terminal() {
                    self.runs.write().await.remove(&id);
                }
                return Ok(updated);
            }

            tracing::debug!(task_id = %id, "Concurrent task update, re-reading");
        }

        Err(Self::contended(id))
    }

    /// Count one more retry of a failed task
    ///
    /// Returns the new count and whether it exceeds the configured maximum.
    /// Once exceeded the count stops growing. Tasks that are not failed are
    /// rejected without touching the count.
    pub async fn increment_retry(&self, id: Uuid) -> ConvertResult<(u32, bool)> {
        match self.bump_retry(id, false).await? {
            Restart::NotFailed(task) => Err(ConvertError::TransitionRejected {
                task_id: id,
                from: task.status,
                to: TaskStatus::Processing,
            }),
            Restart::Started(task) => Ok((task.retry_count, false)),
            Restart::Exhausted(task) => Ok((task.retry_count, true)),
        }
    }

    /// Count a retry and move failed → processing in one swap
    ///
    /// Concurrent resubmissions of one failed task spend exactly one retry;
    /// the losers see [`Restart::NotFailed`].
    pub async fn restart_failed(&self, id: Uuid) -> ConvertResult<Restart> {
        self.bump_retry(id, true).await
    }

    /// Increment `retry_count` of a failed task, optionally restarting it
    ///
    /// Without `restart` a within-budget count comes back as
    /// [`Restart::Started`] while the task stays failed.
    async fn bump_retry(&self, id: Uuid, restart: bool) -> ConvertResult<Restart> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(id).await?;

            if current.status != TaskStatus::Failed {
                return Ok(Restart::NotFailed(current));
            }
            if current.retry_count > self.max_retries {
                return Ok(Restart::Exhausted(current));
            }

            let mut updated = current.clone();
            updated.retry_count += 1;
            updated.updated_at = Utc::now();
            let exceeded = updated.retry_count > self.max_retries;
            if restart && !exceeded {
                updated.status = TaskStatus::Processing;
                updated.outcome = None;
            }

            if self.store.compare_and_swap(&current, &updated).await? {
                if exceeded {
                    tracing::warn!(
                        task_id = %id,
                        retry_count = updated.retry_count,
                        max_retries = self.max_retries,
                        "Task retry limit exceeded"
                    );
                    return Ok(Restart::Exhausted(updated));
                }
                return Ok(Restart::Started(updated));
            }
        }

        Err(Self::contended(id))
    }

    /// Refresh the lease of a processing task
    ///
    /// Returns `false` once the task has left processing, which tells the
    /// renewing pipeline to stop.
    pub async fn renew(&self, id: Uuid) -> ConvertResult<bool> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(id).await?;
            if current.status != TaskStatus::Processing {
                return Ok(false);
            }

            let mut updated = current.clone();
            updated.updated_at = Utc::now();
            if self.store.compare_and_swap(&current, &updated).await? {
                return Ok(true);
            }
        }

        Err(Self::contended(id))
    }

    /// Whether `task` is processing with no owner left to finish it
    pub async fn is_abandoned(&self, task: &Task) -> bool {
        if task.status != TaskStatus::Processing || self.is_running(task.id).await {
            return false;
        }
        Utc::now()
            .signed_duration_since(task.updated_at)
            .to_std()
            .map(|age| age > self.lease)
            .unwrap_or(false)
    }

    /// Fail an abandoned task so the normal retry path can pick it up
    ///
    /// Returns the failed task, or `None` when the task is not abandoned.
    pub async fn reclaim_abandoned(&self, id: Uuid) -> ConvertResult<Option<Task>> {
        self.settle_abandoned(id, TaskStatus::Failed, |task| {
            TaskOutcome::Failed(TaskFailure {
                kind: ErrorKind::TaskFatal,
                reason: format!("abandoned: lease not renewed since {}", task.updated_at.to_rfc3339()),
            })
        })
        .await
    }

    async fn settle_abandoned<F>(&self, id: Uuid, status: TaskStatus, outcome: F) -> ConvertResult<Option<Task>>
    where
        F: Fn(&Task) -> TaskOutcome,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(id).await?;
            if !self.is_abandoned(&current).await {
                return Ok(None);
            }

            let mut updated = current.clone();
            updated.status = status;
            updated.outcome = Some(outcome(&current));
            updated.updated_at = Utc::now();

            if self.store.compare_and_swap(&current, &updated).await? {
                tracing::warn!(
                    task_id = %id,
                    last_renewed = %current.updated_at.to_rfc3339(),
                    status = %status,
                    "Abandoned task settled"
                );
                return Ok(Some(updated));
            }
        }

        Err(Self::contended(id))
    }

    /// Take a hold on the cancellation token for the next run of `id`
    ///
    /// Callers racing to start the same run share one token. The entry is
    /// dropped when the task reaches a terminal status or the last holder
    /// releases it.
    pub async fn register_cancellation(&self, id: Uuid) -> RunClaim {
        let mut runs = self.runs.write().await;
        let entry = runs.entry(id).or_insert_with(|| RunEntry {
            token: CancellationToken::new(),
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            holders: 0,
        });
        entry.holders += 1;

        RunClaim {
            task_id: id,
            generation: entry.generation,
            token: entry.token.clone(),
        }
    }

    /// Give back a hold taken by [`TaskTracker::register_cancellation`]
    pub async fn release_cancellation(&self, claim: RunClaim) {
        let mut runs = self.runs.write().await;
        if let Some(entry) = runs.get_mut(&claim.task_id) {
            if entry.generation != claim.generation {
                return;
            }
            entry.holders = entry.holders.saturating_sub(1);
            if entry.holders == 0 {
                runs.remove(&claim.task_id);
            }
        }
    }

    /// Whether a run of `id` is registered in this process
    pub async fn is_running(&self, id: Uuid) -> bool {
        self.runs.read().await.contains_key(&id)
    }

    /// Ask a task to stop
    ///
    /// A run in this process is signalled and stops at its next track
    /// boundary. A pending task, or a processing one abandoned by a stopped
    /// process, is cancelled directly. Returns `false` when the task is
    /// terminal or still owned by another live process.
    pub async fn request_cancel(&self, id: Uuid) -> ConvertResult<bool> {
        if let Some(entry) = self.runs.read().await.get(&id) {
            tracing::info!(task_id = %id, "Cancellation requested");
            entry.token.cancel();
            return Ok(true);
        }

        let task = self.get(id).await?;
        match task.status {
            TaskStatus::Pending => {
                self.advance(
                    id,
                    TaskStatus::Cancelled,
                    Some(TaskOutcome::Cancelled { processed: 0, total: 0 }),
                )
                .await?;
                tracing::info!(task_id = %id, "Pending task cancelled");
                Ok(true)
            }
            TaskStatus::Processing => {
                let cancelled = self
                    .settle_abandoned(id, TaskStatus::Cancelled, |_| TaskOutcome::Cancelled {
                        processed: 0,
                        total: 0,
                    })
                    .await?;
                Ok(cancelled.is_some())
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryTaskStore;
    use tunebridge_common::{EntityKind, Platform};

    fn tracker(max_retries: u32) -> TaskTracker {
        TaskTracker::new(Arc::new(MemoryTaskStore::new()), max_retries)
    }

    fn candidate(checksum: &str) -> Task {
        Task::new(
            checksum.to_string(),
            Platform::Deezer,
            "908622995",
            EntityKind::Playlist,
            vec![Platform::Spotify],
            None,
        )
    }

    fn failure() -> Option<TaskOutcome> {
        Some(TaskOutcome::Failed(TaskFailure {
            kind: ErrorKind::Adapter,
            reason: "playlist unavailable".to_string(),
        }))
    }

    async fn failed_task(tracker: &TaskTracker) -> Task {
        let (task, _) = tracker.get_or_create(candidate("sum")).await.unwrap();
        tracker.advance(task.id, TaskStatus::Processing, None).await.unwrap();
        tracker.advance(task.id, TaskStatus::Failed, failure()).await.unwrap()
    }

    #[tokio::test]
    async fn test_get_or_create_reports_existing() {
        let tracker = tracker(3);

        let (first, existed) = tracker.get_or_create(candidate("sum")).await.unwrap();
        assert!(!existed);
        let (second, existed) = tracker.get_or_create(candidate("sum")).await.unwrap();
        assert!(existed);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let tracker = tracker(3);
        let (task, _) = tracker.get_or_create(candidate("sum")).await.unwrap();

        let err = tracker
            .advance(task.id, TaskStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConvertError::TransitionRejected { from: TaskStatus::Pending, to: TaskStatus::Completed, .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_task_records_outcome() {
        let tracker = tracker(3);
        let failed = failed_task(&tracker).await;

        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(tracker.get(failed.id).await.unwrap().outcome, failure());
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let tracker = tracker(2);
        let task = failed_task(&tracker).await;

        assert_eq!(tracker.increment_retry(task.id).await.unwrap(), (1, false));
        assert_eq!(tracker.increment_retry(task.id).await.unwrap(), (2, false));
        assert_eq!(tracker.increment_retry(task.id).await.unwrap(), (3, true));
        // saturates once exceeded
        assert_eq!(tracker.increment_retry(task.id).await.unwrap(), (3, true));

        let err = tracker
            .advance(task.id, TaskStatus::Processing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::TransitionRejected { from: TaskStatus::Failed, .. }));
    }

    #[tokio::test]
    async fn test_retry_within_limit_restarts_processing() {
        let tracker = tracker(1);
        let task = failed_task(&tracker).await;

        assert_eq!(tracker.increment_retry(task.id).await.unwrap(), (1, false));
        let restarted = tracker.advance(task.id, TaskStatus::Processing, None).await.unwrap();
        assert_eq!(restarted.status, TaskStatus::Processing);
        assert!(restarted.outcome.is_none());
    }

    #[tokio::test]
    async fn test_retry_only_counted_for_failed_task() {
        let tracker = tracker(1);
        let (task, _) = tracker.get_or_create(candidate("sum")).await.unwrap();
        tracker.advance(task.id, TaskStatus::Processing, None).await.unwrap();

        for _ in 0..2 {
            let err = tracker.increment_retry(task.id).await.unwrap_err();
            assert!(matches!(err, ConvertError::TransitionRejected { from: TaskStatus::Processing, .. }));
        }
        let stored = tracker.get(task.id).await.unwrap();
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn test_concurrent_restarts_spend_one_retry() {
        let tracker = Arc::new(tracker(3));
        let task = failed_task(&tracker).await;

        let attempts = (0..8).map(|_| {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.restart_failed(task.id).await.unwrap() })
        });
        let outcomes: Vec<Restart> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let started = outcomes.iter().filter(|o| matches!(o, Restart::Started(_))).count();
        assert_eq!(started, 1);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, Restart::Started(_) | Restart::NotFailed(_))));

        let stored = tracker.get(task.id).await.unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn test_restart_past_budget_stays_failed() {
        let tracker = tracker(0);
        let task = failed_task(&tracker).await;

        let Restart::Exhausted(exhausted) = tracker.restart_failed(task.id).await.unwrap() else {
            panic!("retry budget of zero must be exhausted");
        };
        assert_eq!(exhausted.status, TaskStatus::Failed);
        assert_eq!(exhausted.retry_count, 1);
        assert!(matches!(tracker.restart_failed(task.id).await.unwrap(), Restart::Exhausted(t) if t.retry_count == 1));
    }

    #[tokio::test]
    async fn test_cancel_pending_task_without_pipeline() {
        let tracker = tracker(3);
        let (task, _) = tracker.get_or_create(candidate("sum")).await.unwrap();

        assert!(tracker.request_cancel(task.id).await.unwrap());
        assert_eq!(tracker.get(task.id).await.unwrap().status, TaskStatus::Cancelled);

        // already terminal
        assert!(!tracker.request_cancel(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_before_start_reaches_run() {
        let tracker = tracker(3);
        let (task, _) = tracker.get_or_create(candidate("sum")).await.unwrap();
        let claim = tracker.register_cancellation(task.id).await;

        // arrives between claim and processing
        assert!(tracker.request_cancel(task.id).await.unwrap());
        assert!(claim.token().is_cancelled());
        assert_eq!(tracker.get(task.id).await.unwrap().status, TaskStatus::Pending);
        assert!(tracker.is_running(task.id).await);

        tracker.advance(task.id, TaskStatus::Processing, None).await.unwrap();
        tracker
            .advance(task.id, TaskStatus::Cancelled, Some(TaskOutcome::Cancelled { processed: 0, total: 3 }))
            .await
            .unwrap();
        assert!(!tracker.is_running(task.id).await);
    }

    #[tokio::test]
    async fn test_racing_claims_share_token() {
        let tracker = tracker(3);
        let (task, _) = tracker.get_or_create(candidate("sum")).await.unwrap();

        let winner = tracker.register_cancellation(task.id).await;
        let loser = tracker.register_cancellation(task.id).await;

        tracker.release_cancellation(loser).await;
        assert!(tracker.is_running(task.id).await);

        assert!(tracker.request_cancel(task.id).await.unwrap());
        assert!(winner.token().is_cancelled());

        tracker.release_cancellation(winner).await;
        assert!(!tracker.is_running(task.id).await);
    }

    #[tokio::test]
    async fn test_stale_release_keeps_newer_run() {
        let tracker = tracker(3);
        let task = failed_task(&tracker).await;

        let stale = tracker.register_cancellation(task.id).await;
        // a terminal advance drops the entry while `stale` is still held
        tracker.runs.write().await.remove(&task.id);

        let current = tracker.register_cancellation(task.id).await;
        tracker.release_cancellation(stale).await;
        assert!(tracker.is_running(task.id).await);

        tracker.release_cancellation(current).await;
        assert!(!tracker.is_running(task.id).await);
    }

    #[tokio::test]
    async fn test_abandoned_task_is_reclaimed() {
        let tracker = tracker(3).with_lease(Duration::from_millis(20));
        let (task, _) = tracker.get_or_create(candidate("sum")).await.unwrap();
        tracker.advance(task.id, TaskStatus::Processing, None).await.unwrap();

        // within the lease
        assert!(tracker.reclaim_abandoned(task.id).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let failed = tracker.reclaim_abandoned(task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(matches!(
            failed.outcome,
            Some(TaskOutcome::Failed(TaskFailure { kind: ErrorKind::TaskFatal, .. }))
        ));
        assert!(matches!(tracker.restart_failed(task.id).await.unwrap(), Restart::Started(_)));
    }

    #[tokio::test]
    async fn test_renewal_and_local_runs_keep_task_owned() {
        let tracker = tracker(3).with_lease(Duration::from_millis(30));
        let (task, _) = tracker.get_or_create(candidate("sum")).await.unwrap();
        tracker.advance(task.id, TaskStatus::Processing, None).await.unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(15)).await;
            assert!(tracker.renew(task.id).await.unwrap());
        }
        assert!(tracker.reclaim_abandoned(task.id).await.unwrap().is_none());

        let claim = tracker.register_cancellation(task.id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!tracker.is_abandoned(&tracker.get(task.id).await.unwrap()).await);
        tracker.release_cancellation(claim).await;
        assert!(tracker.is_abandoned(&tracker.get(task.id).await.unwrap()).await);
    }

    #[tokio::test]
    async fn test_cancel_abandoned_task() {
        let tracker = tracker(3).with_lease(Duration::from_millis(20));
        let (task, _) = tracker.get_or_create(candidate("sum")).await.unwrap();
        tracker.advance(task.id, TaskStatus::Processing, None).await.unwrap();

        // owner may still be alive
        assert!(!tracker.request_cancel(task.id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(tracker.request_cancel(task.id).await.unwrap());
        assert_eq!(tracker.get(task.id).await.unwrap().status, TaskStatus::Cancelled);
        assert!(!tracker.renew(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let tracker = tracker(3);
        let id = Uuid::new_v4();
        assert!(matches!(tracker.get(id).await, Err(ConvertError::TaskNotFound(x)) if x == id));
    }
}
