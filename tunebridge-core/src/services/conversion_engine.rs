//! Conversion engine
//!
//! Track links convert synchronously. Playlist links become a task that runs
//! in the background:
//! 1. fetch the source playlist once
//! 2. per track (bounded concurrency): search every target platform, match
//! 3. emit one track event per target platform as each track resolves
//! 4. persist the aggregated conversion, mark the task completed, emit done
//!
//! A failed search or match never fails the task; it becomes an omission for
//! that track and platform. While a run is active its task lease is renewed
//! in the background, so other processes can tell it from an abandoned one.

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};
use tunebridge_common::config::{EngineSettings, TomlConfig};
use tunebridge_common::{
    CandidateTrack, EntityKind, ErrorKind, MatchResult, Platform, TaskFailure, TaskOutcome,
    TaskStatus, TrackQuery,
};
use uuid::Uuid;

use super::event_emitter::{EventEmitter, TaskEmitter};
use super::matcher::Matcher;
use super::task_tracker::{Restart, RunClaim, TaskTracker};
use crate::adapters::{AdapterError, AdapterRegistry, PlatformAdapter};
use crate::error::{ConvertError, ConvertResult};
use crate::models::{
    conversion_checksum, ConversionResult, DeveloperApp, LinkInfo, PlaylistConversion, Task,
};
use crate::utils::retry_transient;

/// Characters of the checksum used in short links
const SHORT_URL_KEY_LEN: usize = 10;

/// Orchestrates adapters, matcher, task tracker and event emitter
pub struct ConversionEngine {
    registry: Arc<AdapterRegistry>,
    matcher: Matcher,
    tracker: Arc<TaskTracker>,
    emitter: EventEmitter,
    settings: EngineSettings,
    short_url_base: Option<String>,
}

impl ConversionEngine {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        matcher: Matcher,
        tracker: Arc<TaskTracker>,
        emitter: EventEmitter,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            matcher,
            tracker,
            emitter,
            settings,
            short_url_base: None,
        }
    }

    /// Engine wired from configuration
    pub fn from_config(
        config: &TomlConfig,
        registry: Arc<AdapterRegistry>,
        tracker: Arc<TaskTracker>,
        emitter: EventEmitter,
    ) -> Self {
        Self::new(
            registry,
            Matcher::new(config.matcher.clone()),
            tracker,
            emitter,
            config.engine.clone(),
        )
        .with_short_url_base(config.short_url_base.clone())
    }

    pub fn with_short_url_base(mut self, base: Option<String>) -> Self {
        self.short_url_base = base.map(|b| b.trim_end_matches('/').to_string());
        self
    }

    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// Convert a single track to every target platform
    ///
    /// A platform whose adapter fails (or that the app has no integration
    /// for) gets a `None` entry; only failing to read the source track is an
    /// error.
    pub async fn convert_track(
        &self,
        link: &LinkInfo,
        targets: &[Platform],
        app: Option<&DeveloperApp>,
    ) -> ConvertResult<ConversionResult> {
        if link.kind != EntityKind::Track {
            return Err(ConvertError::InvalidRequest(format!(
                "expected a track link, got {} {}",
                link.kind, link.entity_id
            )));
        }
        let targets = self.resolve_targets(link, targets, app)?;

        let source = self
            .call(link.platform, "get_track", |adapter| {
                let id = link.entity_id.clone();
                async move { adapter.get_track(&id).await }
            })
            .await
            .map_err(|e| ConvertError::adapter(link.platform, e))?;

        tracing::info!(
            platform = %link.platform,
            track = %source.title,
            targets = ?targets,
            "Converting track"
        );

        let query = TrackQuery::for_track(&source);
        let source_ref = &source;
        let query_ref = &query;
        let results = join_all(targets.iter().map(|&platform| async move {
            let entry = match self.match_on(platform, source_ref, query_ref, app).await {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::warn!(platform = %platform, track = %source_ref.title, error = %e, "Platform lookup failed");
                    None
                }
            };
            (platform, entry)
        }))
        .await;

        Ok(ConversionResult {
            entity: EntityKind::Track,
            platforms: results.into_iter().collect::<BTreeMap<_, _>>(),
            source,
        })
    }

    /// Start (or join) the background conversion of a playlist
    ///
    /// Returns the task for this request's checksum. An existing task that is
    /// not failed is returned unchanged; a failed one is restarted unless its
    /// retry budget is spent. A processing task abandoned by a stopped
    /// process is failed first and then follows the same retry path.
    pub async fn convert_playlist(
        self: &Arc<Self>,
        link: &LinkInfo,
        targets: &[Platform],
        app: Option<&DeveloperApp>,
    ) -> ConvertResult<Task> {
        if link.kind != EntityKind::Playlist {
            return Err(ConvertError::InvalidRequest(format!(
                "expected a playlist link, got {} {}",
                link.kind, link.entity_id
            )));
        }
        let targets = self.resolve_targets(link, targets, app)?;
        let app_id = app.map(|a| a.app_id.clone()).or_else(|| link.app_id.clone());
        let checksum = conversion_checksum(link.platform, &link.entity_id, &targets, app_id.as_deref());

        let candidate = Task::new(
            checksum,
            link.platform,
            link.entity_id.clone(),
            EntityKind::Playlist,
            targets,
            app_id,
        );
        let (mut task, existed) = self.tracker.get_or_create(candidate).await?;

        if existed && task.status == TaskStatus::Processing {
            match self.tracker.reclaim_abandoned(task.id).await? {
                Some(failed) => task = failed,
                None => {
                    tracing::debug!(task_id = %task.id, "Task is being processed");
                    return Ok(task);
                }
            }
        }
        if existed && !task.status.is_retryable() {
            tracing::debug!(task_id = %task.id, status = %task.status, "Returning existing task");
            return Ok(task);
        }

        // claim before processing, so an early cancel reaches the run
        let claim = self.tracker.register_cancellation(task.id).await;
        let started = if existed {
            self.restart(task.id).await
        } else {
            self.start(task.id).await
        };

        let task = match started {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.tracker.release_cancellation(claim).await;
                return self.tracker.get(task.id).await;
            }
            Err(e) => {
                self.tracker.release_cancellation(claim).await;
                return Err(e);
            }
        };

        let engine = Arc::clone(self);
        let link = link.clone();
        let app = app.cloned();
        let spawned = task.clone();
        tokio::spawn(async move {
            engine.run_playlist(spawned, link, app, claim).await;
        });

        Ok(task)
    }

    /// Move a new task to processing; `None` if another caller got there first
    async fn start(&self, id: Uuid) -> ConvertResult<Option<Task>> {
        match self.tracker.advance(id, TaskStatus::Processing, None).await {
            Ok(task) => Ok(Some(task)),
            Err(ConvertError::TransitionRejected { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Restart a failed task; `None` if its budget is spent or it moved on
    async fn restart(&self, id: Uuid) -> ConvertResult<Option<Task>> {
        match self.tracker.restart_failed(id).await? {
            Restart::Started(task) => {
                tracing::info!(task_id = %id, retry_count = task.retry_count, "Retrying playlist conversion");
                Ok(Some(task))
            }
            Restart::Exhausted(task) => {
                tracing::info!(task_id = %id, retry_count = task.retry_count, "Retry budget spent, task stays failed");
                Ok(None)
            }
            Restart::NotFailed(_) => Ok(None),
        }
    }

    /// Request cancellation of a running or pending task
    pub async fn cancel(&self, task_id: Uuid) -> ConvertResult<bool> {
        self.tracker.request_cancel(task_id).await
    }

    /// Persisted result of a finished playlist conversion
    pub async fn playlist_result(&self, checksum: &str) -> ConvertResult<Option<PlaylistConversion>> {
        Ok(self.tracker.store().get_conversion(checksum).await?)
    }

    pub async fn task(&self, task_id: Uuid) -> ConvertResult<Task> {
        self.tracker.get(task_id).await
    }

    /// Requested targets, else the link's target, else every platform the app
    /// (or this registry) supports except the source
    fn resolve_targets(
        &self,
        link: &LinkInfo,
        requested: &[Platform],
        app: Option<&DeveloperApp>,
    ) -> ConvertResult<Vec<Platform>> {
        let mut targets: Vec<Platform> = if !requested.is_empty() {
            requested.to_vec()
        } else if let Some(target) = link.target_platform {
            vec![target]
        } else {
            let available = match app {
                Some(app) => app.integrations.clone(),
                None => self.registry.platforms(),
            };
            available.into_iter().filter(|p| *p != link.platform).collect()
        };

        targets.sort();
        targets.dedup();

        if targets.is_empty() {
            return Err(ConvertError::InvalidRequest("no target platforms to convert to".to_string()));
        }
        Ok(targets)
    }

    /// One adapter request with in-flight bound, timeout and transient retries
    async fn call<T, F, Fut>(&self, platform: Platform, operation: &str, f: F) -> Result<T, AdapterError>
    where
        F: Fn(Arc<dyn PlatformAdapter>) -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let timeout = Duration::from_millis(self.settings.adapter_timeout_ms);
        self.call_with(platform, operation, Some(timeout), f).await
    }

    /// Like [`Self::call`], with an optional bound on the whole operation
    ///
    /// Multi-request operations pass `None`: the adapters time out each
    /// request on their own.
    async fn call_with<T, F, Fut>(
        &self,
        platform: Platform,
        operation: &str,
        timeout: Option<Duration>,
        f: F,
    ) -> Result<T, AdapterError>
    where
        F: Fn(Arc<dyn PlatformAdapter>) -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let registry = &self.registry;
        let f = &f;

        retry_transient(
            operation,
            self.settings.max_adapter_retries,
            self.settings.retry_backoff_ms,
            move || async move {
                let (adapter, _permit) = match registry.acquire(platform).await {
                    Ok(acquired) => acquired,
                    Err(e) => return Err(e),
                };
                tracing::debug!(platform = %platform, operation, "Adapter call");
                let Some(timeout) = timeout else {
                    return f(adapter).await;
                };
                match tokio::time::timeout(timeout, f(adapter)).await {
                    Ok(result) => result,
                    Err(_) => Err(AdapterError::Timeout),
                }
            },
        )
        .await
    }

    /// Search `platform` for `source` and pick a match
    async fn match_on(
        &self,
        platform: Platform,
        source: &CandidateTrack,
        query: &TrackQuery,
        app: Option<&DeveloperApp>,
    ) -> Result<MatchResult, AdapterError> {
        if platform == source.platform {
            return Ok(MatchResult {
                platform,
                source: source.clone(),
                chosen: Some(source.clone()),
                score: 1.0,
            });
        }

        if let Some(app) = app {
            if !app.has_integration(platform) {
                return Err(AdapterError::NoCredentials(platform));
            }
        }

        let candidates = self
            .call(platform, "search", |adapter| {
                let query = query.clone();
                async move { adapter.search(&query).await }
            })
            .await?;

        Ok(self.matcher.match_track(source, platform, &candidates))
    }

    /// Per-platform results for one playlist track; failures become omissions
    async fn convert_playlist_track(
        &self,
        source: &CandidateTrack,
        targets: &[Platform],
        app: Option<&DeveloperApp>,
    ) -> Vec<MatchResult> {
        let query = TrackQuery::for_track(source);
        let query = &query;

        join_all(targets.iter().map(|&platform| async move {
            match self.match_on(platform, source, query, app).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(
                        platform = %platform,
                        track = %source.title,
                        error = %e,
                        "Track lookup failed, recording omission"
                    );
                    MatchResult::omitted(platform, source.clone(), 0.0)
                }
            }
        }))
        .await
    }

    fn short_url(&self, checksum: &str) -> Option<String> {
        self.short_url_base.as_ref().map(|base| {
            let key: String = checksum.chars().take(SHORT_URL_KEY_LEN).collect();
            format!("{}/{}", base, key)
        })
    }

    /// Keep renewing the lease of `task_id` until the guard drops
    fn renew_lease(&self, task_id: Uuid) -> DropGuard {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let tracker = Arc::clone(&self.tracker);
        let period = tracker.renewal_interval();

        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            // first tick fires immediately; the task was just written
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticks.tick() => match tracker.renew(task_id).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => tracing::warn!(task_id = %task_id, error = %e, "Lease renewal failed"),
                    },
                }
            }
        });

        stop.drop_guard()
    }

    async fn run_playlist(self: Arc<Self>, task: Task, link: LinkInfo, app: Option<DeveloperApp>, claim: RunClaim) {
        let token = claim.token();
        let renewal = self.renew_lease(task.id);
        let mut events = self.emitter.sequence_for(task.id, task.retry_count, app.as_ref()).await;

        if let Err(e) = self.execute_playlist(&task, &link, app.as_ref(), &token, &mut events).await {
            self.fail_task(&task, e, &mut events).await;
        }

        drop(renewal);
        self.tracker.release_cancellation(claim).await;
    }

    async fn execute_playlist(
        self: &Arc<Self>,
        task: &Task,
        link: &LinkInfo,
        app: Option<&DeveloperApp>,
        token: &CancellationToken,
        events: &mut TaskEmitter,
    ) -> ConvertResult<()> {
        tracing::info!(
            task_id = %task.id,
            platform = %link.platform,
            playlist_id = %link.entity_id,
            targets = ?task.targets,
            "Playlist conversion started"
        );

        if token.is_cancelled() {
            return self.finish_cancelled(task, 0, 0, None, events).await;
        }

        // paginated: no bound on the whole enumeration
        let (mut meta, tracks) = self
            .call_with(link.platform, "get_playlist_tracks", None, |adapter| {
                let id = link.entity_id.clone();
                async move { adapter.get_playlist_tracks(&id).await }
            })
            .await
            .map_err(|e| ConvertError::adapter(link.platform, e))?;

        meta.checksum = task.checksum.clone();
        meta.track_count = tracks.len();
        events.emit_metadata(&meta).await?;

        let total = tracks.len();
        let mut slots: Vec<Option<Vec<MatchResult>>> = vec![None; total];
        let mut processed = 0usize;

        {
            let mut resolved = stream::iter(tracks.into_iter().enumerate())
                .map(|(position, track)| {
                    let engine = Arc::clone(self);
                    let targets = task.targets.clone();
                    let app = app.cloned();
                    let token = token.clone();

                    async move {
                        // skip, don't abort: already-running tracks finish
                        if token.is_cancelled() {
                            return (position, None);
                        }
                        let results = engine
                            .convert_playlist_track(&track, &targets, app.as_ref())
                            .await;
                        (position, Some(results))
                    }
                })
                .buffer_unordered(self.settings.track_concurrency.max(1));

            while let Some((position, results)) = resolved.next().await {
                let Some(results) = results else {
                    continue;
                };
                for result in &results {
                    events.emit_track(result.platform, position, result).await?;
                }
                slots[position] = Some(results);
                processed += 1;
            }
        }

        let mut conversion = PlaylistConversion::new(meta, &task.targets);
        let complete = processed == total;
        for results in slots.into_iter().flatten() {
            conversion.record(results);
        }

        if !complete {
            return self
                .finish_cancelled(task, processed, total, Some(conversion), events)
                .await;
        }

        conversion.status = TaskStatus::Completed;
        conversion.short_url = self.short_url(&task.checksum);
        self.tracker.store().put_conversion(&conversion).await?;

        let summary = conversion.summary();
        self.tracker
            .advance(task.id, TaskStatus::Completed, Some(TaskOutcome::Completed(summary.clone())))
            .await?;

        tracing::info!(
            task_id = %task.id,
            tracks = total,
            omitted = summary.omitted,
            "Playlist conversion completed"
        );
        events.emit_done(summary).await
    }

    /// Record a cancellation: partial result, task status, terminal event
    async fn finish_cancelled(
        &self,
        task: &Task,
        processed: usize,
        total: usize,
        partial: Option<PlaylistConversion>,
        events: &mut TaskEmitter,
    ) -> ConvertResult<()> {
        if let Some(mut partial) = partial {
            partial.status = TaskStatus::Cancelled;
            self.tracker.store().put_conversion(&partial).await?;
        }

        self.tracker
            .advance(task.id, TaskStatus::Cancelled, Some(TaskOutcome::Cancelled { processed, total }))
            .await?;

        tracing::info!(task_id = %task.id, processed, total, "Playlist conversion cancelled");
        events
            .emit_error(TaskFailure {
                kind: ErrorKind::Cancelled,
                reason: format!("cancelled after {} of {} tracks", processed, total),
            })
            .await
    }

    /// Mark the task failed and emit the terminal error, logging secondary failures
    async fn fail_task(&self, task: &Task, error: ConvertError, events: &mut TaskEmitter) {
        tracing::error!(task_id = %task.id, error = %error, "Playlist conversion failed");

        let failure = TaskFailure {
            kind: error.kind(),
            reason: error.to_string(),
        };

        if let Err(e) = self
            .tracker
            .advance(task.id, TaskStatus::Failed, Some(TaskOutcome::Failed(failure.clone())))
            .await
        {
            tracing::error!(task_id = %task.id, error = %e, "Could not mark task failed");
        }

        if !events.is_terminated() {
            if let Err(e) = events.emit_error(failure).await {
                tracing::error!(task_id = %task.id, error = %e, "Could not emit error event");
            }
        }
    }
}
