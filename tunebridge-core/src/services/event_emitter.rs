//! Event emitter
//!
//! Builds [`ConversionEvent`]s and hands them to the delivery transport. Each
//! run of a task gets a [`TaskEmitter`] that stamps the run number, numbers
//! its events and enforces their order: metadata, tracks, then exactly one
//! terminal event.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tunebridge_common::events::{ConversionEvent, TrackPayload};
use tunebridge_common::{DoneSummary, MatchResult, Platform, PlaylistMetadata, TaskFailure};
use uuid::Uuid;

use crate::delivery::{Delivery, FanoutDelivery, WebhookDelivery};
use crate::error::{ConvertError, ConvertResult};
use crate::models::DeveloperApp;

const DEFAULT_WEBHOOK_ATTEMPTS: u32 = 3;

/// Hands out per-run sequencers over one delivery transport
#[derive(Clone)]
pub struct EventEmitter {
    delivery: Arc<dyn Delivery>,
    webhook_attempts: u32,
    /// App webhooks by URL, each with one client and one ordered queue
    app_webhooks: Arc<Mutex<HashMap<String, Arc<WebhookDelivery>>>>,
}

impl EventEmitter {
    pub fn new(delivery: Arc<dyn Delivery>) -> Self {
        Self {
            delivery,
            webhook_attempts: DEFAULT_WEBHOOK_ATTEMPTS,
            app_webhooks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attempts per event for app webhooks
    pub fn with_webhook_attempts(mut self, attempts: u32) -> Self {
        self.webhook_attempts = attempts.max(1);
        self
    }

    /// Sequencer for run `run` of `task_id`
    pub async fn sequence(&self, task_id: Uuid, run: u32) -> TaskEmitter {
        self.sequence_for(task_id, run, None).await
    }

    /// Sequencer that also posts to the app's webhook, when it has one
    pub async fn sequence_for(&self, task_id: Uuid, run: u32, app: Option<&DeveloperApp>) -> TaskEmitter {
        let webhook = match app.and_then(|a| a.webhook_url.as_deref()) {
            Some(url) => self.app_webhook(task_id, url).await,
            None => None,
        };

        let delivery = match webhook {
            Some(webhook) => {
                let targets: Vec<Arc<dyn Delivery>> = vec![self.delivery.clone(), webhook];
                Arc::new(FanoutDelivery::new(targets)) as Arc<dyn Delivery>
            }
            None => self.delivery.clone(),
        };

        TaskEmitter {
            task_id,
            run,
            delivery,
            phase: Phase::Start,
            next_sequence: 0,
        }
    }

    async fn app_webhook(&self, task_id: Uuid, url: &str) -> Option<Arc<dyn Delivery>> {
        let mut webhooks = self.app_webhooks.lock().await;
        if let Some(webhook) = webhooks.get(url) {
            return Some(webhook.clone() as Arc<dyn Delivery>);
        }

        match WebhookDelivery::new(url, self.webhook_attempts) {
            Ok(webhook) => {
                let webhook = Arc::new(webhook);
                webhooks.insert(url.to_string(), webhook.clone());
                Some(webhook as Arc<dyn Delivery>)
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, url, error = %e, "App webhook unusable, skipping it");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    MetadataSent,
    Terminated,
}

/// Ordered event sink for one run of a task
pub struct TaskEmitter {
    task_id: Uuid,
    run: u32,
    delivery: Arc<dyn Delivery>,
    phase: Phase,
    next_sequence: u64,
}

impl TaskEmitter {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn run(&self) -> u32 {
        self.run
    }

    /// Whether the terminal event has been sent
    pub fn is_terminated(&self) -> bool {
        self.phase == Phase::Terminated
    }

    pub fn metadata_sent(&self) -> bool {
        self.phase == Phase::MetadataSent
    }

    fn check(&self, allowed: &[Phase], event: &str) -> ConvertResult<()> {
        if allowed.contains(&self.phase) {
            return Ok(());
        }
        let message = format!("{} event for task {} emitted in phase {:?}", event, self.task_id, self.phase);
        tracing::error!(task_id = %self.task_id, phase = ?self.phase, event, "Event emitted out of order");
        Err(ConvertError::Invariant(message))
    }

    fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    pub async fn emit_metadata(&mut self, meta: &PlaylistMetadata) -> ConvertResult<()> {
        self.check(&[Phase::Start], "metadata")?;

        let event = ConversionEvent::Metadata {
            task_id: self.task_id,
            run: self.run,
            sequence: self.take_sequence(),
            payload: meta.clone(),
            timestamp: Utc::now(),
        };
        self.phase = Phase::MetadataSent;
        self.delivery.deliver(event).await;
        Ok(())
    }

    /// One source track's outcome on one platform
    pub async fn emit_track(&mut self, platform: Platform, position: usize, result: &MatchResult) -> ConvertResult<()> {
        self.check(&[Phase::MetadataSent], "track")?;

        let event = ConversionEvent::Track {
            task_id: self.task_id,
            run: self.run,
            sequence: self.take_sequence(),
            platform,
            payload: TrackPayload::from_match(position, result),
            timestamp: Utc::now(),
        };
        self.delivery.deliver(event).await;
        Ok(())
    }

    pub async fn emit_done(&mut self, summary: DoneSummary) -> ConvertResult<()> {
        self.check(&[Phase::MetadataSent], "done")?;

        let event = ConversionEvent::Done {
            task_id: self.task_id,
            run: self.run,
            sequence: self.take_sequence(),
            payload: summary,
            timestamp: Utc::now(),
        };
        self.phase = Phase::Terminated;
        self.delivery.deliver(event).await;
        Ok(())
    }

    /// Terminal error; allowed with or without a preceding metadata event
    pub async fn emit_error(&mut self, failure: TaskFailure) -> ConvertResult<()> {
        self.check(&[Phase::Start, Phase::MetadataSent], "error")?;

        let event = ConversionEvent::Error {
            task_id: self.task_id,
            run: self.run,
            sequence: self.take_sequence(),
            payload: failure,
            timestamp: Utc::now(),
        };
        self.phase = Phase::Terminated;
        self.delivery.deliver(event).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::EventBusDelivery;
    use std::collections::BTreeMap;
    use tunebridge_common::events::{EventBus, EventKind};
    use tunebridge_common::{CandidateTrack, ErrorKind};

    fn meta() -> PlaylistMetadata {
        PlaylistMetadata {
            platform: Platform::Deezer,
            external_id: "908622995".to_string(),
            title: "Road trip".to_string(),
            owner: None,
            description: None,
            cover_url: None,
            track_count: 1,
            last_updated: None,
            url: "https://www.deezer.com/playlist/908622995".to_string(),
            checksum: "sum".to_string(),
        }
    }

    fn result() -> MatchResult {
        let source = CandidateTrack {
            platform: Platform::Deezer,
            external_id: "3135556".to_string(),
            title: "Harder, Better, Faster, Stronger".to_string(),
            artists: vec!["Daft Punk".to_string()],
            duration_ms: 224_000,
            album: None,
            explicit: false,
            url: "https://www.deezer.com/track/3135556".to_string(),
            cover_url: None,
            preview_url: None,
            release_date: None,
        };
        MatchResult::omitted(Platform::Tidal, source, 0.0)
    }

    fn summary() -> DoneSummary {
        DoneSummary {
            checksum: "sum".to_string(),
            track_count: 1,
            matched: BTreeMap::new(),
            omitted: 1,
            short_url: None,
        }
    }

    fn emitter() -> (EventEmitter, EventBus) {
        let bus = EventBus::new(16);
        (EventEmitter::new(Arc::new(EventBusDelivery::new(bus.clone()))), bus)
    }

    #[tokio::test]
    async fn test_ordered_sequence_numbers() {
        let (emitter, bus) = emitter();
        let mut rx = bus.subscribe();
        let mut task = emitter.sequence(Uuid::new_v4(), 0).await;

        task.emit_metadata(&meta()).await.unwrap();
        task.emit_track(Platform::Tidal, 0, &result()).await.unwrap();
        task.emit_done(summary()).await.unwrap();
        assert!(task.is_terminated());

        let mut kinds = Vec::new();
        for expected in 0..3 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.sequence(), expected);
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec![EventKind::Metadata, EventKind::Track, EventKind::Done]);
    }

    #[tokio::test]
    async fn test_track_before_metadata_is_invariant_error() {
        let (emitter, _bus) = emitter();
        let mut task = emitter.sequence(Uuid::new_v4(), 0).await;

        let err = task.emit_track(Platform::Tidal, 0, &result()).await.unwrap_err();
        assert!(matches!(err, ConvertError::Invariant(_)));
    }

    #[tokio::test]
    async fn test_nothing_after_terminal() {
        let (emitter, _bus) = emitter();
        let mut task = emitter.sequence(Uuid::new_v4(), 0).await;

        task.emit_error(TaskFailure {
            kind: ErrorKind::TaskFatal,
            reason: "playlist not found".to_string(),
        })
        .await
        .unwrap();

        assert!(task.emit_metadata(&meta()).await.is_err());
        assert!(task.emit_done(summary()).await.is_err());
        assert!(task
            .emit_error(TaskFailure {
                kind: ErrorKind::TaskFatal,
                reason: "again".to_string(),
            })
            .await
            .is_err());
    }

    /// Webhook endpoint that accepts connections and never answers
    async fn silent_webhook() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{}/hook", addr)
    }

    #[tokio::test]
    async fn test_unresponsive_app_webhook_does_not_block_bus() {
        let (emitter, bus) = emitter();
        let mut rx = bus.subscribe();

        let mut app = DeveloperApp::new("app-1", "Demo", vec![Platform::Tidal]);
        app.webhook_url = Some(silent_webhook().await);
        let mut task = emitter.sequence_for(Uuid::new_v4(), 0, Some(&app)).await;

        let emitted = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            task.emit_metadata(&meta()).await.unwrap();
            for position in 0..10 {
                task.emit_track(Platform::Tidal, position, &result()).await.unwrap();
            }
            task.emit_done(summary()).await.unwrap();
        })
        .await;
        assert!(emitted.is_ok(), "emitting must not wait on the webhook");

        let mut kinds = Vec::new();
        for _ in 0..12 {
            kinds.push(rx.recv().await.unwrap().kind());
        }
        assert_eq!(kinds.first(), Some(&EventKind::Metadata));
        assert_eq!(kinds.last(), Some(&EventKind::Done));
    }

    #[tokio::test]
    async fn test_app_webhook_reused_across_runs() {
        let (emitter, _bus) = emitter();
        let url = silent_webhook().await;

        let first = emitter.app_webhook(Uuid::new_v4(), &url).await.unwrap();
        let second = emitter.app_webhook(Uuid::new_v4(), &url).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(emitter.app_webhooks.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_runs_are_stamped() {
        let (emitter, bus) = emitter();
        let mut rx = bus.subscribe();
        let task_id = Uuid::new_v4();

        let mut first = emitter.sequence(task_id, 0).await;
        first
            .emit_error(TaskFailure {
                kind: ErrorKind::Adapter,
                reason: "playlist unavailable".to_string(),
            })
            .await
            .unwrap();

        let mut retry = emitter.sequence(task_id, 1).await;
        assert_eq!(retry.run(), 1);
        retry.emit_metadata(&meta()).await.unwrap();

        let failed = rx.recv().await.unwrap();
        let restarted = rx.recv().await.unwrap();
        assert_eq!((failed.run(), failed.sequence()), (0, 0));
        assert_eq!((restarted.run(), restarted.sequence()), (1, 0));
        assert_ne!(failed.dedup_key(), restarted.dedup_key());
    }

    #[tokio::test]
    async fn test_done_requires_metadata() {
        let (emitter, _bus) = emitter();
        let mut task = emitter.sequence(Uuid::new_v4(), 0).await;
        assert!(matches!(task.emit_done(summary()).await, Err(ConvertError::Invariant(_))));
    }
}
