//! Shared fixtures for engine integration tests
//!
//! Mock adapters with call counters and failure injection, and a delivery
//! transport that records every event.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tunebridge_common::config::{EngineSettings, MatcherSettings};
use tunebridge_common::events::ConversionEvent;
use tunebridge_common::{CandidateTrack, Platform, PlaylistMetadata, TrackQuery};
use uuid::Uuid;

use tunebridge_core::adapters::{AdapterError, AdapterRegistry, PlatformAdapter};
use tunebridge_core::db::{MemoryTaskStore, TaskStore};
use tunebridge_core::delivery::Delivery;
use tunebridge_core::services::{ConversionEngine, EventEmitter, Matcher, TaskTracker};

pub fn track(platform: Platform, id: &str, title: &str, artist: &str, duration_ms: u64) -> CandidateTrack {
    CandidateTrack {
        platform,
        external_id: id.to_string(),
        title: title.to_string(),
        artists: vec![artist.to_string()],
        duration_ms,
        album: None,
        explicit: false,
        url: format!("https://{}.example/track/{}", platform, id),
        cover_url: None,
        preview_url: None,
        release_date: None,
    }
}

/// The three-track Deezer playlist used across tests
pub fn road_trip_tracks() -> Vec<CandidateTrack> {
    vec![
        track(Platform::Deezer, "dz1", "Harder, Better, Faster, Stronger", "Daft Punk", 224_000),
        track(Platform::Deezer, "dz2", "Midnight City", "M83", 243_000),
        track(Platform::Deezer, "dz3", "Obscure B-Side Nobody Has", "Unknown Garage Band", 180_000),
    ]
}

/// Tidal catalog holding the first two road trip tracks
pub fn tidal_catalog() -> Vec<CandidateTrack> {
    vec![
        track(Platform::Tidal, "td1", "Harder, Better, Faster, Stronger", "Daft Punk", 224_500),
        track(Platform::Tidal, "td2", "Midnight City", "M83", 243_000),
        track(Platform::Tidal, "td9", "One More Time", "Daft Punk", 320_000),
    ]
}

pub fn playlist_meta(id: &str, title: &str) -> PlaylistMetadata {
    PlaylistMetadata {
        platform: Platform::Deezer,
        external_id: id.to_string(),
        title: title.to_string(),
        owner: Some("tester".to_string()),
        description: None,
        cover_url: None,
        track_count: 0,
        last_updated: None,
        url: format!("https://www.deezer.com/playlist/{}", id),
        checksum: String::new(),
    }
}

/// In-memory platform with scripted catalog and failures
pub struct MockAdapter {
    platform: Platform,
    catalog: Vec<CandidateTrack>,
    playlists: HashMap<String, (PlaylistMetadata, Vec<CandidateTrack>)>,
    failing_titles: Mutex<HashSet<String>>,
    playlist_failure: Mutex<Option<AdapterError>>,
    search_gate: Option<Arc<Semaphore>>,
    page_delay: Option<Duration>,
    pub search_calls: AtomicUsize,
    pub track_calls: AtomicUsize,
    pub playlist_calls: AtomicUsize,
}

impl MockAdapter {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            catalog: Vec::new(),
            playlists: HashMap::new(),
            failing_titles: Mutex::new(HashSet::new()),
            playlist_failure: Mutex::new(None),
            search_gate: None,
            page_delay: None,
            search_calls: AtomicUsize::new(0),
            track_calls: AtomicUsize::new(0),
            playlist_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_catalog(mut self, catalog: Vec<CandidateTrack>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_playlist(mut self, meta: PlaylistMetadata, tracks: Vec<CandidateTrack>) -> Self {
        self.catalog.extend(tracks.iter().cloned());
        self.playlists.insert(meta.external_id.clone(), (meta, tracks));
        self
    }

    /// Every search waits for a permit from `gate` first
    pub fn with_search_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.search_gate = Some(gate);
        self
    }

    /// Playlist reads take `delay` per track, as if paged one track at a time
    pub fn with_playlist_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = Some(delay);
        self
    }

    pub fn fail_search_for(&self, title: &str) {
        self.failing_titles.lock().unwrap().insert(title.to_string());
    }

    pub fn fail_playlist_with(&self, error: Option<AdapterError>) {
        *self.playlist_failure.lock().unwrap() = error;
    }

    pub fn searches(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn playlist_fetches(&self) -> usize {
        self.playlist_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn search(&self, query: &TrackQuery) -> Result<Vec<CandidateTrack>, AdapterError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.search_gate {
            let permit = gate.acquire().await.map_err(|e| AdapterError::Network(e.to_string()))?;
            permit.forget();
        }

        if self.failing_titles.lock().unwrap().contains(&query.title) {
            return Err(AdapterError::SearchFailed(format!("scripted failure for {}", query.title)));
        }

        let wanted = query.title.to_lowercase();
        Ok(self
            .catalog
            .iter()
            .filter(|t| t.title.to_lowercase() == wanted)
            .cloned()
            .collect())
    }

    async fn get_track(&self, id: &str) -> Result<CandidateTrack, AdapterError> {
        self.track_calls.fetch_add(1, Ordering::SeqCst);
        self.catalog
            .iter()
            .find(|t| t.external_id == id)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("track {}", id)))
    }

    async fn get_playlist_tracks(&self, id: &str) -> Result<(PlaylistMetadata, Vec<CandidateTrack>), AdapterError> {
        self.playlist_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.playlist_failure.lock().unwrap().clone() {
            return Err(error);
        }

        let (meta, tracks) = self
            .playlists
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("playlist {}", id)))?;

        if let Some(delay) = self.page_delay {
            for _ in &tracks {
                tokio::time::sleep(delay).await;
            }
        }
        Ok((meta, tracks))
    }
}

/// Delivery transport that keeps every event in order of arrival
#[derive(Default)]
pub struct RecordingDelivery {
    events: Mutex<Vec<ConversionEvent>>,
    notify: Notify,
}

impl RecordingDelivery {
    pub fn events(&self) -> Vec<ConversionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, task_id: Uuid) -> Vec<ConversionEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.task_id() == task_id)
            .collect()
    }

    fn terminal_count(&self, task_id: Uuid) -> usize {
        self.events_for(task_id).iter().filter(|e| e.is_terminal()).count()
    }

    /// Wait until `task_id` has emitted `count` terminal events
    pub async fn wait_for_terminals(&self, task_id: Uuid, count: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let notified = self.notify.notified();
                if self.terminal_count(task_id) >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {} terminal event(s) of {}", count, task_id);
    }

    pub async fn wait_for_terminal(&self, task_id: Uuid) {
        self.wait_for_terminals(task_id, 1).await;
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn deliver(&self, event: ConversionEvent) {
        self.events.lock().unwrap().push(event);
        self.notify.notify_waiters();
    }
}

pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        track_concurrency: 2,
        platform_concurrency: 4,
        adapter_timeout_ms: 5_000,
        max_adapter_retries: 1,
        retry_backoff_ms: 1,
    }
}

/// Engine over the given adapters with an in-memory store
pub fn build_engine(
    adapters: Vec<Arc<dyn PlatformAdapter>>,
    settings: EngineSettings,
    max_retries: u32,
) -> (Arc<ConversionEngine>, Arc<RecordingDelivery>) {
    build_engine_with_store(adapters, settings, max_retries, Arc::new(MemoryTaskStore::new()))
}

pub fn build_engine_with_store(
    adapters: Vec<Arc<dyn PlatformAdapter>>,
    settings: EngineSettings,
    max_retries: u32,
    store: Arc<dyn TaskStore>,
) -> (Arc<ConversionEngine>, Arc<RecordingDelivery>) {
    build_engine_with_lease(adapters, settings, max_retries, store, Duration::from_secs(60))
}

/// Engine whose tasks count as abandoned after `lease` without renewal
pub fn build_engine_with_lease(
    adapters: Vec<Arc<dyn PlatformAdapter>>,
    settings: EngineSettings,
    max_retries: u32,
    store: Arc<dyn TaskStore>,
    lease: Duration,
) -> (Arc<ConversionEngine>, Arc<RecordingDelivery>) {
    let mut registry = AdapterRegistry::new(settings.platform_concurrency);
    for adapter in adapters {
        registry.register(adapter);
    }

    let delivery = Arc::new(RecordingDelivery::default());
    let tracker = TaskTracker::new(store, max_retries).with_lease(lease);
    let engine = ConversionEngine::new(
        Arc::new(registry),
        Matcher::new(MatcherSettings::default()),
        Arc::new(tracker),
        EventEmitter::new(delivery.clone()),
        settings,
    );

    (Arc::new(engine), delivery)
}
