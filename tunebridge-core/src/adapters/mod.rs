//! Platform adapters
//!
//! One [`PlatformAdapter`] implementation per streaming platform, looked up by
//! [`Platform`] in the [`AdapterRegistry`].

pub mod deezer;
mod rate_limiter;
pub mod spotify;

pub use deezer::DeezerClient;
pub use spotify::SpotifyClient;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tunebridge_common::config::TomlConfig;
use tunebridge_common::{CandidateTrack, Platform, PlaylistMetadata, TrackQuery};

const USER_AGENT: &str = "TuneBridge/0.1.0";

/// Per-request limits of a bundled HTTP client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpLimits {
    /// Applies to each request on its own, so paginated reads never time out
    /// as a whole
    pub request_timeout: Duration,
    pub min_request_interval_ms: u64,
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            min_request_interval_ms: 100,
        }
    }
}

impl HttpLimits {
    fn client(&self) -> Result<reqwest::Client, AdapterError> {
        reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| AdapterError::Network(e.to_string()))
    }
}

/// Adapter errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// Platform outage (5xx, maintenance)
    #[error("Service unavailable: {0}")]
    ServiceClosed(String),

    /// No credentials or integration for this platform
    #[error("No credentials for {0}")]
    NoCredentials(Platform),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Request timed out")]
    Timeout,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Search failed: {0}")]
    SearchFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl AdapterError {
    /// Whether the call may succeed if repeated
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::ServiceClosed(_)
                | AdapterError::RateLimited
                | AdapterError::Timeout
                | AdapterError::Network(_)
        )
    }

    /// Map a transport error; reqwest timeouts become [`AdapterError::Timeout`]
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::Timeout
        } else if err.is_decode() {
            AdapterError::Parse(err.to_string())
        } else {
            AdapterError::Network(err.to_string())
        }
    }

    /// Map a non-success HTTP status
    pub(crate) fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        match status.as_u16() {
            404 => AdapterError::NotFound(context.to_string()),
            429 => AdapterError::RateLimited,
            401 | 403 => AdapterError::SearchFailed(format!("{}: HTTP {} (credentials rejected)", context, status)),
            500..=599 => AdapterError::ServiceClosed(format!("{}: HTTP {}", context, status)),
            _ => AdapterError::SearchFailed(format!("{}: HTTP {}", context, status)),
        }
    }
}

/// Capability set every platform implements
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Search the catalog; an empty result is not an error
    async fn search(&self, query: &TrackQuery) -> Result<Vec<CandidateTrack>, AdapterError>;

    async fn get_track(&self, external_id: &str) -> Result<CandidateTrack, AdapterError>;

    /// Playlist metadata and every track, in playlist order
    async fn get_playlist_tracks(
        &self,
        external_id: &str,
    ) -> Result<(PlaylistMetadata, Vec<CandidateTrack>), AdapterError>;
}

struct RegisteredAdapter {
    adapter: Arc<dyn PlatformAdapter>,
    in_flight: Arc<Semaphore>,
}

/// Adapters keyed by platform, each behind an in-flight call bound
pub struct AdapterRegistry {
    adapters: HashMap<Platform, RegisteredAdapter>,
    max_in_flight: usize,
}

impl AdapterRegistry {
    /// Empty registry allowing `max_in_flight` concurrent calls per platform
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            adapters: HashMap::new(),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Registry with the bundled clients enabled by `config`
    pub fn from_config(config: &TomlConfig) -> Result<Self, AdapterError> {
        let mut registry = Self::new(config.engine.platform_concurrency);
        let request_timeout = Duration::from_millis(config.engine.adapter_timeout_ms);

        if config.deezer.enabled {
            let limits = HttpLimits {
                request_timeout,
                min_request_interval_ms: config.deezer.min_request_interval_ms,
            };
            registry.register(Arc::new(DeezerClient::new(limits)?));
        }

        if config.spotify.is_configured() {
            let client_id = config.spotify.client_id.clone().unwrap_or_default();
            let client_secret = config.spotify.client_secret.clone().unwrap_or_default();
            let limits = HttpLimits {
                request_timeout,
                min_request_interval_ms: config.spotify.min_request_interval_ms,
            };
            registry.register(Arc::new(SpotifyClient::new(client_id, client_secret, limits)?));
        } else {
            tracing::info!("Spotify credentials not configured, Spotify adapter disabled");
        }

        Ok(registry)
    }

    /// Register (or replace) the adapter for its platform
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        let platform = adapter.platform();
        tracing::debug!(platform = %platform, "Registering platform adapter");
        self.adapters.insert(
            platform,
            RegisteredAdapter {
                adapter,
                in_flight: Arc::new(Semaphore::new(self.max_in_flight)),
            },
        );
    }

    pub fn contains(&self, platform: Platform) -> bool {
        self.adapters.contains_key(&platform)
    }

    /// Registered platforms in canonical order
    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.adapters.keys().copied().collect();
        platforms.sort();
        platforms
    }

    /// Adapter plus a permit for one in-flight call
    ///
    /// Unregistered platforms yield [`AdapterError::NoCredentials`].
    pub async fn acquire(
        &self,
        platform: Platform,
    ) -> Result<(Arc<dyn PlatformAdapter>, OwnedSemaphorePermit), AdapterError> {
        let entry = self
            .adapters
            .get(&platform)
            .ok_or(AdapterError::NoCredentials(platform))?;

        let permit = entry
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AdapterError::ServiceClosed(format!("{} adapter shut down", platform)))?;

        Ok((entry.adapter.clone(), permit))
    }
}
