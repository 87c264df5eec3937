//! Configuration loading and resolution
//!
//! Configuration file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. `TUNEBRIDGE_CONFIG` environment variable
//! 3. `<config dir>/tunebridge/config.toml`
//! 4. Compiled defaults (fallback, also used when the file is missing)
//!
//! Secrets may additionally be overridden from the environment
//! (`TUNEBRIDGE_SPOTIFY_CLIENT_ID`, `TUNEBRIDGE_SPOTIFY_CLIENT_SECRET`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "TUNEBRIDGE_CONFIG";
pub const LOG_LEVEL_ENV_VAR: &str = "TUNEBRIDGE_LOG_LEVEL";
pub const SPOTIFY_CLIENT_ID_ENV_VAR: &str = "TUNEBRIDGE_SPOTIFY_CLIENT_ID";
pub const SPOTIFY_CLIENT_SECRET_ENV_VAR: &str = "TUNEBRIDGE_SPOTIFY_CLIENT_SECRET";

/// Top-level TOML configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Base URL used to build short links for finished playlist conversions
    #[serde(default)]
    pub short_url_base: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub matcher: MatcherSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub tasks: TaskSettings,
    #[serde(default)]
    pub spotify: SpotifyConfig,
    #[serde(default)]
    pub deezer: DeezerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter (`trace`, `debug`, `info`, `warn`, `error`)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit ANSI colors on the console
    #[serde(default = "default_true")]
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            ansi: true,
        }
    }
}

/// Task store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file; defaults to the platform data directory
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Maximum time a write keeps retrying while SQLite reports lock contention
    #[serde(default = "default_max_lock_wait_ms")]
    pub max_lock_wait_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_lock_wait_ms: default_max_lock_wait_ms(),
        }
    }
}

impl DatabaseConfig {
    /// Configured path, or the OS-dependent default
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(default_database_path)
    }
}

/// Matcher scoring weights and acceptance threshold
///
/// Score = (title_weight × title similarity + artist_weight × artist overlap)
/// / (title_weight + artist_weight). Duration only breaks ties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherSettings {
    #[serde(default = "default_title_weight")]
    pub title_weight: f64,
    #[serde(default = "default_artist_weight")]
    pub artist_weight: f64,
    /// Minimum score (0.0-1.0) for a candidate to be accepted
    #[serde(default = "default_acceptance_threshold")]
    pub acceptance_threshold: f64,
    /// Durations further apart than this are treated as "no proximity"
    #[serde(default = "default_duration_tolerance_ms")]
    pub duration_tolerance_ms: u64,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            title_weight: default_title_weight(),
            artist_weight: default_artist_weight(),
            acceptance_threshold: default_acceptance_threshold(),
            duration_tolerance_ms: default_duration_tolerance_ms(),
        }
    }
}

/// Conversion pipeline tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Source tracks converted concurrently within one playlist
    #[serde(default = "default_track_concurrency")]
    pub track_concurrency: usize,
    /// In-flight adapter calls per platform, across all conversions
    #[serde(default = "default_platform_concurrency")]
    pub platform_concurrency: usize,
    /// Timeout of one platform request; a paginated playlist read applies it
    /// per page
    #[serde(default = "default_adapter_timeout_ms")]
    pub adapter_timeout_ms: u64,
    /// Re-attempts of a transient adapter failure before giving up on the item
    #[serde(default = "default_max_adapter_retries")]
    pub max_adapter_retries: u32,
    /// Initial backoff between adapter re-attempts (doubles each time)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            track_concurrency: default_track_concurrency(),
            platform_concurrency: default_platform_concurrency(),
            adapter_timeout_ms: default_adapter_timeout_ms(),
            max_adapter_retries: default_max_adapter_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Task tracker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    /// Resubmissions allowed for a failed task
    #[serde(default = "default_max_task_retries")]
    pub max_retries: u32,
    /// A processing task whose owner has not renewed it for this long is
    /// considered abandoned and may be failed or cancelled by anyone
    #[serde(default = "default_task_lease_ms")]
    pub lease_ms: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_task_retries(),
            lease_ms: default_task_lease_ms(),
        }
    }
}

/// Spotify client-credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotifyConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Minimum spacing between two Spotify API requests
    #[serde(default = "default_spotify_interval_ms")]
    pub min_request_interval_ms: u64,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            min_request_interval_ms: default_spotify_interval_ms(),
        }
    }
}

impl SpotifyConfig {
    /// Both halves of the credentials are present and non-blank
    pub fn is_configured(&self) -> bool {
        matches!(
            (&self.client_id, &self.client_secret),
            (Some(id), Some(secret)) if is_valid_key(id) && is_valid_key(secret)
        )
    }
}

/// Deezer public API settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeezerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum spacing between two Deezer API requests (50 per 5 s allowed)
    #[serde(default = "default_deezer_interval_ms")]
    pub min_request_interval_ms: u64,
}

impl Default for DeezerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_request_interval_ms: default_deezer_interval_ms(),
        }
    }
}

/// Event delivery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Webhook receiving every conversion event as a JSON POST
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Attempts per event before the webhook delivery gives up
    #[serde(default = "default_webhook_attempts")]
    pub webhook_attempts: u32,
    /// Per-subscriber buffer of the in-process event bus
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_attempts: default_webhook_attempts(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_lock_wait_ms() -> u64 {
    5000
}
fn default_title_weight() -> f64 {
    0.6
}
fn default_artist_weight() -> f64 {
    0.4
}
fn default_acceptance_threshold() -> f64 {
    0.7
}
fn default_duration_tolerance_ms() -> u64 {
    5000
}
fn default_track_concurrency() -> usize {
    4
}
fn default_platform_concurrency() -> usize {
    8
}
fn default_adapter_timeout_ms() -> u64 {
    10_000
}
fn default_max_adapter_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_max_task_retries() -> u32 {
    3
}
fn default_task_lease_ms() -> u64 {
    60_000
}
fn default_spotify_interval_ms() -> u64 {
    100
}
fn default_deezer_interval_ms() -> u64 {
    100
}
fn default_webhook_attempts() -> u32 {
    3
}
fn default_event_bus_capacity() -> usize {
    1024
}

/// Validate a secret value (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

impl TomlConfig {
    /// Apply environment overrides on top of file values
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV_VAR) {
            if is_valid_key(&level) {
                debug!("Log level overridden from environment");
                self.logging.level = level;
            }
        }

        if let Ok(id) = std::env::var(SPOTIFY_CLIENT_ID_ENV_VAR) {
            if is_valid_key(&id) {
                if self.spotify.client_id.is_some() {
                    warn!("Spotify client_id found in both TOML and environment. Using environment.");
                }
                self.spotify.client_id = Some(id);
            }
        }

        if let Ok(secret) = std::env::var(SPOTIFY_CLIENT_SECRET_ENV_VAR) {
            if is_valid_key(&secret) {
                self.spotify.client_secret = Some(secret);
            }
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let m = &self.matcher;
        if m.title_weight < 0.0 || m.artist_weight < 0.0 {
            return Err(Error::Config("matcher weights must be non-negative".to_string()));
        }
        if m.title_weight + m.artist_weight <= 0.0 {
            return Err(Error::Config("matcher weights must not both be zero".to_string()));
        }
        if !(0.0..=1.0).contains(&m.acceptance_threshold) {
            return Err(Error::Config(format!(
                "matcher.acceptance_threshold must be within 0.0-1.0, got {}",
                m.acceptance_threshold
            )));
        }
        if self.engine.track_concurrency == 0 || self.engine.platform_concurrency == 0 {
            return Err(Error::Config("engine concurrency limits must be at least 1".to_string()));
        }
        if self.tasks.lease_ms == 0 {
            return Err(Error::Config("tasks.lease_ms must be at least 1".to_string()));
        }
        if self.delivery.event_bus_capacity == 0 {
            return Err(Error::Config("delivery.event_bus_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Default location of the user configuration file
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tunebridge").join("config.toml"))
}

/// OS-dependent default task database path
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("tunebridge").join("tunebridge.db"))
        .unwrap_or_else(|| PathBuf::from("./tunebridge_data/tunebridge.db"))
}

/// Resolve which config file to read, following the priority order above
///
/// Returns `None` when no explicit file was named and no default file exists.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if is_valid_key(&path) {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Default location, only if present
    default_config_path().filter(|p| p.exists())
}

/// Load configuration, falling back to defaults when no file is available
///
/// A missing file is not an error (warning + defaults). A file that exists but
/// does not parse, or values that fail validation, are errors.
pub fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    let mut config = match resolve_config_path(cli_arg) {
        Some(path) if path.exists() => {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
            let config: TomlConfig = toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;
            info!("Configuration loaded from {}", path.display());
            config
        }
        Some(path) => {
            warn!(
                "Config file {} not found, using defaults",
                path.display()
            );
            TomlConfig::default()
        }
        None => {
            debug!("No config file found, using defaults");
            TomlConfig::default()
        }
    };

    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Write a configuration file atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;

    Ok(())
}
