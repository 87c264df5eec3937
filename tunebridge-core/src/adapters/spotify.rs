//! Spotify Web API client
//!
//! Uses the client-credentials flow: the access token is cached until shortly
//! before it expires and refreshed once if the API rejects it.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tunebridge_common::{CandidateTrack, Platform, PlaylistMetadata, TrackQuery};

use super::rate_limiter::RequestSpacer;
use super::{AdapterError, HttpLimits, PlatformAdapter};

const SPOTIFY_API_URL: &str = "https://api.spotify.com/v1";
const SPOTIFY_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const SEARCH_LIMIT: usize = 10;
/// Refresh this long before the reported expiry
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SpotifyImage {
    url: String,
}

#[derive(Debug, Deserialize)]
struct SpotifyExternalUrls {
    spotify: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpotifyAlbum {
    name: String,
    #[serde(default)]
    images: Vec<SpotifyImage>,
    release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrack {
    /// `None` for local files inside playlists
    id: Option<String>,
    name: String,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    explicit: bool,
    #[serde(default)]
    artists: Vec<SpotifyArtist>,
    album: Option<SpotifyAlbum>,
    external_urls: Option<SpotifyExternalUrls>,
    preview_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpotifyPaging<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    tracks: Option<SpotifyPaging<SpotifyTrack>>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    /// Removed or unavailable entries come back as `null`
    track: Option<SpotifyTrack>,
}

#[derive(Debug, Deserialize)]
struct SpotifyUser {
    display_name: Option<String>,
    id: String,
}

#[derive(Debug, Deserialize)]
struct SpotifyPlaylist {
    id: String,
    name: String,
    description: Option<String>,
    owner: Option<SpotifyUser>,
    #[serde(default)]
    images: Vec<SpotifyImage>,
    snapshot_id: Option<String>,
    external_urls: Option<SpotifyExternalUrls>,
    tracks: SpotifyPaging<PlaylistItem>,
}

impl SpotifyTrack {
    /// `None` for entries without a catalog ID
    fn into_candidate(self) -> Option<CandidateTrack> {
        let id = self.id?;
        let url = self
            .external_urls
            .and_then(|u| u.spotify)
            .unwrap_or_else(|| format!("https://open.spotify.com/track/{}", id));

        let (album, cover_url, release_date) = match self.album {
            Some(album) => (
                Some(album.name),
                album.images.into_iter().next().map(|i| i.url),
                album.release_date,
            ),
            None => (None, None, None),
        };

        Some(CandidateTrack {
            platform: Platform::Spotify,
            external_id: id,
            title: self.name,
            artists: self.artists.into_iter().map(|a| a.name).collect(),
            duration_ms: self.duration_ms,
            album,
            explicit: self.explicit,
            url,
            cover_url,
            preview_url: self.preview_url,
            release_date,
        })
    }
}

/// Spotify search syntax; quotes are dropped because field filters do not escape them
fn search_query(query: &TrackQuery) -> String {
    let clean = |s: &str| s.replace('"', "");
    if query.primary_artist().is_empty() {
        format!("track:{}", clean(&query.title))
    } else {
        format!("track:{} artist:{}", clean(&query.title), clean(query.primary_artist()))
    }
}

/// Spotify API client
pub struct SpotifyClient {
    http_client: reqwest::Client,
    spacer: RequestSpacer,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl SpotifyClient {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        limits: HttpLimits,
    ) -> Result<Self, AdapterError> {
        let client_id = client_id.into();
        let client_secret = client_secret.into();
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(AdapterError::NoCredentials(Platform::Spotify));
        }

        Ok(Self {
            http_client: limits.client()?,
            spacer: RequestSpacer::new(limits.min_request_interval_ms),
            client_id,
            client_secret,
            token: Mutex::new(None),
        })
    }

    /// Cached access token, fetching a new one when missing or about to expire
    async fn access_token(&self) -> Result<String, AdapterError> {
        let mut cached = self.token.lock().await;

        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_EXPIRY_MARGIN < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        tracing::debug!("Requesting Spotify access token");

        let credentials = BASE64.encode(format!("{}:{}", self.client_id, self.client_secret));
        let response = self
            .http_client
            .post(SPOTIFY_TOKEN_URL)
            .header(reqwest::header::AUTHORIZATION, format!("Basic {}", credentials))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(AdapterError::from_reqwest)?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED {
            tracing::warn!(status = %status, "Spotify rejected client credentials");
            return Err(AdapterError::NoCredentials(Platform::Spotify));
        }
        if !status.is_success() {
            return Err(AdapterError::from_status(status, "token"));
        }

        let token: TokenResponse = response.json().await.map_err(AdapterError::from_reqwest)?;
        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });

        Ok(access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        context: &str,
    ) -> Result<T, AdapterError> {
        // second attempt only after a 401 with a fresh token
        for attempt in 0..2 {
            let token = self.access_token().await?;
            self.spacer.acquire().await;

            tracing::debug!(url = %url, "Querying Spotify API");

            let response = self
                .http_client
                .get(url)
                .bearer_auth(&token)
                .query(query)
                .send()
                .await
                .map_err(AdapterError::from_reqwest)?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                tracing::debug!("Spotify token rejected, refreshing");
                self.invalidate_token().await;
                continue;
            }
            if !status.is_success() {
                return Err(AdapterError::from_status(status, context));
            }

            return response.json().await.map_err(AdapterError::from_reqwest);
        }

        Err(AdapterError::NoCredentials(Platform::Spotify))
    }
}

#[async_trait]
impl PlatformAdapter for SpotifyClient {
    fn platform(&self) -> Platform {
        Platform::Spotify
    }

    async fn search(&self, query: &TrackQuery) -> Result<Vec<CandidateTrack>, AdapterError> {
        let response: SearchResponse = self
            .get_json(
                &format!("{}/search", SPOTIFY_API_URL),
                &[
                    ("q", search_query(query)),
                    ("type", "track".to_string()),
                    ("limit", SEARCH_LIMIT.to_string()),
                ],
                "search",
            )
            .await?;

        Ok(response
            .tracks
            .map(|page| page.items)
            .unwrap_or_default()
            .into_iter()
            .filter_map(SpotifyTrack::into_candidate)
            .collect())
    }

    async fn get_track(&self, external_id: &str) -> Result<CandidateTrack, AdapterError> {
        let context = format!("track {}", external_id);
        let track: SpotifyTrack = self
            .get_json(&format!("{}/tracks/{}", SPOTIFY_API_URL, external_id), &[], &context)
            .await?;
        track.into_candidate().ok_or(AdapterError::NotFound(context))
    }

    async fn get_playlist_tracks(
        &self,
        external_id: &str,
    ) -> Result<(PlaylistMetadata, Vec<CandidateTrack>), AdapterError> {
        let context = format!("playlist {}", external_id);
        let playlist: SpotifyPlaylist = self
            .get_json(&format!("{}/playlists/{}", SPOTIFY_API_URL, external_id), &[], &context)
            .await?;

        let mut tracks: Vec<CandidateTrack> = playlist
            .tracks
            .items
            .into_iter()
            .filter_map(|item| item.track.and_then(SpotifyTrack::into_candidate))
            .collect();

        let mut next = playlist.tracks.next;
        while let Some(page_url) = next {
            let page: SpotifyPaging<PlaylistItem> = self.get_json(&page_url, &[], &context).await?;
            tracks.extend(
                page.items
                    .into_iter()
                    .filter_map(|item| item.track.and_then(SpotifyTrack::into_candidate)),
            );
            next = page.next;
        }

        tracing::info!(
            playlist_id = %external_id,
            title = %playlist.name,
            tracks = tracks.len(),
            "Retrieved playlist from Spotify"
        );

        let meta = PlaylistMetadata {
            platform: Platform::Spotify,
            url: playlist
                .external_urls
                .and_then(|u| u.spotify)
                .unwrap_or_else(|| format!("https://open.spotify.com/playlist/{}", playlist.id)),
            external_id: playlist.id,
            title: playlist.name,
            owner: playlist.owner.map(|o| o.display_name.unwrap_or(o.id)),
            description: playlist.description.filter(|d| !d.is_empty()),
            cover_url: playlist.images.into_iter().next().map(|i| i.url),
            track_count: tracks.len(),
            last_updated: playlist.snapshot_id,
            checksum: String::new(),
        };

        Ok((meta, tracks))
    }
}
