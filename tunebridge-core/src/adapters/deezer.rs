//! Deezer public API client
//!
//! No credentials required. Deezer reports most errors in-body with HTTP 200,
//! so every response is checked for an `error` object before decoding.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tunebridge_common::{CandidateTrack, Platform, PlaylistMetadata, TrackQuery};

use super::rate_limiter::RequestSpacer;
use super::{AdapterError, HttpLimits, PlatformAdapter};

const DEEZER_BASE_URL: &str = "https://api.deezer.com";
const SEARCH_LIMIT: usize = 10;
const PAGE_SIZE: usize = 100;

/// Deezer in-body error codes
const ERROR_QUOTA: u32 = 4;
const ERROR_SERVICE_BUSY: u32 = 700;
const ERROR_DATA_NOT_FOUND: u32 = 800;

#[derive(Debug, Deserialize)]
struct DeezerError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct DeezerArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct DeezerAlbum {
    title: String,
    cover_xl: Option<String>,
    cover_big: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeezerTrack {
    id: u64,
    title: String,
    /// Seconds
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    preview: Option<String>,
    #[serde(default)]
    explicit_lyrics: bool,
    artist: DeezerArtist,
    /// Only present on full track lookups
    #[serde(default)]
    contributors: Vec<DeezerArtist>,
    album: Option<DeezerAlbum>,
    #[serde(default)]
    release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeezerPage<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeezerUser {
    name: String,
}

#[derive(Debug, Deserialize)]
struct DeezerPlaylist {
    id: u64,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    nb_tracks: usize,
    picture_xl: Option<String>,
    link: Option<String>,
    creator: Option<DeezerUser>,
    /// Deezer's content checksum; changes whenever the track list changes
    checksum: Option<String>,
}

impl DeezerTrack {
    fn into_candidate(self) -> CandidateTrack {
        // contributors include the main artist first when present
        let artists = if self.contributors.is_empty() {
            vec![self.artist.name]
        } else {
            self.contributors.into_iter().map(|a| a.name).collect()
        };

        let (album, cover_url) = match self.album {
            Some(album) => (Some(album.title), album.cover_xl.or(album.cover_big)),
            None => (None, None),
        };

        CandidateTrack {
            platform: Platform::Deezer,
            url: self
                .link
                .unwrap_or_else(|| format!("https://www.deezer.com/track/{}", self.id)),
            external_id: self.id.to_string(),
            title: self.title,
            artists,
            duration_ms: self.duration * 1000,
            album,
            explicit: self.explicit_lyrics,
            cover_url,
            preview_url: self.preview.filter(|p| !p.is_empty()),
            release_date: self.release_date,
        }
    }
}

fn map_deezer_error(error: DeezerError, context: &str) -> AdapterError {
    match error.code {
        ERROR_QUOTA => AdapterError::RateLimited,
        ERROR_SERVICE_BUSY => AdapterError::ServiceClosed(error.message),
        ERROR_DATA_NOT_FOUND => AdapterError::NotFound(context.to_string()),
        code => AdapterError::SearchFailed(format!("{}: Deezer error {}: {}", context, code, error.message)),
    }
}

/// Decode a Deezer response body, surfacing in-body errors
fn decode<T: DeserializeOwned>(body: serde_json::Value, context: &str) -> Result<T, AdapterError> {
    if let Some(error) = body.get("error") {
        let error: DeezerError = serde_json::from_value(error.clone())
            .map_err(|e| AdapterError::Parse(e.to_string()))?;
        return Err(map_deezer_error(error, context));
    }
    serde_json::from_value(body).map_err(|e| AdapterError::Parse(format!("{}: {}", context, e)))
}

/// Deezer API client
pub struct DeezerClient {
    http_client: reqwest::Client,
    spacer: RequestSpacer,
    base_url: String,
}

impl DeezerClient {
    pub fn new(limits: HttpLimits) -> Result<Self, AdapterError> {
        Self::with_base_url(DEEZER_BASE_URL, limits)
    }

    /// Client against a different API root (proxies, local fakes)
    pub fn with_base_url(base_url: impl Into<String>, limits: HttpLimits) -> Result<Self, AdapterError> {
        Ok(Self {
            http_client: limits.client()?,
            spacer: RequestSpacer::new(limits.min_request_interval_ms),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        context: &str,
    ) -> Result<T, AdapterError> {
        self.spacer.acquire().await;

        tracing::debug!(url = %url, "Querying Deezer API");

        let response = self
            .http_client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(AdapterError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::from_status(status, context));
        }

        let body: serde_json::Value = response.json().await.map_err(AdapterError::from_reqwest)?;
        decode(body, context)
    }
}

#[async_trait]
impl PlatformAdapter for DeezerClient {
    fn platform(&self) -> Platform {
        Platform::Deezer
    }

    async fn search(&self, query: &TrackQuery) -> Result<Vec<CandidateTrack>, AdapterError> {
        let q = if query.primary_artist().is_empty() {
            format!("track:\"{}\"", query.title)
        } else {
            format!("artist:\"{}\" track:\"{}\"", query.primary_artist(), query.title)
        };

        let page: DeezerPage<DeezerTrack> = self
            .get_json(
                &format!("{}/search", self.base_url),
                &[("q", q), ("limit", SEARCH_LIMIT.to_string())],
                "search",
            )
            .await?;

        Ok(page.data.into_iter().map(DeezerTrack::into_candidate).collect())
    }

    async fn get_track(&self, external_id: &str) -> Result<CandidateTrack, AdapterError> {
        let track: DeezerTrack = self
            .get_json(
                &format!("{}/track/{}", self.base_url, external_id),
                &[],
                &format!("track {}", external_id),
            )
            .await?;
        Ok(track.into_candidate())
    }

    async fn get_playlist_tracks(
        &self,
        external_id: &str,
    ) -> Result<(PlaylistMetadata, Vec<CandidateTrack>), AdapterError> {
        let context = format!("playlist {}", external_id);
        let playlist: DeezerPlaylist = self
            .get_json(&format!("{}/playlist/{}", self.base_url, external_id), &[], &context)
            .await?;

        // the embedded first page is truncated for large playlists; page explicitly
        let mut tracks = Vec::with_capacity(playlist.nb_tracks);
        let mut index = 0;
        loop {
            let page: DeezerPage<DeezerTrack> = self
                .get_json(
                    &format!("{}/playlist/{}/tracks", self.base_url, external_id),
                    &[("index", index.to_string()), ("limit", PAGE_SIZE.to_string())],
                    &context,
                )
                .await?;

            let fetched = page.data.len();
            tracks.extend(page.data.into_iter().map(DeezerTrack::into_candidate));
            index += fetched;

            if page.next.is_none() || fetched == 0 {
                break;
            }
        }

        tracing::info!(
            playlist_id = %external_id,
            title = %playlist.title,
            tracks = tracks.len(),
            "Retrieved playlist from Deezer"
        );

        let meta = PlaylistMetadata {
            platform: Platform::Deezer,
            external_id: playlist.id.to_string(),
            title: playlist.title,
            owner: playlist.creator.map(|c| c.name),
            description: playlist.description.filter(|d| !d.is_empty()),
            cover_url: playlist.picture_xl,
            track_count: tracks.len(),
            last_updated: playlist.checksum,
            url: playlist
                .link
                .unwrap_or_else(|| format!("https://www.deezer.com/playlist/{}", playlist.id)),
            checksum: String::new(),
        };

        Ok((meta, tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_track_mapping() {
        let body = json!({
            "id": 3135556,
            "title": "Harder, Better, Faster, Stronger",
            "duration": 224,
            "link": "https://www.deezer.com/track/3135556",
            "preview": "https://cdns-preview-d.dzcdn.net/stream/c-1.mp3",
            "explicit_lyrics": false,
            "release_date": "2001-03-07",
            "artist": { "name": "Daft Punk" },
            "contributors": [{ "name": "Daft Punk" }],
            "album": { "title": "Discovery", "cover_xl": "https://e-cdns-images.dzcdn.net/cover.jpg" }
        });

        let track: DeezerTrack = decode(body, "track").unwrap();
        let candidate = track.into_candidate();

        assert_eq!(candidate.platform, Platform::Deezer);
        assert_eq!(candidate.external_id, "3135556");
        assert_eq!(candidate.duration_ms, 224_000);
        assert_eq!(candidate.artists, vec!["Daft Punk".to_string()]);
        assert_eq!(candidate.album.as_deref(), Some("Discovery"));
        assert_eq!(candidate.release_date.as_deref(), Some("2001-03-07"));
    }

    #[test]
    fn test_search_result_without_contributors_uses_main_artist() {
        let body = json!({
            "data": [{
                "id": 1,
                "title": "One More Time",
                "duration": 320,
                "artist": { "name": "Daft Punk" }
            }],
            "total": 1
        });

        let page: DeezerPage<DeezerTrack> = decode(body, "search").unwrap();
        let candidates: Vec<_> = page.data.into_iter().map(DeezerTrack::into_candidate).collect();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].artists, vec!["Daft Punk".to_string()]);
        assert_eq!(candidates[0].url, "https://www.deezer.com/track/1");
        assert!(page.next.is_none());
    }

    #[test]
    fn test_in_body_errors_are_mapped() {
        let quota = json!({ "error": { "type": "Exception", "message": "Quota limit exceeded", "code": 4 } });
        let err = decode::<DeezerTrack>(quota, "track 1").unwrap_err();
        assert_eq!(err, AdapterError::RateLimited);

        let missing = json!({ "error": { "type": "DataException", "message": "no data", "code": 800 } });
        let err = decode::<DeezerTrack>(missing, "track 1").unwrap_err();
        assert_eq!(err, AdapterError::NotFound("track 1".to_string()));

        let other = json!({ "error": { "type": "ParameterException", "message": "Wrong parameter", "code": 500 } });
        let err = decode::<DeezerTrack>(other, "track 1").unwrap_err();
        assert!(matches!(err, AdapterError::SearchFailed(_)));
    }
}
