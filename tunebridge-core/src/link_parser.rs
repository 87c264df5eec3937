//! Link parser
//!
//! Normalizes a raw platform URL into a [`LinkInfo`]. Deezer share links
//! (`deezer.page.link`, `link.deezer.com`) hide the entity behind one redirect,
//! which is resolved through a [`RedirectResolver`] before parsing.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tunebridge_common::{EntityKind, Platform};
use url::Url;

use crate::models::LinkInfo;

const USER_AGENT: &str = "TuneBridge/0.1.0";

/// Link parse errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkParseError {
    /// Host is not a supported streaming platform
    #[error("Host not supported: {0}")]
    HostUnsupported(String),

    /// Supported host, but the path does not name a track, album or playlist
    #[error("Invalid link: {0}")]
    InvalidLink(String),

    /// Short link redirect could not be followed
    #[error("Could not resolve short link {url}: {reason}")]
    Unresolvable { url: String, reason: String },
}

/// Follows exactly one redirect hop
#[async_trait]
pub trait RedirectResolver: Send + Sync {
    /// Return the redirect target of `url`
    async fn resolve(&self, url: &Url) -> Result<Url, String>;
}

/// Redirect resolver issuing a GET with redirects disabled and reading `Location`
pub struct HttpRedirectResolver {
    http_client: reqwest::Client,
}

impl HttpRedirectResolver {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl RedirectResolver for HttpRedirectResolver {
    async fn resolve(&self, url: &Url) -> Result<Url, String> {
        tracing::debug!(url = %url, "Resolving short link");

        let response = self
            .http_client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_redirection() {
            return Err(format!("expected redirect, got HTTP {}", response.status()));
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| "redirect without Location header".to_string())?;

        url.join(location).map_err(|e| e.to_string())
    }
}

/// Parses platform links, resolving share-link indirection when needed
pub struct LinkParser {
    resolver: Arc<dyn RedirectResolver>,
}

impl LinkParser {
    pub fn new(resolver: Arc<dyn RedirectResolver>) -> Self {
        Self { resolver }
    }

    /// Parse a raw link
    ///
    /// Accepts URLs with or without scheme and `spotify:{kind}:{id}` URIs.
    pub async fn parse(&self, raw: &str) -> Result<LinkInfo, LinkParseError> {
        let raw = raw.trim();

        if let Some(rest) = raw.strip_prefix("spotify:") {
            return parse_spotify_uri(raw, rest);
        }

        let url = normalize(raw)?;

        if is_deezer_short_host(host_of(&url)?) {
            let resolved = self
                .resolver
                .resolve(&url)
                .await
                .map_err(|reason| LinkParseError::Unresolvable {
                    url: url.to_string(),
                    reason,
                })?;

            tracing::debug!(short = %url, resolved = %resolved, "Deezer short link resolved");

            if is_deezer_short_host(host_of(&resolved)?) {
                return Err(LinkParseError::InvalidLink(format!(
                    "short link {} redirects to another short link",
                    url
                )));
            }
            return parse_url(&resolved);
        }

        parse_url(&url)
    }
}

fn normalize(raw: &str) -> Result<Url, LinkParseError> {
    if raw.is_empty() {
        return Err(LinkParseError::InvalidLink("empty link".to_string()));
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };
    Url::parse(&with_scheme).map_err(|e| LinkParseError::InvalidLink(format!("{}: {}", raw, e)))
}

fn host_of(url: &Url) -> Result<&str, LinkParseError> {
    url.host_str()
        .ok_or_else(|| LinkParseError::InvalidLink(format!("{} has no host", url)))
}

fn is_deezer_short_host(host: &str) -> bool {
    matches!(host, "deezer.page.link" | "link.deezer.com")
}

/// Parse an already-resolved URL (no network access)
pub fn parse_url(url: &Url) -> Result<LinkInfo, LinkParseError> {
    let host = host_of(url)?;
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    let (platform, kind, entity_id) = match host {
        "open.spotify.com" | "play.spotify.com" => {
            let (kind, id) = parse_spotify_path(&segments).ok_or_else(|| invalid(url))?;
            (Platform::Spotify, kind, id)
        }
        "deezer.com" | "www.deezer.com" => {
            let (kind, id) = parse_deezer_path(&segments).ok_or_else(|| invalid(url))?;
            (Platform::Deezer, kind, id)
        }
        "tidal.com" | "www.tidal.com" | "listen.tidal.com" => {
            let (kind, id) = parse_tidal_path(&segments).ok_or_else(|| invalid(url))?;
            (Platform::Tidal, kind, id)
        }
        "music.apple.com" => {
            let (kind, id) = parse_apple_path(url, &segments).ok_or_else(|| invalid(url))?;
            (Platform::AppleMusic, kind, id)
        }
        "music.youtube.com" => {
            let (kind, id) = parse_ytmusic_path(url, &segments).ok_or_else(|| invalid(url))?;
            (Platform::YouTubeMusic, kind, id)
        }
        other => return Err(LinkParseError::HostUnsupported(other.to_string())),
    };

    Ok(LinkInfo::new(platform, kind, entity_id, canonical_url(url)))
}

fn invalid(url: &Url) -> LinkParseError {
    LinkParseError::InvalidLink(url.to_string())
}

/// Drop tracking query parameters and fragments that do not identify the entity
fn canonical_url(url: &Url) -> String {
    let mut canonical = url.clone();
    canonical.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| matches!(k.as_ref(), "i" | "v" | "list"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        canonical.set_query(None);
    } else {
        canonical.query_pairs_mut().clear().extend_pairs(kept);
    }
    canonical.to_string()
}

fn entity_kind(segment: &str) -> Option<EntityKind> {
    match segment {
        "track" => Some(EntityKind::Track),
        "album" => Some(EntityKind::Album),
        "playlist" => Some(EntityKind::Playlist),
        _ => None,
    }
}

fn is_alphanumeric_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric())
}

fn is_numeric_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_digit())
}

/// `/{intl-xx/}{embed/}{kind}/{id}`
fn parse_spotify_path(segments: &[&str]) -> Option<(EntityKind, String)> {
    let rest: Vec<&str> = segments
        .iter()
        .copied()
        .skip_while(|s| s.starts_with("intl-") || *s == "embed")
        .collect();

    let kind = entity_kind(rest.first()?)?;
    let id = rest.get(1)?;
    is_alphanumeric_id(id).then(|| (kind, id.to_string()))
}

fn parse_spotify_uri(raw: &str, rest: &str) -> Result<LinkInfo, LinkParseError> {
    let mut parts = rest.split(':');
    let kind = parts
        .next()
        .and_then(entity_kind)
        .ok_or_else(|| LinkParseError::InvalidLink(raw.to_string()))?;
    let id = parts
        .next()
        .filter(|id| is_alphanumeric_id(id))
        .ok_or_else(|| LinkParseError::InvalidLink(raw.to_string()))?;

    let url = format!("https://open.spotify.com/{}/{}", kind, id);
    Ok(LinkInfo::new(Platform::Spotify, kind, id, url))
}

/// `/{lang/}{kind}/{numeric id}`
fn parse_deezer_path(segments: &[&str]) -> Option<(EntityKind, String)> {
    let kind_index = segments.iter().take(2).position(|s| entity_kind(s).is_some())?;
    let kind = entity_kind(segments[kind_index])?;
    let id = segments.get(kind_index + 1)?;
    is_numeric_id(id).then(|| (kind, id.to_string()))
}

/// `/{browse/}{kind}/{id}`; playlist IDs are UUIDs, the rest numeric
fn parse_tidal_path(segments: &[&str]) -> Option<(EntityKind, String)> {
    let rest: &[&str] = match segments.first() {
        Some(&"browse") => &segments[1..],
        _ => segments,
    };
    let kind = entity_kind(rest.first()?)?;
    let id = rest.get(1)?;

    let valid = match kind {
        EntityKind::Playlist => {
            !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
        }
        _ => is_numeric_id(id),
    };
    valid.then(|| (kind, id.to_string()))
}

/// `/{cc}/album/{slug}/{id}?i={track}`, `/{cc}/song/{slug}/{id}`, `/{cc}/playlist/{slug}/{pl.id}`
fn parse_apple_path(url: &Url, segments: &[&str]) -> Option<(EntityKind, String)> {
    let country = segments.first()?;
    if country.len() != 2 {
        return None;
    }
    let kind_segment = *segments.get(1)?;
    // slug is optional: /us/album/1440857781 is accepted too
    let id = *segments.get(2..)?.last()?;

    match kind_segment {
        "album" => {
            let track_id = url
                .query_pairs()
                .find(|(k, _)| k == "i")
                .map(|(_, v)| v.into_owned());
            match track_id {
                Some(track_id) if is_numeric_id(&track_id) => Some((EntityKind::Track, track_id)),
                Some(_) => None,
                None => is_numeric_id(id).then(|| (EntityKind::Album, id.to_string())),
            }
        }
        "song" => is_numeric_id(id).then(|| (EntityKind::Track, id.to_string())),
        "playlist" => id
            .starts_with("pl.")
            .then(|| (EntityKind::Playlist, id.to_string())),
        _ => None,
    }
}

/// `/watch?v=`, `/playlist?list=`, `/browse/MPREb_…`
fn parse_ytmusic_path(url: &Url, segments: &[&str]) -> Option<(EntityKind, String)> {
    let query = |key: &str| {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
    };

    match segments {
        ["watch"] => query("v").map(|id| (EntityKind::Track, id)),
        ["playlist"] => query("list").map(|id| (EntityKind::Playlist, id)),
        ["browse", id] if id.starts_with("MPREb_") => Some((EntityKind::Album, id.to_string())),
        _ => None,
    }
}
