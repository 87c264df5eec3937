//! Track-level domain types shared by adapters, matcher and events

use serde::{Deserialize, Serialize};

use crate::platform::Platform;

/// A track as returned by a platform adapter
///
/// Produced once by an adapter and never mutated afterwards. The same type
/// describes the source track of a conversion and every search candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTrack {
    /// Platform the track lives on
    pub platform: Platform,
    /// Platform-specific track ID
    pub external_id: String,
    /// Track title as published by the platform
    pub title: String,
    /// Artist names, in platform order (primary artist first)
    pub artists: Vec<String>,
    /// Duration in milliseconds (0 when the platform does not report one)
    pub duration_ms: u64,
    /// Album title
    pub album: Option<String>,
    /// Explicit-content flag
    #[serde(default)]
    pub explicit: bool,
    /// Canonical public URL of the track
    pub url: String,
    /// Cover artwork URL
    pub cover_url: Option<String>,
    /// Preview clip URL
    pub preview_url: Option<String>,
    /// Release date as reported (usually `YYYY-MM-DD` or `YYYY`)
    pub release_date: Option<String>,
}

/// Search query sent to an adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackQuery {
    pub title: String,
    pub artists: Vec<String>,
}

impl TrackQuery {
    pub fn for_track(track: &CandidateTrack) -> Self {
        Self {
            title: track.title.clone(),
            artists: track.artists.clone(),
        }
    }

    /// Primary artist, or empty string when the source had none
    pub fn primary_artist(&self) -> &str {
        self.artists.first().map(String::as_str).unwrap_or("")
    }
}

/// Source playlist metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistMetadata {
    /// Platform the playlist was read from
    pub platform: Platform,
    /// Platform-specific playlist ID
    pub external_id: String,
    pub title: String,
    pub owner: Option<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    /// Number of tracks enumerated from the source
    pub track_count: usize,
    /// Last-modified marker reported by the platform, if any
    pub last_updated: Option<String>,
    /// Public URL of the playlist
    pub url: String,
    /// Idempotency checksum of the conversion this metadata belongs to
    ///
    /// Empty until the conversion engine assigns it.
    #[serde(default)]
    pub checksum: String,
}

/// A source track that found no acceptable match on a target platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmittedTrack {
    pub title: String,
    pub url: String,
    pub artists: Vec<String>,
    /// Platform on which no match was found
    pub platform: Platform,
}

/// Outcome of matching one source track against one platform's candidates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Target platform the candidates came from
    pub platform: Platform,
    /// Track being converted
    pub source: CandidateTrack,
    /// Accepted candidate, `None` when the track is omitted
    pub chosen: Option<CandidateTrack>,
    /// Score of the best candidate considered (0.0-1.0), 0.0 when there were none
    pub score: f64,
}

impl MatchResult {
    /// Result for a track that could not be matched on `platform`
    pub fn omitted(platform: Platform, source: CandidateTrack, score: f64) -> Self {
        Self {
            platform,
            source,
            chosen: None,
            score,
        }
    }

    pub fn is_match(&self) -> bool {
        self.chosen.is_some()
    }

    /// Omission record derived from the source track, if unmatched
    pub fn omission(&self) -> Option<OmittedTrack> {
        if self.chosen.is_some() {
            return None;
        }
        Some(OmittedTrack {
            title: self.source.title.clone(),
            url: self.source.url.clone(),
            artists: self.source.artists.clone(),
            platform: self.platform,
        })
    }
}
