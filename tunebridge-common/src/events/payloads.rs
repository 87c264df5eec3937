//! Payload shapes carried by conversion events

use serde::{Deserialize, Serialize};

use crate::track::{CandidateTrack, MatchResult, OmittedTrack};

/// Per-platform outcome for one source track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPayload {
    /// Zero-based position of the source track in the playlist
    pub position: usize,
    /// Source platform track ID
    pub source_id: String,
    /// Matched track on the target platform
    pub matched: Option<CandidateTrack>,
    /// Omission record when no acceptable match was found
    pub omitted: Option<OmittedTrack>,
    /// Best candidate score (0.0-1.0)
    pub score: f64,
}

impl TrackPayload {
    pub fn from_match(position: usize, result: &MatchResult) -> Self {
        Self {
            position,
            source_id: result.source.external_id.clone(),
            matched: result.chosen.clone(),
            omitted: result.omission(),
            score: result.score,
        }
    }
}
