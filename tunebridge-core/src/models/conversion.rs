//! Conversion results

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tunebridge_common::{
    CandidateTrack, DoneSummary, EntityKind, MatchResult, OmittedTrack, Platform,
    PlaylistMetadata, TaskStatus,
};

/// Result of a single-track conversion
///
/// Each requested platform has an entry; `None` means the platform failed or
/// is not available to the caller. A `Some` entry may still be an omission
/// (`chosen == None`) when no candidate scored high enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub entity: EntityKind,
    pub source: CandidateTrack,
    pub platforms: BTreeMap<Platform, Option<MatchResult>>,
}

impl ConversionResult {
    /// Matched track on `platform`, if any
    pub fn matched(&self, platform: Platform) -> Option<&CandidateTrack> {
        self.platforms
            .get(&platform)
            .and_then(|entry| entry.as_ref())
            .and_then(|result| result.chosen.as_ref())
    }
}

/// Working state and final result of a playlist conversion
///
/// Owned by the conversion engine while it runs; persisted once under
/// `id` (the idempotency checksum) when it completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistConversion {
    /// Idempotency checksum
    pub id: String,
    pub status: TaskStatus,
    pub meta: PlaylistMetadata,
    /// Matched results per target platform, in source playlist order
    pub platforms: BTreeMap<Platform, Vec<MatchResult>>,
    /// One record per unmatched (track, platform) pair
    pub omitted_tracks: Vec<OmittedTrack>,
    pub short_url: Option<String>,
}

impl PlaylistConversion {
    pub fn new(meta: PlaylistMetadata, targets: &[Platform]) -> Self {
        Self {
            id: meta.checksum.clone(),
            status: TaskStatus::Processing,
            platforms: targets.iter().map(|p| (*p, Vec::new())).collect(),
            meta,
            omitted_tracks: Vec::new(),
            short_url: None,
        }
    }

    /// Fold one track's per-platform results into the conversion
    ///
    /// Callers feed tracks in playlist order.
    pub fn record(&mut self, results: Vec<MatchResult>) {
        for result in results {
            if let Some(omitted) = result.omission() {
                self.omitted_tracks.push(omitted);
            } else {
                self.platforms.entry(result.platform).or_default().push(result);
            }
        }
    }

    pub fn summary(&self) -> DoneSummary {
        DoneSummary {
            checksum: self.id.clone(),
            track_count: self.meta.track_count,
            matched: self
                .platforms
                .iter()
                .map(|(platform, results)| (*platform, results.len()))
                .collect(),
            omitted: self.omitted_tracks.len(),
            short_url: self.short_url.clone(),
        }
    }
}
