//! Track matcher
//!
//! Scores search candidates against a source track and picks at most one.
//! Pure: no I/O, no clock, and the choice does not depend on candidate order.
//!
//! Score = weighted mean of title similarity and artist overlap. Duration only
//! breaks ties.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use tunebridge_common::config::MatcherSettings;
use tunebridge_common::{CandidateTrack, MatchResult, Platform};

/// Scores closer than this are considered equal
const SCORE_EPSILON: f64 = 1e-9;
/// Jaro-Winkler similarity at which two normalized artist names are the same artist
const ARTIST_NAME_THRESHOLD: f64 = 0.9;

const FEATURING_MARKERS: [&str; 5] = ["featuring ", "feat. ", "feat ", "ft. ", "ft "];
const ARTIST_SEPARATORS: [&str; 10] = [
    ",", ";", " & ", " x ", " / ", " with ", " featuring ", " feat. ", " feat ", " ft. ",
];
/// Words marking a ` - ` suffix as an edition note rather than part of the title
const EDITION_KEYWORDS: [&str; 8] = ["remaster", "live", "version", "edit", "mix", "mono", "stereo", "radio"];

/// Track in comparable form
#[derive(Debug, Clone)]
struct Normalized {
    /// Normalized title, words in original order
    title: String,
    title_tokens: BTreeSet<String>,
    artists: Vec<String>,
    duration_ms: u64,
}

impl Normalized {
    fn from_track(track: &CandidateTrack) -> Self {
        let lower = track.title.to_lowercase();
        let (bare_title, featured) = split_featuring(&lower);
        let title = normalize_text(&strip_edition_suffix(&bare_title));

        let mut artists: Vec<String> = Vec::new();
        for name in track.artists.iter().map(|a| a.to_lowercase()).chain(featured) {
            for artist in split_artists(&name) {
                if !artists.contains(&artist) {
                    artists.push(artist);
                }
            }
        }

        Self {
            title_tokens: title.split_whitespace().map(str::to_string).collect(),
            title,
            artists,
            duration_ms: track.duration_ms,
        }
    }
}

/// Lowercase, drop bracketed content, turn punctuation into spaces, collapse whitespace
fn normalize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut depth = 0usize;

    for c in input.chars().flat_map(char::to_lowercase) {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            _ if depth > 0 => {}
            // apostrophes join words: "don't" == "dont"
            '\'' | '\u{2019}' => {}
            c if c.is_alphanumeric() => out.push(c),
            _ => out.push(' '),
        }
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split "title (feat. a & b)" into ("title", ["a & b"])
///
/// Expects lowercase input.
fn split_featuring(title: &str) -> (String, Vec<String>) {
    let found = FEATURING_MARKERS
        .iter()
        .filter_map(|marker| {
            title.match_indices(marker).find(|(idx, _)| {
                *idx == 0
                    || title[..*idx]
                        .chars()
                        .next_back()
                        .map(|c| c == '(' || c == '[' || c.is_whitespace())
                        .unwrap_or(false)
            })
            .map(|(idx, m)| (idx, m.len()))
        })
        .min_by_key(|(idx, _)| *idx);

    let Some((idx, marker_len)) = found else {
        return (title.to_string(), Vec::new());
    };

    let before = title[..idx].trim_end_matches(|c: char| c == '(' || c == '[' || c == '-' || c.is_whitespace());
    let after = &title[idx + marker_len..];
    let featured_end = after.find(|c: char| c == ')' || c == ']').unwrap_or(after.len());
    let featured = after[..featured_end].trim().to_string();
    // text after the closing bracket is kept, e.g. "x (feat. y) [remix]"
    let rest = after.get(featured_end + 1..).unwrap_or("");

    let bare = format!("{} {}", before, rest).trim().to_string();
    let featured = if featured.is_empty() { Vec::new() } else { vec![featured] };
    (bare, featured)
}

/// Drop " - Remastered 2011" style suffixes
fn strip_edition_suffix(title: &str) -> String {
    match title.rfind(" - ") {
        Some(idx) if EDITION_KEYWORDS.iter().any(|k| title[idx..].contains(k)) => title[..idx].to_string(),
        _ => title.to_string(),
    }
}

/// Split a credit string into normalized individual artist names
fn split_artists(credit: &str) -> Vec<String> {
    let mut parts = vec![credit.to_lowercase()];
    for separator in ARTIST_SEPARATORS {
        parts = parts
            .iter()
            .flat_map(|p| p.split(separator).map(str::to_string).collect::<Vec<_>>())
            .collect();
    }
    parts
        .iter()
        .map(|p| normalize_text(p))
        .filter(|p| !p.is_empty())
        .collect()
}

/// max(token-set Jaccard, normalized Levenshtein)
fn title_similarity(a: &Normalized, b: &Normalized) -> f64 {
    if a.title.is_empty() || b.title.is_empty() {
        return 0.0;
    }
    let intersection = a.title_tokens.intersection(&b.title_tokens).count() as f64;
    let union = a.title_tokens.union(&b.title_tokens).count() as f64;
    let jaccard = if union > 0.0 { intersection / union } else { 0.0 };

    jaccard.max(strsim::normalized_levenshtein(&a.title, &b.title))
}

/// Overlap coefficient of the two artist sets with fuzzy name equality
fn artist_overlap(a: &Normalized, b: &Normalized) -> f64 {
    match (a.artists.is_empty(), b.artists.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        _ => {}
    }

    let shared = a
        .artists
        .iter()
        .filter(|x| {
            b.artists
                .iter()
                .any(|y| x == &y || strsim::jaro_winkler(x, y) >= ARTIST_NAME_THRESHOLD)
        })
        .count() as f64;

    (shared / a.artists.len().min(b.artists.len()) as f64).min(1.0)
}

/// Absolute duration difference; unknown durations sort last
fn duration_gap(a: &Normalized, b: &Normalized) -> u64 {
    if a.duration_ms == 0 || b.duration_ms == 0 {
        return u64::MAX;
    }
    a.duration_ms.abs_diff(b.duration_ms)
}

struct Scored<'a> {
    position: usize,
    candidate: &'a CandidateTrack,
    score: f64,
    artist: f64,
    duration_gap: u64,
}

fn cmp_f64_desc(a: f64, b: f64) -> Ordering {
    if (a - b).abs() <= SCORE_EPSILON {
        Ordering::Equal
    } else {
        b.partial_cmp(&a).unwrap_or(Ordering::Equal)
    }
}

/// Best-first ordering
fn rank(a: &Scored<'_>, b: &Scored<'_>) -> Ordering {
    cmp_f64_desc(a.score, b.score)
        .then_with(|| cmp_f64_desc(a.artist, b.artist))
        .then_with(|| a.duration_gap.cmp(&b.duration_gap))
        .then_with(|| a.candidate.external_id.cmp(&b.candidate.external_id))
        .then_with(|| a.position.cmp(&b.position))
}

/// Candidate scorer with configured weights and threshold
#[derive(Debug, Clone)]
pub struct Matcher {
    settings: MatcherSettings,
}

impl Matcher {
    pub fn new(settings: MatcherSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &MatcherSettings {
        &self.settings
    }

    fn weighted(&self, title: f64, artist: f64) -> f64 {
        let tw = self.settings.title_weight.max(0.0);
        let aw = self.settings.artist_weight.max(0.0);
        if tw + aw <= 0.0 {
            return title;
        }
        ((tw * title + aw * artist) / (tw + aw)).clamp(0.0, 1.0)
    }

    /// Score of one candidate against the source (0.0-1.0)
    pub fn score(&self, source: &CandidateTrack, candidate: &CandidateTrack) -> f64 {
        let s = Normalized::from_track(source);
        let c = Normalized::from_track(candidate);
        self.weighted(title_similarity(&s, &c), artist_overlap(&s, &c))
    }

    /// Whether `candidate`'s duration is within the configured tolerance of `source`
    pub fn duration_within_tolerance(&self, source: &CandidateTrack, candidate: &CandidateTrack) -> bool {
        source.duration_ms > 0
            && candidate.duration_ms > 0
            && source.duration_ms.abs_diff(candidate.duration_ms) <= self.settings.duration_tolerance_ms
    }

    /// Pick the best candidate from `platform` for `source`
    ///
    /// Returns an omission when there are no candidates or the best score is
    /// below the acceptance threshold.
    pub fn match_track(&self, source: &CandidateTrack, platform: Platform, candidates: &[CandidateTrack]) -> MatchResult {
        let normalized_source = Normalized::from_track(source);

        let best = candidates
            .iter()
            .enumerate()
            .map(|(position, candidate)| {
                let c = Normalized::from_track(candidate);
                let title = title_similarity(&normalized_source, &c);
                let artist = artist_overlap(&normalized_source, &c);
                Scored {
                    position,
                    candidate,
                    score: self.weighted(title, artist),
                    artist,
                    duration_gap: duration_gap(&normalized_source, &c),
                }
            })
            .min_by(rank);

        let Some(best) = best else {
            tracing::debug!(platform = %platform, track = %source.title, "No candidates, track omitted");
            return MatchResult::omitted(platform, source.clone(), 0.0);
        };

        if best.score + SCORE_EPSILON < self.settings.acceptance_threshold {
            tracing::debug!(
                platform = %platform,
                track = %source.title,
                best = %best.candidate.title,
                score = best.score,
                "Best candidate below threshold, track omitted"
            );
            return MatchResult::omitted(platform, source.clone(), best.score);
        }

        if best.duration_gap != u64::MAX && best.duration_gap > self.settings.duration_tolerance_ms {
            tracing::debug!(
                platform = %platform,
                track = %source.title,
                gap_ms = best.duration_gap,
                "Accepted candidate outside duration tolerance"
            );
        }

        MatchResult {
            platform,
            source: source.clone(),
            chosen: Some(best.candidate.clone()),
            score: best.score,
        }
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(MatcherSettings::default())
    }
}
