//! # TuneBridge Common Library
//!
//! Shared code for the TuneBridge crates:
//! - Platform and entity identifiers
//! - Track, playlist and match types exchanged between adapters, matcher and events
//! - Task lifecycle types
//! - Conversion event union and the in-process EventBus
//! - Configuration loading and tracing setup

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod platform;
pub mod task;
pub mod track;

pub use error::{Error, Result};
pub use platform::{EntityKind, Platform};
pub use task::{DoneSummary, ErrorKind, TaskFailure, TaskOutcome, TaskStatus};
pub use track::{CandidateTrack, MatchResult, OmittedTrack, PlaylistMetadata, TrackQuery};
