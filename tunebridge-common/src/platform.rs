//! Streaming platforms and entity kinds

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Supported streaming platforms
///
/// Serialized names are the identifiers used in configuration, events and
/// persisted results (`spotify`, `deezer`, `tidal`, `applemusic`, `ytmusic`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "spotify")]
    Spotify,
    #[serde(rename = "deezer")]
    Deezer,
    #[serde(rename = "tidal")]
    Tidal,
    #[serde(rename = "applemusic")]
    AppleMusic,
    #[serde(rename = "ytmusic")]
    YouTubeMusic,
}

impl Platform {
    /// Every platform, in a fixed order
    pub const ALL: [Platform; 5] = [
        Platform::Spotify,
        Platform::Deezer,
        Platform::Tidal,
        Platform::AppleMusic,
        Platform::YouTubeMusic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Spotify => "spotify",
            Platform::Deezer => "deezer",
            Platform::Tidal => "tidal",
            Platform::AppleMusic => "applemusic",
            Platform::YouTubeMusic => "ytmusic",
        }
    }

    /// Parse a comma-separated platform list (`"deezer, tidal"`)
    ///
    /// Duplicates are dropped; the result is sorted so that equal sets
    /// always produce equal lists.
    pub fn parse_list(list: &str) -> Result<Vec<Platform>, Error> {
        let mut platforms = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Platform::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        platforms.sort();
        platforms.dedup();
        Ok(platforms)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spotify" => Ok(Platform::Spotify),
            "deezer" => Ok(Platform::Deezer),
            "tidal" => Ok(Platform::Tidal),
            "applemusic" | "apple_music" | "apple" => Ok(Platform::AppleMusic),
            "ytmusic" | "youtubemusic" | "youtube_music" | "youtube" => Ok(Platform::YouTubeMusic),
            other => Err(Error::InvalidInput(format!("Unknown platform: {}", other))),
        }
    }
}

/// Kind of entity a link points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Track,
    Album,
    Playlist,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Track => "track",
            EntityKind::Album => "album",
            EntityKind::Playlist => "playlist",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "track" | "song" => Ok(EntityKind::Track),
            "album" => Ok(EntityKind::Album),
            "playlist" => Ok(EntityKind::Playlist),
            other => Err(Error::InvalidInput(format!("Unknown entity kind: {}", other))),
        }
    }
}
