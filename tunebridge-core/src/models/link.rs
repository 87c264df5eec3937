//! Parsed links and the app context that requests conversions

use serde::{Deserialize, Serialize};
use tunebridge_common::{EntityKind, Platform};

/// A parsed platform link
///
/// Immutable once produced by the link parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    /// Platform the link belongs to
    pub platform: Platform,
    /// Kind of entity referenced
    pub kind: EntityKind,
    /// Platform-specific entity ID
    pub entity_id: String,
    /// Normalized source URL (after short-link resolution)
    pub url: String,
    /// Single target platform requested with the link, `None` = all
    #[serde(default)]
    pub target_platform: Option<Platform>,
    /// Owning app, when the request came through one
    #[serde(default)]
    pub app_id: Option<String>,
}

impl LinkInfo {
    pub fn new(platform: Platform, kind: EntityKind, entity_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            platform,
            kind,
            entity_id: entity_id.into(),
            url: url.into(),
            target_platform: None,
            app_id: None,
        }
    }

    pub fn with_target(mut self, target: Platform) -> Self {
        self.target_platform = Some(target);
        self
    }

    pub fn with_app(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }
}

/// Developer app on whose behalf conversions run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeveloperApp {
    pub app_id: String,
    pub name: String,
    /// Platforms the app has credentials/integrations for
    pub integrations: Vec<Platform>,
    /// Webhook receiving this app's conversion events
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl DeveloperApp {
    pub fn new(app_id: impl Into<String>, name: impl Into<String>, integrations: Vec<Platform>) -> Self {
        Self {
            app_id: app_id.into(),
            name: name.into(),
            integrations,
            webhook_url: None,
        }
    }

    pub fn has_integration(&self, platform: Platform) -> bool {
        self.integrations.contains(&platform)
    }
}
