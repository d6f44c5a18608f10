//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{ConfigError, ConfigResult};

/// Worker configuration
///
/// Every URL the worker caches or surfaces is anchored to `origin` and
/// `base_path`. Bumping `cache_name` invalidates every earlier generation on
/// the next activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the application is served from
    pub origin: Url,

    /// Origin-relative prefix of every application page
    pub base_path: String,

    /// Name of the active cache generation
    pub cache_name: String,

    /// Document served to HTML requests when offline
    pub offline_path: String,

    /// Assets fetched and stored on install, in order
    pub precache: Vec<String>,

    /// Requests whose host contains any of these markers bypass the worker
    pub excluded_host_markers: Vec<String>,

    /// Upper bound for a single network fetch; unbounded when absent
    pub network_timeout_ms: Option<u64>,

    /// JSON snapshot the cache store is persisted to
    pub cache_snapshot: Option<PathBuf>,

    /// Activate a freshly installed worker without waiting for the page to
    /// send a skip-waiting message
    pub skip_waiting_on_install: bool,

    /// Notification defaults
    pub notifications: NotificationDefaults,
}

/// Defaults applied to notifications when the triggering event omits a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    /// Tag for server push notifications
    pub push_tag: String,
    /// Tag for notifications requested by an application page
    pub message_tag: String,
    /// Tag for messages forwarded by the push SDK adapter
    pub background_tag: String,
    /// Vibration pattern in milliseconds
    pub vibrate: Vec<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost/").expect("static origin is a valid URL"),
            base_path: "/chris/".to_string(),
            cache_name: "studyhub-v4".to_string(),
            offline_path: "/chris/".to_string(),
            precache: [
                "/chris/",
                "/chris/index.html",
                "/chris/manifest.json",
                "/chris/icons/icon-192.png",
                "/chris/icons/icon-512.png",
                "/chris/icons/icon-192-maskable.png",
                "/chris/icons/icon-512-maskable.png",
                "https://fonts.googleapis.com/css2?family=Heebo:wght@300;400;500;600;700;800&display=swap",
                "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.4.0/css/all.min.css",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            excluded_host_markers: vec![
                "github".to_string(),
                "cloudinary".to_string(),
                "api.".to_string(),
            ],
            network_timeout_ms: None,
            cache_snapshot: None,
            skip_waiting_on_install: true,
            notifications: NotificationDefaults::default(),
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "StudyHub".to_string(),
            body: "יש לך התראה חדשה".to_string(),
            icon: "/chris/icons/icon-192.png".to_string(),
            badge: "/chris/icons/icon-192.png".to_string(),
            push_tag: "studyhub-push".to_string(),
            message_tag: "studyhub".to_string(),
            background_tag: "studyhub-firebase".to_string(),
            vibrate: vec![200, 100, 200],
        }
    }
}

impl WorkerConfig {
    /// Load and validate a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded worker config");
        Self::from_json(&raw)
    }

    /// Parse and validate a configuration from JSON; absent fields take defaults
    pub fn from_json(raw: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the worker relies on
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cache_name.trim().is_empty() {
            return Err(ConfigError::invalid("cache_name must not be empty"));
        }
        if !self.base_path.starts_with('/') || !self.base_path.ends_with('/') {
            return Err(ConfigError::invalid(format!(
                "base_path '{}' must start and end with '/'",
                self.base_path
            )));
        }
        if !self.offline_path.starts_with(&self.base_path) {
            return Err(ConfigError::invalid(format!(
                "offline_path '{}' is outside base_path '{}'",
                self.offline_path, self.base_path
            )));
        }
        for entry in &self.precache {
            self.resolve(entry)?;
        }
        Ok(())
    }

    /// Resolve an origin-relative path or absolute URL
    pub fn resolve(&self, path: &str) -> ConfigResult<Url> {
        Ok(self.origin.join(path)?)
    }

    /// Absolute URL of the application's base path
    pub fn base_url(&self) -> ConfigResult<Url> {
        self.resolve(&self.base_path)
    }

    /// Absolute URL of the offline fallback document
    pub fn offline_url(&self) -> ConfigResult<Url> {
        self.resolve(&self.offline_path)
    }

    /// Absolute URLs of the precache set, in order
    pub fn precache_urls(&self) -> ConfigResult<Vec<Url>> {
        self.precache.iter().map(|p| self.resolve(p)).collect()
    }

    /// Network fetch bound, if configured
    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout_ms.map(Duration::from_millis)
    }

    /// Whether a same-origin URL belongs to the application
    pub fn is_app_url(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin() && url.path().starts_with(&self.base_path)
    }
}
