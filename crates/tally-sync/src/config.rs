//! Configuration for the sync layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SyncError;

/// Default delay between push-channel reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1200;

/// Default number of rows per page for list collections.
pub const DEFAULT_PAGE_SIZE: u32 = 8;

/// Largest page size the backend accepts.
pub const MAX_PAGE_SIZE: u32 = 500;

/// Request timeout bounds, in seconds.
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 300;

/// Settings shared by the HTTP client, push channel and reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the REST API, without trailing slash.
    pub api_url: String,
    /// WebSocket URL of the push channel.
    pub events_url: String,
    pub reconnect_delay_ms: u64,
    pub default_page_size: u32,
    /// Recent push-event fingerprints remembered for duplicate detection.
    /// Zero disables it.
    pub dedup_window: usize,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000/api".to_string(),
            events_url: "ws://localhost:8000/ws/events/".to_string(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            default_page_size: DEFAULT_PAGE_SIZE,
            dedup_window: crate::reconciler::DEFAULT_DEDUP_WINDOW,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Check every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<(), SyncError> {
        for (name, url, schemes) in [
            ("api_url", &self.api_url, &["http://", "https://"]),
            ("events_url", &self.events_url, &["ws://", "wss://"]),
        ] {
            if !schemes.iter().any(|s| url.starts_with(s)) {
                return Err(SyncError::Config(format!(
                    "{} must start with {} (got '{}')",
                    name,
                    schemes.join(" or "),
                    url
                )));
            }
        }

        if self.reconnect_delay_ms == 0 {
            return Err(SyncError::Config(
                "reconnect_delay_ms must be greater than zero".to_string(),
            ));
        }

        if !(1..=MAX_PAGE_SIZE).contains(&self.default_page_size) {
            return Err(SyncError::Config(format!(
                "default_page_size must be between 1 and {MAX_PAGE_SIZE} (got {})",
                self.default_page_size
            )));
        }

        for (name, secs) in [
            ("request_timeout_secs", self.request_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
        ] {
            if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&secs) {
                return Err(SyncError::Config(format!(
                    "{name} must be between {MIN_TIMEOUT_SECS} and {MAX_TIMEOUT_SECS} (got {secs})"
                )));
            }
        }

        Ok(())
    }
}

/// Fluent builder for [`SyncConfig`].
///
/// ```rust
/// use tally_sync::SyncConfig;
///
/// let config = SyncConfig::builder()
///     .api_url("https://shop.example.com/api")
///     .events_url("wss://shop.example.com/ws/events/")
///     .default_page_size(20)
///     .build()
///     .unwrap();
/// assert_eq!(config.default_page_size, 20);
/// ```
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_url = url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn events_url(mut self, url: impl Into<String>) -> Self {
        self.config.events_url = url.into();
        self
    }

    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn default_page_size(mut self, size: u32) -> Self {
        self.config.default_page_size = size;
        self
    }

    #[must_use]
    pub fn dedup_window(mut self, window: usize) -> Self {
        self.config.dedup_window = window;
        self
    }

    #[must_use]
    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<SyncConfig, SyncError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
