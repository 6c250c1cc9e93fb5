//! Configuration — handler settings and per-write options.
//!
//! [`CacheConfig`] is constructed once per process and handed to
//! [`CacheHandler::new`](crate::handler::CacheHandler::new). [`SetOptions`] is
//! the typed replacement for the pipeline's per-artifact options object; both
//! deserialize from the camelCase JSON the rendering pipeline already emits.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default primary store location.
pub const DEFAULT_URL: &str = "redis://127.0.0.1:6379";

/// Default entry lifetime in the primary store (one hour).
pub const DEFAULT_TTL_SECS: u64 = 3600;

/// Default bound on the in-process fallback tier.
pub const DEFAULT_FALLBACK_CAPACITY: usize = 100;

/// Longest TTL accepted anywhere in the crate (about 136 years).
///
/// Keeps `now + ttl` representable both as a process `Instant` and as a
/// server-side millisecond expiry.
pub const MAX_TTL_SECS: u64 = u32::MAX as u64;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid store URL `{url}`: {reason}")]
    Url { url: String, reason: String },

    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },

    #[error("`ttlSeconds` is {ttl_seconds}, above the maximum of {max}")]
    TtlTooLarge { ttl_seconds: u64, max: u64 },
}

/// Handler-wide configuration.
///
/// Every field has a default, so an empty JSON object is a valid config.
///
/// # Examples
///
/// ```
/// use tagcache::config::CacheConfig;
///
/// let config = CacheConfig::from_json(r#"{ "fallbackCapacity": 2, "ttlSeconds": 60 }"#).unwrap();
/// assert_eq!(config.fallback_capacity, 2);
/// assert_eq!(config.default_ttl().as_secs(), 60);
/// assert_eq!(config.reconnect_max_attempts, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheConfig {
    /// `redis://[[user]:password@]host[:port][/db]`
    pub url: String,
    /// TTL applied when a write does not carry its own.
    pub ttl_seconds: u64,
    /// Maximum number of entries held by the fallback tier.
    pub fallback_capacity: usize,
    /// Dial attempts per connection attempt sequence.
    pub reconnect_max_attempts: u32,
    /// Backoff step; the wait before attempt `n + 1` is `n * base`.
    pub reconnect_base_delay_ms: u64,
    /// Upper bound on a single backoff wait.
    pub reconnect_max_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    /// Prepended to every cache key written to the primary store.
    pub key_prefix: String,
    /// Prepended to a tag name to form its membership set key.
    pub tag_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_owned(),
            ttl_seconds: DEFAULT_TTL_SECS,
            fallback_capacity: DEFAULT_FALLBACK_CAPACITY,
            reconnect_max_attempts: 3,
            reconnect_base_delay_ms: 50,
            reconnect_max_delay_ms: 500,
            connect_timeout_ms: 1000,
            operation_timeout_ms: 1000,
            key_prefix: String::new(),
            tag_prefix: "tags:".to_owned(),
        }
    }
}

impl CacheConfig {
    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] for malformed JSON or unknown fields, and
    /// the errors of [`validate`](Self::validate) otherwise.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the rest of the crate relies on.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Zero`]: a count or duration that must be positive is zero.
    /// - [`ConfigError::TtlTooLarge`]: `ttlSeconds` exceeds [`MAX_TTL_SECS`].
    /// - [`ConfigError::Url`]: `url` is not a usable store address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("ttlSeconds", self.ttl_seconds),
            ("fallbackCapacity", self.fallback_capacity as u64),
            ("reconnectMaxAttempts", u64::from(self.reconnect_max_attempts)),
            ("connectTimeoutMs", self.connect_timeout_ms),
            ("operationTimeoutMs", self.operation_timeout_ms),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field: *field });
        }
        if self.ttl_seconds > MAX_TTL_SECS {
            return Err(ConfigError::TtlTooLarge {
                ttl_seconds: self.ttl_seconds,
                max: MAX_TTL_SECS,
            });
        }
        self.client()?;
        Ok(())
    }

    /// A [`redis::Client`] for [`url`](Self::url). Opening a client parses
    /// the URL but does not dial.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Url`] when the URL is rejected.
    pub fn client(&self) -> Result<redis::Client, ConfigError> {
        redis::Client::open(self.url.as_str()).map_err(|e| ConfigError::Url {
            url: self.url.clone(),
            reason: e.to_string(),
        })
    }

    /// [`ttl_seconds`](Self::ttl_seconds), capped at [`MAX_TTL_SECS`].
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds.min(MAX_TTL_SECS))
    }

    /// Connection-level settings for [`PrimaryStoreClient`](crate::store::PrimaryStoreClient).
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_max_attempts.max(1),
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
        }
    }

    /// Sets the fallback capacity.
    #[must_use]
    pub fn with_fallback_capacity(mut self, capacity: usize) -> Self {
        self.fallback_capacity = capacity;
        self
    }

    /// Sets the store URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

/// How a [`PrimaryStoreClient`](crate::store::PrimaryStoreClient) dials and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

impl ReconnectPolicy {
    /// Wait applied after failed attempt number `attempt` (1-based):
    /// `min(attempt * base_delay, max_delay)`.
    ///
    /// ```
    /// use std::time::Duration;
    /// use tagcache::config::CacheConfig;
    ///
    /// let policy = CacheConfig::default().reconnect_policy();
    /// assert_eq!(policy.delay_after(1), Duration::from_millis(50));
    /// assert_eq!(policy.delay_after(20), Duration::from_millis(500));
    /// ```
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        CacheConfig::default().reconnect_policy()
    }
}

/// Per-write options: the typed form of `{ ttlSeconds, tags }`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tagcache::config::SetOptions;
///
/// let opts = SetOptions::new().ttl_secs(30).tag("category:technology").tag("home");
/// assert_eq!(opts.resolve_ttl(Duration::from_secs(3600)), Duration::from_secs(30));
/// assert_eq!(opts.tags(), ["category:technology", "home"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SetOptions {
    ttl_seconds: Option<u64>,
    tags: Vec<String>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the default TTL for this write. Zero means "use the default".
    #[must_use]
    pub fn ttl_secs(mut self, secs: u64) -> Self {
        self.ttl_seconds = Some(secs);
        self
    }

    /// Adds a tag. Empty and duplicate tags are ignored.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !tag.is_empty() && !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    /// Adds every tag in `tags`, with the same filtering as [`tag`](Self::tag).
    #[must_use]
    pub fn with_tags<I, T>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        tags.into_iter().fold(self, |opts, t| opts.tag(t))
    }

    /// Tags after normalization. Deserialized input is normalized here too.
    pub fn tags(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::with_capacity(self.tags.len());
        for tag in &self.tags {
            if !tag.is_empty() && !seen.contains(&tag.as_str()) {
                seen.push(tag);
            }
        }
        seen
    }

    /// The explicit TTL if one was given and is non-zero, else `default`.
    /// Either way the result is capped at [`MAX_TTL_SECS`].
    pub fn resolve_ttl(&self, default: Duration) -> Duration {
        self.ttl_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(default)
            .min(Duration::from_secs(MAX_TTL_SECS))
    }
}
