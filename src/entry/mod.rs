//! Cache entries — the value plus the metadata stored alongside it.
//!
//! The primary store holds entries as JSON text; the fallback tier keeps the
//! decoded struct. Expiry is recorded for both but only the primary store
//! enforces it.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cached artifact.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use serde_json::json;
/// use tagcache::entry::CacheEntry;
///
/// let entry = CacheEntry::new(json!({"html": "<p>hi</p>"}), Duration::from_secs(60), vec!["home".into()]);
/// let text = entry.encode().unwrap();
/// let back = CacheEntry::decode(&text).unwrap();
/// assert_eq!(back.value, entry.value);
/// assert!(back.has_tag("home"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub value: Value,
    /// Unix milliseconds at write time.
    pub stored_at: u64,
    /// Unix milliseconds after which the primary store drops the entry.
    pub expires_at: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CacheEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(value: Value, ttl: Duration, tags: Vec<String>) -> Self {
        let stored_at = now_millis();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Self {
            value,
            stored_at,
            expires_at: stored_at.saturating_add(ttl_ms),
            tags,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Whether the recorded expiry has passed. Informational only: nothing in
    /// the fallback tier acts on it.
    pub fn is_expired(&self) -> bool {
        now_millis() >= self.expires_at
    }
}

/// Milliseconds since the Unix epoch; a clock before 1970 reads as zero.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
