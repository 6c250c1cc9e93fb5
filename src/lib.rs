//! # tagcache
//!
//! A resilient two-tier cache handler for server-side page rendering.
//!
//! Reads and writes go to a shared Redis-compatible primary store when it is
//! reachable and fall back to a bounded in-process store when it is not.
//! Entries can be grouped under tags and invalidated together. No cache
//! operation ever returns an error to the caller; degraded behavior is
//! reported through an [`observer`] instead.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tagcache::{CacheConfig, CacheHandler, Emitter, PrimaryStoreClient, SetOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::from_json(r#"{ "url": "redis://127.0.0.1:6379" }"#)?;
//!     config.validate()?;
//!
//!     let store = Arc::new(PrimaryStoreClient::from_config(&config, Emitter::tracing())?);
//!     let cache = CacheHandler::new(config, store, Emitter::tracing());
//!
//!     cache.set("/blog/hello", json!({ "html": "<p>hi</p>" }), SetOptions::new().tag("blog")).await;
//!     println!("{:?}", cache.get("/blog/hello").await);
//!     cache.revalidate_tag("blog").await;
//!     Ok(())
//! }
//! ```

// ── Storage tiers ─────────────────────────────────────────────────────────────
pub mod fallback;
pub mod store;

// ── Cache logic ───────────────────────────────────────────────────────────────
pub mod entry;
pub mod handler;
pub mod tags;

// ── Ambient ───────────────────────────────────────────────────────────────────
pub mod config;
pub mod observer;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{CacheConfig, ConfigError, ReconnectPolicy, SetOptions};
pub use entry::CacheEntry;
pub use fallback::FallbackStore;
pub use handler::{CacheHandler, HandlerState, Lookup, SetOutcome};
pub use observer::{CacheEvent, CacheObserver, CacheStats, Emitter};
pub use store::{ConnectionState, MemoryStore, PrimaryStore, PrimaryStoreClient, StoreError};
pub use tags::{Invalidation, TagIndex};
