//! The cache handler — the only component the rendering pipeline talks to.
//!
//! Composes the primary store, the fallback tier, and the tag index into
//! four operations that never fail: [`get`](CacheHandler::get),
//! [`set`](CacheHandler::set), [`revalidate_tag`](CacheHandler::revalidate_tag),
//! and [`reset_request_cache`](CacheHandler::reset_request_cache).
//!
//! ```text
//! get ──▶ primary ──hit──▶ Lookup::Hit
//!            │ miss / error / down
//!            ▼
//!         fallback ──hit──▶ Lookup::Fallback
//!            │
//!            ▼
//!         Lookup::Miss
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::trace;

use crate::config::{CacheConfig, SetOptions};
use crate::entry::CacheEntry;
use crate::fallback::FallbackStore;
use crate::observer::{CacheEvent, Emitter, Operation, Source};
use crate::store::{ConnectionState, PrimaryStore};
use crate::tags::{Invalidation, Keyspace, TagIndex};

/// Outcome of [`CacheHandler::get`].
///
/// Distinguishes an authoritative hit from a degraded one served by the
/// fallback tier, so callers and tests need not inspect logs.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Served by the primary store.
    Hit(Value),
    /// Served by the fallback tier; may be stale.
    Fallback(Value),
    Miss,
}

impl Lookup {
    /// The value from either tier.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Hit(v) | Self::Fallback(v) => Some(v),
            Self::Miss => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Hit(v) | Self::Fallback(v) => Some(v),
            Self::Miss => None,
        }
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }

    pub fn source(&self) -> Option<Source> {
        match self {
            Self::Hit(_) => Some(Source::Primary),
            Self::Fallback(_) => Some(Source::Fallback),
            Self::Miss => None,
        }
    }
}

/// Acknowledgement of [`CacheHandler::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOutcome {
    /// The primary store accepted the write.
    pub primary_written: bool,
    /// Tags successfully recorded in the tag index.
    pub tags_associated: usize,
    /// Key the fallback tier evicted to make room, if any.
    pub evicted: Option<String>,
}

/// Where the handler stands with respect to its primary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// No public call has run yet.
    Uninitialized,
    Connecting,
    Ready { primary_available: bool },
}

impl HandlerState {
    const UNINITIALIZED: u8 = 0;
    const CONNECTING: u8 = 1;
    const AVAILABLE: u8 = 2;
    const UNAVAILABLE: u8 = 3;

    fn from_u8(raw: u8) -> Self {
        match raw {
            Self::CONNECTING => Self::Connecting,
            Self::AVAILABLE => Self::Ready {
                primary_available: true,
            },
            Self::UNAVAILABLE => Self::Ready {
                primary_available: false,
            },
            _ => Self::Uninitialized,
        }
    }
}

/// Resilient two-tier cache with tag invalidation.
///
/// Construct one per process and share it by `Arc` with every request task.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use serde_json::json;
/// use tagcache::config::{CacheConfig, SetOptions};
/// use tagcache::handler::{CacheHandler, Lookup};
/// use tagcache::observer::Emitter;
/// use tagcache::store::MemoryStore;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = Arc::new(MemoryStore::new());
/// let cache = CacheHandler::new(CacheConfig::default(), store.clone(), Emitter::none());
///
/// cache.set("home", json!("<h1>hi</h1>"), SetOptions::new().tag("page")).await;
/// assert_eq!(cache.get("home").await, Lookup::Hit(json!("<h1>hi</h1>")));
///
/// store.set_online(false);
/// assert_eq!(cache.get("home").await, Lookup::Fallback(json!("<h1>hi</h1>")));
///
/// cache.revalidate_tag("page").await;
/// assert!(cache.get("home").await.is_miss());
/// # }
/// ```
pub struct CacheHandler<S> {
    store: Arc<S>,
    fallback: FallbackStore,
    tags: TagIndex<S>,
    keyspace: Keyspace,
    default_ttl: Duration,
    state: AtomicU8,
    emitter: Emitter,
}

impl<S: PrimaryStore> CacheHandler<S> {
    /// Builds a handler around an already-constructed primary store.
    ///
    /// `config` is trusted as given; run [`CacheConfig::validate`] first when
    /// it comes from outside the process.
    pub fn new(config: CacheConfig, store: Arc<S>, emitter: Emitter) -> Self {
        let keyspace = Keyspace::new(config.key_prefix.clone(), config.tag_prefix.clone());
        Self {
            tags: TagIndex::new(Arc::clone(&store), keyspace.clone(), emitter.clone()),
            fallback: FallbackStore::new(config.fallback_capacity),
            store,
            keyspace,
            default_ttl: config.default_ttl(),
            state: AtomicU8::new(HandlerState::UNINITIALIZED),
            emitter,
        }
    }

    pub fn state(&self) -> HandlerState {
        HandlerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn fallback(&self) -> &FallbackStore {
        &self.fallback
    }

    pub fn tag_index(&self) -> &TagIndex<S> {
        &self.tags
    }

    /// Looks `key` up in the primary store, then in the fallback tier.
    pub async fn get(&self, key: &str) -> Lookup {
        if self.ensure_connected().await {
            match self.store.get(&self.keyspace.entry_key(key)).await {
                Ok(Some(text)) => match CacheEntry::decode(&text) {
                    Ok(entry) => {
                        self.emitter.emit(|| CacheEvent::Hit {
                            key: key.to_owned(),
                            source: Source::Primary,
                        });
                        return Lookup::Hit(entry.value);
                    }
                    Err(e) => self.report(Operation::Decode, key, &e),
                },
                Ok(None) => {}
                Err(e) => {
                    self.report(Operation::Get, key, &e);
                    self.sync_state();
                }
            }
        }

        if let Some(entry) = self.fallback.get(key) {
            self.emitter.emit(|| CacheEvent::Hit {
                key: key.to_owned(),
                source: Source::Fallback,
            });
            return Lookup::Fallback(entry.value);
        }

        self.emitter.emit(|| CacheEvent::Miss {
            key: key.to_owned(),
        });
        Lookup::Miss
    }

    /// Writes `value` to the primary store (when reachable) and, always, to
    /// the fallback tier.
    ///
    /// Tags are associated only after the primary write succeeds; an entry
    /// that never reached the primary store has nothing there to invalidate.
    pub async fn set(&self, key: &str, value: Value, options: SetOptions) -> SetOutcome {
        let ttl = options.resolve_ttl(self.default_ttl);
        let tags: Vec<String> = options.tags().into_iter().map(str::to_owned).collect();
        let entry = CacheEntry::new(value, ttl, tags);

        let mut primary_written = false;
        let mut tags_associated = 0;

        if self.ensure_connected().await {
            match entry.encode() {
                Ok(text) => {
                    match self.store.set(&self.keyspace.entry_key(key), &text, ttl).await {
                        Ok(()) => primary_written = true,
                        Err(e) => {
                            self.report(Operation::Set, key, &e);
                            self.sync_state();
                        }
                    }
                }
                Err(e) => self.report(Operation::Encode, key, &e),
            }

            if primary_written {
                for tag in &entry.tags {
                    if self.tags.associate(tag, key).await {
                        tags_associated += 1;
                    }
                }
            }
        }

        let evicted = self.fallback.put(key, entry);
        if let Some(old) = &evicted {
            self.emitter
                .emit(|| CacheEvent::Evicted { key: old.clone() });
        }
        self.emitter.emit(|| CacheEvent::Set {
            key: key.to_owned(),
            primary: primary_written,
        });

        SetOutcome {
            primary_written,
            tags_associated,
            evicted,
        }
    }

    /// Invalidates every entry written with `tag`, in both tiers.
    pub async fn revalidate_tag(&self, tag: &str) -> Invalidation {
        self.ensure_connected().await;
        self.tags.invalidate(tag, &self.fallback).await
    }

    /// Called once per inbound request by the pipeline. The handler keeps no
    /// request-scoped state, so there is nothing to clear.
    pub fn reset_request_cache(&self) {
        trace!("reset_request_cache: no request-scoped state");
    }

    /// Gives the primary store a chance to (re)connect and records the result.
    async fn ensure_connected(&self) -> bool {
        let _ = self.state.compare_exchange(
            HandlerState::UNINITIALIZED,
            HandlerState::CONNECTING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let available = self.store.connect().await;
        self.sync_state();
        available
    }

    /// Mirrors the store's connection state, which a failed operation may
    /// have just dropped.
    fn sync_state(&self) {
        let next = if self.store.state() == ConnectionState::Connected {
            HandlerState::AVAILABLE
        } else {
            HandlerState::UNAVAILABLE
        };
        self.state.store(next, Ordering::Release);
    }

    fn report(&self, op: Operation, key: &str, error: &dyn std::fmt::Display) {
        self.emitter.emit(|| CacheEvent::Error {
            op,
            key: Some(key.to_owned()),
            message: error.to_string(),
        });
    }
}
