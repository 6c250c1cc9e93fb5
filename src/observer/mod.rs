//! Operation observer — structured events for every branch the cache takes.
//!
//! Every hit, miss, write, eviction, invalidation, error, and connection
//! transition is reported as a [`CacheEvent`] to an optional
//! [`CacheObserver`]. Nothing in the crate depends on an observer being
//! present; it exists so operators can see degraded behavior that callers
//! never will.
//!
//! ## Provided observers
//!
//! - [`TracingObserver`]: logs each event through `tracing` (the default).
//! - [`CacheStats`]: lock-free counters with a serializable snapshot.
//! - [`Observers`]: fans one event out to several observers.
//! - any `Fn(&CacheEvent) + Send + Sync` closure.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

/// Which tier answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Primary,
    Fallback,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        })
    }
}

/// The operation that produced an [`CacheEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Get,
    Set,
    Associate,
    Members,
    Delete,
    Encode,
    Decode,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Get => "get",
            Self::Set => "set",
            Self::Associate => "associate",
            Self::Members => "members",
            Self::Delete => "delete",
            Self::Encode => "encode",
            Self::Decode => "decode",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observable outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Hit { key: String, source: Source },
    Miss { key: String },
    /// A write completed; `primary` is `false` when only the fallback took it.
    Set { key: String, primary: bool },
    /// The fallback tier dropped `key` to make room.
    Evicted { key: String },
    Invalidated { tag: String, primary: usize, fallback: usize },
    /// `op` is [`Operation::Connect`] when an attempt sequence gave up.
    Error {
        op: Operation,
        key: Option<String>,
        message: String,
    },
    /// Dial attempt `attempt` failed; the next one starts after `delay`.
    Reconnect { attempt: u32, delay: Duration },
    Connected { attempts: u32 },
    /// An established connection was lost.
    Disconnected { reason: String },
}

/// A sink for [`CacheEvent`]s.
///
/// Called inline on the request path, so implementations should be cheap and
/// must not block.
pub trait CacheObserver: Send + Sync {
    fn on_event(&self, event: &CacheEvent);
}

impl<F> CacheObserver for F
where
    F: Fn(&CacheEvent) + Send + Sync,
{
    fn on_event(&self, event: &CacheEvent) {
        self(event)
    }
}

/// Cheaply-cloneable handle used by every component to report events.
///
/// Events are built lazily, so a disabled emitter costs one branch.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tagcache::observer::{CacheEvent, CacheStats, Emitter};
///
/// let stats = Arc::new(CacheStats::default());
/// let emitter = Emitter::new(stats.clone());
/// emitter.emit(|| CacheEvent::Miss { key: "k".into() });
/// assert_eq!(stats.snapshot().misses, 1);
///
/// Emitter::none().emit(|| unreachable!("never built"));
/// ```
#[derive(Clone)]
pub struct Emitter {
    inner: Option<Arc<dyn CacheObserver>>,
}

impl Emitter {
    pub fn new(observer: Arc<dyn CacheObserver>) -> Self {
        Self {
            inner: Some(observer),
        }
    }

    /// An emitter that drops every event.
    pub fn none() -> Self {
        Self { inner: None }
    }

    /// An emitter backed by [`TracingObserver`].
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingObserver))
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn emit(&self, make: impl FnOnce() -> CacheEvent) {
        if let Some(observer) = &self.inner {
            observer.on_event(&make());
        }
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::tracing()
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Logs every event with structured fields.
///
/// Levels: reads and writes at `debug`/`trace`, connection changes at `info`,
/// errors and failed dials at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CacheObserver for TracingObserver {
    fn on_event(&self, event: &CacheEvent) {
        match event {
            CacheEvent::Hit { key, source } => debug!(%key, %source, "cache hit"),
            CacheEvent::Miss { key } => debug!(%key, "cache miss"),
            CacheEvent::Set { key, primary } => trace!(%key, primary, "cache set"),
            CacheEvent::Evicted { key } => trace!(%key, "fallback evicted entry"),
            CacheEvent::Invalidated {
                tag,
                primary,
                fallback,
            } => info!(%tag, primary, fallback, "tag revalidated"),
            CacheEvent::Error { op, key, message } => warn!(
                op = %op,
                key = key.as_deref().unwrap_or("-"),
                error = %message,
                "cache operation failed"
            ),
            CacheEvent::Reconnect { attempt, delay } => {
                warn!(attempt, delay_ms = delay.as_millis() as u64, "store dial failed, retrying")
            }
            CacheEvent::Connected { attempts } => info!(attempts, "store connected"),
            CacheEvent::Disconnected { reason } => warn!(%reason, "store disconnected"),
        }
    }
}

/// Atomic counters over the event stream.
#[derive(Debug, Default)]
pub struct CacheStats {
    primary_hits: AtomicU64,
    fallback_hits: AtomicU64,
    misses: AtomicU64,
    primary_sets: AtomicU64,
    fallback_only_sets: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
}

/// A point-in-time copy of [`CacheStats`], ready to serialize for a metrics endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub primary_hits: u64,
    pub fallback_hits: u64,
    pub misses: u64,
    pub primary_sets: u64,
    pub fallback_only_sets: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub connects: u64,
    pub disconnects: u64,
}

impl StatsSnapshot {
    /// Fraction of reads answered by either tier, or `0.0` with no reads.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.primary_hits + self.fallback_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl CacheStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            primary_hits: load(&self.primary_hits),
            fallback_hits: load(&self.fallback_hits),
            misses: load(&self.misses),
            primary_sets: load(&self.primary_sets),
            fallback_only_sets: load(&self.fallback_only_sets),
            evictions: load(&self.evictions),
            invalidations: load(&self.invalidations),
            errors: load(&self.errors),
            reconnects: load(&self.reconnects),
            connects: load(&self.connects),
            disconnects: load(&self.disconnects),
        }
    }
}

impl CacheObserver for CacheStats {
    fn on_event(&self, event: &CacheEvent) {
        let counter = match event {
            CacheEvent::Hit {
                source: Source::Primary,
                ..
            } => &self.primary_hits,
            CacheEvent::Hit {
                source: Source::Fallback,
                ..
            } => &self.fallback_hits,
            CacheEvent::Miss { .. } => &self.misses,
            CacheEvent::Set { primary: true, .. } => &self.primary_sets,
            CacheEvent::Set { primary: false, .. } => &self.fallback_only_sets,
            CacheEvent::Evicted { .. } => &self.evictions,
            CacheEvent::Invalidated { .. } => &self.invalidations,
            CacheEvent::Error { .. } => &self.errors,
            CacheEvent::Reconnect { .. } => &self.reconnects,
            CacheEvent::Connected { .. } => &self.connects,
            CacheEvent::Disconnected { .. } => &self.disconnects,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Forwards each event to every observer in order.
#[derive(Default, Clone)]
pub struct Observers {
    inner: Vec<Arc<dyn CacheObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.inner.push(observer);
        self
    }
}

impl CacheObserver for Observers {
    fn on_event(&self, event: &CacheEvent) {
        for observer in &self.inner {
            observer.on_event(event);
        }
    }
}
