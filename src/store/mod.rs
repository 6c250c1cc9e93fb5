//! Primary store access — the networked tier the handler prefers when it is up.
//!
//! [`PrimaryStore`] is the seam between the orchestration logic and whatever
//! holds the shared data. Two implementations ship with the crate:
//!
//! - [`PrimaryStoreClient`]: a `redis` multiplexed connection wrapped in lazy
//!   single-flight connect, bounded reconnect backoff, and per-operation
//!   timeouts.
//! - [`MemoryStore`]: an in-process stand-in that can be switched offline,
//!   for tests and local development.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use thiserror::Error;

pub mod client;
pub mod memory;

pub use client::PrimaryStoreClient;
pub use memory::MemoryStore;

/// Primary store failures. None of these ever reach a cache caller; the
/// handler downgrades them and reports them through the observer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("primary store error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("not connected to the primary store")]
    Disconnected,
}

impl StoreError {
    /// `true` when the connection can no longer be trusted. Server error
    /// replies and type mismatches leave it usable.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            Self::Timeout(_) | Self::Disconnected => true,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Redis(e.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Lifecycle of the single primary connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An atomically-updated [`ConnectionState`].
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Stores `state` and returns the previous one.
    pub(crate) fn swap(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }
}

/// The primitives the cache handler and tag index need from the primary tier.
///
/// # Contract
///
/// - Every method takes `&self`; implementations must be safe to share
///   across Tokio tasks.
/// - [`connect`](Self::connect) never fails loudly: it reports the outcome
///   as a `bool` and is a no-op when already connected.
/// - Data operations on a disconnected store return
///   [`StoreError::Disconnected`] rather than dialing on their own.
/// - Every returned future must resolve in bounded time.
pub trait PrimaryStore: Send + Sync + 'static {
    /// Ensures a connection exists. Returns `true` when connected.
    fn connect(&self) -> impl Future<Output = bool> + Send;

    fn state(&self) -> ConnectionState;

    /// `Ok(None)` when the key does not exist.
    fn get(&self, key: &str) -> impl Future<Output = StoreResult<Option<String>>> + Send;

    /// Writes `value` under `key`, expiring after `ttl`.
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Adds `member` to the set at `set_key`. Returns `true` if it was new.
    fn add_to_set(
        &self,
        set_key: &str,
        member: &str,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    /// All members of the set at `set_key`; empty when the set does not exist.
    fn members_of(&self, set_key: &str) -> impl Future<Output = StoreResult<Vec<String>>> + Send;

    /// Invalidates a tag in one atomic step: reads the members of the set at
    /// `set_key`, deletes `key_prefix + member` for each of them, and deletes
    /// the set. Returns the members that were read.
    ///
    /// No other write can land between the read and the deletes, so a member
    /// added concurrently is either returned (and its entry deleted) or still
    /// in a fresh set afterwards.
    fn invalidate_set(
        &self,
        set_key: &str,
        key_prefix: &str,
    ) -> impl Future<Output = StoreResult<Vec<String>>> + Send;

    /// Deletes all `keys` in one batch. Returns how many existed.
    fn delete_keys(&self, keys: &[String]) -> impl Future<Output = StoreResult<usize>> + Send;

    /// Deletes one key. Returns `true` if it existed.
    fn delete_key(&self, key: &str) -> impl Future<Output = StoreResult<bool>> + Send;
}
