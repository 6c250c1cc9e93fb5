//! In-process primary store.
//!
//! Behaves like a single Redis-compatible server: string values with expiry,
//! sets that disappear when emptied, and one "connection" that can be taken
//! offline to simulate an outage. Every command is atomic with respect to
//! every other, matching the server's single-threaded execution.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use super::{AtomicState, ConnectionState, PrimaryStore, StoreError, StoreResult};
use crate::config::MAX_TTL_SECS;

/// Expiry used when `now + ttl` is not representable on this platform.
const FALLBACK_HORIZON: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A primary store that lives in process memory.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tagcache::store::{MemoryStore, PrimaryStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new();
/// assert!(store.connect().await);
/// store.set("k", "v", Duration::from_secs(60)).await.unwrap();
/// assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
///
/// store.set_online(false);
/// assert!(store.get("k").await.is_err());
/// assert!(!store.connect().await);
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    data: Mutex<Data>,
    online: AtomicBool,
    state: AtomicState,
    connect_calls: AtomicU64,
    connect_delay: Duration,
}

#[derive(Debug, Default)]
struct Data {
    values: HashMap<String, (String, Instant)>,
    sets: HashMap<String, HashSet<String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(Data::default()),
            online: AtomicBool::new(true),
            state: AtomicState::new(ConnectionState::Disconnected),
            connect_calls: AtomicU64::new(0),
            connect_delay: Duration::ZERO,
        }
    }

    /// A store that starts offline and refuses every connection.
    pub fn offline() -> Self {
        let store = Self::new();
        store.online.store(false, Ordering::Release);
        store
    }

    /// Makes each `connect` call take `delay`, to widen race windows in tests.
    #[must_use]
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Simulates an outage (`false`) or recovery (`true`).
    ///
    /// Going offline drops the connection; recovery requires a new `connect`.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
        if !online {
            self.state.swap(ConnectionState::Disconnected);
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// How many times `connect` has actually tried to connect.
    pub fn connect_calls(&self) -> u64 {
        self.connect_calls.load(Ordering::Relaxed)
    }

    /// Writes raw text under `key`, bypassing the connection check.
    /// `ttl` is capped at [`MAX_TTL_SECS`].
    pub fn insert_raw(&self, key: &str, value: &str, ttl: Duration) {
        self.data()
            .values
            .insert(key.to_owned(), (value.to_owned(), expiry(ttl)));
    }

    /// Whether `key` currently holds an unexpired value.
    pub fn contains_key(&self, key: &str) -> bool {
        self.data()
            .values
            .get(key)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }

    fn data(&self) -> MutexGuard<'_, Data> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> StoreResult<()> {
        if !self.is_online() {
            self.state.swap(ConnectionState::Disconnected);
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "memory store offline",
            )
            .into());
        }
        if self.state.load() != ConnectionState::Connected {
            return Err(StoreError::Disconnected);
        }
        Ok(())
    }
}

impl PrimaryStore for MemoryStore {
    async fn connect(&self) -> bool {
        if self.state.load() == ConnectionState::Connected && self.is_online() {
            return true;
        }
        self.connect_calls.fetch_add(1, Ordering::Relaxed);
        self.state.swap(ConnectionState::Connecting);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let outcome = if self.is_online() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        self.state.swap(outcome);
        outcome == ConnectionState::Connected
    }

    fn state(&self) -> ConnectionState {
        self.state.load()
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        let mut data = self.data();
        let expired = match data.values.get(key) {
            Some((value, expires)) if *expires > Instant::now() => {
                return Ok(Some(value.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            data.values.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check()?;
        self.insert_raw(key, value, ttl);
        Ok(())
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self
            .data()
            .sets
            .entry(set_key.to_owned())
            .or_default()
            .insert(member.to_owned()))
    }

    async fn members_of(&self, set_key: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        Ok(self
            .data()
            .sets
            .get(set_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn invalidate_set(&self, set_key: &str, key_prefix: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        let mut data = self.data();
        let Some(members) = data.sets.remove(set_key) else {
            return Ok(Vec::new());
        };
        for member in &members {
            data.values.remove(&format!("{key_prefix}{member}"));
        }
        Ok(members.into_iter().collect())
    }

    async fn delete_keys(&self, keys: &[String]) -> StoreResult<usize> {
        self.check()?;
        let mut data = self.data();
        let mut removed = 0;
        for key in keys {
            if data.values.remove(key).is_some() || data.sets.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_key(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let mut data = self.data();
        Ok(data.values.remove(key).is_some() || data.sets.remove(key).is_some())
    }
}

fn expiry(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl.min(Duration::from_secs(MAX_TTL_SECS)))
        .unwrap_or_else(|| now + FALLBACK_HORIZON)
}
