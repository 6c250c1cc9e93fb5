//! Async primary store client on top of `redis`.
//!
//! Holds at most one multiplexed connection to a Redis-compatible server.
//! The connection is established lazily, shared by every caller, and
//! re-established on demand after any transport error.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, FromRedisValue, RedisResult, Script};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{AtomicState, ConnectionState, PrimaryStore, StoreError, StoreResult};
use crate::config::{CacheConfig, ConfigError, MAX_TTL_SECS, ReconnectPolicy};
use crate::observer::{CacheEvent, Emitter, Operation};

/// Reads a tag set, deletes every member's entry and the set itself, and
/// returns the members. Runs atomically on the server.
///
/// KEYS[1] = set key, ARGV[1] = entry key prefix.
const INVALIDATE_SET_SCRIPT: &str = r"
local members = redis.call('SMEMBERS', KEYS[1])
for _, member in ipairs(members) do
    redis.call('DEL', ARGV[1] .. member)
end
redis.call('DEL', KEYS[1])
return members
";

/// A best-effort client for a Redis-compatible primary store.
///
/// - `connect` is idempotent and single-flight: concurrent callers that
///   arrive while an attempt is running wait for it and share its outcome.
/// - An attempt sequence dials up to `max_attempts` times, sleeping
///   `min(n * base_delay, max_delay)` after failure `n`.
/// - Each command is bounded by the operation timeout; any transport error
///   drops the connection and moves the state to `Disconnected`.
///
/// URL parsing, `AUTH` and `SELECT` are handled by [`redis::Client`]; a
/// dial counts as successful once the server has also answered `PING`.
///
/// # Examples
///
/// ```rust,no_run
/// use tagcache::config::CacheConfig;
/// use tagcache::observer::Emitter;
/// use tagcache::store::{PrimaryStore, PrimaryStoreClient};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = PrimaryStoreClient::from_config(&CacheConfig::default(), Emitter::tracing())?;
///     if client.connect().await {
///         println!("{:?}", client.get("greeting").await?);
///     }
///     Ok(())
/// }
/// ```
pub struct PrimaryStoreClient {
    client: Client,
    policy: ReconnectPolicy,
    state: AtomicState,
    // Bumped each time an attempt sequence finishes, successfully or not.
    epoch: AtomicU64,
    dials: AtomicU64,
    gate: Mutex<()>,
    // Cloned out per command; the multiplexed connection pairs replies itself.
    conn: StdMutex<Option<MultiplexedConnection>>,
    invalidate_script: Script,
    emitter: Emitter,
}

impl PrimaryStoreClient {
    /// Builds a client from the handler configuration. Does not dial.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Url`] if `config.url` cannot be parsed.
    pub fn from_config(config: &CacheConfig, emitter: Emitter) -> Result<Self, ConfigError> {
        Ok(Self::new(config.client()?, config.reconnect_policy(), emitter))
    }

    pub fn new(client: Client, policy: ReconnectPolicy, emitter: Emitter) -> Self {
        Self {
            client,
            policy,
            state: AtomicState::new(ConnectionState::Disconnected),
            epoch: AtomicU64::new(0),
            dials: AtomicU64::new(0),
            gate: Mutex::new(()),
            conn: StdMutex::new(None),
            invalidate_script: Script::new(INVALIDATE_SET_SCRIPT),
            emitter,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Total individual dial attempts made over the client's lifetime.
    pub fn connection_attempts(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    /// Drops the current connection, if any.
    pub fn close(&self) {
        if self.slot().take().is_some() {
            self.mark_disconnected("closed by client");
        }
    }

    /// Round-trips `PING`.
    pub async fn ping(&self) -> StoreResult<()> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    /// Server introspection via `INFO` and `DBSIZE` in one pipeline, parsed
    /// into `field -> value`. `DBSIZE` is reported as `keys`.
    ///
    /// Read-only; intended for metrics and health endpoints, never for the
    /// cache path.
    pub async fn diagnostics(&self) -> StoreResult<BTreeMap<String, String>> {
        let mut conn = self.connection()?;
        let mut pipe = redis::pipe();
        pipe.cmd("INFO").cmd("DBSIZE");
        let (text, keys): (String, u64) = self.guarded(pipe.query_async(&mut conn)).await?;

        let mut info = parse_info(&text);
        info.insert("keys".to_owned(), keys.to_string());
        Ok(info)
    }

    /// Sends an arbitrary command on the shared connection.
    ///
    /// Server error replies come back as [`StoreError::Redis`] and leave the
    /// connection intact; transport failures drop it.
    pub async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> StoreResult<T> {
        let mut conn = self.connection()?;
        self.guarded(cmd.query_async(&mut conn)).await
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<MultiplexedConnection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self) -> StoreResult<MultiplexedConnection> {
        self.slot().clone().ok_or(StoreError::Disconnected)
    }

    /// Bounds `request` by the operation timeout and drops the connection
    /// when the failure says it can no longer be trusted.
    async fn guarded<T>(&self, request: impl Future<Output = RedisResult<T>>) -> StoreResult<T> {
        let op_timeout = self.policy.operation_timeout;
        let result = match timeout(op_timeout, request).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(op_timeout)),
        };

        if let Err(e) = &result {
            if e.is_transport() {
                self.slot().take();
                self.mark_disconnected(&e.to_string());
            }
        }
        result
    }

    fn mark_disconnected(&self, reason: &str) {
        if self.state.swap(ConnectionState::Disconnected) == ConnectionState::Connected {
            warn!(%reason, "primary store connection dropped");
            self.emitter.emit(|| CacheEvent::Disconnected {
                reason: reason.to_owned(),
            });
        }
    }

    /// Runs one full attempt sequence. Only called with the gate held.
    async fn establish(&self) -> Option<MultiplexedConnection> {
        let max_attempts = self.policy.max_attempts;

        for attempt in 1..=max_attempts {
            self.dials.fetch_add(1, Ordering::Relaxed);

            match self.dial_once().await {
                Ok(conn) => {
                    debug!(attempt, "primary store handshake complete");
                    self.emitter
                        .emit(|| CacheEvent::Connected { attempts: attempt });
                    return Some(conn);
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    debug!(attempt, error = %e, "dial failed");
                    self.emitter
                        .emit(|| CacheEvent::Reconnect { attempt, delay });
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.emitter.emit(|| CacheEvent::Error {
                        op: Operation::Connect,
                        key: None,
                        message: format!("gave up after {max_attempts} attempts: {e}"),
                    });
                }
            }
        }

        None
    }

    async fn dial_once(&self) -> StoreResult<MultiplexedConnection> {
        let connect_timeout = self.policy.connect_timeout;
        let mut conn = timeout(
            connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::Timeout(connect_timeout))??;

        let op_timeout = self.policy.operation_timeout;
        let _: String = timeout(op_timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout(op_timeout))??;
        Ok(conn)
    }
}

/// Resets the connection state if an attempt sequence is abandoned midway,
/// and always advances the epoch so queued callers adopt this outcome.
struct AttemptGuard<'a> {
    state: &'a AtomicState,
    epoch: &'a AtomicU64,
    finished: bool,
}

impl<'a> AttemptGuard<'a> {
    fn begin(state: &'a AtomicState, epoch: &'a AtomicU64) -> Self {
        state.swap(ConnectionState::Connecting);
        Self {
            state,
            epoch,
            finished: false,
        }
    }

    fn finish(mut self, outcome: ConnectionState) {
        self.state.swap(outcome);
        self.finished = true;
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.state.swap(ConnectionState::Disconnected);
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

impl PrimaryStore for PrimaryStoreClient {
    async fn connect(&self) -> bool {
        if self.state.load() == ConnectionState::Connected {
            return true;
        }

        let observed = self.epoch.load(Ordering::Acquire);
        let _gate = self.gate.lock().await;

        // An attempt finished while we were queued; share its outcome.
        if self.epoch.load(Ordering::Acquire) != observed {
            return self.state.load() == ConnectionState::Connected;
        }

        let attempt = AttemptGuard::begin(&self.state, &self.epoch);
        match self.establish().await {
            Some(conn) => {
                *self.slot() = Some(conn);
                attempt.finish(ConnectionState::Connected);
                true
            }
            None => {
                attempt.finish(ConnectionState::Disconnected);
                false
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.state.load()
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.query(redis::cmd("SET").arg(key).arg(value).arg("PX").arg(px(ttl)))
            .await
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> StoreResult<bool> {
        let added: u64 = self.query(redis::cmd("SADD").arg(set_key).arg(member)).await?;
        Ok(added > 0)
    }

    async fn members_of(&self, set_key: &str) -> StoreResult<Vec<String>> {
        self.query(redis::cmd("SMEMBERS").arg(set_key)).await
    }

    async fn invalidate_set(&self, set_key: &str, key_prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection()?;
        let mut invocation = self.invalidate_script.prepare_invoke();
        invocation.key(set_key).arg(key_prefix);
        self.guarded(invocation.invoke_async(&mut conn)).await
    }

    async fn delete_keys(&self, keys: &[String]) -> StoreResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        self.query(&cmd).await
    }

    async fn delete_key(&self, key: &str) -> StoreResult<bool> {
        let removed: u64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }
}

/// `ttl` in whole milliseconds for `SET .. PX`. The server rejects `PX 0`,
/// so sub-millisecond TTLs round up; the top is capped at [`MAX_TTL_SECS`].
fn px(ttl: Duration) -> u64 {
    let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    ms.clamp(1, MAX_TTL_SECS * 1000)
}

/// Parses `INFO` output: `# Section` headers and blank lines are skipped,
/// every other line is `field:value`.
fn parse_info(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}
