//! Shared helpers for integration tests: a tiny Redis-compatible server that
//! runs inside the test process and can be taken offline on demand.
//!
//! It understands the commands the crate sends, including the tag
//! invalidation script via `SCRIPT LOAD` and `EVALSHA`.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

use tagcache::CacheConfig;
use tracing_subscriber::EnvFilter;

/// How often an idle connection re-checks the online flag.
const POLL: Duration = Duration::from_millis(10);

pub struct TestServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    online: AtomicBool,
    accepted: AtomicU64,
    commands: Mutex<Vec<String>>,
    password: Option<String>,
    data: Mutex<Data>,
}

#[derive(Default)]
struct Data {
    values: HashMap<String, (String, Instant)>,
    sets: HashMap<String, BTreeSet<String>>,
    scripts: Vec<String>,
}

/// Placeholder digest handed back by `SCRIPT LOAD`.
const SCRIPT_SHA: &str = "0000000000000000000000000000000000000000";

/// Commands the client library sends on its own during connection setup.
const SETUP_COMMANDS: &[&str] = &["CLIENT", "HELLO"];

enum Reply {
    Status(&'static str),
    Error(String),
    Integer(i64),
    Bulk(String),
    Nil,
    Array(Vec<String>),
}

impl Reply {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Status(s) => out.extend_from_slice(format!("+{s}\r\n").as_bytes()),
            Self::Error(e) => out.extend_from_slice(format!("-{e}\r\n").as_bytes()),
            Self::Integer(n) => out.extend_from_slice(format!(":{n}\r\n").as_bytes()),
            Self::Bulk(b) => {
                out.extend_from_slice(format!("${}\r\n{b}\r\n", b.len()).as_bytes());
            }
            Self::Nil => out.extend_from_slice(b"$-1\r\n"),
            Self::Array(items) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    Self::Bulk(item.clone()).encode(out);
                }
            }
        }
    }
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    /// A server that rejects every command until `AUTH <password>` succeeds.
    pub async fn start_with_password(password: &str) -> Self {
        Self::start_with(Some(password.to_owned())).await
    }

    async fn start_with(password: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let shared = Arc::new(Shared {
            online: AtomicBool::new(true),
            password,
            ..Shared::default()
        });

        let task = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    shared.accepted.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(serve(stream, Arc::clone(&shared)));
                }
            }
        });

        Self { addr, shared, task }
    }

    pub fn url(&self) -> String {
        format!("redis://{}", self.addr)
    }

    /// A config pointing at this server with test-friendly timings.
    pub fn config(&self) -> CacheConfig {
        fast_config().with_url(self.url())
    }

    /// Offline: open connections are dropped and new ones are closed
    /// before they can complete a handshake.
    pub fn set_online(&self, online: bool) {
        self.shared.online.store(online, Ordering::Release);
    }

    pub fn accepted(&self) -> u64 {
        self.shared.accepted.load(Ordering::Relaxed)
    }

    /// Names of every command received, in order, leaving out what the
    /// client library sends on its own while setting up a connection.
    pub fn commands(&self) -> Vec<String> {
        self.shared
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !SETUP_COMMANDS.contains(&c.as_str()))
            .cloned()
            .collect()
    }

    pub fn raw_get(&self, key: &str) -> Option<String> {
        let data = self.shared.data.lock().unwrap();
        data.values
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(v, _)| v.clone())
    }

    pub fn raw_set(&self, key: &str, value: &str) {
        self.shared.data.lock().unwrap().values.insert(
            key.to_owned(),
            (value.to_owned(), Instant::now() + Duration::from_secs(600)),
        );
    }

    pub fn raw_members(&self, set_key: &str) -> Vec<String> {
        let data = self.shared.data.lock().unwrap();
        data.sets
            .get(set_key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shared.online.store(false, Ordering::Release);
        self.task.abort();
    }
}

/// Routes library logs to the test harness; set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A config whose reconnects and timeouts finish within tens of milliseconds.
pub fn fast_config() -> CacheConfig {
    CacheConfig {
        reconnect_max_attempts: 3,
        reconnect_base_delay_ms: 5,
        reconnect_max_delay_ms: 20,
        connect_timeout_ms: 200,
        operation_timeout_ms: 200,
        ..CacheConfig::default()
    }
}

/// An address nothing listens on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("redis://{addr}")
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut buf = BytesMut::with_capacity(4096);
    let mut authed = shared.password.is_none();

    loop {
        if !shared.online.load(Ordering::Acquire) {
            return;
        }

        match parse_command(&buf) {
            Ok(Some((args, used))) => {
                buf.advance(used);
                let mut out = Vec::new();
                shared.apply(args, &mut authed).encode(&mut out);
                if stream.write_all(&out).await.is_err() {
                    return;
                }
                continue;
            }
            Ok(None) => {}
            Err(()) => return,
        }

        match timeout(POLL, stream.read_buf(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return,
            Ok(Ok(_)) | Err(_) => {}
        }
    }
}

/// Parses one `*<n>` array of bulk strings from the front of `buf`.
/// `Ok(None)` means more bytes are needed.
fn parse_command(buf: &[u8]) -> Result<Option<(Vec<String>, usize)>, ()> {
    let mut pos = 0;
    let Some(count) = read_header(buf, &mut pos, b'*')? else {
        return Ok(None);
    };
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let Some(len) = read_header(buf, &mut pos, b'$')? else {
            return Ok(None);
        };
        if buf.len() < pos + len + 2 {
            return Ok(None);
        }
        let arg = std::str::from_utf8(&buf[pos..pos + len]).map_err(|_| ())?;
        args.push(arg.to_owned());
        pos += len + 2;
    }
    Ok(Some((args, pos)))
}

/// Reads `<prefix><number>\r\n` at `pos`.
fn read_header(buf: &[u8], pos: &mut usize, prefix: u8) -> Result<Option<usize>, ()> {
    let rest = &buf[*pos..];
    let Some(end) = rest.windows(2).position(|w| w == b"\r\n") else {
        return Ok(None);
    };
    if rest.first() != Some(&prefix) {
        return Err(());
    }
    let n = std::str::from_utf8(&rest[1..end])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(())?;
    *pos += end + 2;
    Ok(Some(n))
}

impl Shared {
    fn apply(&self, args: Vec<String>, authed: &mut bool) -> Reply {
        let Some((name, rest)) = args.split_first() else {
            return Reply::Error("ERR empty command".into());
        };
        let name = name.to_ascii_uppercase();
        self.commands.lock().unwrap().push(name.clone());

        if name == "AUTH" {
            // `AUTH <password>` or `AUTH <user> <password>`.
            return match (&self.password, rest.last()) {
                (Some(expected), Some(given)) if expected == given => {
                    *authed = true;
                    Reply::Status("OK")
                }
                _ => Reply::Error("WRONGPASS invalid username-password pair".into()),
            };
        }
        if !*authed {
            return Reply::Error("NOAUTH Authentication required.".into());
        }

        let mut data = self.data.lock().unwrap();
        let now = Instant::now();
        data.values.retain(|_, (_, expires)| *expires > now);

        match (name.as_str(), rest) {
            ("PING", _) => Reply::Status("PONG"),
            ("SELECT", [_]) | ("CLIENT", _) => Reply::Status("OK"),
            ("GET", [key]) => match data.values.get(key) {
                Some((value, _)) => Reply::Bulk(value.clone()),
                None => Reply::Nil,
            },
            ("SET", [key, value, px, ms]) if px.eq_ignore_ascii_case("PX") => {
                let Ok(ms) = ms.parse::<u64>() else {
                    return Reply::Error("ERR value is not an integer or out of range".into());
                };
                if ms == 0 {
                    return Reply::Error("ERR invalid expire time in 'set' command".into());
                }
                let Some(expires) = now.checked_add(Duration::from_millis(ms)) else {
                    return Reply::Error("ERR invalid expire time in 'set' command".into());
                };
                data.values.insert(key.clone(), (value.clone(), expires));
                Reply::Status("OK")
            }
            ("SADD", [set_key, member]) => {
                let added = data.sets.entry(set_key.clone()).or_default().insert(member.clone());
                Reply::Integer(i64::from(added))
            }
            ("SMEMBERS", [set_key]) => Reply::Array(
                data.sets
                    .get(set_key)
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default(),
            ),
            ("DEL", keys) if !keys.is_empty() => {
                let removed = keys
                    .iter()
                    .filter(|k| data.values.remove(*k).is_some() || data.sets.remove(*k).is_some())
                    .count();
                Reply::Integer(removed as i64)
            }
            ("DBSIZE", []) => Reply::Integer((data.values.len() + data.sets.len()) as i64),
            ("INFO", _) => Reply::Bulk(
                "# Server\r\nredis_version:7.2.4\r\n\r\n# Clients\r\nconnected_clients:1\r\n"
                    .into(),
            ),
            ("SCRIPT", [sub, body]) if sub.eq_ignore_ascii_case("LOAD") => {
                data.scripts.push(body.clone());
                Reply::Bulk(SCRIPT_SHA.into())
            }
            ("EVALSHA", [_, numkeys, set_key, prefix]) if numkeys == "1" => {
                if data.scripts.is_empty() {
                    return Reply::Error("NOSCRIPT No matching script. Please use EVAL.".into());
                }
                let known = data.scripts.iter().any(|body| body.contains("SMEMBERS"));
                if !known {
                    return Reply::Error("ERR script not supported by the test server".into());
                }
                invalidate_set(&mut data, set_key, prefix)
            }
            ("EVAL", [body, numkeys, set_key, prefix])
                if numkeys == "1" && body.contains("SMEMBERS") =>
            {
                invalidate_set(&mut data, set_key, prefix)
            }
            _ => Reply::Error(format!("ERR unknown command '{name}'")),
        }
    }
}

/// What the tag invalidation script does, in one step under the data lock.
fn invalidate_set(data: &mut Data, set_key: &str, prefix: &str) -> Reply {
    let members: Vec<String> = data
        .sets
        .remove(set_key)
        .map(|set| set.into_iter().collect())
        .unwrap_or_default();
    for member in &members {
        data.values.remove(&format!("{prefix}{member}"));
    }
    Reply::Array(members)
}
