//! Walks through a primary-store outage with the in-process store.
//!
//! ```text
//! RUST_LOG=tagcache=debug cargo run --example outage
//! ```

use std::sync::Arc;

use serde_json::json;
use tagcache::observer::{CacheStats, Observers, TracingObserver};
use tagcache::{CacheConfig, CacheHandler, Emitter, MemoryStore, SetOptions};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tagcache=debug")),
        )
        .init();

    let stats = Arc::new(CacheStats::default());
    let emitter = Emitter::new(Arc::new(
        Observers::new()
            .with(Arc::new(TracingObserver))
            .with(stats.clone()),
    ));

    let config = CacheConfig::from_json(r#"{ "fallbackCapacity": 2 }"#)?;
    let store = Arc::new(MemoryStore::new());
    let cache = CacheHandler::new(config, store.clone(), emitter);

    let tech = SetOptions::new().tag("category:technology");
    cache.set("/posts/rust", json!("<article>rust</article>"), tech.clone()).await;
    cache.set("/posts/tokio", json!("<article>tokio</article>"), tech).await;
    println!("healthy:  {:?}", cache.get("/posts/rust").await);

    store.set_online(false);
    println!("outage:   {:?}", cache.get("/posts/rust").await);
    cache.set("/about", json!("<p>about</p>"), SetOptions::new()).await;
    println!("evicted:  {:?}", cache.get("/posts/rust").await);

    store.set_online(true);
    let report = cache.revalidate_tag("category:technology").await;
    println!("revalidated: {}", serde_json::to_string(&report)?);
    println!("after:    {:?}", cache.get("/posts/tokio").await);

    println!("stats: {}", serde_json::to_string_pretty(&stats.snapshot())?);
    Ok(())
}
