//! Two windows sharing one in-memory channel
//!
//! Window A edits a counter in a burst; window B follows along. Run with
//! `RUST_LOG=tabsync=debug` to watch the source marker being claimed and
//! released around each flush.

use anyhow::{anyhow, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tabsync::{attach, HostStore, MemoryChannel, MemoryStore, StoreKeys, StoreOptions};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("🚀 Tabsync - Two Windows Example\n");

    let channel = MemoryChannel::new();
    let keys = StoreKeys::with_default_prefix("counter");
    let options = StoreOptions::enabled();

    let a = Arc::new(MemoryStore::new(json!({ "count": 0 })));
    let b = Arc::new(MemoryStore::new(json!({ "count": 0 })));

    let _a_sync = attach(keys.clone(), &options, a.clone(), Arc::new(channel.open_window()))?
        .ok_or_else(|| anyhow!("window A not attached"))?;
    let _b_sync = attach(keys.clone(), &options, b.clone(), Arc::new(channel.open_window()))?
        .ok_or_else(|| anyhow!("window B not attached"))?;

    for i in 1..=5 {
        a.update(|state| state["count"] = json!(i));
        println!("A: {}   B: {}", a.state(), b.state());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    tokio::time::sleep(options.debounce() + Duration::from_millis(50)).await;
    println!("\nAfter the quiet period:");
    println!("A: {}   B: {}", a.state(), b.state());
    println!(
        "Snapshot writes: {}",
        channel.write_count(keys.snapshot())
    );

    Ok(())
}
