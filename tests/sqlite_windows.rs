use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use tabsync::channel::WindowId;
use tabsync::{
    attach, HostStore, MemoryStore, SharedChannel, SqliteChannel, StoreKeys, StoreOptions,
};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

fn open(dir: &TempDir) -> Result<Arc<SqliteChannel>> {
    Ok(Arc::new(SqliteChannel::open_with(
        dir.path().join("channel.db"),
        WindowId::new(),
        Duration::from_millis(10),
    )?))
}

async fn wait_for_state(store: &MemoryStore, expected: &Value) -> Result<()> {
    timeout(Duration::from_secs(5), async {
        while store.state() != *expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("store never reached {expected}; last state {}", store.state()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_processes_converge_through_sqlite() -> Result<()> {
    let dir = TempDir::new()?;
    let options = StoreOptions::enabled().with_debounce(Duration::from_millis(30));
    let keys = StoreKeys::with_default_prefix("prefs");

    let a_store = Arc::new(MemoryStore::default());
    let a_channel = open(&dir)?;
    let _a = attach(keys.clone(), &options, a_store.clone(), a_channel.clone())?
        .ok_or_else(|| anyhow!("window a not attached"))?;

    let b_store = Arc::new(MemoryStore::default());
    let _b = attach(keys.clone(), &options, b_store.clone(), open(&dir)?)?
        .ok_or_else(|| anyhow!("window b not attached"))?;

    a_store.set(json!({"theme": "dark", "size": 14}));
    wait_for_state(&b_store, &json!({"theme": "dark", "size": 14})).await?;

    b_store.set(json!({"theme": "light", "size": 14}));
    wait_for_state(&a_store, &json!({"theme": "light", "size": 14})).await?;

    assert_eq!(a_channel.get(keys.source())?, None);
    assert_eq!(a_channel.get(keys.acceptor())?.as_deref(), Some("true"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_window_replays_from_file() -> Result<()> {
    let dir = TempDir::new()?;
    let options = StoreOptions::enabled().with_debounce(Duration::from_millis(20));
    let keys = StoreKeys::with_default_prefix("cart");

    {
        let store = Arc::new(MemoryStore::default());
        let handle = attach(keys.clone(), &options, store.clone(), open(&dir)?)?
            .ok_or_else(|| anyhow!("not attached"))?;
        store.set(json!({"items": ["apple"]}));
        sleep(Duration::from_millis(60)).await;
        handle.coordinator().wait_idle().await;
    }

    let store = Arc::new(MemoryStore::default());
    let _handle = attach(keys, &options, store.clone(), open(&dir)?)?;
    assert_eq!(store.state(), json!({"items": ["apple"]}));
    Ok(())
}
