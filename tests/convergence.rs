use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tabsync::{
    attach, HostStore, MemoryChannel, MemoryStore, RemoteOutcome, SharedChannel, StoreKeys,
    StoreOptions, SyncHandle,
};
use tokio::time::sleep;

const STORE: &str = "S";

struct Window {
    store: Arc<MemoryStore>,
    sync: SyncHandle,
}

fn open_window(channel: &MemoryChannel, initial: Value) -> Window {
    let store = Arc::new(MemoryStore::new(initial));
    let sync = attach(
        StoreKeys::with_default_prefix(STORE),
        &StoreOptions::enabled(),
        store.clone(),
        Arc::new(channel.open_window()),
    )
    .unwrap()
    .expect("synchronization enabled");
    Window { store, sync }
}

fn keys() -> StoreKeys {
    StoreKeys::with_default_prefix(STORE)
}

#[tokio::test(start_paused = true)]
async fn count_scenario_reaches_other_window() {
    let channel = MemoryChannel::new();
    let a = open_window(&channel, json!({"count": 0}));
    let b = open_window(&channel, json!({"count": 0}));

    a.store.set(json!({"count": 1}));
    sleep(Duration::from_millis(300)).await;
    sleep(Duration::from_millis(10)).await;

    assert_eq!(channel.peek(keys().snapshot()).as_deref(), Some(r#"{"count":1}"#));
    assert_eq!(b.store.state(), json!({"count": 1}));
    assert_eq!(channel.peek(keys().source()), None);
    assert!(!a.sync.coordinator().is_source());
}

#[tokio::test(start_paused = true)]
async fn converges_after_burst_in_one_window() {
    let channel = MemoryChannel::new();
    let a = open_window(&channel, json!({"items": []}));
    let b = open_window(&channel, json!({"items": []}));

    for i in 0..20 {
        a.store.update(|state| {
            state["items"].as_array_mut().unwrap().push(json!(i));
        });
        sleep(Duration::from_millis(10)).await;
    }
    sleep(Duration::from_millis(400)).await;

    assert_eq!(channel.write_count(keys().snapshot()), 1);
    assert_eq!(b.store.state(), a.store.state());
    assert_eq!(b.store.state()["items"].as_array().unwrap().len(), 20);
}

#[tokio::test(start_paused = true)]
async fn windows_take_turns_as_source() {
    let channel = MemoryChannel::new();
    let a = open_window(&channel, json!({}));
    let b = open_window(&channel, json!({}));

    a.store.set(json!({"turn": "a"}));
    sleep(Duration::from_millis(400)).await;
    assert_eq!(b.store.state(), json!({"turn": "a"}));

    b.store.set(json!({"turn": "b"}));
    sleep(Duration::from_millis(400)).await;
    assert_eq!(a.store.state(), json!({"turn": "b"}));
    assert_eq!(channel.peek(keys().snapshot()).as_deref(), Some(r#"{"turn":"b"}"#));

    assert_eq!(channel.peek(keys().source()), None);
    assert_eq!(channel.peek(keys().acceptor()).as_deref(), Some("true"));
}

#[tokio::test(start_paused = true)]
async fn new_window_starts_from_persisted_snapshot() {
    let channel = MemoryChannel::new();
    let a = open_window(&channel, json!({}));
    a.store.set(json!({"user": {"name": "ada"}}));
    sleep(Duration::from_millis(400)).await;

    let c = open_window(&channel, json!({}));
    assert_eq!(c.store.state(), json!({"user": {"name": "ada"}}));
}

#[tokio::test(start_paused = true)]
async fn applied_snapshot_is_not_echoed_back() {
    let channel = MemoryChannel::new();
    let a = open_window(&channel, json!({}));
    let b = open_window(&channel, json!({}));

    a.store.set(json!({"count": 3}));
    sleep(Duration::from_secs(2)).await;

    assert_eq!(b.store.state(), json!({"count": 3}));
    assert_eq!(channel.write_count(keys().snapshot()), 1);
    assert_eq!(a.sync.coordinator().stats().applied, 0);
    assert_eq!(b.sync.coordinator().stats().applied, 1);
}

#[tokio::test(start_paused = true)]
async fn removed_key_disappears_in_other_window() {
    let channel = MemoryChannel::new();
    let a = open_window(&channel, json!({}));
    let b = open_window(&channel, json!({}));

    a.store.set(json!({"filter": "x", "count": 1}));
    sleep(Duration::from_millis(400)).await;
    assert_eq!(b.store.state(), json!({"filter": "x", "count": 1}));

    a.store.set(json!({"count": 1}));
    sleep(Duration::from_millis(400)).await;
    assert_eq!(b.store.state(), a.store.state());

    let coordinator = b.sync.coordinator();
    assert_eq!(coordinator.on_remote_change(r#"{"count":1}"#), RemoteOutcome::Unchanged);
}

#[tokio::test(start_paused = true)]
async fn repeated_remote_snapshot_patches_once() {
    let channel = MemoryChannel::new();
    let b = open_window(&channel, json!({"count": 0}));
    let coordinator = b.sync.coordinator();

    assert_eq!(coordinator.on_remote_change(r#"{"count":4}"#), RemoteOutcome::Applied);
    assert_eq!(coordinator.on_remote_change(r#"{"count":4}"#), RemoteOutcome::Unchanged);
    assert_eq!(coordinator.stats().applied, 1);
    assert_eq!(coordinator.stats().unchanged, 1);
}

#[tokio::test(start_paused = true)]
async fn corrupt_snapshot_from_other_window_is_ignored() {
    let channel = MemoryChannel::new();
    let b = open_window(&channel, json!({"count": 2}));
    let rogue = channel.open_window();

    rogue.set(keys().snapshot(), "{\"count\":").unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(b.store.state(), json!({"count": 2}));
    assert_eq!(b.sync.coordinator().stats().rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn outage_heals_on_next_flush() {
    let channel = MemoryChannel::new();
    let a = open_window(&channel, json!({}));
    let b = open_window(&channel, json!({}));

    channel.set_available(false);
    a.store.set(json!({"count": 1}));
    sleep(Duration::from_millis(400)).await;
    assert_eq!(a.store.state(), json!({"count": 1}));
    assert_eq!(b.store.state(), json!({}));

    channel.set_available(true);
    a.store.set(json!({"count": 2}));
    sleep(Duration::from_millis(400)).await;
    assert_eq!(b.store.state(), json!({"count": 2}));
}

#[tokio::test(start_paused = true)]
async fn detached_window_stops_syncing() {
    let channel = MemoryChannel::new();
    let a = open_window(&channel, json!({}));
    let b = open_window(&channel, json!({}));

    let Window { store: b_store, sync: b_sync } = b;
    b_sync.detach();

    a.store.set(json!({"count": 1}));
    sleep(Duration::from_millis(400)).await;
    assert_eq!(b_store.state(), json!({}));

    b_store.set(json!({"count": 99}));
    sleep(Duration::from_millis(400)).await;
    assert_eq!(channel.peek(keys().snapshot()).as_deref(), Some(r#"{"count":1}"#));
}
