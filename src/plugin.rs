//! Attaching stores to a channel
//!
//! [`attach`] is the whole integration surface: it reads the store's opt-in
//! flag once, builds a [`SyncCoordinator`], and spawns a router that feeds
//! direct store mutations into `on_local_change` and other windows' snapshot
//! writes into `on_remote_change`. Stores that did not opt in get nothing:
//! no reads, no writes, no subscriptions.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::SharedChannel;
use crate::config::{StoreOptions, SyncSettings};
use crate::coordinator::SyncCoordinator;
use crate::keys::StoreKeys;
use crate::store::{HostStore, MutationKind};

/// Live synchronization of one store; dropping it detaches
pub struct SyncHandle {
    coordinator: Arc<SyncCoordinator>,
    router: JoinHandle<()>,
}

impl SyncHandle {
    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    /// Stop routing, discard a pending flush and release the source role
    pub fn detach(self) {
        drop(self);
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.router.abort();
        self.coordinator.shutdown();
        info!(store = self.coordinator.keys().store_id(), "synchronization detached");
    }
}

/// Attach `store` to `channel` if `options` opt in
pub fn attach(
    keys: StoreKeys,
    options: &StoreOptions,
    store: Arc<dyn HostStore>,
    channel: Arc<dyn SharedChannel>,
) -> Result<Option<SyncHandle>> {
    if !options.synchronization {
        debug!(store = keys.store_id(), "synchronization disabled");
        return Ok(None);
    }

    // Subscribe before the replay so nothing slips between the two
    let mut mutations = store.subscribe();
    let mut events = channel.subscribe();
    let snapshot_key = keys.snapshot().to_string();

    let coordinator = Arc::new(SyncCoordinator::from_options(
        keys,
        channel,
        store.clone(),
        options,
    )?);

    let sync = coordinator.clone();
    let router = tokio::spawn(async move {
        loop {
            tokio::select! {
                mutation = mutations.recv() => match mutation {
                    Ok(mutation) if mutation.kind == MutationKind::Direct => {
                        sync.on_local_change(mutation.state);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(store = sync.keys().store_id(), skipped, "store mutations lagged");
                        sync.on_local_change(store.state());
                    }
                    Err(RecvError::Closed) => break,
                },
                event = events.recv() => match event {
                    Some(event) if event.key == snapshot_key => {
                        if let Some(raw) = event.new_value {
                            sync.on_remote_change(&raw);
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
    });

    info!(
        store = coordinator.keys().store_id(),
        window = %coordinator.window_id(),
        debounce_ms = coordinator.debounce().as_millis() as u64,
        "synchronization attached"
    );

    Ok(Some(SyncHandle {
        coordinator,
        router,
    }))
}

/// Attaches many stores of one window from shared settings
pub struct SyncHub {
    settings: SyncSettings,
    channel: Arc<dyn SharedChannel>,
}

impl SyncHub {
    pub fn new(settings: SyncSettings, channel: Arc<dyn SharedChannel>) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings, channel })
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn attach(&self, store_id: &str, store: Arc<dyn HostStore>) -> Result<Option<SyncHandle>> {
        attach(
            StoreKeys::new(&self.settings.key_prefix, store_id),
            &self.settings.options_for(store_id),
            store,
            self.channel.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn disabled_store_touches_nothing() {
        let channel = MemoryChannel::new();
        let store = Arc::new(MemoryStore::default());

        let handle = attach(
            StoreKeys::with_default_prefix("S"),
            &StoreOptions::default(),
            store.clone(),
            Arc::new(channel.open_window()),
        )
        .unwrap();
        assert!(handle.is_none());

        store.set(json!({"count": 1}));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(channel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hub_uses_configured_prefix() {
        let channel = MemoryChannel::new();
        let settings = SyncSettings {
            key_prefix: "app".into(),
            ..Default::default()
        }
        .with_store("cart", StoreOptions::enabled());
        let hub = SyncHub::new(settings, Arc::new(channel.open_window())).unwrap();

        let store = Arc::new(MemoryStore::default());
        let handle = hub.attach("cart", store.clone()).unwrap().unwrap();
        assert!(hub.attach("other", Arc::new(MemoryStore::default())).unwrap().is_none());

        store.set(json!({"items": [1]}));
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert_eq!(channel.peek("app:snapshot:cart").as_deref(), Some(r#"{"items":[1]}"#));
        handle.detach();
    }

    #[tokio::test(start_paused = true)]
    async fn patched_state_is_not_flushed_back() {
        let channel = MemoryChannel::new();
        let store = Arc::new(MemoryStore::default());
        let handle = attach(
            StoreKeys::with_default_prefix("S"),
            &StoreOptions::enabled(),
            store.clone(),
            Arc::new(channel.open_window()),
        )
        .unwrap()
        .unwrap();

        store.patch(json!({"count": 9}));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(channel.write_count(handle.coordinator().keys().snapshot()), 0);
    }
}
