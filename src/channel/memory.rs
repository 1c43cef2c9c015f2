//! In-process channel: many windows, one map
//!
//! Every [`MemoryWindow`] handed out by a [`MemoryChannel`] sees the same
//! entries and is notified of the others' writes, the way tabs of one origin
//! share browser storage. Used by tests, the demo and embedders that run
//! several stores in one process.

use anyhow::{bail, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{ChannelEvent, ChannelSubscription, SharedChannel, WindowId, EVENT_CAPACITY};

struct Inner {
    entries: DashMap<String, String>,
    // Successful `set` calls per key
    writes: DashMap<String, u64>,
    events: broadcast::Sender<ChannelEvent>,
    available: AtomicBool,
    quota: Option<usize>,
}

/// Shared in-memory store plus change fan-out
#[derive(Clone)]
pub struct MemoryChannel {
    inner: Arc<Inner>,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Reject writes once keys plus values would exceed `bytes`
    pub fn with_quota(bytes: usize) -> Self {
        Self::build(Some(bytes))
    }

    fn build(quota: Option<usize>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                writes: DashMap::new(),
                events,
                available: AtomicBool::new(true),
                quota,
            }),
        }
    }

    /// Handle for a new window with a fresh identity
    pub fn open_window(&self) -> MemoryWindow {
        self.window(WindowId::new())
    }

    pub fn window(&self, id: WindowId) -> MemoryWindow {
        MemoryWindow {
            id,
            channel: self.clone(),
        }
    }

    /// Simulate the channel going away; every call fails while false
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Read an entry without going through a window
    pub fn peek(&self, key: &str) -> Option<String> {
        self.inner.entries.get(key).map(|v| v.clone())
    }

    pub fn write_count(&self, key: &str) -> u64 {
        self.inner.writes.get(key).map(|n| *n).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    fn ensure_available(&self) -> Result<()> {
        if !self.inner.available.load(Ordering::SeqCst) {
            bail!("shared channel unavailable");
        }
        Ok(())
    }

    fn used_bytes_without(&self, key: &str) -> usize {
        self.inner
            .entries
            .iter()
            .filter(|entry| entry.key() != key)
            .map(|entry| entry.key().len() + entry.value().len())
            .sum()
    }

    fn set_as(&self, origin: WindowId, key: &str, value: &str) -> Result<()> {
        self.ensure_available()?;

        if let Some(quota) = self.inner.quota {
            let needed = self.used_bytes_without(key) + key.len() + value.len();
            if needed > quota {
                bail!("channel quota exceeded: {} > {} bytes", needed, quota);
            }
        }

        let previous = self.inner.entries.insert(key.to_string(), value.to_string());
        *self.inner.writes.entry(key.to_string()).or_insert(0) += 1;

        if previous.as_deref() != Some(value) {
            // No receivers is fine
            let _ = self.inner.events.send(ChannelEvent {
                key: key.to_string(),
                new_value: Some(value.to_string()),
                origin,
            });
        }
        Ok(())
    }

    fn remove_as(&self, origin: WindowId, key: &str) -> Result<()> {
        self.ensure_available()?;

        if self.inner.entries.remove(key).is_some() {
            let _ = self.inner.events.send(ChannelEvent {
                key: key.to_string(),
                new_value: None,
                origin,
            });
        }
        Ok(())
    }
}

/// One window's handle onto a [`MemoryChannel`]
#[derive(Clone)]
pub struct MemoryWindow {
    id: WindowId,
    channel: MemoryChannel,
}

impl SharedChannel for MemoryWindow {
    fn window_id(&self) -> WindowId {
        self.id
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        self.channel.ensure_available()?;
        Ok(self.channel.peek(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.channel.set_as(self.id, key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.channel.remove_as(self.id, key)
    }

    fn subscribe(&self) -> ChannelSubscription {
        ChannelSubscription::new(self.id, self.channel.inner.events.subscribe())
    }
}
