//! Shared key-value channel between windows
//!
//! A channel is the only thing windows share: atomic get/set/remove of single
//! entries plus a change stream that reaches every *other* window. There is no
//! transaction or lock primitive; the coordinator is built around that.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

pub use memory::{MemoryChannel, MemoryWindow};
pub use sqlite::{ChannelEntry, SqliteChannel};

/// Capacity of the per-channel event buffer
pub(crate) const EVENT_CAPACITY: usize = 1024;

/// Identity of one window (tab, process) attached to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowId(Uuid);

impl WindowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WindowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for WindowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A change made to one channel entry by some window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub key: String,

    /// `None` when the entry was removed
    pub new_value: Option<String>,

    /// Window that made the change
    pub origin: WindowId,
}

/// Per-window view of a shared channel
pub trait SharedChannel: Send + Sync {
    /// Window this handle writes as
    fn window_id(&self) -> WindowId;

    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Changes made by other windows, from now on
    fn subscribe(&self) -> ChannelSubscription;
}

/// Stream of channel changes with this window's own writes filtered out
pub struct ChannelSubscription {
    window: WindowId,
    rx: broadcast::Receiver<ChannelEvent>,
}

impl ChannelSubscription {
    pub(crate) fn new(window: WindowId, rx: broadcast::Receiver<ChannelEvent>) -> Self {
        Self { window, rx }
    }

    /// Next change from another window; `None` once the channel is gone
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.origin == self.window => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(window = %self.window, skipped, "channel subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.origin == self.window => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(window = %self.window, skipped, "channel subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_id_round_trips_through_text() {
        let id = WindowId::new();
        let parsed: WindowId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-window".parse::<WindowId>().is_err());
    }

    #[tokio::test]
    async fn subscription_skips_own_events() {
        let (tx, rx) = broadcast::channel(8);
        let me = WindowId::new();
        let other = WindowId::new();
        let mut sub = ChannelSubscription::new(me, rx);

        tx.send(ChannelEvent {
            key: "k".into(),
            new_value: Some("mine".into()),
            origin: me,
        })
        .unwrap();
        tx.send(ChannelEvent {
            key: "k".into(),
            new_value: Some("theirs".into()),
            origin: other,
        })
        .unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.new_value.as_deref(), Some("theirs"));
        assert_eq!(event.origin, other);
        assert!(sub.try_recv().is_none());
    }
}
