//! Sync Coordinator - source/acceptor arbitration for one store in one window
//!
//! Each window keeps the store's full state in three shared entries:
//!
//! - **snapshot**: the serialized state, rewritten on every flush
//! - **source**: identity of the window currently flushing
//! - **acceptor**: `true` while non-source windows should take snapshots
//!
//! Local changes are debounced and flushed as one write. During a flush the
//! window claims the source marker (only if nobody holds it), writes the
//! snapshot, then releases the marker. A window holding the marker ignores
//! remote snapshots, which keeps its own in-flight edits from being
//! overwritten with older data.
//!
//! The claim is check-then-set over a channel without transactions, so two
//! windows flushing at the same instant can both believe they are source.
//! The cost is one redundant snapshot write, never a corrupt entry.

mod debounce;

pub use debounce::PendingFlush;

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::channel::{SharedChannel, WindowId};
use crate::config::StoreOptions;
use crate::error::categorize_error;
use crate::keys::StoreKeys;
use crate::store::HostStore;

const ACCEPTOR_TRUE: &str = "true";
const ACCEPTOR_FALSE: &str = "false";

/// Result of handling one remote notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Patched into the local store
    Applied,
    /// Equal to the local state; nothing to do
    Unchanged,
    /// This window is source and does not accept snapshots
    IgnoredAsSource,
    /// Could not be decoded; local state kept
    Rejected,
}

/// Counters for one coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub flushes: u64,
    pub failed_writes: u64,
    pub applied: u64,
    pub unchanged: u64,
    pub ignored_as_source: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    flushes: AtomicU64,
    failed_writes: AtomicU64,
    applied: AtomicU64,
    unchanged: AtomicU64,
    ignored_as_source: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SyncStats {
        SyncStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            ignored_as_source: self.ignored_as_source.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Everything a flush needs, shared with the debounce task
struct Shared {
    keys: StoreKeys,
    window: WindowId,
    channel: Arc<dyn SharedChannel>,
    store: Arc<dyn HostStore>,
    counters: Counters,
}

impl Shared {
    fn window_token(&self) -> String {
        self.window.to_string()
    }

    /// Log a swallowed channel failure
    fn best_effort(&self, action: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                Counters::bump(&self.counters.failed_writes);
                let category = categorize_error(&err);
                warn!(
                    store = self.keys.store_id(),
                    window = %self.window,
                    category = %category,
                    heals = category.heals_on_next_flush(),
                    error = %format!("{:#}", err),
                    "failed to {}",
                    action
                );
                false
            }
        }
    }

    fn source_holder(&self) -> Option<String> {
        match self.channel.get(self.keys.source()) {
            Ok(holder) => holder,
            Err(err) => {
                warn!(
                    store = self.keys.store_id(),
                    category = %categorize_error(&err),
                    error = %format!("{:#}", err),
                    "failed to read source marker"
                );
                None
            }
        }
    }

    fn is_source(&self) -> bool {
        self.source_holder().as_deref() == Some(self.window_token().as_str())
    }

    /// Become source unless some window already is
    fn claim_source(&self) -> bool {
        if let Some(holder) = self.source_holder() {
            debug!(store = self.keys.store_id(), %holder, "source marker already held");
            return false;
        }

        let token = self.window_token();
        if !self.best_effort("claim source marker", self.channel.set(self.keys.source(), &token)) {
            return false;
        }
        self.best_effort(
            "clear acceptor flag",
            self.channel.set(self.keys.acceptor(), ACCEPTOR_FALSE),
        );
        debug!(store = self.keys.store_id(), window = %self.window, "claimed source");
        true
    }

    /// Give up the marker if this window holds it
    fn release_source(&self) {
        if !self.is_source() {
            return;
        }
        self.best_effort(
            "set acceptor flag",
            self.channel.set(self.keys.acceptor(), ACCEPTOR_TRUE),
        );
        self.best_effort(
            "remove source marker",
            self.channel.remove(self.keys.source()),
        );
        debug!(store = self.keys.store_id(), window = %self.window, "released source");
    }

    fn mark_as_acceptor(&self) {
        let token = self.window_token();
        if self.source_holder().as_deref() == Some(token.as_str()) {
            return;
        }
        self.best_effort(
            "set acceptor flag",
            self.channel.set(self.keys.acceptor(), ACCEPTOR_TRUE),
        );
        // The marker may have been taken by this window between the read
        // above and the flag write; never leave it behind.
        if self.source_holder().as_deref() == Some(token.as_str()) {
            self.best_effort(
                "remove source marker",
                self.channel.remove(self.keys.source()),
            );
        }
    }

    fn flush(&self, state: &Value) {
        Counters::bump(&self.counters.flushes);
        self.claim_source();

        match serde_json::to_string(state) {
            Ok(text) => {
                self.best_effort(
                    "write snapshot",
                    self.channel.set(self.keys.snapshot(), &text),
                );
            }
            Err(err) => {
                self.best_effort("encode snapshot", Err(anyhow::Error::new(err)));
            }
        }

        self.release_source();
        self.mark_as_acceptor();
        debug!(store = self.keys.store_id(), window = %self.window, "flushed snapshot");
    }

    fn decode(&self, raw: &str) -> Option<Value> {
        match serde_json::from_str::<Value>(raw) {
            Ok(state) => Some(state),
            Err(err) => {
                Counters::bump(&self.counters.rejected);
                warn!(
                    store = self.keys.store_id(),
                    error = %err,
                    "dropping snapshot that failed to deserialize"
                );
                None
            }
        }
    }

    fn apply(&self, state: Value) -> RemoteOutcome {
        if state == self.store.state() {
            Counters::bump(&self.counters.unchanged);
            return RemoteOutcome::Unchanged;
        }
        self.store.patch(state);
        Counters::bump(&self.counters.applied);
        debug!(store = self.keys.store_id(), window = %self.window, "applied remote snapshot");
        RemoteOutcome::Applied
    }
}

/// Synchronizes one store of one window through a shared channel
pub struct SyncCoordinator {
    shared: Arc<Shared>,
    debounce: Duration,
    pending: PendingFlush,
}

impl SyncCoordinator {
    /// Build a coordinator and run the initialization sequence:
    /// replay a persisted snapshot, then take the acceptor role unless
    /// this window is source.
    ///
    /// Must be called inside a tokio runtime; flushes are spawned on it.
    pub fn new(
        keys: StoreKeys,
        channel: Arc<dyn SharedChannel>,
        store: Arc<dyn HostStore>,
        debounce: Duration,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| anyhow!("SyncCoordinator must be created inside a tokio runtime"))?;

        let shared = Arc::new(Shared {
            window: channel.window_id(),
            keys,
            channel,
            store,
            counters: Counters::default(),
        });

        let coordinator = Self {
            shared,
            debounce,
            pending: PendingFlush::new(runtime),
        };
        coordinator.initialize();
        Ok(coordinator)
    }

    pub fn from_options(
        keys: StoreKeys,
        channel: Arc<dyn SharedChannel>,
        store: Arc<dyn HostStore>,
        options: &StoreOptions,
    ) -> Result<Self> {
        options.validate()?;
        Self::new(keys, channel, store, options.debounce())
    }

    fn initialize(&self) {
        let shared = &self.shared;
        match shared.channel.get(shared.keys.snapshot()) {
            Ok(Some(raw)) => {
                if let Some(state) = shared.decode(&raw) {
                    let outcome = shared.apply(state);
                    debug!(store = shared.keys.store_id(), ?outcome, "cold start replay");
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    store = shared.keys.store_id(),
                    category = %categorize_error(&err),
                    error = %format!("{:#}", err),
                    "failed to read snapshot for replay"
                );
            }
        }

        if !shared.is_source() {
            shared.mark_as_acceptor();
        }
    }

    /// The host store changed; flush `state` once changes go quiet
    pub fn on_local_change(&self, state: Value) {
        let shared = self.shared.clone();
        self.pending
            .schedule(self.debounce, move || shared.flush(&state));
    }

    /// Another window changed the snapshot entry
    pub fn on_remote_change(&self, raw: &str) -> RemoteOutcome {
        let shared = &self.shared;
        if shared.is_source() {
            Counters::bump(&shared.counters.ignored_as_source);
            debug!(store = shared.keys.store_id(), "source window ignores remote snapshot");
            return RemoteOutcome::IgnoredAsSource;
        }

        match shared.decode(raw) {
            Some(state) => shared.apply(state),
            None => RemoteOutcome::Rejected,
        }
    }

    /// Take the acceptor role unless this window is source
    pub fn mark_as_acceptor(&self) {
        self.shared.mark_as_acceptor();
    }

    pub fn is_source(&self) -> bool {
        self.shared.is_source()
    }

    pub fn has_pending_flush(&self) -> bool {
        self.pending.is_pending()
    }

    /// Wait until no flush is pending
    pub async fn wait_idle(&self) {
        while self.pending.is_pending() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Cancel any pending flush and give up the source role
    pub fn shutdown(&self) {
        if self.pending.cancel() {
            debug!(store = self.shared.keys.store_id(), "discarded pending flush");
        }
        self.shared.release_source();
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.shared.keys
    }

    pub fn window_id(&self) -> WindowId {
        self.shared.window
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn stats(&self) -> SyncStats {
        self.shared.counters.snapshot()
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("store", &self.shared.keys.store_id())
            .field("window", &self.shared.window)
            .field("debounce", &self.debounce)
            .field("channel", &"<dyn SharedChannel>")
            .finish()
    }
}
