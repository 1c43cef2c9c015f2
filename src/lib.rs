//! # Tabsync - Cross-Window State Synchronization
//!
//! Keeps a reactive store identical across every window (tab, process) that
//! shares one key-value channel, with no event wiring in the application.
//!
//! ## Features
//!
//! - **Debounced write-through**: bursts of local changes become one snapshot write
//! - **Source/acceptor arbitration**: the flushing window never re-applies stale remote state
//! - **Cold-start replay**: a new window starts from the latest persisted snapshot
//! - **Opt-in per store**: stores without `synchronization = true` cost nothing
//! - **Pluggable channels**: in-memory for one process, SQLite for many
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tabsync::{attach, MemoryChannel, MemoryStore, StoreKeys, StoreOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let channel = MemoryChannel::new();
//!     let store = Arc::new(MemoryStore::default());
//!
//!     let _sync = attach(
//!         StoreKeys::with_default_prefix("counter"),
//!         &StoreOptions::enabled(),
//!         store.clone(),
//!         Arc::new(channel.open_window()),
//!     )?;
//!
//!     store.set(serde_json::json!({ "count": 1 }));
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod keys;
pub mod plugin;
pub mod store;

// Re-export main types for library consumers
pub use channel::{ChannelEvent, MemoryChannel, MemoryWindow, SharedChannel, SqliteChannel, WindowId};
pub use config::{StoreOptions, SyncSettings};
pub use coordinator::{RemoteOutcome, SyncCoordinator, SyncStats};
pub use error::{categorize_error, ErrorCategory};
pub use keys::StoreKeys;
pub use plugin::{attach, SyncHandle, SyncHub};
pub use store::{HostStore, MemoryStore, Mutation, MutationKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
