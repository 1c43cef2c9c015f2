//! Per-store synchronization settings
//!
//! Settings are plain TOML:
//!
//! ```toml
//! key_prefix = "__tabsync__"
//!
//! [stores.cart]
//! synchronization = true
//! debounce_ms = 300
//! ```
//!
//! A store that is not listed, or lists `synchronization = false`, is never
//! attached. The flag is read once when the store is attached.

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::keys::DEFAULT_KEY_PREFIX;

/// Default debounce interval in milliseconds
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

/// Options for one store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreOptions {
    /// Opt-in flag; nothing is read, written or subscribed while false
    pub synchronization: bool,

    /// Quiet period before a burst of local changes is flushed
    pub debounce_ms: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            synchronization: false,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl StoreOptions {
    /// Synchronization on, default debounce
    pub fn enabled() -> Self {
        Self {
            synchronization: true,
            ..Default::default()
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.debounce_ms == 0 {
            bail!("invalid config: debounce_ms must be greater than zero");
        }
        Ok(())
    }
}

/// Settings for every store of an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Namespace for every channel key
    pub key_prefix: String,

    /// Per-store options, keyed by store-id
    pub stores: HashMap<String, StoreOptions>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            stores: HashMap::new(),
        }
    }
}

impl SyncSettings {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: SyncSettings =
            toml::from_str(text).context("invalid config: failed to parse sync settings")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("Failed to load config: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            bail!("invalid config: key_prefix must not be empty");
        }
        if self.key_prefix.contains(':') {
            bail!("invalid config: key_prefix must not contain ':'");
        }
        for (store_id, options) in &self.stores {
            options
                .validate()
                .with_context(|| format!("store '{}'", store_id))?;
        }
        Ok(())
    }

    /// Options for a store; unlisted stores are disabled
    pub fn options_for(&self, store_id: &str) -> StoreOptions {
        self.stores.get(store_id).cloned().unwrap_or_default()
    }

    pub fn with_store(mut self, store_id: impl Into<String>, options: StoreOptions) -> Self {
        self.stores.insert(store_id.into(), options);
        self
    }
}
