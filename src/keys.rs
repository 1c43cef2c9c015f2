//! Shared-channel key naming.
//!
//! Every synchronized store owns three entries, each namespaced by a fixed
//! prefix plus the store-id so independent implementations sharing one
//! channel agree on where to look.

/// Prefix used when the settings do not override it
pub const DEFAULT_KEY_PREFIX: &str = "__tabsync__";

const SNAPSHOT: &str = "snapshot";
const SOURCE: &str = "source";
const ACCEPTOR: &str = "acceptor";

/// The three channel keys belonging to one store-id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    store_id: String,
    snapshot: String,
    source: String,
    acceptor: String,
}

impl StoreKeys {
    pub fn new(prefix: &str, store_id: &str) -> Self {
        Self {
            store_id: store_id.to_string(),
            snapshot: format!("{prefix}:{SNAPSHOT}:{store_id}"),
            source: format!("{prefix}:{SOURCE}:{store_id}"),
            acceptor: format!("{prefix}:{ACCEPTOR}:{store_id}"),
        }
    }

    pub fn with_default_prefix(store_id: &str) -> Self {
        Self::new(DEFAULT_KEY_PREFIX, store_id)
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Serialized full state of the store
    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    /// Identity of the window currently writing
    pub fn source(&self) -> &str {
        &self.source
    }

    /// `true` while non-source windows should accept snapshots
    pub fn acceptor(&self) -> &str {
        &self.acceptor
    }

    pub fn all(&self) -> [&str; 3] {
        [&self.snapshot, &self.source, &self.acceptor]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_prefix_and_store() {
        let keys = StoreKeys::new("app", "cart");
        assert_eq!(keys.snapshot(), "app:snapshot:cart");
        assert_eq!(keys.source(), "app:source:cart");
        assert_eq!(keys.acceptor(), "app:acceptor:cart");
        assert_eq!(keys.store_id(), "cart");
    }

    #[test]
    fn different_stores_never_share_keys() {
        let a = StoreKeys::with_default_prefix("a");
        let b = StoreKeys::with_default_prefix("b");
        for key in a.all() {
            assert!(!b.all().contains(&key));
        }
    }
}
