//! Host store contract and a reactive in-memory store
//!
//! The coordinator only needs three things from a store: its current state,
//! a way to patch external state in, and a stream of mutations. State is a
//! `serde_json::Value` so comparison is structural.
//!
//! A remote snapshot is always a store's full state, so patching replaces
//! rather than merges; keys another window dropped must disappear here too.

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

const MUTATION_CAPACITY: usize = 256;

/// What produced a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Changed by the application itself
    Direct,
    /// State taken over from outside (another window)
    Patch,
}

/// Emitted after every change, carrying the full new state
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub kind: MutationKind,
    pub state: Value,
}

pub trait HostStore: Send + Sync {
    /// Current state snapshot
    fn state(&self) -> Value;

    /// Replace the live state with a full snapshot from outside
    fn patch(&self, state: Value);

    /// Every mutation from now on
    fn subscribe(&self) -> broadcast::Receiver<Mutation>;
}

/// Deep-merge `patch` into `target`.
///
/// Objects merge key by key; anything else replaces the target value.
pub fn merge_patch(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge_patch(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

pub struct MemoryStore {
    state: RwLock<Value>,
    mutations: broadcast::Sender<Mutation>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Value::Object(Default::default()))
    }
}

impl MemoryStore {
    pub fn new(initial: Value) -> Self {
        let (mutations, _) = broadcast::channel(MUTATION_CAPACITY);
        Self {
            state: RwLock::new(initial),
            mutations,
        }
    }

    /// Replace the whole state
    pub fn set(&self, state: Value) {
        *self.state.write() = state.clone();
        self.emit(MutationKind::Direct, state);
    }

    /// Mutate in place
    pub fn update(&self, f: impl FnOnce(&mut Value)) {
        let state = {
            let mut guard = self.state.write();
            f(&mut *guard);
            guard.clone()
        };
        self.emit(MutationKind::Direct, state);
    }

    fn emit(&self, kind: MutationKind, state: Value) {
        let _ = self.mutations.send(Mutation { kind, state });
    }
}

impl HostStore for MemoryStore {
    fn state(&self) -> Value {
        self.state.read().clone()
    }

    fn patch(&self, state: Value) {
        *self.state.write() = state.clone();
        self.emit(MutationKind::Patch, state);
    }

    fn subscribe(&self) -> broadcast::Receiver<Mutation> {
        self.mutations.subscribe()
    }
}
