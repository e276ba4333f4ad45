//! In-process collaborators: blob storage and a reactive store.
//!
//! Both are real implementations, not test doubles. The binary wires them
//! directly and tests use them as-is.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tracing::trace;

use crate::clock::SharedClock;
use crate::context::SharedContext;
use crate::core::Parameter;
use crate::services::{
    Persistence, ReactiveStore, StoreChange, StoreListener, StoreSnapshot, StoreSubscription,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Persistence
// =============================================================================

#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.blobs).keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn save(&self, key: &str, blob: Vec<u8>) -> anyhow::Result<()> {
        trace!(key, bytes = blob.len(), "blob saved");
        lock(&self.blobs).insert(key.to_string(), blob);
        Ok(())
    }

    async fn load(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(lock(&self.blobs).get(key).cloned())
    }
}

// =============================================================================
// Reactive Store
// =============================================================================

struct StoreInner {
    values: BTreeMap<Parameter, f32>,
    revision: u64,
    next_listener: u64,
    listeners: Vec<(u64, StoreListener)>,
}

/// Key/value store keyed by [`Parameter`] with synchronous change listeners.
///
/// Starts with the coordinator's default for every parameter.
pub struct InMemoryReactiveStore {
    clock: SharedClock,
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryReactiveStore {
    pub fn new(clock: SharedClock) -> Self {
        let defaults = SharedContext::new(clock.now());
        let values = Parameter::ALL
            .iter()
            .map(|parameter| (*parameter, defaults.parameter(*parameter)))
            .collect();
        Self {
            clock,
            inner: Arc::new(Mutex::new(StoreInner {
                values,
                revision: 0,
                next_listener: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Override initial values without notifying anyone.
    pub fn with_values(self, values: impl IntoIterator<Item = (Parameter, f32)>) -> Self {
        lock(&self.inner).values.extend(values);
        self
    }

    pub fn get(&self, parameter: Parameter) -> Option<f32> {
        lock(&self.inner).values.get(&parameter).copied()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }
}

impl ReactiveStore for InMemoryReactiveStore {
    fn subscribe(&self, listener: StoreListener) -> StoreSubscription {
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_listener;
            inner.next_listener += 1;
            inner.listeners.push((id, listener));
            id
        };

        let weak: Weak<Mutex<StoreInner>> = Arc::downgrade(&self.inner);
        StoreSubscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).listeners.retain(|(listener_id, _)| *listener_id != id);
            }
        })
    }

    fn state(&self) -> StoreSnapshot {
        let inner = lock(&self.inner);
        StoreSnapshot {
            revision: inner.revision,
            values: inner.values.clone(),
        }
    }

    fn write(&self, parameter: Parameter, value: f32) {
        let (change, listeners) = {
            let mut inner = lock(&self.inner);
            if inner.values.get(&parameter) == Some(&value) {
                return;
            }
            inner.values.insert(parameter, value);
            inner.revision += 1;
            let change = StoreChange {
                parameter,
                value,
                confirmed_at: self.clock.now(),
                revision: inner.revision,
            };
            let listeners: Vec<StoreListener> =
                inner.listeners.iter().map(|(_, listener)| listener.clone()).collect();
            (change, listeners)
        };

        trace!(%parameter, value, revision = change.revision, "store write confirmed");
        // Listeners run outside the lock so they may read or write the store.
        for listener in listeners {
            listener(&change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;

    #[tokio::test]
    async fn persistence_round_trip() {
        let storage = InMemoryPersistence::new();
        assert_eq!(storage.load("missing").await.unwrap(), None);

        storage.save("checkpoint/a", b"{}".to_vec()).await.unwrap();
        assert_eq!(storage.load("checkpoint/a").await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(storage.keys(), vec!["checkpoint/a".to_string()]);
    }

    #[test]
    fn equal_writes_do_not_notify() {
        let store = InMemoryReactiveStore::new(system_clock());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = store.subscribe(Arc::new(move |change: &StoreChange| {
            sink.lock().unwrap().push(change.value);
        }));

        store.write(Parameter::BloomThreshold, 0.3);
        store.write(Parameter::BloomThreshold, 0.3);
        store.write(Parameter::BloomThreshold, 0.4);

        assert_eq!(*seen.lock().unwrap(), vec![0.3, 0.4]);
        assert_eq!(store.state().revision, 2);
    }

    #[test]
    fn starts_from_coordinator_defaults() {
        let store = InMemoryReactiveStore::new(system_clock());
        assert_eq!(store.get(Parameter::BloomThreshold), Some(0.8));
        assert_eq!(store.state().values.len(), Parameter::ALL.len());
    }

    #[test]
    fn unsubscribe_detaches_listener() {
        let store = InMemoryReactiveStore::new(system_clock());
        let sub = store.subscribe(Arc::new(|_: &StoreChange| {}));
        assert_eq!(store.listener_count(), 1);

        sub.unsubscribe();
        assert_eq!(store.listener_count(), 0);
    }
}
