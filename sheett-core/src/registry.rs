//! Explicit registry of open stores, keyed by store id.
//!
//! A session owner registers every store it opens and closes it when the
//! session ends. Stores are shared behind a mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::store::MergeableStore;

/// A store shared between the UI surface, the persister and the synchronizer.
pub type SharedStore = Arc<Mutex<MergeableStore>>;

/// Lock a shared store.
///
/// Every store mutation is a single synchronous write, so the state behind a
/// poisoned lock is still consistent and is used as-is.
pub fn lock_store(store: &SharedStore) -> MutexGuard<'_, MergeableStore> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Stores opened by one session owner, keyed by store id.
#[derive(Debug, Default)]
pub struct StoreRegistry {
    stores: HashMap<String, SharedStore>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store under its own id.
    ///
    /// Returns the store previously registered under the same id.
    pub fn register(&mut self, store: SharedStore) -> Option<SharedStore> {
        let id = lock_store(&store).id().to_string();
        log::debug!("registry: registered store {id}");
        self.stores.insert(id, store)
    }

    pub fn get(&self, store_id: &str) -> Option<SharedStore> {
        self.stores.get(store_id).cloned()
    }

    pub fn contains(&self, store_id: &str) -> bool {
        self.stores.contains_key(store_id)
    }

    /// Remove a store from the registry.
    pub fn close(&mut self, store_id: &str) -> Option<SharedStore> {
        let removed = self.stores.remove(store_id);
        if removed.is_some() {
            log::debug!("registry: closed store {store_id}");
        }
        removed
    }

    /// Drop every registered store.
    pub fn clear(&mut self) {
        self.stores.clear();
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.stores.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(id: &str, replica: &str) -> SharedStore {
        Arc::new(Mutex::new(MergeableStore::with_replica(id, replica)))
    }

    #[test]
    fn test_register_shares_the_store() {
        let mut registry = StoreRegistry::new();
        let store = shared("spreadsheetStore-1", "A");
        assert!(registry.register(store.clone()).is_none());

        let found = registry.get("spreadsheetStore-1").unwrap();
        assert!(Arc::ptr_eq(&store, &found));
        lock_store(&store).set_value("name", "x");
        assert!(lock_store(&found).get_value("name").is_some());
    }

    #[test]
    fn test_register_replaces_and_close() {
        let mut registry = StoreRegistry::new();
        let first = shared("userStore-u1", "A");
        registry.register(first.clone());
        let previous = registry.register(shared("userStore-u1", "B")).unwrap();
        assert!(Arc::ptr_eq(&previous, &first));
        assert!(registry.contains("userStore-u1"));
        assert_eq!(registry.ids(), vec!["userStore-u1".to_string()]);

        assert!(registry.close("userStore-u1").is_some());
        assert!(registry.close("userStore-u1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut registry = StoreRegistry::new();
        registry.register(shared("spreadsheetStore-1", "A"));
        registry.register(shared("spreadsheetStore-2", "A"));
        assert_eq!(registry.len(), 2);
        registry.clear();
        assert!(registry.is_empty());
    }
}
