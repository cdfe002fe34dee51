use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{FeatureFlag, FlagSource, Result};

type Flags = HashMap<String, Arc<FeatureFlag>>;

/// `FlagStore` is an in-memory [`FlagSource`] that allows concurrent access for readers and
/// writers.
///
/// Useful for bootstrapping flags from a file, for tests, and for running fully offline.
pub struct FlagStore {
    flags: RwLock<Arc<Flags>>,
}

impl FlagStore {
    pub fn new() -> Self {
        Self {
            flags: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Create a store holding `flags`, keyed by their `key`.
    pub fn with_flags(flags: impl IntoIterator<Item = FeatureFlag>) -> Self {
        let store = FlagStore::new();
        store.set_flags(flags);
        store
    }

    /// Get the current snapshot.
    pub fn snapshot(&self) -> Arc<Flags> {
        // self.flags.read() should always return Ok(). Err() is possible only if the lock is
        // poisoned (writer panicked while holding the lock), which should never happen. Still,
        // recovering the guard here to not crash the app.
        let flags = self
            .flags
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        flags.clone()
    }

    /// Replace all flags, returning the previous snapshot.
    pub fn set_flags(&self, flags: impl IntoIterator<Item = FeatureFlag>) -> Arc<Flags> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Arc::new(
            flags
                .into_iter()
                .map(|flag| (flag.key.clone(), Arc::new(flag)))
                .collect(),
        );

        let mut slot = self
            .flags
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::replace(&mut *slot, new_value)
    }

    /// Insert or replace a single flag. An update with a version not newer than the stored one
    /// is ignored. Returns `true` if the flag was stored.
    pub fn upsert(&self, flag: FeatureFlag) -> bool {
        let mut slot = self
            .flags
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if matches!(slot.get(&flag.key), Some(existing) if existing.version >= flag.version) {
            return false;
        }
        Arc::make_mut(&mut *slot).insert(flag.key.clone(), Arc::new(flag));
        true
    }

    /// Remove a flag, returning it if it was present.
    pub fn remove(&self, key: &str) -> Option<Arc<FeatureFlag>> {
        let mut slot = self
            .flags
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::make_mut(&mut *slot).remove(key)
    }
}

impl Default for FlagStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FlagSource for FlagStore {
    fn get_flag(&self, key: &str) -> Result<Option<Arc<FeatureFlag>>> {
        Ok(self.snapshot().get(key).cloned())
    }

    fn get_all_flags(&self) -> Result<HashMap<String, Arc<FeatureFlag>>> {
        Ok((*self.snapshot()).clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::FlagStore;
    use crate::{FeatureFlag, FlagSource};

    fn flag(key: &str, version: u64) -> FeatureFlag {
        serde_json::from_value(json!({"key": key, "version": version})).unwrap()
    }

    #[test]
    fn can_set_flags_from_another_thread() {
        let store = Arc::new(FlagStore::new());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set_flags([flag("a", 1)]);
            })
            .join();
        }

        assert!(store.get_flag("a").unwrap().is_some());
    }

    #[test]
    fn upsert_ignores_stale_versions() {
        let store = FlagStore::with_flags([flag("a", 2)]);

        assert!(!store.upsert(flag("a", 1)));
        assert!(!store.upsert(flag("a", 2)));
        assert!(store.upsert(flag("a", 3)));
        assert!(store.upsert(flag("b", 1)));

        assert_eq!(store.get_flag("a").unwrap().unwrap().version, 3);
        assert_eq!(store.get_all_flags().unwrap().len(), 2);
    }

    #[test]
    fn snapshots_are_not_affected_by_later_writes() {
        let store = FlagStore::with_flags([flag("a", 1)]);
        let before = store.snapshot();

        store.remove("a");

        assert!(before.contains_key("a"));
        assert!(store.get_flag("a").unwrap().is_none());
    }
}
