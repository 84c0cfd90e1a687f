use crate::{
    sync::{AtomicU64, AtomicUsize, Ordering},
    table::SparseTable,
    types::{IndexSet, KeyIndex},
};
use core::hash::{BuildHasher, Hash};
use derive_more::Debug;
use rustc_hash::FxBuildHasher;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Default number of entries in the key-to-index cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;
/// Cache slots inspected per lookup before falling back to the registry.
const PROBE_LEN: usize = 8;
const EMPTY: u64 = 0;

/// Append-only registry assigning dense indices to symbolic keys.
///
/// Indices are handed out monotonically on first sight and never change.
/// Registration goes through a single mutex; lookups in both directions are
/// served without locking:
/// - index to key from a [`SparseTable`] filled once per key,
/// - key to index from a bounded linear-probe cache whose entries are
///   validated against the table, so unsynchronized cache writes can only
///   cause a miss, never a wrong answer.
///
/// One interner is meant to live for the whole process and be shared by
/// every resolution context of a [`Config`](crate::config::Config).
#[derive(Debug)]
pub struct Interner<K> {
    #[debug(skip)]
    registry: Mutex<IndexSet<K>>,
    by_index: SparseTable<K>,
    /// `tag << 32 | (index + 1)`, where `tag` is the upper half of the key's hash.
    #[debug(skip)]
    cache: Box<[AtomicU64]>,
    len: AtomicUsize,
}

impl<K: Clone + Eq + Hash> Default for Interner<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash> Interner<K> {
    /// Creates an empty interner with the default cache size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cache_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Creates an empty interner whose key-to-index cache holds `capacity`
    /// entries, rounded up to a power of two.
    #[must_use]
    pub fn with_cache_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(PROBE_LEN).next_power_of_two();
        Self {
            registry: Mutex::new(IndexSet::default()),
            by_index: SparseTable::new(),
            cache: (0..capacity).map(|_| AtomicU64::new(EMPTY)).collect(),
            len: AtomicUsize::new(0),
        }
    }

    /// Dense index of `key`, registering it if this is its first sighting.
    ///
    /// # Panics
    /// If more than `u32::MAX - 1` keys are registered.
    pub fn intern(&self, key: &K) -> KeyIndex {
        let hash = FxBuildHasher.hash_one(key);
        if let Some(index) = self.probe(hash, key) {
            return index;
        }
        let index = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            match registry.get_index_of(key) {
                Some(index) => index,
                None => {
                    let (index, _) = registry.insert_full(key.clone());
                    assert!(
                        u32::try_from(index + 1).is_ok(),
                        "Interner::intern: [1]"
                    );
                    let (_, installed) = self.by_index.get_or_insert_with(index, || key.clone());
                    assert!(installed, "Interner::intern: [2]");
                    self.len.store(index + 1, Ordering::Release);
                    debug!(index, "interned new key");
                    index
                }
            }
        };
        let index = KeyIndex(u32::try_from(index).expect("Interner::intern: [3]"));
        self.remember(hash, index);
        index
    }

    /// Dense index of `key`, if it has been registered.
    pub fn resolve_key(&self, key: &K) -> Option<KeyIndex> {
        let hash = FxBuildHasher.hash_one(key);
        if let Some(index) = self.probe(hash, key) {
            return Some(index);
        }
        let index = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_index_of(key)?;
        let index = KeyIndex(u32::try_from(index).expect("Interner::resolve_key: [1]"));
        self.remember(hash, index);
        Some(index)
    }

    /// Key registered under `index`.
    pub fn resolve_index(&self, index: KeyIndex) -> Option<&K> {
        self.by_index.get(index.get())
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether no key has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn home(&self, hash: u64) -> usize {
        // Truncation is fine: the mask keeps only the low bits anyway.
        #[allow(clippy::cast_possible_truncation)]
        let home = hash as usize;
        home & (self.cache.len() - 1)
    }

    fn probe(&self, hash: u64, key: &K) -> Option<KeyIndex> {
        let tag = hash >> 32;
        let home = self.home(hash);
        for offset in 0..PROBE_LEN {
            let entry = self.cache[(home + offset) & (self.cache.len() - 1)].load(Ordering::Acquire);
            if entry == EMPTY {
                return None;
            }
            if entry >> 32 != tag {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let index = KeyIndex((entry as u32) - 1);
            if self.resolve_index(index) == Some(key) {
                return Some(index);
            }
        }
        None
    }

    /// Caches `index` for the key hashing to `hash`. Racing writers may
    /// overwrite each other; lookups validate every hit.
    fn remember(&self, hash: u64, index: KeyIndex) {
        let entry = ((hash >> 32) << 32) | (u64::from(index.0) + 1);
        let home = self.home(hash);
        let mask = self.cache.len() - 1;
        let target = (0..PROBE_LEN)
            .map(|offset| &self.cache[(home + offset) & mask])
            .find(|slot| {
                let current = slot.load(Ordering::Relaxed);
                current == EMPTY || current == entry
            })
            .unwrap_or(&self.cache[home]);
        target.store(entry, Ordering::Release);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn tiny_cache_still_answers_correctly() {
        let interner = Interner::with_cache_capacity(1);
        let keys: Vec<String> = (0..200).map(|i| format!("key-{i}")).collect();
        let indices: Vec<_> = keys.iter().map(|k| interner.intern(k)).collect();
        for (key, index) in keys.iter().zip(&indices) {
            assert_eq!(interner.resolve_key(key), Some(*index));
            assert_eq!(interner.resolve_index(*index), Some(key));
        }
        assert_eq!(interner.len(), 200);
    }

    #[test]
    fn concurrent_interning_agrees_on_indices() {
        let interner = Arc::new(Interner::<u64>::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let interner = Arc::clone(&interner);
                thread::spawn(move || (0..500u64).map(|k| interner.intern(&k)).collect::<Vec<_>>())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(interner.len(), 500);
        let mut dense: Vec<_> = results[0].iter().map(|i| i.get()).collect();
        dense.sort_unstable();
        assert_eq!(dense, (0..500).collect::<Vec<_>>());
    }
}
