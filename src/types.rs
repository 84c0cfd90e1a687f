use crate::{config::Config, deferred::Async, sync::UnsafeCell};
use derive_more::{Deref, DerefMut};
use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;

/// A minimal `UnsafeCell` wrapper that is `Sync` when `T: Send`.
///
/// Access is only ever handed out under an exclusive protocol, such as the
/// single winner of a fan-in race, so sharing the wrapper never results in
/// concurrent access to the inner value.
#[derive(Deref, DerefMut)]
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

unsafe impl<T: Send> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }
}

/// Dense, process-wide index assigned to a symbolic key by an
/// [`Interner`](crate::interner::Interner).
///
/// Indices are handed out monotonically from zero and never reused, which
/// makes them suitable for direct array addressing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct KeyIndex(pub(crate) u32);

impl KeyIndex {
    /// Position of the key in dense storage.
    #[must_use]
    #[inline]
    pub const fn get(self) -> usize {
        self.0 as usize
    }
}

impl From<KeyIndex> for usize {
    fn from(index: KeyIndex) -> Self {
        index.get()
    }
}

/// Per-request input mapping: plain values or already asynchronous handles.
pub type Inputs<C> = IndexMap<<C as Config>::Key, Async<<C as Config>::Value>>;

/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
