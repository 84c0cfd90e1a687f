use crate::{
    error::AlreadyFrozen,
    sync::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Backoff, Ordering, UnsafeCell},
};
use core::{fmt, iter::FusedIterator, mem::MaybeUninit, ptr, ptr::NonNull};

/// Capacity of the first chunk.
const INITIAL_CAPACITY: usize = 8;
/// Chunk capacities double up to this bound.
const MAX_CAPACITY: usize = 256;
/// Set in a chunk's reservation counter once the list is frozen.
const FROZEN: usize = 1 << (usize::BITS - 1);

const SLOT_EMPTY: u8 = 0;
const SLOT_FULL: u8 = 1;
const SLOT_SEALED: u8 = 2;
const SLOT_TAKEN: u8 = 3;

/// Capacity of the chunk following one of capacity `capacity`.
pub(crate) const fn next_capacity(capacity: usize) -> usize {
    let doubled = capacity.saturating_mul(2);
    if doubled > MAX_CAPACITY {
        MAX_CAPACITY
    } else {
        doubled
    }
}

/// Marks the end of a frozen chain of chunks. Never dereferenced.
fn sealed<T>() -> *mut Chunk<T> {
    NonNull::dangling().as_ptr()
}

struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct Chunk<T> {
    /// Number of reservations handed out, with `FROZEN` or-ed in on freeze.
    /// May exceed `slots.len()`: overflowing writers move on to `next`.
    reserved: AtomicUsize,
    next: AtomicPtr<Chunk<T>>,
    slots: Box<[Slot<T>]>,
}

impl<T> Chunk<T> {
    fn alloc(capacity: usize) -> *mut Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                state: AtomicU8::new(SLOT_EMPTY),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Box::into_raw(Box::new(Self {
            reserved: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            slots,
        }))
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots that may hold a value once the chunk is frozen.
    fn filled(&self) -> usize {
        (self.reserved.load(Ordering::Acquire) & !FROZEN).min(self.capacity())
    }
}

/// Lock-free, append-only sequence built from chunks of doubling capacity.
///
/// Any number of threads may [`push`](Self::push) concurrently. A single
/// [`freeze`](Self::freeze) turns the list read-only: every push that has not
/// published its item by then fails and hands the item back, and everything
/// published before is visible to iteration in reservation order.
///
/// The first chunk is allocated lazily, so an unused list costs no allocation.
pub struct AppendList<T> {
    head: AtomicPtr<Chunk<T>>,
    /// Hint to the chunk currently accepting writes. Null until the head exists.
    tail: AtomicPtr<Chunk<T>>,
    frozen: AtomicBool,
    /// Set once the freezing thread has sealed every reserved slot.
    settled: AtomicBool,
}

unsafe impl<T: Send> Send for AppendList<T> {}
unsafe impl<T: Send + Sync> Sync for AppendList<T> {}

impl<T> Default for AppendList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AppendList<T> {
    /// Creates an empty list without allocating.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            frozen: AtomicBool::new(false),
            settled: AtomicBool::new(false),
        }
    }

    /// Appends `item`.
    ///
    /// # Errors
    /// Hands `item` back if the list has been frozen, including when the
    /// freeze raced ahead of this push after it had reserved a slot.
    pub fn push(&self, item: T) -> Result<(), T> {
        let Some(mut chunk) = self.writable_chunk() else {
            return Err(item);
        };
        loop {
            let reserved = chunk.reserved.fetch_add(1, Ordering::AcqRel);
            if reserved & FROZEN != 0 {
                return Err(item);
            }
            if let Some(slot) = chunk.slots.get(reserved) {
                // SAFETY: the reservation counter hands out `reserved` exactly once, so
                // this thread is the only writer of the slot, and readers only touch it
                // after observing `SLOT_FULL`.
                unsafe { slot.value.with_mut(|ptr| (*ptr).write(item)) };
                return match slot.state.compare_exchange(
                    SLOT_EMPTY,
                    SLOT_FULL,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => Ok(()),
                    // SAFETY: the freeze sealed the slot before we published, so no
                    // reader will ever look at the value we just wrote.
                    Err(_) => Err(unsafe { slot.value.with_mut(|ptr| (*ptr).assume_init_read()) }),
                };
            }
            let Some(next) = self.next_chunk(chunk) else {
                return Err(item);
            };
            chunk = next;
        }
    }

    /// Transitions the list to read-only and returns its contents.
    ///
    /// Pushes that lose the race against the freeze observe failure; the
    /// returned iterator never sees their items.
    ///
    /// # Errors
    /// If the list has already been frozen.
    pub fn freeze(&self) -> Result<Iter<'_, T>, AlreadyFrozen> {
        if self.frozen.swap(true, Ordering::AcqRel) {
            return Err(AlreadyFrozen);
        }
        let mut link = &self.head;
        loop {
            let chunk = match link.compare_exchange(
                ptr::null_mut(),
                sealed(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                // SAFETY: non-null links other than the seal point to live chunks owned
                // by this list.
                Err(chunk) => unsafe { &*chunk },
            };
            let reserved = chunk.reserved.fetch_or(FROZEN, Ordering::AcqRel) & !FROZEN;
            for slot in &chunk.slots[..reserved.min(chunk.capacity())] {
                // Either the writer already published (the item stays) or it will fail
                // to publish and take the item back.
                let _ = slot.state.compare_exchange(
                    SLOT_EMPTY,
                    SLOT_SEALED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            if reserved < chunk.capacity() {
                // Nobody overflowed into a next chunk, and nobody can anymore.
                break;
            }
            link = &chunk.next;
        }
        self.settled.store(true, Ordering::Release);
        Ok(self.iter_frozen())
    }

    /// Whether [`freeze`](Self::freeze) has been called.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Iterates a frozen list. Returns `None` while the list still accepts
    /// appends.
    ///
    /// If another thread is in the middle of freezing, waits for it to finish
    /// sealing so the iteration sees the final contents.
    pub fn iter(&self) -> Option<Iter<'_, T>> {
        if !self.is_frozen() {
            return None;
        }
        let mut backoff = Backoff::new();
        while !self.settled.load(Ordering::Acquire) {
            backoff.snooze();
        }
        Some(self.iter_frozen())
    }

    /// Number of items in a frozen list. `None` while the list still accepts
    /// appends.
    pub fn len(&self) -> Option<usize> {
        self.iter().map(Iterator::count)
    }

    /// Whether a frozen list holds no items. `None` while the list still
    /// accepts appends.
    pub fn is_empty(&self) -> Option<bool> {
        self.iter().map(|mut iter| iter.next().is_none())
    }

    fn iter_frozen(&self) -> Iter<'_, T> {
        Iter {
            chunk: self.head.load(Ordering::Acquire),
            slot: 0,
            _list: self,
        }
    }

    /// Chunk to start reserving in, allocating the head on first use.
    fn writable_chunk(&self) -> Option<&Chunk<T>> {
        let tail = self.tail.load(Ordering::Acquire);
        if !tail.is_null() {
            // SAFETY: the tail hint only ever points to live chunks of this list.
            return Some(unsafe { &*tail });
        }
        let mut head = self.head.load(Ordering::Acquire);
        if head.is_null() {
            let fresh = Chunk::alloc(INITIAL_CAPACITY);
            head = match self.head.compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => fresh,
                Err(existing) => {
                    // SAFETY: `fresh` was never published.
                    drop(unsafe { Box::from_raw(fresh) });
                    existing
                }
            };
        }
        if head == sealed() {
            return None;
        }
        let _ = self
            .tail
            .compare_exchange(ptr::null_mut(), head, Ordering::AcqRel, Ordering::Relaxed);
        // SAFETY: `head` is non-null and not the seal.
        Some(unsafe { &*head })
    }

    /// Follows (or installs) the chunk after `chunk`. `None` once the chain
    /// has been sealed by a freeze.
    fn next_chunk<'a>(&'a self, chunk: &'a Chunk<T>) -> Option<&'a Chunk<T>> {
        let mut next = chunk.next.load(Ordering::Acquire);
        if next.is_null() {
            let fresh = Chunk::alloc(next_capacity(chunk.capacity()));
            next = match chunk.next.compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => fresh,
                Err(existing) => {
                    // SAFETY: `fresh` was never published.
                    drop(unsafe { Box::from_raw(fresh) });
                    existing
                }
            };
        }
        if next == sealed() {
            return None;
        }
        let _ = self.tail.compare_exchange(
            ptr::from_ref(chunk).cast_mut(),
            next,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        // SAFETY: `next` is non-null and not the seal.
        Some(unsafe { &*next })
    }
}

impl<T> Drop for AppendList<T> {
    fn drop(&mut self) {
        let mut chunk = self.head.load(Ordering::Acquire);
        while !chunk.is_null() && chunk != sealed() {
            // SAFETY: exclusive access; every chunk in the chain was allocated by
            // `Chunk::alloc` and is freed exactly once here.
            let owned = unsafe { Box::from_raw(chunk) };
            for slot in &owned.slots {
                if slot.state.load(Ordering::Acquire) == SLOT_FULL {
                    // SAFETY: `SLOT_FULL` slots hold an initialized value nobody moved out.
                    unsafe { slot.value.with_mut(|ptr| (*ptr).assume_init_drop()) };
                }
            }
            chunk = owned.next.load(Ordering::Acquire);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for AppendList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.iter() {
            Some(iter) => f.debug_list().entries(iter).finish(),
            None => f
                .debug_struct("AppendList")
                .field("frozen", &false)
                .finish_non_exhaustive(),
        }
    }
}

/// Iterator over a frozen [`AppendList`], in reservation order.
pub struct Iter<'a, T> {
    chunk: *const Chunk<T>,
    slot: usize,
    _list: &'a AppendList<T>,
}

unsafe impl<T: Sync> Send for Iter<'_, T> {}
unsafe impl<T: Sync> Sync for Iter<'_, T> {}

impl<T> Clone for Iter<'_, T> {
    fn clone(&self) -> Self {
        Self {
            chunk: self.chunk,
            slot: self.slot,
            _list: self._list,
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.chunk.is_null() && self.chunk != sealed::<T>().cast_const() {
            // SAFETY: chunks stay alive for as long as the list is borrowed.
            let chunk = unsafe { &*self.chunk };
            while self.slot < chunk.filled() {
                let slot = &chunk.slots[self.slot];
                self.slot += 1;
                if slot.state.load(Ordering::Acquire) == SLOT_FULL {
                    // SAFETY: published values are never mutated or moved out while the
                    // list is shared; `SLOT_FULL` is final once the list is frozen.
                    return Some(unsafe { slot.value.with(|ptr| (*ptr).assume_init_ref()) });
                }
            }
            self.chunk = chunk.next.load(Ordering::Acquire);
            self.slot = 0;
        }
        None
    }
}

impl<T> FusedIterator for Iter<'_, T> {}

/// Owning iterator over an [`AppendList`].
///
/// Exclusive ownership means no freeze is required: every published item is
/// yielded in reservation order.
pub struct IntoIter<T> {
    _list: AppendList<T>,
    chunk: *const Chunk<T>,
    slot: usize,
}

unsafe impl<T: Send> Send for IntoIter<T> {}

impl<T> IntoIterator for AppendList<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        let chunk = self.head.load(Ordering::Acquire);
        IntoIter {
            _list: self,
            chunk,
            slot: 0,
        }
    }
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.chunk.is_null() && self.chunk != sealed::<T>().cast_const() {
            // SAFETY: the chunks are owned by `self._list`, which outlives this call.
            let chunk = unsafe { &*self.chunk };
            while self.slot < chunk.filled() {
                let slot = &chunk.slots[self.slot];
                self.slot += 1;
                if slot.state.load(Ordering::Acquire) == SLOT_FULL {
                    slot.state.store(SLOT_TAKEN, Ordering::Relaxed);
                    // SAFETY: the slot was full and is now marked taken, so the value is
                    // moved out exactly once and `Drop` skips it.
                    return Some(unsafe { slot.value.with_mut(|ptr| (*ptr).assume_init_read()) });
                }
            }
            self.chunk = chunk.next.load(Ordering::Acquire);
            self.slot = 0;
        }
        None
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn capacities_double_up_to_the_bound() {
        let mut capacity = INITIAL_CAPACITY;
        let mut seen = vec![capacity];
        for _ in 0..8 {
            capacity = next_capacity(capacity);
            seen.push(capacity);
        }
        assert_eq!(seen, [8, 16, 32, 64, 128, 256, 256, 256, 256]);
    }

    #[test]
    fn push_then_freeze_preserves_order_across_chunks() {
        let list = AppendList::new();
        for i in 0..1000 {
            assert!(list.push(i).is_ok());
        }
        let items: Vec<_> = list.freeze().unwrap().copied().collect();
        assert_eq!(items, (0..1000).collect::<Vec<_>>());
        assert_eq!(list.push(1000), Err(1000));
        assert!(list.freeze().is_err());
    }

    #[test]
    fn iteration_requires_freeze() {
        let list = AppendList::new();
        list.push("a").unwrap();
        assert!(list.iter().is_none());
        assert_eq!(list.len(), None);
        list.freeze().unwrap();
        assert_eq!(list.iter().unwrap().count(), 1);
        assert_eq!(list.len(), Some(1));
        assert_eq!(list.is_empty(), Some(false));
    }

    #[test]
    fn freezing_an_empty_list_rejects_later_pushes() {
        let list = AppendList::<u8>::new();
        assert_eq!(list.freeze().unwrap().count(), 0);
        assert_eq!(list.push(1), Err(1));
    }

    #[test]
    fn concurrent_pushes_all_land_or_bounce() {
        let list = Arc::new(AppendList::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    let mut accepted = vec![];
                    for i in 0..500 {
                        if list.push(t * 1000 + i).is_ok() {
                            accepted.push(t * 1000 + i);
                        }
                    }
                    accepted
                })
            })
            .collect();
        let mut accepted: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let mut frozen: Vec<_> = list.freeze().unwrap().copied().collect();
        accepted.sort_unstable();
        frozen.sort_unstable();
        assert_eq!(accepted, frozen);
    }

    #[test]
    fn owned_iteration_moves_items_out_once() {
        let list = AppendList::new();
        for i in 0..20 {
            list.push(Arc::new(i)).unwrap();
        }
        let item = list.freeze().unwrap().next().cloned().unwrap();
        let drained: Vec<_> = list.into_iter().map(|v| *v).collect();
        assert_eq!(drained, (0..20).collect::<Vec<_>>());
        assert_eq!(Arc::strong_count(&item), 1);
    }
}
