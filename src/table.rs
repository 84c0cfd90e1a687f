use crate::sync::{AtomicPtr, Ordering};
use core::{fmt, ptr};

/// Slots per leaf chunk.
pub(crate) const CHUNK_LEN: usize = 32;
const CHUNK_SHIFT: u32 = CHUNK_LEN.trailing_zeros();
/// Chunk pointers in the first directory segment; segment `k` holds
/// `FIRST_SEGMENT << k` of them.
const FIRST_SEGMENT: usize = 8;
/// Enough segments to address every `u32` index.
const SEGMENTS: usize = 26;

/// Directory coordinates of a dense index.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Location {
    pub(crate) segment: usize,
    pub(crate) chunk: usize,
    pub(crate) slot: usize,
}

impl Location {
    pub(crate) const fn of(index: usize) -> Self {
        let chunk = index >> CHUNK_SHIFT;
        let slot = index & (CHUNK_LEN - 1);
        // Segment `k` covers chunks `FIRST_SEGMENT * (2^k - 1) .. FIRST_SEGMENT * (2^(k+1) - 1)`.
        let biased = chunk / FIRST_SEGMENT + 1;
        let segment = (usize::BITS - 1 - biased.leading_zeros()) as usize;
        let chunk = chunk - FIRST_SEGMENT * ((1 << segment) - 1);
        Self {
            segment,
            chunk,
            slot,
        }
    }
}

type Chunk<T> = [AtomicPtr<T>; CHUNK_LEN];
/// Directory entry pointing at a leaf chunk.
type Link<T> = AtomicPtr<Chunk<T>>;

fn null_array<T, const N: usize>() -> [AtomicPtr<T>; N] {
    core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut()))
}

/// Installs `fresh` into `link` unless another thread got there first, in
/// which case `fresh` is dropped and the winner is returned.
///
/// # Safety
/// `fresh` must come from `Box::into_raw` and not be shared yet.
unsafe fn install<T>(link: &AtomicPtr<T>, fresh: *mut T) -> (*mut T, bool) {
    match link.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => (fresh, true),
        Err(existing) => {
            // SAFETY: guaranteed by the caller.
            drop(unsafe { Box::from_raw(fresh) });
            (existing, false)
        }
    }
}

/// Sparse array of single-assignment slots addressed by dense index.
///
/// Leaves hold 32 slots and are allocated on first touch; the directory above
/// them grows in doubling segments, so storage is proportional to the indices
/// actually used rather than the largest one. Each slot is installed at most
/// once by an atomic compare-and-swap and never replaced: concurrent
/// first-access races have exactly one winner, and the losers observe the
/// winner's value.
pub struct SparseTable<T> {
    /// Base pointers of the directory segments, each a boxed slice of links.
    segments: [AtomicPtr<Link<T>>; SEGMENTS],
}

unsafe impl<T: Send + Sync> Send for SparseTable<T> {}
unsafe impl<T: Send + Sync> Sync for SparseTable<T> {}

impl<T> Default for SparseTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SparseTable<T> {
    /// Creates an empty table without allocating any leaves.
    #[must_use]
    pub fn new() -> Self {
        Self {
            segments: null_array(),
        }
    }

    /// Value installed at `index`, if any.
    pub fn get(&self, index: usize) -> Option<&T> {
        let Location {
            segment,
            chunk,
            slot,
        } = Location::of(index);
        let base = self.segments[segment].load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        // SAFETY: installed segments live as long as the table, and `chunk` is within
        // the `FIRST_SEGMENT << segment` links of this one.
        let leaf = unsafe { &*base.add(chunk) }.load(Ordering::Acquire);
        if leaf.is_null() {
            return None;
        }
        // SAFETY: installed leaves live as long as the table.
        let value = unsafe { &*leaf }[slot].load(Ordering::Acquire);
        // SAFETY: installed values are never replaced or freed before the table.
        (!value.is_null()).then(|| unsafe { &*value })
    }

    /// Value installed at `index`, installing `make()` first if the slot is
    /// empty. The flag is `true` exactly for the call whose value won the
    /// install.
    ///
    /// `make` may run on losing threads too; their values are dropped.
    pub fn get_or_insert_with(&self, index: usize, make: impl FnOnce() -> T) -> (&T, bool) {
        if let Some(existing) = self.get(index) {
            return (existing, false);
        }
        let chunk = self.chunk(index);
        let Location { slot, .. } = Location::of(index);
        let fresh = Box::into_raw(Box::new(make()));
        // SAFETY: `fresh` was just boxed and is not shared.
        let (value, installed) = unsafe { install(&chunk[slot], fresh) };
        // SAFETY: installed values live as long as the table.
        (unsafe { &*value }, installed)
    }

    /// Leaf chunk holding `index`, allocating the path down to it.
    fn chunk(&self, index: usize) -> &Chunk<T> {
        let Location { segment, chunk, .. } = Location::of(index);
        let segment_link = &self.segments[segment];
        let mut base = segment_link.load(Ordering::Acquire);
        if base.is_null() {
            let fresh: Box<[Link<T>]> = (0..FIRST_SEGMENT << segment)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect();
            let fresh = Box::into_raw(fresh).cast::<Link<T>>();
            base = match segment_link.compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => fresh,
                Err(existing) => {
                    // SAFETY: `fresh` is the unpublished slice allocated above.
                    drop(unsafe { Box::from_raw(segment_slice(fresh, segment)) });
                    existing
                }
            };
        }
        // SAFETY: `chunk` is within the segment's bounds by construction of `Location`.
        let link = unsafe { &*base.add(chunk) };
        let mut leaf = link.load(Ordering::Acquire);
        if leaf.is_null() {
            let fresh = Box::into_raw(Box::new(null_array::<T, CHUNK_LEN>()));
            // SAFETY: `fresh` was just boxed and is not shared.
            leaf = unsafe { install(link, fresh) }.0;
        }
        // SAFETY: installed leaves live as long as the table.
        unsafe { &*leaf }
    }
}

fn segment_slice<T>(base: *mut Link<T>, segment: usize) -> *mut [Link<T>] {
    ptr::slice_from_raw_parts_mut(base, FIRST_SEGMENT << segment)
}

impl<T> Drop for SparseTable<T> {
    fn drop(&mut self) {
        for (segment, link) in self.segments.iter().enumerate() {
            let base = link.load(Ordering::Acquire);
            if base.is_null() {
                continue;
            }
            // SAFETY: exclusive access; the segment was allocated as a boxed slice of
            // exactly this length.
            let directory = unsafe { Box::from_raw(segment_slice(base, segment)) };
            for leaf in directory.iter() {
                let leaf = leaf.load(Ordering::Acquire);
                if leaf.is_null() {
                    continue;
                }
                // SAFETY: leaves and values were boxed by this table and are freed once.
                let leaf = unsafe { Box::from_raw(leaf) };
                for value in leaf.iter() {
                    let value = value.load(Ordering::Acquire);
                    if !value.is_null() {
                        // SAFETY: see above.
                        drop(unsafe { Box::from_raw(value) });
                    }
                }
            }
        }
    }
}

impl<T> fmt::Debug for SparseTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let allocated = self
            .segments
            .iter()
            .filter(|link| !link.load(Ordering::Relaxed).is_null())
            .count();
        f.debug_struct("SparseTable")
            .field("segments", &allocated)
            .finish_non_exhaustive()
    }
}
