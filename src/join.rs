//! Fan-in over many cells with a single continuation.
//!
//! [`await_all`] invokes [`Continuation::on_success`] once every cell has
//! succeeded, or [`Continuation::on_error`] with the first error observed, and
//! never both. Cells are inspected last to first; those already succeeded get
//! no listener. When every cell is already realized the continuation runs
//! inline without allocating. Tuples of up to 16 cells are passed without
//! building an intermediate collection.

use crate::{
    deferred::{Callbacks, Deferred, Listener},
    error::Error,
    sync::{AtomicUsize, Ordering},
    types::SyncUnsafeCell,
};
use std::sync::Arc;

/// Set in the countdown once an error has claimed the continuation.
const DONE: usize = 1 << (usize::BITS - 1);

/// Code to run once a fan-in settles.
pub trait Continuation: Send + 'static {
    /// Every awaited cell succeeded.
    fn on_success(self);
    /// The first failure among the awaited cells.
    fn on_error(self, error: &Error);
}

impl<S, E> Continuation for Callbacks<S, E>
where
    S: FnOnce() + Send + 'static,
    E: FnOnce(&Error) + Send + 'static,
{
    fn on_success(self) {
        (self.on_success)();
    }

    fn on_error(self, error: &Error) {
        (self.on_error)(error);
    }
}

/// Pairs two closures into a [`Continuation`].
pub fn continuation<S, E>(on_success: S, on_error: E) -> Callbacks<S, E>
where
    S: FnOnce() + Send + 'static,
    E: FnOnce(&Error) + Send + 'static,
{
    Callbacks::new(on_success, on_error)
}

/// A cell viewed without its value type.
trait Awaitable {
    /// `None` while pending.
    fn settled(&self) -> Option<Result<(), &Error>>;
    fn watch(&self, signal: Arc<dyn Signal>);
}

trait Signal: Send + Sync + 'static {
    fn succeeded(&self);
    fn failed(&self, error: &Error);
}

impl<T: Clone + Send + Sync + 'static> Awaitable for Deferred<T> {
    fn settled(&self) -> Option<Result<(), &Error>> {
        self.peek().map(|outcome| outcome.as_ref().map(|_| ()))
    }

    fn watch(&self, signal: Arc<dyn Signal>) {
        self.subscribe(Box::new(Relay(signal)));
    }
}

struct Relay(Arc<dyn Signal>);

impl<T> Listener<T> for Relay {
    fn on_success(self: Box<Self>, _: &T) {
        self.0.succeeded();
    }

    fn on_error(self: Box<Self>, error: &Error) {
        self.0.failed(error);
    }
}

/// Shared countdown of a pending fan-in.
struct FanIn<K> {
    /// Cells still pending, with `DONE` or-ed in by the first failure.
    remaining: AtomicUsize,
    /// Taken exactly once, by whichever signal settles the fan-in.
    continuation: SyncUnsafeCell<Option<K>>,
}

impl<K: Continuation> FanIn<K> {
    fn take(&self) -> K {
        // SAFETY: only the single thread that settled the countdown gets here.
        self.continuation
            .with_mut(|continuation| unsafe { (*continuation).take() })
            .expect("FanIn::take: [1]")
    }
}

impl<K: Continuation> Signal for FanIn<K> {
    fn succeeded(&self) {
        // Failing cells never decrement, so reaching zero means all succeeded.
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.take().on_success();
        }
    }

    fn failed(&self, error: &Error) {
        if self.remaining.fetch_or(DONE, Ordering::AcqRel) & DONE == 0 {
            self.take().on_error(error);
        }
    }
}

fn await_cells<'a, I, K>(cells: I, continuation: K)
where
    I: DoubleEndedIterator<Item = &'a dyn Awaitable> + Clone,
    K: Continuation,
{
    let mut pending = false;
    for cell in cells.clone().rev() {
        match cell.settled() {
            Some(Err(error)) => return continuation.on_error(error),
            Some(Ok(())) => {}
            None => pending = true,
        }
    }
    if !pending {
        return continuation.on_success();
    }
    // The scan holds one count until every watch is in place, so cells completing
    // meanwhile cannot settle the fan-in early. Watching a realized cell notifies
    // inline.
    let fan_in = Arc::new(FanIn {
        remaining: AtomicUsize::new(1),
        continuation: SyncUnsafeCell::new(Some(continuation)),
    });
    let signal: Arc<dyn Signal> = Arc::clone(&fan_in) as Arc<dyn Signal>;
    for cell in cells.rev() {
        if matches!(cell.settled(), Some(Ok(()))) {
            continue;
        }
        if fan_in.remaining.fetch_add(1, Ordering::AcqRel) & DONE != 0 {
            break;
        }
        cell.watch(Arc::clone(&signal));
    }
    fan_in.succeeded();
}

/// A group of cells that can be awaited together.
pub trait AwaitAll {
    /// Runs `continuation` once the whole group has settled. See [`await_all`].
    fn await_all<K: Continuation>(self, continuation: K);
}

macro_rules! await_tuple {
    ($($cell:ident),+) => {
        impl<'a, $($cell: Clone + Send + Sync + 'static),+> AwaitAll for ($(&'a Deferred<$cell>,)+) {
            #[allow(non_snake_case)]
            fn await_all<K: Continuation>(self, continuation: K) {
                let ($($cell,)+) = self;
                await_cells([$($cell as &dyn Awaitable),+].into_iter(), continuation);
            }
        }
    };
}

await_tuple!(A);
await_tuple!(A, B);
await_tuple!(A, B, C);
await_tuple!(A, B, C, D);
await_tuple!(A, B, C, D, E);
await_tuple!(A, B, C, D, E, F);
await_tuple!(A, B, C, D, E, F, G);
await_tuple!(A, B, C, D, E, F, G, H);
await_tuple!(A, B, C, D, E, F, G, H, I);
await_tuple!(A, B, C, D, E, F, G, H, I, J);
await_tuple!(A, B, C, D, E, F, G, H, I, J, L);
await_tuple!(A, B, C, D, E, F, G, H, I, J, L, M);
await_tuple!(A, B, C, D, E, F, G, H, I, J, L, M, N);
await_tuple!(A, B, C, D, E, F, G, H, I, J, L, M, N, O);
await_tuple!(A, B, C, D, E, F, G, H, I, J, L, M, N, O, P);
await_tuple!(A, B, C, D, E, F, G, H, I, J, L, M, N, O, P, Q);

impl<T: Clone + Send + Sync + 'static> AwaitAll for &[Deferred<T>] {
    fn await_all<K: Continuation>(self, continuation: K) {
        await_cells(self.iter().map(|cell| cell as &dyn Awaitable), continuation);
    }
}

impl<T: Clone + Send + Sync + 'static> AwaitAll for &Vec<Deferred<T>> {
    fn await_all<K: Continuation>(self, continuation: K) {
        self.as_slice().await_all(continuation);
    }
}

/// Invokes `continuation` exactly once: with success after every cell in
/// `cells` has succeeded, or with the first error observed, without waiting
/// for the rest.
///
/// ```
/// use crg::{deferred::Deferred, join::{await_all, continuation}};
///
/// let (a, b) = (Deferred::<u8>::new(), Deferred::<&str>::new());
/// let both = Deferred::new();
/// let done = both.clone();
/// await_all((&a, &b), continuation(move || { done.success(()); }, |_| {}));
/// a.success(1);
/// assert!(!both.is_realized());
/// b.success("two");
/// assert!(both.is_realized());
/// ```
pub fn await_all<A: AwaitAll, K: Continuation>(cells: A, continuation: K) {
    cells.await_all(continuation);
}
