mod bind;
mod wait;

pub use bind::Step;

use crate::{
    error::{Error, OwnershipError},
    list::AppendList,
    sink::report_exception,
    sync::{AtomicU8, AtomicU64, Backoff, Ordering, UnsafeCell},
};
use core::{any::Any, fmt, mem, num::NonZeroU64};
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, OnceLock},
};

const EMPTY: u8 = 0;
const LISTENING: u8 = 1;
/// Transient: some thread is mutating the guarded fields.
const LOCKED: u8 = 2;
const SUCCEEDED: u8 = 3;
const FAILED: u8 = 4;

/// Externally observable state of a [`Deferred`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum State {
    /// Pending, nobody has shown interest yet.
    Empty,
    /// Pending, with listeners registered or an owner bound.
    Listening,
    /// Completed with a value.
    Succeeded,
    /// Completed with an error.
    Failed,
}

impl State {
    /// Whether the cell has completed.
    #[must_use]
    pub fn is_realized(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Pair of continuations notified once when a [`Deferred`] completes.
///
/// Registered before completion, a listener runs on whichever thread performs
/// the completing write; registered after, it runs inline before
/// registration returns. Panics are routed to the exception sink.
pub trait Listener<T>: Send {
    /// Called with the value of a successful cell.
    fn on_success(self: Box<Self>, value: &T);
    /// Called with the error of a failed cell.
    fn on_error(self: Box<Self>, error: &Error);
}

/// A pending computation that can be abandoned from the outside.
pub trait Revocable: Send + Sync + 'static {
    /// Fails the target with [`Error::Revoked`] if it is still pending and
    /// accepts external completion. Returns whether it did.
    fn revoke(&self, cause: Option<&Error>) -> bool;
}

/// Opaque identity reserving the right to complete a [`Deferred`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Token(NonZeroU64);

impl Token {
    fn fresh() -> Self {
        static NEXT: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(1);
        let id = NEXT.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        Self(NonZeroU64::new(id).expect("Token::fresh: [1]"))
    }
}

/// Exclusive right to complete a claimed [`Deferred`].
///
/// Every completion goes through the bound token, so holders of plain
/// handles, cancellation and revocation included, cannot complete the cell.
#[derive(Debug)]
pub struct Claim<T> {
    cell: Deferred<T>,
    token: Token,
}

impl<T> Clone for Claim<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            token: self.token,
        }
    }
}

impl<T> Claim<T> {
    /// Claims `cell`. `None` if it is already owned or has completed.
    pub fn acquire(cell: &Deferred<T>) -> Option<Self> {
        Some(Self {
            cell: cell.clone(),
            token: cell.claim()?,
        })
    }

    /// The claimed cell.
    pub fn cell(&self) -> &Deferred<T> {
        &self.cell
    }

    /// The bound token.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Completes the cell with `value`. Returns whether this call did.
    pub fn success(&self, value: T) -> bool {
        self.cell.complete_success(value, Some(self.token)) == Ok(true)
    }

    /// Completes the cell with `error`. Returns whether this call did.
    pub fn error(&self, error: Error) -> bool {
        self.cell.complete_error(error, Some(self.token)) == Ok(true)
    }
}

impl<T: Clone + Send + Sync + 'static> Claim<T> {
    /// Completes the cell with the outcome of `source`.
    /// See [`Deferred::chain_owned`].
    pub fn chain(&self, source: impl Into<Async<T>>) {
        self.cell.chain_owned(source, self.token);
    }
}

/// Metadata attached to a cell.
pub type Meta = Arc<dyn Any + Send + Sync>;

/// A value that is either available now or will be produced by a cell.
#[derive(Clone, Debug)]
pub enum Async<T> {
    /// Already available.
    Value(T),
    /// Produced by this cell, possibly later.
    Deferred(Deferred<T>),
}

impl<T> From<Deferred<T>> for Async<T> {
    fn from(deferred: Deferred<T>) -> Self {
        Self::Deferred(deferred)
    }
}

impl<T: Clone + Send + Sync + 'static> Async<T> {
    /// The value, if it is available without waiting and not an error.
    #[must_use]
    pub fn realized(&self) -> Option<T> {
        match self {
            Self::Value(value) => Some(value.clone()),
            Self::Deferred(deferred) => deferred.peek()?.as_ref().ok().cloned(),
        }
    }
}

/// Who is completing a cell.
#[derive(Copy, Clone)]
enum Authority {
    /// Anyone, provided the cell has no owner. Violations are quiet rejections.
    Unowned,
    /// Checked against the bound owner. Violations are reported.
    Token(Option<Token>),
}

struct Guarded<T> {
    outcome: Option<Result<T, Error>>,
    listeners: AppendList<Box<dyn Listener<T>>>,
    revokee: Option<Box<dyn Revocable>>,
}

struct Inner<T> {
    state: AtomicU8,
    /// Bound token id, `0` when unowned. Written only in the locked phase.
    owner: AtomicU64,
    guarded: UnsafeCell<Guarded<T>>,
    meta: OnceLock<Meta>,
    /// Shared by every blocking wait on this cell.
    latch: OnceLock<Arc<wait::Latch>>,
}

// SAFETY: the guarded fields are mutated only by the thread that moved the state to
// `LOCKED`; once terminal, the outcome is immutable and shared by reference.
unsafe impl<T: Send + Sync> Sync for Inner<T> {}
unsafe impl<T: Send + Sync> Send for Inner<T> {}

/// Single-assignment asynchronous value.
///
/// A cell starts pending and completes exactly once, with a value or an
/// [`Error`]. Handles are cheap to clone and all refer to the same cell.
///
/// Every mutation (listener registration, claiming, linking a revokee,
/// completion) runs inside a short locked phase entered by compare-and-swap
/// on the state word and bounded by a spin-wait; nothing ever blocks except
/// [`wait`](Self::wait).
///
/// A cell may be *owned*: once a [`Token`] is bound, only completions
/// presenting it are accepted. [`success`](Self::success) and
/// [`error`](Self::error) quietly refuse owned cells, while
/// [`complete_success`](Self::complete_success) and
/// [`complete_error`](Self::complete_error) report a mismatch as an
/// [`OwnershipError`].
pub struct Deferred<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deferred<T> {
    fn with_state(state: u8, owner: u64, outcome: Option<Result<T, Error>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(state),
                owner: AtomicU64::new(owner),
                guarded: UnsafeCell::new(Guarded {
                    outcome,
                    listeners: AppendList::new(),
                    revokee: None,
                }),
                meta: OnceLock::new(),
                latch: OnceLock::new(),
            }),
        }
    }

    /// Creates a pending, unowned cell.
    #[must_use]
    pub fn new() -> Self {
        Self::with_state(EMPTY, 0, None)
    }

    /// Creates a pending cell owned by the returned token.
    #[must_use]
    pub fn owned() -> (Self, Token) {
        let token = Token::fresh();
        (Self::with_state(LISTENING, token.0.get(), None), token)
    }

    /// Creates a cell that has already succeeded.
    #[must_use]
    pub fn succeeded(value: T) -> Self {
        Self::with_state(SUCCEEDED, 0, Some(Ok(value)))
    }

    /// Creates a cell that has already failed.
    #[must_use]
    pub fn failed(error: Error) -> Self {
        Self::with_state(FAILED, 0, Some(Err(error)))
    }

    /// Enters the locked phase. Returns the pending state it replaced, or the
    /// terminal state if the cell has completed.
    fn lock(&self) -> Result<u8, u8> {
        let mut backoff = Backoff::new();
        loop {
            let state = self.inner.state.load(Ordering::Acquire);
            match state {
                EMPTY | LISTENING => {
                    if self
                        .inner
                        .state
                        .compare_exchange_weak(state, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        return Ok(state);
                    }
                }
                LOCKED => backoff.snooze(),
                terminal => return Err(terminal),
            }
        }
    }

    fn unlock(&self, state: u8) {
        self.inner.state.store(state, Ordering::Release);
    }

    /// # Safety
    /// The caller must hold the locked phase.
    unsafe fn locked<R>(&self, f: impl FnOnce(&mut Guarded<T>) -> R) -> R {
        // SAFETY: the locked phase grants exclusive access to the guarded fields.
        self.inner.guarded.with_mut(|guarded| f(unsafe { &mut *guarded }))
    }

    /// Current state, waiting out an in-progress mutation.
    pub fn state(&self) -> State {
        let mut backoff = Backoff::new();
        loop {
            match self.inner.state.load(Ordering::Acquire) {
                EMPTY => return State::Empty,
                LISTENING => return State::Listening,
                SUCCEEDED => return State::Succeeded,
                FAILED => return State::Failed,
                _ => backoff.snooze(),
            }
        }
    }

    /// Whether the cell has completed.
    pub fn is_realized(&self) -> bool {
        matches!(
            self.inner.state.load(Ordering::Acquire),
            SUCCEEDED | FAILED
        )
    }

    /// The outcome, if the cell has completed.
    pub fn peek(&self) -> Option<&Result<T, Error>> {
        if !self.is_realized() {
            return None;
        }
        // SAFETY: the outcome was written before the terminal state was released and
        // is never touched again.
        self.inner
            .guarded
            .with(|guarded| unsafe { (*guarded).outcome.as_ref() })
    }

    /// Whether a token has been bound.
    pub fn is_claimed(&self) -> bool {
        self.inner.owner.load(Ordering::Acquire) != 0
    }

    /// Binds a fresh token, reserving the right to complete this cell.
    ///
    /// Returns `None` if the cell is already owned or has completed.
    pub fn claim(&self) -> Option<Token> {
        let previous = self.lock().ok()?;
        if self.is_claimed() {
            self.unlock(previous);
            return None;
        }
        let token = Token::fresh();
        self.inner.owner.store(token.0.get(), Ordering::Release);
        self.unlock(LISTENING);
        Some(token)
    }

    /// Completes an unowned cell with `value`.
    ///
    /// Returns whether this call performed the completion: `false` if the cell
    /// had already completed or is owned.
    pub fn success(&self, value: T) -> bool {
        matches!(self.complete(Ok(value), Authority::Unowned), Ok(true))
    }

    /// Completes an unowned cell with `error`. See [`success`](Self::success).
    pub fn error(&self, error: Error) -> bool {
        matches!(self.complete(Err(error), Authority::Unowned), Ok(true))
    }

    /// Completes the cell with `value`, checking ownership.
    ///
    /// `token` must be the bound token if the cell is owned, and `None`
    /// otherwise. Returns whether this call performed the completion.
    ///
    /// # Errors
    /// On a missing, mismatched or superfluous token.
    pub fn complete_success(&self, value: T, token: Option<Token>) -> Result<bool, OwnershipError> {
        self.complete(Ok(value), Authority::Token(token))
    }

    /// Completes the cell with `error`, checking ownership.
    ///
    /// # Errors
    /// See [`complete_success`](Self::complete_success).
    pub fn complete_error(&self, error: Error, token: Option<Token>) -> Result<bool, OwnershipError> {
        self.complete(Err(error), Authority::Token(token))
    }

    fn complete(&self, outcome: Result<T, Error>, authority: Authority) -> Result<bool, OwnershipError> {
        let Ok(previous) = self.lock() else {
            return Ok(false);
        };
        let owner = self.inner.owner.load(Ordering::Relaxed);
        let violation = match authority {
            Authority::Unowned => (owner != 0).then_some(None),
            Authority::Token(token) => match (owner, token) {
                (0, None) => None,
                (0, Some(_)) => Some(Some(OwnershipError::Superfluous)),
                (_, None) => Some(Some(OwnershipError::Missing)),
                (owner, Some(token)) if owner == token.0.get() => None,
                (_, Some(_)) => Some(Some(OwnershipError::Mismatch)),
            },
        };
        if let Some(violation) = violation {
            self.unlock(previous);
            return violation.map_or(Ok(false), Err);
        }

        let succeeded = outcome.is_ok();
        // SAFETY: we hold the locked phase.
        let (listeners, revokee) = unsafe {
            self.locked(|guarded| {
                guarded.outcome = Some(outcome);
                (mem::take(&mut guarded.listeners), guarded.revokee.take())
            })
        };
        self.unlock(if succeeded { SUCCEEDED } else { FAILED });

        let outcome = self.peek().expect("Deferred::complete: [1]");
        for listener in listeners {
            notify(listener, outcome);
        }
        if let Some(revokee) = revokee {
            revokee.revoke(outcome.as_ref().err());
        }
        Ok(true)
    }

    /// Registers `listener`, or runs it inline if the cell has completed.
    pub fn on_realized(&self, listener: impl Listener<T> + 'static) {
        self.subscribe(Box::new(listener));
    }

    /// Registers a pair of callbacks. See [`on_realized`](Self::on_realized).
    pub fn add_listener<S, E>(&self, on_success: S, on_error: E)
    where
        S: FnOnce(&T) + Send + 'static,
        E: FnOnce(&Error) + Send + 'static,
    {
        self.on_realized(Callbacks::new(on_success, on_error));
    }

    pub(crate) fn subscribe(&self, listener: Box<dyn Listener<T>>) {
        match self.lock() {
            Ok(_) => {
                // SAFETY: we hold the locked phase.
                let pushed = unsafe { self.locked(|guarded| guarded.listeners.push(listener).is_ok()) };
                self.unlock(LISTENING);
                // The listener list is only ever taken, never frozen.
                assert!(pushed, "Deferred::subscribe: [1]");
            }
            Err(_) => {
                let outcome = self.peek().expect("Deferred::subscribe: [2]");
                notify(listener, outcome);
            }
        }
    }

    /// Arranges for `dependent` to be revoked when this cell completes, unless
    /// it has completed by then. Revokes right away if this cell already has.
    ///
    /// A cell links at most one revokee; linking another replaces it.
    pub fn revoke_to(&self, dependent: impl Revocable) {
        match self.lock() {
            Ok(previous) => {
                // SAFETY: we hold the locked phase.
                let replaced =
                    unsafe { self.locked(|guarded| guarded.revokee.replace(Box::new(dependent))) };
                self.unlock(previous);
                drop(replaced);
            }
            Err(_) => {
                let outcome = self.peek().expect("Deferred::revoke_to: [1]");
                dependent.revoke(outcome.as_ref().err());
            }
        }
    }

    /// Attaches metadata. Only the first call has an effect.
    pub fn set_meta(&self, meta: Meta) -> bool {
        self.inner.meta.set(meta).is_ok()
    }

    /// Metadata attached with [`set_meta`](Self::set_meta).
    pub fn meta(&self) -> Option<&Meta> {
        self.inner.meta.get()
    }

    /// Whether both handles refer to the same cell.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + Send + Sync + 'static> Revocable for Deferred<T> {
    fn revoke(&self, cause: Option<&Error>) -> bool {
        if self.is_realized() {
            return false;
        }
        self.error(Error::Revoked {
            cause: cause.cloned().map(Box::new),
        })
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Deferred");
        debug.field("state", &self.state());
        if let Some(outcome) = self.peek() {
            debug.field("outcome", outcome);
        }
        debug.field("claimed", &self.is_claimed()).finish()
    }
}

fn notify<T>(listener: Box<dyn Listener<T>>, outcome: &Result<T, Error>) {
    let delivered = catch_unwind(AssertUnwindSafe(|| match outcome {
        Ok(value) => listener.on_success(value),
        Err(error) => listener.on_error(error),
    }));
    if let Err(payload) = delivered {
        report_exception(&Error::from_panic(payload));
    }
}

/// Adapts a pair of closures into a [`Listener`] or a
/// [`Continuation`](crate::join::Continuation).
pub struct Callbacks<S, E> {
    pub(crate) on_success: S,
    pub(crate) on_error: E,
}

impl<S, E> Callbacks<S, E> {
    /// Pairs the two callbacks.
    pub fn new(on_success: S, on_error: E) -> Self {
        Self {
            on_success,
            on_error,
        }
    }
}

impl<T, S, E> Listener<T> for Callbacks<S, E>
where
    S: FnOnce(&T) + Send + 'static,
    E: FnOnce(&Error) + Send + 'static,
{
    fn on_success(self: Box<Self>, value: &T) {
        (self.on_success)(value);
    }

    fn on_error(self: Box<Self>, error: &Error) {
        (self.on_error)(error);
    }
}
