use super::{Async, Deferred, Listener, Token};
use crate::{error::Error, sink::report_exception};
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Outcome of a transformation step: a value now, a cell to follow, or a failure.
pub type Step<U> = Result<Async<U>, Error>;

type NoRecovery<U> = fn(&Error) -> Step<U>;

impl<T: Clone + Send + Sync + 'static> Deferred<T> {
    /// Completes this cell with the outcome of `source`.
    ///
    /// A plain value completes it right away; a cell is followed until it
    /// completes. Completion is attempted without a token, so an owned cell
    /// ignores the forwarded outcome.
    pub fn chain(&self, source: impl Into<Async<T>>) {
        self.forward(source.into(), None);
    }

    /// Like [`chain`](Self::chain), completing with `token`. Ownership
    /// violations are routed to the exception sink.
    pub fn chain_owned(&self, source: impl Into<Async<T>>, token: Token) {
        self.forward(source.into(), Some(token));
    }

    fn forward(&self, source: Async<T>, token: Option<Token>) {
        match source {
            Async::Value(value) => self.settle(Ok(value), token),
            Async::Deferred(source) => match source.peek() {
                Some(outcome) => self.settle(outcome.clone(), token),
                None => source.on_realized(Forward {
                    target: self.clone(),
                    token,
                }),
            },
        }
    }

    fn settle(&self, outcome: Result<T, Error>, token: Option<Token>) {
        let Some(token) = token else {
            let _ = match outcome {
                Ok(value) => self.success(value),
                Err(error) => self.error(error),
            };
            return;
        };
        let settled = match outcome {
            Ok(value) => self.complete_success(value, Some(token)),
            Err(error) => self.complete_error(error, Some(token)),
        };
        if let Err(violation) = settled {
            report_exception(&Error::computation(violation));
        }
    }

    /// Cell completing with `f` applied to this cell's value.
    ///
    /// Returning [`Async::Deferred`] makes the result follow that cell, and
    /// revokes it should the result complete first. Errors propagate
    /// unchanged; a panic in `f` fails the result.
    pub fn bind<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> Step<U> + Send + 'static,
    {
        self.transform(f, None::<NoRecovery<U>>)
    }

    /// Like [`bind`](Self::bind), additionally mapping an error of this cell
    /// through `recover`.
    pub fn bind_or_else<U, F, G>(&self, f: F, recover: G) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> Step<U> + Send + 'static,
        G: FnOnce(&Error) -> Step<U> + Send + 'static,
    {
        self.transform(f, Some(recover))
    }

    /// Cell completing with `f` applied to this cell's value.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        self.bind(move |value| Ok(Async::Value(f(value))))
    }

    fn transform<U, F, G>(&self, on_success: F, on_error: Option<G>) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> Step<U> + Send + 'static,
        G: FnOnce(&Error) -> Step<U> + Send + 'static,
    {
        let result = Deferred::new();
        self.on_realized(Transform {
            result: result.clone(),
            on_success,
            on_error,
        });
        result
    }

    /// Completes this cell with the outcome of a transformation step.
    fn adopt(&self, step: Step<T>) {
        match step {
            Ok(Async::Value(value)) => {
                self.success(value);
            }
            Ok(Async::Deferred(inner)) => {
                self.revoke_to(inner.clone());
                self.chain(inner);
            }
            Err(error) => {
                self.error(error);
            }
        }
    }
}

fn guarded<U>(f: impl FnOnce() -> Step<U>) -> Step<U> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(Error::from_panic(payload)))
}

struct Forward<T> {
    target: Deferred<T>,
    token: Option<Token>,
}

impl<T: Clone + Send + Sync + 'static> Listener<T> for Forward<T> {
    fn on_success(self: Box<Self>, value: &T) {
        self.target.settle(Ok(value.clone()), self.token);
    }

    fn on_error(self: Box<Self>, error: &Error) {
        self.target.settle(Err(error.clone()), self.token);
    }
}

struct Transform<U, F, G> {
    result: Deferred<U>,
    on_success: F,
    on_error: Option<G>,
}

impl<T, U, F, G> Listener<T> for Transform<U, F, G>
where
    T: 'static,
    U: Clone + Send + Sync + 'static,
    F: FnOnce(&T) -> Step<U> + Send + 'static,
    G: FnOnce(&Error) -> Step<U> + Send + 'static,
{
    fn on_success(self: Box<Self>, value: &T) {
        let Self {
            result, on_success, ..
        } = *self;
        result.adopt(guarded(|| on_success(value)));
    }

    fn on_error(self: Box<Self>, error: &Error) {
        let Self {
            result, on_error, ..
        } = *self;
        match on_error {
            Some(recover) => result.adopt(guarded(|| recover(error))),
            None => {
                result.error(error.clone());
            }
        }
    }
}
