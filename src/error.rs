use crate::{config::Config, context::ResultView, types::Inputs};
use core::{any::Any, fmt, time::Duration};
use std::sync::Arc;
use thiserror::Error;

/// Terminal error of a [`Deferred`](crate::deferred::Deferred) cell.
///
/// Cloning is cheap: the same error is handed to every listener of a cell.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A node computation or a transformation function failed.
    #[error("{0}")]
    Computation(Arc<dyn std::error::Error + Send + Sync + 'static>),
    /// The upstream cell completed while this one was still pending and no
    /// longer needed.
    #[error("revoked")]
    Revoked {
        /// Error of the upstream cell, if it failed.
        #[source]
        cause: Option<Box<Error>>,
    },
    /// The owning context was frozen before this cell could be registered.
    #[error("context finished")]
    ContextFinished,
    /// The owning context was cancelled while this cell was pending.
    #[error("cancelled")]
    Cancelled {
        /// What triggered the cancellation.
        #[source]
        cause: Option<Box<Error>>,
    },
    /// Something that is not an error was raised where an error was expected.
    #[error("non-error value raised: {0}")]
    NonError(NonError),
    /// No node is registered for a key that has no input either.
    #[error("no node registered for key {key}")]
    UnknownNode {
        /// `Debug` rendering of the key.
        key: String,
    },
    /// A blocking wait gave up. Never stored in a cell.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Failure of a whole request, with diagnostics.
    #[error(transparent)]
    Yank(Arc<YankError>),
}

impl Error {
    /// Computation failure carrying a plain message.
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        anyhow::Error::msg(message).into()
    }

    /// Computation failure wrapping any standard error.
    pub fn computation(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Computation(Arc::new(error))
    }

    /// Wraps a value that is not an error, keeping it for introspection.
    pub fn from_value<V: Any + fmt::Debug + Send + Sync>(value: V) -> Self {
        Self::NonError(NonError {
            rendered: format!("{value:?}").into(),
            value: Some(Arc::new(value)),
        })
    }

    /// Wraps a panic payload caught while running user code.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<String>() {
            Ok(message) => return Self::NonError(NonError::message(*message)),
            Err(payload) => payload,
        };
        match payload.downcast::<&'static str>() {
            Ok(message) => Self::NonError(NonError::message((*message).to_owned())),
            Err(_) => Self::NonError(NonError {
                rendered: "opaque panic payload".into(),
                value: None,
            }),
        }
    }

    /// Whether this is a cancellation raised by a context.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether this is a revocation raised by an upstream cell.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        matches!(self, Self::Revoked { .. })
    }

    /// The request diagnostics, if this error surfaced from a `yank`.
    #[must_use]
    pub fn as_yank(&self) -> Option<&YankError> {
        match self {
            Self::Yank(error) => Some(error),
            _ => None,
        }
    }

    /// Strips `yank` enrichment, returning the underlying error.
    #[must_use]
    pub fn root(&self) -> &Error {
        match self {
            Self::Yank(error) => error.cause().root(),
            other => other,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        let boxed: Box<dyn std::error::Error + Send + Sync + 'static> = error.into();
        Self::Computation(Arc::from(boxed))
    }
}

/// A non-error value raised as an error, preserved for introspection.
#[derive(Clone)]
pub struct NonError {
    rendered: Box<str>,
    value: Option<Arc<dyn Any + Send + Sync>>,
}

impl NonError {
    fn message(message: String) -> Self {
        Self {
            rendered: message.as_str().into(),
            value: Some(Arc::new(message)),
        }
    }

    /// The original value, if it was recoverable and is a `V`.
    #[must_use]
    pub fn downcast_ref<V: Any>(&self) -> Option<&V> {
        self.value.as_deref()?.downcast_ref()
    }

    /// `Debug` rendering of the original value.
    #[must_use]
    pub fn rendered(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Debug for NonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NonError").field(&self.rendered).finish()
    }
}

impl fmt::Display for NonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// Error surfaced by [`Context::yank`](crate::context::Context::yank),
/// enriched with what the request had achieved when it failed.
#[derive(Error)]
#[error("failed to resolve {requested_rendered}: {cause}")]
pub struct YankError {
    #[source]
    cause: Error,
    requested_rendered: String,
    /// `ResultView<C>` at the time of failure.
    partial: Box<dyn Any + Send + Sync>,
    /// `Vec<C::Key>` that were being resolved.
    requested: Box<dyn Any + Send + Sync>,
}

impl YankError {
    pub(crate) fn new<C: Config>(cause: Error, partial: ResultView<C>, requested: Vec<C::Key>) -> Self {
        Self {
            cause,
            requested_rendered: format!("{requested:?}"),
            partial: Box::new(partial),
            requested: Box::new(requested),
        }
    }

    /// The error that made the request fail.
    #[must_use]
    pub fn cause(&self) -> &Error {
        &self.cause
    }

    /// Everything resolved successfully before the failure.
    #[must_use]
    pub fn partial<C: Config>(&self) -> Option<&ResultView<C>> {
        self.partial.downcast_ref()
    }

    /// The request's original inputs.
    #[must_use]
    pub fn inputs<C: Config>(&self) -> Option<&Inputs<C>> {
        self.partial::<C>().map(ResultView::inputs)
    }

    /// The keys the request asked for.
    #[must_use]
    pub fn requested<C: Config>(&self) -> Option<&[C::Key]> {
        self.requested
            .downcast_ref::<Vec<C::Key>>()
            .map(Vec::as_slice)
    }
}

impl fmt::Debug for YankError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YankError")
            .field("cause", &self.cause)
            .field("requested", &self.requested_rendered)
            .finish_non_exhaustive()
    }
}

/// A completion attempt presented the wrong ownership token.
///
/// Always a logic error in the caller; never stored in a cell.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum OwnershipError {
    /// The cell is owned by a different token.
    #[error("cell is owned by another token")]
    Mismatch,
    /// A token was presented for a cell nobody owns.
    #[error("token presented for an unowned cell")]
    Superfluous,
    /// The cell is owned but no token was presented.
    #[error("cell is owned, completion requires its token")]
    Missing,
}

/// Invalid state transition of a [`Context`](crate::context::Context).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ContextError {
    /// The context has already been frozen.
    #[error("context is already frozen")]
    AlreadyFrozen,
}

/// An [`AppendList`](crate::list::AppendList) was frozen a second time.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("list is already frozen")]
pub struct AlreadyFrozen;

impl From<AlreadyFrozen> for ContextError {
    fn from(AlreadyFrozen: AlreadyFrozen) -> Self {
        Self::AlreadyFrozen
    }
}

impl From<ContextError> for Error {
    fn from(error: ContextError) -> Self {
        match error {
            ContextError::AlreadyFrozen => Self::ContextFinished,
        }
    }
}
