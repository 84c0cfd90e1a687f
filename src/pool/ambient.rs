use core::{
    any::{Any, TypeId, type_name},
    cell::RefCell,
    fmt,
};
use std::sync::Arc;
use tracing::Span;

thread_local! {
    /// Bindings of the job currently running on this thread.
    static CURRENT: RefCell<Option<Arc<Frame>>> = const { RefCell::new(None) };
}

/// One binding, pointing at the bindings it shadows.
struct Frame {
    type_id: TypeId,
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<Frame>>,
}

/// Snapshot of the dynamic context a unit of work runs in: the caller's
/// `tracing` span and a persistent set of typed bindings.
///
/// A [`Pool`](super::Pool) captures one at creation and re-establishes it
/// around every job it dispatches, whichever thread the job lands on.
/// Bindings are looked up by type; binding a type again shadows the previous
/// value for the extended snapshot only.
#[derive(Clone)]
pub struct Ambient {
    span: Span,
    frame: Option<Arc<Frame>>,
}

impl Default for Ambient {
    fn default() -> Self {
        Self {
            span: Span::none(),
            frame: None,
        }
    }
}

impl Ambient {
    /// Snapshot of the calling thread's span and bindings.
    #[must_use]
    pub fn current() -> Self {
        Self {
            span: Span::current(),
            frame: CURRENT.with_borrow(Clone::clone),
        }
    }

    /// This snapshot extended with `value`.
    #[must_use]
    pub fn with<T: Any + Send + Sync>(&self, value: T) -> Self {
        Self {
            span: self.span.clone(),
            frame: Some(Arc::new(Frame {
                type_id: TypeId::of::<T>(),
                type_name: type_name::<T>(),
                value: Arc::new(value),
                parent: self.frame.clone(),
            })),
        }
    }

    /// This snapshot with `span` in place of the captured one.
    #[must_use]
    pub fn in_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// The innermost `T` bound on the calling thread.
    #[must_use]
    pub fn get<T: Any + Send + Sync>() -> Option<Arc<T>> {
        Self::current().lookup()
    }

    /// The innermost `T` bound in this snapshot.
    #[must_use]
    pub fn lookup<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let mut frame = self.frame.as_deref();
        while let Some(current) = frame {
            if current.type_id == TypeId::of::<T>() {
                return Arc::clone(&current.value).downcast().ok();
            }
            frame = current.parent.as_deref();
        }
        None
    }

    /// The captured span.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Runs `f` with this snapshot installed on the calling thread, restoring
    /// the previous one afterwards, also on unwind.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> R {
        let _restore = Restore(Some(CURRENT.replace(self.frame.clone())));
        let _entered = self.span.enter();
        f()
    }
}

struct Restore(Option<Option<Arc<Frame>>>);

impl Drop for Restore {
    fn drop(&mut self) {
        if let Some(previous) = self.0.take() {
            CURRENT.set(previous);
        }
    }
}

impl fmt::Debug for Ambient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bound = Vec::new();
        let mut frame = self.frame.as_deref();
        while let Some(current) = frame {
            bound.push(current.type_name);
            frame = current.parent.as_deref();
        }
        f.debug_struct("Ambient")
            .field("span", &self.span)
            .field("bound", &bound)
            .finish()
    }
}
