use super::{Deferred, Listener};
use crate::error::Error;
use core::time::Duration;
use std::{
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::Instant,
};

/// One-shot gate opened by the completion of a cell.
#[derive(Debug, Default)]
pub(super) struct Latch {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Latch {
    fn open(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.opened.notify_all();
    }

    /// Blocks until opened or until `deadline`. Returns whether it was opened.
    fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        while !*open {
            open = match deadline {
                None => self.opened.wait(open).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                        return false;
                    };
                    self.opened
                        .wait_timeout(open, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        true
    }
}

impl<T> Listener<T> for Arc<Latch> {
    fn on_success(self: Box<Self>, _: &T) {
        self.open();
    }

    fn on_error(self: Box<Self>, _: &Error) {
        self.open();
    }
}

impl<T: Clone + Send + Sync + 'static> Deferred<T> {
    /// Blocks the calling thread until the cell completes and returns a copy of
    /// its outcome.
    ///
    /// Must not be called from a thread the completion depends on.
    ///
    /// # Errors
    /// The error the cell failed with.
    pub fn wait(&self) -> Result<T, Error> {
        self.block(None)
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    ///
    /// # Errors
    /// The error the cell failed with, or [`Error::Timeout`] if it was still
    /// pending when the timeout elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, Error> {
        self.block(Some(timeout))
    }

    fn block(&self, timeout: Option<Duration>) -> Result<T, Error> {
        if let Some(outcome) = self.peek() {
            return outcome.clone();
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        // One latch per cell, registered by the first waiter, so waits that time
        // out leave nothing behind.
        let mut installed = false;
        let latch = self.inner.latch.get_or_init(|| {
            installed = true;
            Arc::default()
        });
        if installed {
            self.on_realized(Arc::clone(latch));
        }
        if !latch.wait(deadline) {
            return Err(Error::Timeout(timeout.unwrap_or_default()));
        }
        self.peek().expect("Deferred::block: [1]").clone()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_the_value_completed_elsewhere() {
        let cell = Deferred::<String>::new();
        let writer = cell.clone();
        let handle = thread::spawn(move || writer.success("done".to_owned()));
        assert_eq!(cell.wait().unwrap(), "done");
        assert!(handle.join().unwrap());
    }

    #[test]
    fn wait_timeout_gives_up_on_a_pending_cell() {
        let cell = Deferred::<u8>::new();
        let error = cell.wait_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(error, Error::Timeout(_)));
        assert!(!cell.is_realized());
        cell.error(Error::ContextFinished);
        assert!(matches!(cell.wait(), Err(Error::ContextFinished)));
    }

    #[test]
    fn repeated_timeouts_share_one_listener() {
        let cell = Deferred::<u8>::new();
        for _ in 0..100 {
            assert!(matches!(cell.wait_timeout(Duration::ZERO), Err(Error::Timeout(_))));
        }
        // Held by the cell and by its single registered listener.
        assert_eq!(Arc::strong_count(cell.inner.latch.get().unwrap()), 2);

        let waiter = {
            let cell = cell.clone();
            thread::spawn(move || cell.wait())
        };
        cell.success(4);
        assert_eq!(waiter.join().unwrap().unwrap(), 4);
        // Completion consumed the listener.
        assert_eq!(Arc::strong_count(cell.inner.latch.get().unwrap()), 1);
    }
}
