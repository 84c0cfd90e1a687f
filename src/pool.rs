mod ambient;

pub use ambient::Ambient;

use crate::{error::Error, sink::report_exception};
use core::{cell::Cell, fmt};
use rayon::ThreadPool;
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tracing::trace;

/// Unit of work handed to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs, typically on other threads.
pub trait Executor: Send + Sync + 'static {
    /// Takes ownership of `job` and runs it eventually.
    fn execute(&self, job: Job);
}

impl<F: Fn(Job) + Send + Sync + 'static> Executor for F {
    fn execute(&self, job: Job) {
        self(job);
    }
}

thread_local! {
    /// Address of the executor whose job is running on this thread, `0` if none.
    static INSIDE: Cell<usize> = const { Cell::new(0) };
}

/// Marks the calling thread as running a job of the executor at `address`.
struct Inside(usize);

impl Inside {
    fn enter(address: usize) -> Self {
        Self(INSIDE.replace(address))
    }
}

impl Drop for Inside {
    fn drop(&mut self) {
        INSIDE.set(self.0);
    }
}

#[derive(Clone)]
enum Strategy {
    Inline,
    Executor(Arc<dyn Executor>),
    Rayon(Arc<ThreadPool>),
}

/// Dispatch strategy for node computations, chosen once per context.
///
/// Every strategy re-establishes the [`Ambient`] captured when the pool was
/// created around each job, and routes panics escaping a job to the
/// exception sink.
#[derive(Clone)]
pub struct Pool {
    strategy: Strategy,
    ambient: Ambient,
}

impl Default for Pool {
    fn default() -> Self {
        Self::inline()
    }
}

impl Pool {
    fn with_strategy(strategy: Strategy) -> Self {
        Self {
            strategy,
            ambient: Ambient::current(),
        }
    }

    /// Runs jobs on the dispatching thread, before `dispatch` returns.
    #[must_use]
    pub fn inline() -> Self {
        Self::with_strategy(Strategy::Inline)
    }

    /// Submits jobs to `executor`. Jobs dispatched from a thread already running
    /// one of its jobs run inline instead of paying a second hop.
    #[must_use]
    pub fn executor(executor: Arc<dyn Executor>) -> Self {
        Self::with_strategy(Strategy::Executor(executor))
    }

    /// Spawns jobs on a rayon pool, pushing onto the local deque when already
    /// running inside it.
    #[must_use]
    pub fn rayon(pool: Arc<ThreadPool>) -> Self {
        Self::with_strategy(Strategy::Rayon(pool))
    }

    /// This pool with `ambient` in place of the snapshot captured at creation.
    #[must_use]
    pub fn with_ambient(mut self, ambient: Ambient) -> Self {
        self.ambient = ambient;
        self
    }

    /// Dynamic context jobs run in.
    #[must_use]
    pub fn ambient(&self) -> &Ambient {
        &self.ambient
    }

    /// Runs `job` according to the strategy.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        let ambient = self.ambient.clone();
        let job = move || ambient.scope(|| run_reporting(job));
        match &self.strategy {
            Strategy::Inline => job(),
            Strategy::Executor(executor) => {
                let address = Arc::as_ptr(executor).cast::<()>().addr();
                if INSIDE.get() == address {
                    trace!("executor fast path");
                    job();
                } else {
                    trace!("submitting job to executor");
                    executor.execute(Box::new(move || {
                        let _inside = Inside::enter(address);
                        job();
                    }));
                }
            }
            Strategy::Rayon(pool) => {
                if pool.current_thread_index().is_some() {
                    trace!("forking onto current rayon worker");
                    rayon::spawn(job);
                } else {
                    trace!("submitting job to rayon pool");
                    pool.spawn(job);
                }
            }
        }
    }
}

fn run_reporting(job: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        report_exception(&Error::from_panic(payload));
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let strategy = match &self.strategy {
            Strategy::Inline => "inline",
            Strategy::Executor(_) => "executor",
            Strategy::Rayon(_) => "rayon",
        };
        f.debug_struct("Pool")
            .field("strategy", &strategy)
            .field("ambient", &self.ambient)
            .finish()
    }
}
