#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use crg::{
    deferred::Deferred,
    error::Error,
    pool::{Ambient, Job, Pool},
    sink::{reset_exception_sink, set_exception_sink},
};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

const PATIENCE: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
struct Request(u32);

#[test]
fn inline_runs_before_returning_with_the_ambient() {
    let pool = Pool::inline().with_ambient(Ambient::default().with(Request(1)));
    let seen = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&seen);
    pool.dispatch(move || *slot.lock().unwrap() = Ambient::get::<Request>());
    assert_eq!(seen.lock().unwrap().as_deref(), Some(&Request(1)));
    // Nothing leaks into the dispatching thread.
    assert!(Ambient::get::<Request>().is_none());
}

#[test]
fn executor_skips_the_second_hop() {
    let submitted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&submitted);
    let executor = move |job: Job| {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::spawn(job);
    };
    let pool = Pool::executor(Arc::new(executor));

    let done = Deferred::new();
    let (outer_pool, result) = (pool.clone(), done.clone());
    pool.dispatch(move || {
        let outer = thread::current().id();
        let inner_result = result.clone();
        outer_pool.dispatch(move || {
            inner_result.success(thread::current().id() == outer);
        });
    });

    assert!(done.wait_timeout(PATIENCE).unwrap());
    assert_eq!(submitted.load(Ordering::SeqCst), 1);
}

#[test]
fn rayon_jobs_run_on_the_pool_and_carry_the_ambient() {
    let threads = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap());
    let pool = Pool::rayon(Arc::clone(&threads)).with_ambient(Ambient::default().with(Request(7)));

    let done = Deferred::new();
    let (nested_pool, result) = (pool.clone(), done.clone());
    pool.dispatch(move || {
        assert!(rayon::current_thread_index().is_some());
        let request = Ambient::get::<Request>();
        nested_pool.dispatch(move || {
            let nested = Ambient::get::<Request>();
            result.success(rayon::current_thread_index().is_some() && request == nested && nested.is_some());
        });
    });

    assert!(done.wait_timeout(PATIENCE).unwrap());
}

#[test]
fn panicking_jobs_reach_the_exception_sink() {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    set_exception_sink(move |error: &Error| sink.lock().unwrap().push(error.to_string()));

    Pool::inline().dispatch(|| panic!("job exploded"));

    let threads = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap());
    let pool = Pool::rayon(threads);
    pool.dispatch(|| panic!("pooled job exploded"));
    // Jobs on a single worker run in order, so this one runs after the panic.
    let done = Deferred::new();
    let signal = done.clone();
    pool.dispatch(move || {
        signal.success(());
    });
    done.wait_timeout(PATIENCE).unwrap();

    reset_exception_sink();
    assert_eq!(
        *reports.lock().unwrap(),
        [
            "non-error value raised: job exploded",
            "non-error value raised: pooled job exploded"
        ]
    );
}
