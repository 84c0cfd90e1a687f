#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use crg::{
    config::Config,
    context::{Context, NodeTable},
    deferred::{Async, Claim, Deferred},
    error::{ContextError, Error},
    interner::Interner,
    pool::{Ambient, Job, Pool},
    types::Inputs,
};
use std::{
    sync::{
        Arc, Barrier, LazyLock, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

struct Calc;

static KEYS: LazyLock<Interner<&'static str>> = LazyLock::new(Interner::new);

impl Config for Calc {
    type Key = &'static str;
    type Value = i64;
    type Provider = NodeTable<Self>;

    fn interner() -> &'static Interner<&'static str> {
        &KEYS
    }
}

fn inputs(entries: &[(&'static str, i64)]) -> Inputs<Calc> {
    entries
        .iter()
        .map(|&(key, value)| (key, Async::Value(value)))
        .collect()
}

fn rayon_pool() -> Pool {
    Pool::rayon(Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap(),
    ))
}

/// `b = a + 1`, computed on another thread.
fn increment_node() -> NodeTable<Calc> {
    NodeTable::new().with("b", |context, cell| {
        let a = context.fetch_key(&"a");
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            cell.chain(a.map(|a| a + 1));
        });
    })
}

#[test]
fn yank_merges_inputs_and_computed_values() {
    let context = Context::<Calc>::new(inputs(&[("a", 1)]), Arc::new(increment_node()), rayon_pool());
    let view = context.yank(["a", "b"]).wait().unwrap();

    assert_eq!(view.get(&"a"), Some(&1));
    assert_eq!(view.get(&"b"), Some(&2));
    assert!(!view.contains_key(&"c"));
    let entries: Vec<_> = view.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(entries, [("a", 1), ("b", 2)]);
    assert!(context.is_frozen());
}

#[test]
fn the_view_map_is_stable_across_reads_and_clones() {
    let context = Context::<Calc>::new(inputs(&[("a", 1)]), Arc::new(increment_node()), Pool::inline());
    let view = context.yank(["b"]).wait().unwrap();
    let first: *const _ = view.to_map();
    let second: *const _ = view.to_map();
    assert_eq!(first, second);
    assert_eq!(view.len(), 2);
    assert_eq!(view.clone().to_map(), view.to_map());
}

/// Parking spot for a node's claim, completed later by the test.
type Parked = Arc<Mutex<Option<Claim<i64>>>>;

#[test]
fn failing_node_surfaces_an_enriched_error() {
    let parked = Parked::default();
    let slot = Arc::clone(&parked);
    let nodes = NodeTable::<Calc>::new()
        .with("b", |_, cell| {
            cell.error(anyhow::anyhow!("b exploded").into());
        })
        .with("slow", move |_, cell| *slot.lock().unwrap() = Some(cell));
    let context = Context::<Calc>::new(inputs(&[("a", 1)]), Arc::new(nodes), Pool::inline());
    let slow = context.fetch_key(&"slow");

    let error = context.yank(["a", "b", "slow"]).wait().unwrap_err();
    let yank = error.as_yank().expect("yank enrichment");
    assert_eq!(yank.cause().to_string(), "b exploded");
    assert_eq!(error.root().to_string(), "b exploded");
    assert_eq!(yank.requested::<Calc>(), Some(&["a", "b", "slow"][..]));
    assert_eq!(yank.inputs::<Calc>().unwrap().len(), 1);

    let partial = yank.partial::<Calc>().unwrap();
    assert_eq!(partial.get(&"a"), Some(&1));
    assert_eq!(partial.get(&"b"), None);
    assert_eq!(partial.len(), 1);

    // The running node kept its cell through the cancellation.
    assert!(!slow.is_realized());
    let claim = parked.lock().unwrap().take().unwrap();
    assert!(claim.success(5));
    assert_eq!(slow.wait().unwrap(), 5);
    assert_eq!(partial.get(&"slow"), None);
}

#[test]
fn the_view_ignores_cells_completed_after_the_freeze() {
    let parked = Parked::default();
    let slot = Arc::clone(&parked);
    let nodes = NodeTable::<Calc>::new()
        .with("x", move |_, cell| *slot.lock().unwrap() = Some(cell))
        .with("a", |context, cell| {
            // Fetched, never awaited.
            let _ = context.fetch_key(&"x");
            cell.success(1);
        });
    let context = Context::<Calc>::new(Inputs::<Calc>::default(), Arc::new(nodes), Pool::inline());

    let view = context.yank(["a"]).wait().unwrap();
    assert_eq!(view.get(&"x"), None);
    let claim = parked.lock().unwrap().take().unwrap();
    assert!(claim.success(99));
    assert_eq!(context.fetch_key(&"x").wait().unwrap(), 99);

    assert_eq!(view.get(&"x"), None);
    assert!(!view.contains_key(&"x"));
    assert_eq!(view.len(), 1);
    assert_eq!(view.to_map().keys().collect::<Vec<_>>(), [&"a"]);
}

#[test]
fn concurrent_fetches_run_the_node_once() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let nodes = NodeTable::<Calc>::new().with("shared", move |_, cell| {
        counter.fetch_add(1, Ordering::SeqCst);
        cell.success(42);
    });
    let context = Context::<Calc>::new(Inputs::<Calc>::default(), Arc::new(nodes), rayon_pool());

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let context = Arc::clone(&context);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                context.fetch_key(&"shared")
            })
        })
        .collect();
    let cells: Vec<Deferred<i64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(cells.windows(2).all(|pair| pair[0].ptr_eq(&pair[1])));
    assert_eq!(cells[0].wait().unwrap(), 42);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn freezing_twice_is_an_error_and_closes_registration() {
    let nodes = NodeTable::<Calc>::new().with("late", |_, cell| {
        cell.success(1);
    });
    let context = Context::<Calc>::new(inputs(&[("a", 1)]), Arc::new(nodes), Pool::inline());
    assert_eq!(context.fetch_key(&"a").wait().unwrap(), 1);

    assert_eq!(context.freeze().unwrap().count(), 1);
    assert!(matches!(context.freeze(), Err(ContextError::AlreadyFrozen)));

    let late = context.fetch_key(&"late");
    assert!(matches!(late.peek(), Some(Err(Error::ContextFinished))));
    // Cells registered before the freeze are still served.
    assert!(context.fetch_key(&"a").ptr_eq(&context.fetch_key(&"a")));
}

#[test]
fn cancel_fails_queued_nodes_and_spares_running_ones() {
    let queue: Arc<Mutex<Vec<Job>>> = Arc::default();
    let submit = Arc::clone(&queue);
    let pool = Pool::executor(Arc::new(move |job: Job| submit.lock().unwrap().push(job)));

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let parked = Parked::default();
    let slot = Arc::clone(&parked);
    let nodes = NodeTable::<Calc>::new()
        .with("queued", move |_, cell| {
            counter.fetch_add(1, Ordering::SeqCst);
            cell.success(1);
        })
        .with("running", move |_, cell| *slot.lock().unwrap() = Some(cell));
    let context = Context::<Calc>::new(Inputs::<Calc>::default(), Arc::new(nodes), pool);

    let running = context.fetch_key(&"running");
    let queued = context.fetch_key(&"queued");
    let start = queue.lock().unwrap().remove(0);
    start();
    assert!(running.is_claimed());

    context.cancel(Some(Error::msg("shutting down")));
    assert!(context.is_frozen());
    match queued.peek().unwrap() {
        Err(Error::Cancelled { cause: Some(cause) }) => assert_eq!(cause.to_string(), "shutting down"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!running.is_realized());

    // The cancelled node's job finds its cell taken and skips the node.
    let jobs = std::mem::take(&mut *queue.lock().unwrap());
    for job in jobs {
        job();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let claim = parked.lock().unwrap().take().unwrap();
    assert!(claim.success(7));
    assert_eq!(running.wait().unwrap(), 7);
}

#[test]
fn missing_nodes_and_panics_fail_their_cells() {
    let nodes = NodeTable::<Calc>::new().with("broken", |_, _| panic!("node bug"));
    let context = Context::<Calc>::new(Inputs::<Calc>::default(), Arc::new(nodes), Pool::inline());

    let unknown = context.fetch_key(&"nowhere").wait().unwrap_err();
    assert!(matches!(unknown, Error::UnknownNode { ref key } if key == "\"nowhere\""));

    match context.fetch_key(&"broken").wait() {
        Err(Error::NonError(payload)) => assert_eq!(payload.rendered(), "node bug"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn asynchronous_inputs_are_chained() {
    let pending = Deferred::new();
    let mut inputs = Inputs::<Calc>::default();
    inputs.insert("a", pending.clone().into());
    let context = Context::<Calc>::new(inputs, Arc::new(increment_node()), Pool::inline());

    let result = context.yank(["b"]);
    assert!(!result.is_realized());
    pending.success(10);
    let view = result.wait().unwrap();
    assert_eq!(view.get(&"a"), Some(&10));
    assert_eq!(view.get(&"b"), Some(&11));
}

#[derive(Debug, PartialEq)]
struct Tenant(&'static str);

#[test]
fn nodes_see_the_ambient_captured_by_the_pool() {
    let nodes = NodeTable::<Calc>::new().with("tenant", |context, cell| {
        let tenant = Ambient::get::<Tenant>();
        assert_eq!(context.pool().ambient().lookup::<Tenant>(), tenant);
        cell.success(i64::from(tenant.as_deref() == Some(&Tenant("acme"))));
    });
    let pool = rayon_pool().with_ambient(Ambient::current().with(Tenant("acme")));
    let context = Context::<Calc>::new(Inputs::<Calc>::default(), Arc::new(nodes), pool);

    let view = context.yank(["tenant"]).wait().unwrap();
    assert_eq!(view.get(&"tenant"), Some(&1));
}
