#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use crg::{
    deferred::Deferred,
    error::Error,
    join::{AwaitAll, Continuation, await_all, continuation},
};
use std::{
    sync::{
        Arc, Barrier, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

/// Records how the fan-in settled.
#[derive(Clone, Default)]
struct Outcome(Arc<Mutex<Vec<Result<(), String>>>>);

impl Outcome {
    fn taken(&self) -> Vec<Result<(), String>> {
        self.0.lock().unwrap().clone()
    }
}

impl Continuation for Outcome {
    fn on_success(self) {
        self.0.lock().unwrap().push(Ok(()));
    }

    fn on_error(self, error: &Error) {
        self.0.lock().unwrap().push(Err(error.to_string()));
    }
}

#[test]
fn success_waits_for_every_cell() {
    let (a, b, c) = (Deferred::<u8>::new(), Deferred::<String>::new(), Deferred::<()>::new());
    let outcome = Outcome::default();
    await_all((&a, &b, &c), outcome.clone());

    a.success(1);
    c.success(());
    assert!(outcome.taken().is_empty());
    b.success("last".to_owned());
    assert_eq!(outcome.taken(), [Ok(())]);
}

#[test]
fn first_error_short_circuits() {
    let cells: Vec<Deferred<u32>> = (0..5).map(|_| Deferred::new()).collect();
    let outcome = Outcome::default();
    cells.await_all(outcome.clone());

    cells[0].success(0);
    cells[3].error(Error::msg("third"));
    assert_eq!(outcome.taken(), [Err("third".to_owned())]);

    // Later completions change nothing.
    cells[1].error(Error::msg("late"));
    for cell in &cells {
        cell.success(9);
    }
    assert_eq!(outcome.taken(), [Err("third".to_owned())]);
}

#[test]
fn realized_cells_settle_inline() {
    let done = Deferred::succeeded(1_u8);
    let failed = Deferred::<u8>::failed(Error::msg("already"));

    let outcome = Outcome::default();
    await_all((&done,), outcome.clone());
    assert_eq!(outcome.taken(), [Ok(())]);

    let outcome = Outcome::default();
    await_all((&done, &failed), outcome.clone());
    assert_eq!(outcome.taken(), [Err("already".to_owned())]);

    let outcome = Outcome::default();
    await_all(&Vec::<Deferred<u8>>::new(), outcome.clone());
    assert_eq!(outcome.taken(), [Ok(())]);
}

#[test]
fn closures_make_continuations() {
    let a = Deferred::<i32>::new();
    let sum = Deferred::new();
    let (left, result) = (a.clone(), sum.clone());
    await_all(
        (&a,),
        continuation(
            move || {
                result.success(left.peek().unwrap().as_ref().unwrap() * 2);
            },
            |_| {},
        ),
    );
    a.success(21);
    assert_eq!(sum.wait().unwrap(), 42);
}

#[test]
fn widest_tuple_is_supported() {
    let cells: Vec<Deferred<u8>> = (0..16).map(|_| Deferred::new()).collect();
    let c = &cells;
    let outcome = Outcome::default();
    (
        &c[0], &c[1], &c[2], &c[3], &c[4], &c[5], &c[6], &c[7], &c[8], &c[9], &c[10], &c[11], &c[12],
        &c[13], &c[14], &c[15],
    )
        .await_all(outcome.clone());
    for cell in c.iter().rev() {
        assert!(outcome.taken().is_empty());
        cell.success(0);
    }
    assert_eq!(outcome.taken(), [Ok(())]);
}

#[test]
fn concurrent_completions_settle_exactly_once() {
    for round in 0..50 {
        let cells: Vec<Deferred<usize>> = (0..16).map(|_| Deferred::new()).collect();
        let settled = Arc::new(AtomicUsize::new(0));
        let (on_success, on_error) = (Arc::clone(&settled), Arc::clone(&settled));
        await_all(
            &cells,
            continuation(
                move || {
                    on_success.fetch_add(1, Ordering::SeqCst);
                },
                move |_| {
                    on_error.fetch_add(1, Ordering::SeqCst);
                },
            ),
        );

        let barrier = Arc::new(Barrier::new(cells.len()));
        let handles: Vec<_> = cells
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, cell)| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    if i == round % 16 && round % 2 == 0 {
                        cell.error(Error::msg("unlucky"));
                    } else {
                        cell.success(i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(settled.load(Ordering::SeqCst), 1, "round {round}");
    }
}
