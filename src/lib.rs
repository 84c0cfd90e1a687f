//! Lock-free engine resolving per-request graphs of asynchronous computations.
//!
//! A request names the outputs it wants and supplies some inputs. Every node
//! it transitively touches is computed at most once, errors and cancellation
//! propagate without blocking threads, and the results are merged into a
//! single read-only view. It:
//! - Builds on a single-assignment cell, `Deferred`, whose mutations are
//!   linearized by a short compare-and-swap critical section and whose
//!   completion notifies listeners exactly once.
//! - Memoizes cells per request in a sparse table addressed by dense key
//!   indices, so concurrent fetches of the same key race on one atomic install
//!   and the winner alone starts the node.
//! - Shares a process-wide interner that maps symbolic keys to those indices.
//! - Dispatches node computations inline, on a generic executor or on a rayon
//!   pool, carrying the caller's tracing span and dynamic bindings along.
//!
//! Key modules:
//! - `config`: binds key, value and provider types via the `Config` trait.
//! - `deferred`: the future cell, ownership tokens, bind/chain, revocation.
//! - `join`: fan-in of many cells into one continuation.
//! - `context`: per-request memo table, `yank`, and the `ResultView`.
//! - `pool`: dispatch strategies and the `Ambient` dynamic context.
//!
//! Quick start:
//! 1. Implement `Config` with your key and value types, a `NodeTable` (or
//!    your own `NodeProvider`) and a static `Interner`.
//! 2. Register nodes: each receives the context and a `Claim` on the cell to
//!    complete, and fetches whatever it depends on from the context.
//! 3. Create a `Context` per request with its inputs and a `Pool`, then
//!    `yank` the keys you need and wait on (or listen to) the returned cell.
//!
//! ```
//! use crg::{
//!     config::Config,
//!     context::{Context, NodeTable},
//!     deferred::Async,
//!     interner::Interner,
//!     pool::Pool,
//!     types::Inputs,
//! };
//! use std::sync::{Arc, LazyLock};
//!
//! struct Calc;
//!
//! static KEYS: LazyLock<Interner<&'static str>> = LazyLock::new(Interner::new);
//!
//! impl Config for Calc {
//!     type Key = &'static str;
//!     type Value = i64;
//!     type Provider = NodeTable<Self>;
//!
//!     fn interner() -> &'static Interner<&'static str> {
//!         &KEYS
//!     }
//! }
//!
//! let nodes = NodeTable::<Calc>::new().with("b", |context, cell| {
//!     cell.chain(context.fetch_key(&"a").map(|a| a + 1));
//! });
//! let mut inputs = Inputs::<Calc>::default();
//! inputs.insert("a", Async::Value(1));
//!
//! let context = Context::<Calc>::new(inputs, Arc::new(nodes), Pool::inline());
//! let view = context.yank(["a", "b"]).wait().unwrap();
//! assert_eq!(view.get(&"b"), Some(&2));
//! assert_eq!(view.len(), 2);
//! ```

/// Public interface to configure a resolution engine.
///
/// Exposes the `Config` trait which binds the key, value and provider types
/// and the interner for a concrete instantiation.
pub mod config;
/// Per-request resolution: the memo table, `yank`, freezing, cancellation and
/// the merged result view.
pub mod context;
/// The single-assignment asynchronous cell.
///
/// Covers completion with or without ownership tokens, listeners,
/// transformations (`bind`, `map`, `chain`), revocation links and blocking
/// waits.
pub mod deferred;
/// Error types.
pub mod error;
/// Process-wide key interner assigning dense indices.
pub mod interner;
/// Fan-in combinators.
pub mod join;
/// Lock-free append-only chunked list.
pub mod list;
/// Dispatch strategies for node computations and the ambient dynamic context
/// they carry across threads.
pub mod pool;
/// Global hook for errors that would otherwise be swallowed.
pub mod sink;
mod sync;
/// Sparse single-install table addressed by dense index.
pub mod table;
/// Core types used across the crate (dense indices, map aliases).
///
/// Provides `KeyIndex`, the Fx-hashed `IndexMap` alias and the per-request
/// `Inputs` mapping.
pub mod types;
