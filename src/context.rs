mod view;

pub use view::ResultView;

use crate::{
    config::Config,
    deferred::{Claim, Deferred},
    error::{ContextError, Error, YankError},
    join::{AwaitAll, Continuation},
    list::{self, AppendList},
    pool::Pool,
    sink::report_exception,
    table::SparseTable,
    types::{IndexMap, Inputs, KeyIndex},
};
use core::fmt;
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tracing::{debug, trace};

/// Computation of one node: must eventually complete the cell it is handed the
/// claim of, directly or by chaining it to another asynchronous value.
pub type Node<C> = Arc<dyn Fn(&Arc<Context<C>>, Claim<<C as Config>::Value>) + Send + Sync>;

/// Cells registered by a context, in registration order.
pub type Ledger<'a, C> = list::Iter<'a, (KeyIndex, Deferred<<C as Config>::Value>)>;

/// Source of node computations.
pub trait NodeProvider<C: Config>: Send + Sync + 'static {
    /// Computation for `key`, whose dense index is `index`.
    fn node(&self, key: &C::Key, index: KeyIndex) -> Option<Node<C>>;
}

/// Ready-made [`NodeProvider`] backed by a map from keys to nodes.
///
/// Lookups are memoized by dense index, so repeated requests resolve a node
/// without hashing its key.
pub struct NodeTable<C: Config> {
    nodes: IndexMap<C::Key, Node<C>>,
    resolved: SparseTable<Option<Node<C>>>,
}

impl<C: Config> Default for NodeTable<C> {
    fn default() -> Self {
        Self {
            nodes: IndexMap::default(),
            resolved: SparseTable::new(),
        }
    }
}

impl<C: Config> NodeTable<C> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `node` under `key`, replacing any previous one.
    pub fn insert<F>(&mut self, key: C::Key, node: F) -> &mut Self
    where
        F: Fn(&Arc<Context<C>>, Claim<C::Value>) + Send + Sync + 'static,
    {
        self.nodes.insert(key, Arc::new(node));
        self.resolved = SparseTable::new();
        self
    }

    /// Builder form of [`insert`](Self::insert).
    #[must_use]
    pub fn with<F>(mut self, key: C::Key, node: F) -> Self
    where
        F: Fn(&Arc<Context<C>>, Claim<C::Value>) + Send + Sync + 'static,
    {
        self.insert(key, node);
        self
    }

    /// Number of registered nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl<C: Config> NodeProvider<C> for NodeTable<C> {
    fn node(&self, key: &C::Key, index: KeyIndex) -> Option<Node<C>> {
        let (node, _) = self
            .resolved
            .get_or_insert_with(index.get(), || self.nodes.get(key).cloned());
        node.clone()
    }
}

impl<C: Config> fmt::Debug for NodeTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.nodes.keys()).finish()
    }
}

/// Per-request memo table resolving nodes at most once.
///
/// Every key a request touches gets exactly one cell, installed in a sparse
/// table under the key's dense index by whichever `fetch` gets there first.
/// Only that winner registers the cell in the ledger and starts the work that
/// completes it: chaining to the request's input for the key if there is one,
/// dispatching the provider's node on the pool otherwise.
///
/// A node's cell is claimed when its job starts, so from then on only the node
/// completes it. Until then it can be cancelled, and the job then skips the
/// node.
///
/// Freezing closes the ledger: cells fetched afterwards fail with
/// [`Error::ContextFinished`] without running anything.
pub struct Context<C: Config> {
    slots: SparseTable<Deferred<C::Value>>,
    inputs: Arc<Inputs<C>>,
    ledger: AppendList<(KeyIndex, Deferred<C::Value>)>,
    provider: Arc<C::Provider>,
    pool: Pool,
}

impl<C: Config> Context<C> {
    /// Creates a context for one request.
    pub fn new(inputs: impl Into<Arc<Inputs<C>>>, provider: Arc<C::Provider>, pool: Pool) -> Arc<Self> {
        Arc::new(Self {
            slots: SparseTable::new(),
            inputs: inputs.into(),
            ledger: AppendList::new(),
            provider,
            pool,
        })
    }

    /// Cell for `key`, whose dense index is `index`, starting its computation
    /// if this is the first fetch of the key.
    pub fn fetch(self: &Arc<Self>, index: KeyIndex, key: &C::Key) -> Deferred<C::Value> {
        let (cell, installed) = self.slots.get_or_insert_with(index.get(), Deferred::new);
        let cell = cell.clone();
        if !installed {
            return cell;
        }
        if self.ledger.push((index, cell.clone())).is_err() {
            trace!(?key, "fetch after freeze");
            cell.error(Error::ContextFinished);
            return cell;
        }
        if let Some(input) = self.inputs.get(key) {
            trace!(?key, "chaining input");
            cell.chain(input.clone());
            return cell;
        }
        let Some(node) = self.provider.node(key, index) else {
            cell.error(Error::UnknownNode {
                key: format!("{key:?}"),
            });
            return cell;
        };
        trace!(?key, index = index.get(), "dispatching node");
        let context = Arc::clone(self);
        let target = cell.clone();
        self.pool.dispatch(move || {
            let Some(claim) = Claim::acquire(&target) else {
                trace!(index = index.get(), "node cancelled before it started");
                return;
            };
            let owner = claim.clone();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| node(&context, claim))) {
                let error = Error::from_panic(payload);
                if !owner.error(error.clone()) {
                    report_exception(&error);
                }
            }
        });
        cell
    }

    /// [`fetch`](Self::fetch) by key alone, interning it first.
    pub fn fetch_key(self: &Arc<Self>, key: &C::Key) -> Deferred<C::Value> {
        self.fetch(C::interner().intern(key), key)
    }

    /// Resolves `keys` and completes the returned cell with a view of
    /// everything the request produced.
    ///
    /// On the first failure among `keys`, the context is cancelled and the
    /// cell fails with [`Error::Yank`], carrying the cause, the partial view
    /// and the requested keys.
    pub fn yank(self: &Arc<Self>, keys: impl IntoIterator<Item = C::Key>) -> Deferred<ResultView<C>> {
        let keys: Vec<C::Key> = keys.into_iter().collect();
        let cells: Vec<_> = keys.iter().map(|key| self.fetch_key(key)).collect();
        debug!(keys = keys.len(), "yanking");
        let result = Deferred::new();
        cells.as_slice().await_all(Yank {
            context: Arc::clone(self),
            keys,
            result: result.clone(),
        });
        result
    }

    /// Stops registering new cells and returns the ledger.
    ///
    /// # Errors
    /// If the context has already been frozen.
    pub fn freeze(&self) -> Result<Ledger<'_, C>, ContextError> {
        let ledger = self.ledger.freeze()?;
        debug!("context frozen");
        Ok(ledger)
    }

    /// Freezes the context if needed and fails every pending cell of the
    /// ledger that nobody owns with [`Error::Cancelled`]: nodes still queued
    /// and inputs still awaited. Running nodes keep their cells.
    pub fn cancel(&self, cause: Option<Error>) {
        let ledger = match self.ledger.freeze() {
            Ok(ledger) => ledger,
            Err(_) => self.ledger.iter().expect("Context::cancel: [1]"),
        };
        let cause = cause.map(Box::new);
        let cancelled = ledger
            .filter(|(_, cell)| {
                !cell.is_realized()
                    && cell.error(Error::Cancelled {
                        cause: cause.clone(),
                    })
            })
            .count();
        debug!(cancelled, "context cancelled");
    }

    /// Whether the context has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.ledger.is_frozen()
    }

    /// The request's inputs.
    pub fn inputs(&self) -> &Inputs<C> {
        &self.inputs
    }

    /// The pool nodes are dispatched on.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// The ledger, once frozen.
    pub(crate) fn ledger(&self) -> Option<Ledger<'_, C>> {
        self.ledger.iter()
    }
}

impl<C: Config> fmt::Debug for Context<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("frozen", &self.is_frozen())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Continuation of a `yank`.
struct Yank<C: Config> {
    context: Arc<Context<C>>,
    keys: Vec<C::Key>,
    result: Deferred<ResultView<C>>,
}

impl<C: Config> Continuation for Yank<C> {
    fn on_success(self) {
        if self.context.freeze().is_err() {
            debug!("context was already frozen");
        }
        self.result.success(ResultView::new(self.context));
    }

    fn on_error(self, error: &Error) {
        self.context.cancel(Some(error.clone()));
        let partial = ResultView::new(Arc::clone(&self.context));
        let enriched = YankError::new::<C>(error.clone(), partial, self.keys);
        debug!(error = %enriched, "yank failed");
        self.result.error(Error::Yank(Arc::new(enriched)));
    }
}
