use super::Context;
use crate::{
    config::Config,
    deferred::{Async, Deferred},
    types::{IndexMap, Inputs},
};
use core::fmt;
use std::sync::Arc;

struct Inner<C: Config> {
    context: Arc<Context<C>>,
    entries: IndexMap<C::Key, C::Value>,
}

/// Immutable view of what a request produced: its inputs merged with every
/// value computed in its context.
///
/// The view is a snapshot taken from a frozen context. Inputs come first, then
/// computed entries in registration order; a computed value replaces the input
/// of the same key. Cells completing after the snapshot are not reflected.
pub struct ResultView<C: Config>(Arc<Inner<C>>);

impl<C: Config> Clone for ResultView<C> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

fn succeeded<V: Clone + Send + Sync + 'static>(cell: &Deferred<V>) -> Option<&V> {
    cell.peek()?.as_ref().ok()
}

fn realized<V: Clone + Send + Sync + 'static>(input: &Async<V>) -> Option<&V> {
    match input {
        Async::Value(value) => Some(value),
        Async::Deferred(cell) => succeeded(cell),
    }
}

impl<C: Config> ResultView<C> {
    /// Snapshots `context`, whose ledger must be frozen.
    pub(crate) fn new(context: Arc<Context<C>>) -> Self {
        let mut entries = IndexMap::default();
        for (key, input) in context.inputs() {
            if let Some(value) = realized(input) {
                entries.insert(key.clone(), value.clone());
            }
        }
        let interner = C::interner();
        let ledger = context.ledger().expect("ResultView::new: [1]");
        for (index, cell) in ledger {
            let (Some(value), Some(key)) = (succeeded(cell), interner.resolve_index(*index)) else {
                continue;
            };
            entries.insert(key.clone(), value.clone());
        }
        Self(Arc::new(Inner { context, entries }))
    }

    /// Value for `key`, computed or supplied as input.
    pub fn get(&self, key: &C::Key) -> Option<&C::Value> {
        self.0.entries.get(key)
    }

    /// Whether `key` has a value.
    pub fn contains_key(&self, key: &C::Key) -> bool {
        self.get(key).is_some()
    }

    /// Entries in snapshot order, inputs first.
    pub fn iter(&self) -> indexmap::map::Iter<'_, C::Key, C::Value> {
        self.to_map().iter()
    }

    /// Every entry as a plain map.
    pub fn to_map(&self) -> &IndexMap<C::Key, C::Value> {
        &self.0.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.to_map().len()
    }

    /// Whether the view has no entries.
    pub fn is_empty(&self) -> bool {
        self.to_map().is_empty()
    }

    /// The request's original inputs.
    pub fn inputs(&self) -> &Inputs<C> {
        self.0.context.inputs()
    }

    /// Context the view was taken from.
    pub fn context(&self) -> &Arc<Context<C>> {
        &self.0.context
    }
}

impl<'a, C: Config> IntoIterator for &'a ResultView<C> {
    type Item = (&'a C::Key, &'a C::Value);
    type IntoIter = indexmap::map::Iter<'a, C::Key, C::Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<C: Config> fmt::Debug for ResultView<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.to_map().keys()).finish()
    }
}
