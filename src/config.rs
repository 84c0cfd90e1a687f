use crate::{context::NodeProvider, interner::Interner};
use core::{fmt::Debug, hash::Hash};

/// Configuration entry-point for instantiating resolution contexts.
///
/// A concrete `Config` binds the symbolic key type, the value type every node
/// produces, and the provider that turns keys into node computations. It also
/// names the process-wide interner that assigns dense indices to keys, so
/// every request built from the same `Config` shares one key space.
///
/// ```
/// use crg::{config::Config, context::NodeTable, interner::Interner};
/// use std::sync::LazyLock;
///
/// struct Pricing;
///
/// static KEYS: LazyLock<Interner<&'static str>> = LazyLock::new(Interner::new);
///
/// impl Config for Pricing {
///     type Key = &'static str;
///     type Value = f64;
///     type Provider = NodeTable<Self>;
///
///     fn interner() -> &'static Interner<Self::Key> {
///         &KEYS
///     }
/// }
/// ```
pub trait Config: Sized + 'static {
    /// Symbolic name of a node or input.
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    /// Value produced by nodes and supplied by inputs.
    type Value: Clone + Send + Sync + 'static;
    /// Source of node computations.
    type Provider: NodeProvider<Self>;

    /// Long-lived interner shared by every context of this configuration.
    fn interner() -> &'static Interner<Self::Key>;
}
