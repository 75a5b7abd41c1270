//! Reactive Primitives
//!
//! This module implements the core reactive system: values, derived values,
//! transactions and autoruns. Everything hangs off a [`Runtime`], which owns
//! one isolated dependency graph.
//!
//! # Concepts
//!
//! ## Values
//!
//! A [`Value`] is a container for mutable state. Reading it through a
//! tracking [`Reader`] registers the reading computation as a dependent.
//! Writing it invalidates every observed dependent.
//!
//! ## Derived Values
//!
//! A [`Derived`] value caches the result of a pure function of other
//! observables. It is lazy: nothing runs until it is read, and a stale node
//! recomputes only if one of its dependencies really changed.
//!
//! ## Autoruns
//!
//! An [`Autorun`] is a side-effecting computation that runs once on
//! creation and again after every transaction that changed something it
//! read. Each autorun runs at most once per commit, after all the derived
//! values it depends on have settled, so it never sees a half-applied
//! update.
//!
//! ## Transactions
//!
//! A [`Transaction`] groups writes. Reactions run when the outermost
//! transaction ends; a bare write is its own transaction.
//!
//! # Implementation Notes
//!
//! Dependency tracking is explicit: computations receive a [`Reader`] and
//! read observables through it. The reader records each dependency together
//! with the version it saw, which is what lets a stale node prove that its
//! inputs did not move and keep its cache.

mod autorun;
mod context;
mod derived;
mod promise;
mod runtime;
mod transaction;
mod trigger;
mod value;

pub use autorun::{Autorun, AutorunGuard};
pub use context::Reader;
pub use derived::{Derived, KeepObserved};
pub use promise::{ObservablePromise, PromiseState};
pub use runtime::{ReactionError, Runtime};
pub use transaction::Transaction;
pub use trigger::Trigger;
pub use value::{EqualsFn, Value};

pub(crate) use runtime::Reactive;

use crate::error::Result;
use crate::graph::NodeId;

/// Anything a computation can read and depend on.
pub trait Observable {
    /// The type produced by a read.
    type Output: Clone;

    /// The node backing this observable.
    fn node_id(&self) -> NodeId;

    /// Read the current value, recording a dependency if `reader` tracks.
    fn read(&self, reader: &Reader<'_>) -> Result<Self::Output>;
}
