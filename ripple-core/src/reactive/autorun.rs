//! Autorun Reactions
//!
//! An autorun is a side-effecting computation that re-runs whenever its
//! dependencies change.
//!
//! # How Autoruns Work
//!
//! 1. When created, the body runs immediately to establish its initial
//!    dependencies.
//!
//! 2. When any dependency changes, the reaction is queued for the commit of
//!    the enclosing transaction.
//!
//! 3. At commit, the reaction first checks whether a dependency really
//!    moved (a derived value may have recomputed to the same result). Only
//!    then does the body run again, tracking a fresh dependency set.
//!
//! # Lifetime
//!
//! The runtime owns a reaction until it is disposed. Dropping an [`Autorun`]
//! handle does not stop it; call [`Autorun::dispose`] or hold an
//! [`AutorunGuard`] instead.
//!
//! # Failures
//!
//! An error returned by the body, or a panic when
//! [`catch_reaction_panics`](crate::RuntimeConfig::catch_reaction_panics) is
//! set, is logged and reported to the runtime's reaction error handler. It
//! never reaches the code that made the triggering write.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::context::Reader;
use super::runtime::{Reactive, Runtime};
use crate::error::{Error, Result};
use crate::graph::{Node, NodeId, ReactiveRef};

type RunFn = Box<dyn Fn(&Reader<'_>) -> Result<()> + Send + Sync>;

struct ReactionInner {
    id: NodeId,
    run: RunFn,
    runs: Arc<AtomicUsize>,
}

impl ReactionInner {
    fn call(&self, rt: &Runtime, reader: &Reader<'_>) -> Result<()> {
        if !rt.config().catch_reaction_panics {
            return (self.run)(reader);
        }
        match catch_unwind(AssertUnwindSafe(|| (self.run)(reader))) {
            Ok(result) => result,
            Err(payload) => Err(Error::ReactionPanicked {
                node: self.id,
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl Reactive for ReactionInner {
    fn evaluate(&self, rt: &Runtime) -> Result<()> {
        rt.run_evaluation(self.id, |reader| {
            self.runs.fetch_add(1, Ordering::Relaxed);
            // A reaction has no output, so its version never moves.
            self.call(rt, reader).map(|()| false)
        })
        .map(drop)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Handle to a running reaction.
///
/// # Example
///
/// ```rust,ignore
/// let rt = Runtime::new();
/// let count = rt.value(0);
///
/// let logger = {
///     let count = count.clone();
///     rt.autorun(move |r| {
///         println!("Count is: {}", count.read(r)?);
///         Ok(())
///     })
/// };
///
/// count.set(5)?;  // Prints: "Count is: 5"
/// logger.dispose();
/// ```
#[derive(Clone)]
#[must_use = "an autorun keeps running until disposed; keep the handle to stop it"]
pub struct Autorun {
    rt: Runtime,
    id: NodeId,
    runs: Arc<AtomicUsize>,
}

impl Runtime {
    /// Start a reaction. The body runs once before this returns and again
    /// after every commit that changed something it read.
    pub fn autorun<F>(&self, run: F) -> Autorun
    where
        F: Fn(&Reader<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let node = Node::reaction();
        let id = node.id();
        let runs = Arc::new(AtomicUsize::new(0));
        let inner: Arc<dyn Reactive> = Arc::new(ReactionInner {
            id,
            run: Box::new(run),
            runs: Arc::clone(&runs),
        });
        self.register(node.with_reactive(ReactiveRef::Strong(Arc::clone(&inner))));
        debug!(node = %id, "autorun started");

        // Writes made by the first run commit when this transaction ends.
        let tx = self.begin();
        if let Err(err) = inner.evaluate(self) {
            self.report_reaction_error(id, err);
        }
        drop(tx);

        Autorun {
            rt: self.clone(),
            id,
            runs,
        }
    }
}

impl Autorun {
    /// The reaction's node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Give the reaction a debug name, used in logs and error reports.
    pub fn named(self, name: &str) -> Self {
        self.rt.set_name(self.id, name);
        self
    }

    /// Stop the reaction and unsubscribe it from everything it read.
    /// Idempotent.
    pub fn dispose(&self) {
        self.rt.dispose(self.id);
    }

    /// Whether the reaction has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.rt.is_disposed(self.id)
    }

    /// How many times the body has run.
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::Relaxed)
    }

    /// Convert into a guard that disposes the reaction when dropped.
    pub fn into_guard(self) -> AutorunGuard {
        AutorunGuard { autorun: self }
    }
}

impl std::fmt::Debug for Autorun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Autorun")
            .field("id", &self.id)
            .field("runs", &self.run_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Disposes its reaction on drop.
#[must_use = "the reaction is disposed as soon as the guard is dropped"]
#[derive(Debug)]
pub struct AutorunGuard {
    autorun: Autorun,
}

impl AutorunGuard {
    /// The guarded reaction.
    pub fn autorun(&self) -> &Autorun {
        &self.autorun
    }
}

impl Drop for AutorunGuard {
    fn drop(&mut self) {
        self.autorun.dispose();
    }
}
