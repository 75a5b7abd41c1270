//! Async Bridge
//!
//! Two directions between the graph and tokio:
//!
//! - [`ObservablePromise`] turns a future into an observable whose state
//!   moves from pending to resolved or rejected exactly once.
//! - [`Runtime::wait_for`] turns an observable into a future that completes
//!   the first time a predicate holds.
//!
//! Both are thin layers over values and autoruns; the graph itself stays
//! synchronous.

use std::fmt::Display;
use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use super::context::Reader;
use super::runtime::Runtime;
use super::value::Value;
use super::Observable;
use crate::error::{Error, Result};
use crate::graph::NodeId;

/// Settlement state of an [`ObservablePromise`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromiseState<T> {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Resolved(T),
    /// Settled with an error message.
    Rejected(String),
}

impl<T> PromiseState<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, PromiseState::Pending)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, PromiseState::Resolved(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, PromiseState::Rejected(_))
    }

    /// The resolved value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            PromiseState::Resolved(value) => Some(value),
            _ => None,
        }
    }
}

/// An observable that settles once.
#[derive(Clone)]
pub struct ObservablePromise<T> {
    state: Value<PromiseState<T>>,
}

impl Runtime {
    /// Create a pending promise, settled later with
    /// [`resolve`](ObservablePromise::resolve) or
    /// [`reject`](ObservablePromise::reject).
    pub fn promise<T>(&self) -> ObservablePromise<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        // Any transition out of pending is a change.
        let state = self.value_with_equals(PromiseState::Pending, |a, b| {
            a.is_pending() && b.is_pending()
        });
        ObservablePromise { state }
    }

    /// Drive `future` on the current tokio runtime and settle the returned
    /// promise with its output.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_promise<T, E, F>(&self, future: F) -> ObservablePromise<T>
    where
        T: Clone + Send + Sync + 'static,
        E: Display + Send + 'static,
        F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        let promise = self.promise();
        let settle = promise.clone();
        tokio::spawn(async move {
            let outcome = match future.await {
                Ok(value) => settle.resolve(value),
                Err(err) => settle.reject(err.to_string()),
            };
            if let Err(err) = outcome {
                trace!(node = %settle.id(), error = %err, "promise outlived its node");
            }
        });
        promise
    }

    /// Complete the first time `predicate` holds for `observable`.
    ///
    /// The check runs immediately and then after every commit that changes
    /// the observable. If reading the observable fails, the future resolves
    /// to that error. Dropping the future stops watching.
    pub fn wait_for<O, P>(
        &self,
        observable: &O,
        predicate: P,
    ) -> impl Future<Output = Result<O::Output>> + Send + 'static
    where
        O: Observable + Clone + Send + Sync + 'static,
        O::Output: Send + 'static,
        P: Fn(&O::Output) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<O::Output>>();
        let sender = Mutex::new(Some(tx));
        let watched = observable.clone();
        let watcher = self
            .autorun(move |r| {
                let outcome = match watched.read(r) {
                    Ok(value) if predicate(&value) => Ok(value),
                    Ok(_) => return Ok(()),
                    Err(err) => Err(err),
                };
                if let Some(tx) = sender.lock().take() {
                    let _ = tx.send(outcome);
                }
                Ok(())
            })
            .named("wait_for");
        let watcher_id = watcher.id();
        let guard = watcher.into_guard();

        async move {
            let _guard = guard;
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Disposed { node: watcher_id }),
            }
        }
    }
}

impl<T> ObservablePromise<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The node id of the underlying state.
    pub fn id(&self) -> NodeId {
        self.state.id()
    }

    /// Give the node a debug name.
    pub fn named(self, name: &str) -> Self {
        Self {
            state: self.state.named(name),
        }
    }

    /// Read the state, recording a dependency if `reader` tracks.
    pub fn read(&self, reader: &Reader<'_>) -> Result<PromiseState<T>> {
        self.state.read(reader)
    }

    /// The current state, untracked.
    pub fn get(&self) -> PromiseState<T> {
        self.state.get()
    }

    /// Settle with `value`. Ignored if already settled.
    pub fn resolve(&self, value: T) -> Result<()> {
        self.settle(PromiseState::Resolved(value))
    }

    /// Settle with an error. Ignored if already settled.
    pub fn reject(&self, message: impl Into<String>) -> Result<()> {
        self.settle(PromiseState::Rejected(message.into()))
    }

    fn settle(&self, next: PromiseState<T>) -> Result<()> {
        let rt = self.state.runtime();
        let _turn = rt.turn();
        if !self.state.latest().is_pending() {
            return Ok(());
        }
        self.state.set(next)
    }

    /// Wait until the promise settles.
    pub fn settled(&self) -> impl Future<Output = Result<T>> + Send + 'static {
        let wait = self
            .state
            .runtime()
            .wait_for(&self.state, |s| !s.is_pending());
        async move {
            match wait.await? {
                PromiseState::Resolved(value) => Ok(value),
                PromiseState::Rejected(message) => Err(Error::msg(message)),
                PromiseState::Pending => Err(Error::msg("promise still pending")),
            }
        }
    }
}

impl<T> Observable for ObservablePromise<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = PromiseState<T>;

    fn node_id(&self) -> NodeId {
        self.id()
    }

    fn read(&self, reader: &Reader<'_>) -> Result<PromiseState<T>> {
        ObservablePromise::read(self, reader)
    }
}

impl<T> std::fmt::Debug for ObservablePromise<T>
where
    T: Clone + Send + Sync + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservablePromise")
            .field("id", &self.id())
            .field("state", &self.get())
            .finish()
    }
}
