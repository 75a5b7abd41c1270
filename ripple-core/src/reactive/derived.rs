//! Derived Values
//!
//! A `Derived` is a cached pure computation over other observables. It
//! re-evaluates only when one of its dependencies changes.
//!
//! # How Derived Values Work
//!
//! 1. Creating a derived value runs nothing. The first read evaluates it.
//!
//! 2. While something observes it (a reaction, another observed derived
//!    value or a [`KeepObserved`] guard), it is subscribed to its
//!    dependencies and is marked stale when one of them changes.
//!
//! 3. On the next read a stale node pulls its dependencies first. If none of
//!    their versions moved, the cached value is returned as is.
//!
//! 4. If the recomputed value is equal to the cached one, the node keeps its
//!    version, so its own consumers are not re-run.
//!
//! # Unobserved Reads
//!
//! A derived value nobody observes is not subscribed to anything. It keeps
//! its cache and the versions it read, and validates them on every read, so
//! repeated reads without intervening writes still run the computation once.

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::context::Reader;
use super::runtime::{Reactive, Runtime};
use super::value::EqualsFn;
use super::Observable;
use crate::error::{Error, Result};
use crate::graph::{Node, NodeId, NodeState, ReactiveRef};

type ComputeFn<T> = Box<dyn Fn(&Reader<'_>) -> Result<T> + Send + Sync>;

struct DerivedInner<T> {
    id: NodeId,
    rt: Runtime,
    compute: ComputeFn<T>,
    equals: EqualsFn<T>,

    /// The cached value (None until the first successful evaluation).
    cache: RwLock<Option<T>>,

    /// Number of times the compute function has been entered.
    runs: AtomicUsize,
}

impl<T> Reactive for DerivedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn evaluate(&self, rt: &Runtime) -> Result<()> {
        rt.run_evaluation(self.id, |reader| {
            self.runs.fetch_add(1, Ordering::Relaxed);
            let next = (self.compute)(reader)?;
            let mut cache = self.cache.write();
            let changed = match cache.as_ref() {
                Some(current) => !(self.equals)(current, &next),
                None => true,
            };
            if changed {
                *cache = Some(next);
            }
            Ok(changed)
        })
        .map(drop)
    }
}

impl<T> Drop for DerivedInner<T> {
    fn drop(&mut self) {
        self.rt.remove_node(self.id);
    }
}

/// A cached value derived from other observables.
///
/// # Example
///
/// ```rust,ignore
/// let rt = Runtime::new();
/// let count = rt.value(2);
/// let doubled = {
///     let count = count.clone();
///     rt.derive(move |r| Ok(count.read(r)? * 2))
/// };
///
/// assert_eq!(doubled.get()?, 4);
/// ```
pub struct Derived<T> {
    inner: Arc<DerivedInner<T>>,
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Runtime {
    /// Create a derived value that compares results with `==`.
    pub fn derive<T, F>(&self, compute: F) -> Derived<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&Reader<'_>) -> Result<T> + Send + Sync + 'static,
    {
        self.derive_with_equals(compute, |a, b| a == b)
    }

    /// Create a derived value with a custom equality function. A result
    /// equal to the cached one does not count as a change.
    pub fn derive_with_equals<T, F, E>(&self, compute: F, equals: E) -> Derived<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&Reader<'_>) -> Result<T> + Send + Sync + 'static,
        E: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let node = Node::derived();
        let inner = Arc::new(DerivedInner {
            id: node.id(),
            rt: self.clone(),
            compute: Box::new(compute),
            equals: Box::new(equals),
            cache: RwLock::new(None),
            runs: AtomicUsize::new(0),
        });
        let weak = Arc::downgrade(&inner);
        let weak: Weak<dyn Reactive> = weak;
        self.register(node.with_reactive(ReactiveRef::Weak(weak)));
        Derived { inner }
    }

    /// Keep `derived` subscribed to its dependencies while the guard lives,
    /// even if nothing reads it.
    pub fn keep_observed<T>(&self, derived: &Derived<T>) -> Result<KeepObserved>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = derived.id();
        if !self.ptr_eq(&derived.inner.rt) {
            return Err(Error::ForeignRuntime { node: id });
        }
        self.retain(id)?;
        Ok(KeepObserved {
            rt: self.clone(),
            id,
        })
    }
}

impl<T> Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The node id.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// The runtime this node belongs to.
    pub fn runtime(&self) -> &Runtime {
        &self.inner.rt
    }

    /// Give the node a debug name.
    pub fn named(self, name: &str) -> Self {
        self.inner.rt.set_name(self.inner.id, name);
        self
    }

    /// Read the value, recomputing if needed and recording a dependency if
    /// `reader` tracks.
    ///
    /// Errors from the compute function are returned to the caller; the
    /// next read after the current commit retries. The dependency is
    /// recorded even when the read fails, so a reader that saw the error
    /// re-runs once the node recovers.
    pub fn read(&self, reader: &Reader<'_>) -> Result<T> {
        let inner = &self.inner;
        reader.check_runtime(&inner.rt, inner.id)?;
        let refreshed = inner.rt.refresh(inner.id);
        let version = inner.rt.version(inner.id)?;
        reader.track(inner.id, version);
        refreshed?;
        inner
            .cache
            .read()
            .clone()
            .ok_or(Error::Disposed { node: inner.id })
    }

    /// Read the value outside any computation.
    pub fn get(&self) -> Result<T> {
        let reader = self.inner.rt.reader();
        self.read(&reader)
    }

    /// Detach the computation. Later reads fail with [`Error::Disposed`]
    /// and reactions that read this node re-run once to see it.
    pub fn dispose(&self) {
        self.inner.rt.dispose(self.inner.id);
        self.inner.cache.write().take();
    }

    /// Whether [`dispose`](Self::dispose) was called.
    pub fn is_disposed(&self) -> bool {
        self.inner.rt.is_disposed(self.inner.id)
    }

    /// The node's scheduling state.
    pub fn state(&self) -> NodeState {
        self.inner
            .rt
            .node_state(self.inner.id)
            .unwrap_or(NodeState::Stale)
    }

    /// How many times the compute function has run.
    pub fn compute_count(&self) -> usize {
        self.inner.runs.load(Ordering::Relaxed)
    }
}

impl<T> Observable for Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = T;

    fn node_id(&self) -> NodeId {
        self.id()
    }

    fn read(&self, reader: &Reader<'_>) -> Result<T> {
        Derived::read(self, reader)
    }
}

impl<T> Debug for Derived<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Derived")
            .field("id", &self.inner.id)
            .field("cached", &*self.inner.cache.read())
            .field("state", &self.state())
            .finish()
    }
}

/// Keeps a derived node observed. Releases it on drop.
#[must_use = "the node is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct KeepObserved {
    rt: Runtime,
    id: NodeId,
}

impl KeepObserved {
    /// The node being kept.
    pub fn node(&self) -> NodeId {
        self.id
    }
}

impl Drop for KeepObserved {
    fn drop(&mut self) {
        self.rt.unretain(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_is_lazy() {
        let rt = Runtime::new();
        let v = rt.value(1);
        let d = {
            let v = v.clone();
            rt.derive(move |r| Ok(v.read(r)? * 2))
        };

        assert_eq!(d.compute_count(), 0);
        assert_eq!(d.get().unwrap(), 2);
        assert_eq!(d.compute_count(), 1);
    }

    #[test]
    fn unobserved_reads_reuse_the_cache() {
        let rt = Runtime::new();
        let v = rt.value(1);
        let d = {
            let v = v.clone();
            rt.derive(move |r| Ok(v.read(r)? + 1))
        };

        assert_eq!(d.get().unwrap(), 2);
        assert_eq!(d.get().unwrap(), 2);
        assert_eq!(d.compute_count(), 1);

        v.set(5).unwrap();
        assert_eq!(d.get().unwrap(), 6);
        assert_eq!(d.compute_count(), 2);
    }

    #[test]
    fn equal_result_keeps_version() {
        let rt = Runtime::new();
        let v = rt.value(3);
        let parity = {
            let v = v.clone();
            rt.derive(move |r| Ok(v.read(r)? % 2))
        };
        parity.get().unwrap();
        let before = rt.snapshot().node(parity.id()).unwrap().version;

        v.set(5).unwrap();
        assert_eq!(parity.get().unwrap(), 1);
        assert_eq!(parity.compute_count(), 2);
        assert_eq!(rt.snapshot().node(parity.id()).unwrap().version, before);
    }

    #[test]
    fn self_read_is_a_cycle() {
        let rt = Runtime::new();
        let slot: Arc<RwLock<Option<Derived<i32>>>> = Arc::new(RwLock::new(None));
        let d = {
            let slot = slot.clone();
            rt.derive(move |r| {
                let me = slot.read().clone();
                match me {
                    Some(me) => me.read(r),
                    None => Ok(0),
                }
            })
        };
        *slot.write() = Some(d.clone());

        assert!(matches!(d.get(), Err(Error::Cycle { .. })));
        // Break the reference cycle so the node can go away
        slot.write().take();
    }

    #[test]
    fn compute_errors_propagate_and_retry() {
        let rt = Runtime::new();
        let v = rt.value(0);
        let d = {
            let v = v.clone();
            rt.derive(move |r| {
                let n = v.read(r)?;
                if n < 0 {
                    return Err(Error::msg("negative"));
                }
                Ok(n * 10)
            })
        };

        v.set(-1).unwrap();
        assert!(matches!(d.get(), Err(Error::Compute(_))));
        // A failed node retries on every read
        assert!(d.get().is_err());
        assert_eq!(d.compute_count(), 2);

        v.set(2).unwrap();
        assert_eq!(d.get().unwrap(), 20);
    }

    #[test]
    fn disposed_derived_refuses_reads() {
        let rt = Runtime::new();
        let d = rt.derive(|_| Ok(1));
        assert_eq!(d.get().unwrap(), 1);

        d.dispose();
        assert!(d.is_disposed());
        assert!(matches!(d.get(), Err(Error::Disposed { .. })));
    }

    #[test]
    fn keep_observed_subscribes_without_readers() {
        let rt = Runtime::new();
        let v = rt.value(1);
        let d = {
            let v = v.clone();
            rt.derive(move |r| Ok(v.read(r)? * 3))
        };
        d.get().unwrap();
        assert_eq!(v.subscriber_count(), 0);

        let guard = rt.keep_observed(&d).unwrap();
        assert_eq!(guard.node(), d.id());
        assert_eq!(v.subscriber_count(), 1);
        assert_eq!(d.state(), NodeState::UpToDate);

        // Observed nodes are pulled at commit
        v.set(2).unwrap();
        assert_eq!(d.state(), NodeState::UpToDate);
        assert_eq!(d.compute_count(), 2);
        assert_eq!(d.get().unwrap(), 6);
        assert_eq!(d.compute_count(), 2);

        drop(guard);
        assert_eq!(v.subscriber_count(), 0);
    }

    #[test]
    fn keep_observed_rejects_foreign_runtime() {
        let rt = Runtime::new();
        let other = Runtime::new();
        let d = rt.derive(|_| Ok(1));
        assert!(matches!(other.keep_observed(&d), Err(Error::ForeignRuntime { .. })));
    }
}
