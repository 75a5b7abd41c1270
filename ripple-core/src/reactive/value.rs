//! Observable Value
//!
//! A `Value` is the source primitive. It holds a value and a version, and
//! tracks which computations depend on it.
//!
//! # How Values Work
//!
//! 1. When a value is read through a tracking [`Reader`], the reader's
//!    computation records it as a dependency.
//!
//! 2. When a value is written and the equality function says the new value
//!    differs, the version is bumped and observed dependents go stale.
//!
//! 3. Stale reactions run when the enclosing transaction commits.
//!
//! 4. A write from a reaction body during a commit is staged and applied
//!    when the round ends; until then every reader sees the old value.
//!
//! # Memory Layout
//!
//! Each value consists of:
//! - A node id and a handle to its runtime
//! - The value itself behind a lock
//! - A slot for a write staged during a commit round
//! - The equality function used to suppress no-op writes

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::context::Reader;
use super::runtime::Runtime;
use super::transaction::Transaction;
use super::Observable;
use crate::error::Result;
use crate::graph::{Node, NodeId};

/// Equality used to decide whether a new value is a change.
pub type EqualsFn<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

struct ValueInner<T> {
    id: NodeId,
    rt: Runtime,
    value: RwLock<T>,
    staged: Mutex<Option<T>>,
    equals: EqualsFn<T>,
}

impl<T> ValueInner<T> {
    /// Store `value`, returning whether it differs from the current one.
    fn store(&self, value: T) -> bool {
        let mut current = self.value.write();
        if (self.equals)(&current, &value) {
            false
        } else {
            *current = value;
            true
        }
    }
}

impl<T> Drop for ValueInner<T> {
    fn drop(&mut self) {
        self.rt.remove_node(self.id);
    }
}

/// A reactive value holding a `T`.
///
/// # Example
///
/// ```rust,ignore
/// let rt = Runtime::new();
/// let count = rt.value(0);
///
/// count.set(5)?;
/// assert_eq!(count.get(), 5);
/// ```
pub struct Value<T> {
    inner: Arc<ValueInner<T>>,
}

impl<T> Clone for Value<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Runtime {
    /// Create a value that treats `==` writes as no-ops.
    pub fn value<T>(&self, initial: T) -> Value<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.value_with_equals(initial, |a, b| a == b)
    }

    /// Create a value with a custom equality function. A write for which
    /// `equals(old, new)` is true bumps nothing and notifies nobody.
    pub fn value_with_equals<T, F>(&self, initial: T, equals: F) -> Value<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let id = self.register(Node::value());
        Value {
            inner: Arc::new(ValueInner {
                id,
                rt: self.clone(),
                value: RwLock::new(initial),
                staged: Mutex::new(None),
                equals: Box::new(equals),
            }),
        }
    }
}

impl<T> Value<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The value's node id.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// The runtime this value belongs to.
    pub fn runtime(&self) -> &Runtime {
        &self.inner.rt
    }

    /// Give the node a debug name.
    pub fn named(self, name: &str) -> Self {
        self.inner.rt.set_name(self.inner.id, name);
        self
    }

    /// Read the value, recording a dependency if `reader` tracks.
    pub fn read(&self, reader: &Reader<'_>) -> Result<T> {
        reader.check_runtime(&self.inner.rt, self.inner.id)?;
        let version = self.inner.rt.version(self.inner.id)?;
        reader.track(self.inner.id, version);
        Ok(self.inner.value.read().clone())
    }

    /// Get the current value without tracking.
    pub fn get(&self) -> T {
        let _turn = self.inner.rt.turn();
        self.inner.value.read().clone()
    }

    /// Borrow the current value without tracking or cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let _turn = self.inner.rt.turn();
        f(&self.inner.value.read())
    }

    /// Store a new value.
    ///
    /// Inside an open transaction the reactions are deferred to its commit;
    /// otherwise they run before this returns. Called from a reaction body
    /// during a commit, the value is staged until the round ends. Fails with
    /// [`Error::WriteDuringCompute`](crate::Error::WriteDuringCompute) when
    /// called from a derived computation.
    pub fn set(&self, value: T) -> Result<()> {
        let inner = &self.inner;
        let _turn = inner.rt.turn();
        if inner.rt.stages_writes(inner.id)? {
            self.stage(value);
            return Ok(());
        }
        inner.rt.write(inner.id, || inner.store(value)).map(drop)
    }

    fn stage(&self, value: T) {
        let first = self.inner.staged.lock().replace(value).is_none();
        if !first {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.rt.defer_write(
            self.inner.id,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                let staged = inner.staged.lock().take();
                staged.is_some_and(|value| inner.store(value))
            }),
        );
    }

    /// Store a new value as part of `tx`.
    pub fn set_in(&self, tx: &Transaction<'_>, value: T) -> Result<()> {
        tx.check_runtime(&self.inner.rt, self.inner.id)?;
        self.set(value)
    }

    /// Update the value using a function of the current one.
    ///
    /// A value staged earlier in the same round counts as the current one.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> T,
    {
        let _turn = self.inner.rt.turn();
        let next = f(&self.latest());
        self.set(next)
    }

    /// The staged value if there is one, otherwise the current value.
    pub(crate) fn latest(&self) -> T {
        let staged = self.inner.staged.lock().clone();
        staged.unwrap_or_else(|| self.inner.value.read().clone())
    }

    /// The current version. Bumped once per effective write.
    pub fn version(&self) -> u64 {
        self.inner.rt.version(self.inner.id).unwrap_or_default()
    }

    /// Number of consumers currently subscribed.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .rt
            .lock()
            .graph
            .get_node(self.inner.id)
            .map_or(0, |n| n.dependents().len())
    }
}

impl<T> Observable for Value<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = T;

    fn node_id(&self) -> NodeId {
        self.id()
    }

    fn read(&self, reader: &Reader<'_>) -> Result<T> {
        Value::read(self, reader)
    }
}

impl<T> Debug for Value<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("id", &self.inner.id)
            .field("value", &self.get())
            .field("version", &self.version())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn value_get_and_set() {
        let rt = Runtime::new();
        let value = rt.value(0);
        assert_eq!(value.get(), 0);

        value.set(42).unwrap();
        assert_eq!(value.get(), 42);
        assert_eq!(value.version(), 1);
    }

    #[test]
    fn value_update() {
        let rt = Runtime::new();
        let value = rt.value(10);
        value.update(|v| v + 5).unwrap();
        assert_eq!(value.get(), 15);
    }

    #[test]
    fn equal_write_is_a_no_op() {
        let rt = Runtime::new();
        let value = rt.value("a".to_string());
        value.set("a".to_string()).unwrap();
        assert_eq!(value.version(), 0);
    }

    #[test]
    fn custom_equality_suppresses_writes() {
        let rt = Runtime::new();
        // Only the integer part matters
        let value = rt.value_with_equals(1.2f64, |a, b| a.trunc() == b.trunc());

        value.set(1.9).unwrap();
        assert_eq!(value.version(), 0);
        assert_eq!(value.get(), 1.2);

        value.set(2.1).unwrap();
        assert_eq!(value.version(), 1);
        assert_eq!(value.get(), 2.1);
    }

    #[test]
    fn value_clone_shares_state() {
        let rt = Runtime::new();
        let value1 = rt.value(0);
        let value2 = value1.clone();

        value1.set(42).unwrap();
        assert_eq!(value2.get(), 42);
        assert_eq!(value1.id(), value2.id());
    }

    #[test]
    fn tracked_read_records_version() {
        let rt = Runtime::new();
        let value = rt.value(3).named("width");
        value.set(4).unwrap();

        let reader = super::super::context::Reader::tracking(&rt, NodeId::new());
        assert_eq!(value.read(&reader).unwrap(), 4);
        let deps = reader.finish();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].node, value.id());
        assert_eq!(deps[0].version, 1);
        assert_eq!(rt.snapshot().find("width").map(|n| n.id), Some(value.id()));
    }

    #[test]
    fn reaction_writes_are_staged_until_the_round_ends() {
        let rt = Runtime::new();
        let input = rt.value(1);
        let output = rt.value(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _r = {
            let (input, output, seen) = (input.clone(), output.clone(), seen.clone());
            rt.autorun(move |r| {
                let n = input.read(r)?;
                output.set(n * 2)?;
                output.update(|v| v + 1)?;
                seen.lock().push(output.get());
                Ok(())
            })
        };
        // The first run happens outside any commit and writes through
        assert_eq!(*seen.lock(), vec![3]);

        input.set(5).unwrap();
        // Inside the commit the body still saw the old value...
        assert_eq!(*seen.lock(), vec![3, 3]);
        // ...and the staged result landed as one write once the round ended
        assert_eq!(output.get(), 11);
        assert_eq!(output.version(), 3);
    }

    #[test]
    fn reading_from_another_runtime_fails() {
        let rt = Runtime::new();
        let other = Runtime::new();
        let value = rt.value(1);

        let reader = other.reader();
        assert!(matches!(value.read(&reader), Err(Error::ForeignRuntime { .. })));
    }
}
