//! Observable Set
//!
//! An insertion-ordered set built on [`ObservableMap`] with unit values.
//! Adding a present element, removing an absent one or clearing an empty set
//! changes nothing and notifies nobody.

use std::hash::Hash;

use super::change::ChangeTracker;
use super::map::ObservableMap;
use crate::error::Result;
use crate::graph::NodeId;
use crate::reactive::{Reader, Runtime, Transaction};

/// Change tracker for an [`ObservableSet`]. Sets have no values, so
/// `changed` is always empty.
pub type SetChangeTracker<K> = ChangeTracker<K, ()>;

/// A reactive set.
///
/// # Example
///
/// ```rust,ignore
/// let rt = Runtime::new();
/// let tags = rt.observable_set::<&str>();
///
/// rt.transaction(|_| {
///     tags.add("a")?;
///     tags.add("b")
/// })?;
/// assert_eq!(tags.len(&rt.reader())?, 2);
/// ```
pub struct ObservableSet<K> {
    map: ObservableMap<K, ()>,
}

impl<K> Clone for ObservableSet<K> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl Runtime {
    /// Create an empty observable set.
    pub fn observable_set<K>(&self) -> ObservableSet<K>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
    {
        ObservableSet {
            map: self.observable_map(),
        }
    }
}

impl<K> ObservableSet<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// The container's node id.
    pub fn id(&self) -> NodeId {
        self.map.id()
    }

    /// Give the node a debug name.
    pub fn named(self, name: &str) -> Self {
        Self {
            map: self.map.named(name),
        }
    }

    /// Add `value`. Returns false (and changes nothing) if it was present.
    pub fn add(&self, value: K) -> Result<bool> {
        self.map.insert_if_absent(value, ())
    }

    /// Remove `value`. Returns false if it was absent.
    pub fn remove(&self, value: &K) -> Result<bool> {
        self.map.remove(value).map(|removed| removed.is_some())
    }

    /// Remove every element.
    pub fn clear(&self) -> Result<()> {
        self.map.clear()
    }

    /// Add as part of `tx`.
    pub fn add_in(&self, tx: &Transaction<'_>, value: K) -> Result<bool> {
        tx.check_runtime(self.map.runtime(), self.id())?;
        self.add(value)
    }

    pub fn len(&self, reader: &Reader<'_>) -> Result<usize> {
        self.map.len(reader)
    }

    pub fn is_empty(&self, reader: &Reader<'_>) -> Result<bool> {
        self.map.is_empty(reader)
    }

    pub fn contains(&self, reader: &Reader<'_>, value: &K) -> Result<bool> {
        self.map.contains_key(reader, value)
    }

    /// Elements in insertion order.
    pub fn values(&self, reader: &Reader<'_>) -> Result<Vec<K>> {
        self.map.keys(reader)
    }

    /// Start tracking additions and removals from now on.
    pub fn tracker(&self) -> SetChangeTracker<K> {
        self.map.tracker()
    }
}

impl<K> std::fmt::Debug for ObservableSet<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ObservableSet").field(&self.map).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent() {
        let rt = Runtime::new();
        let set = rt.observable_set::<u32>();
        assert!(set.add(1).unwrap());
        assert!(!set.add(1).unwrap());
        assert_eq!(rt.snapshot().node(set.id()).unwrap().version, 1);
    }

    #[test]
    fn remove_and_clear() {
        let rt = Runtime::new();
        let set = rt.observable_set::<u32>().named("ids");
        let r = rt.reader();
        set.add(1).unwrap();
        set.add(2).unwrap();

        assert!(set.remove(&1).unwrap());
        assert!(!set.remove(&1).unwrap());
        assert!(set.contains(&r, &2).unwrap());
        assert_eq!(set.values(&r).unwrap(), vec![2]);

        set.clear().unwrap();
        assert!(set.is_empty(&r).unwrap());
        assert_eq!(rt.snapshot().find("ids").unwrap().version, 4);
    }
}
