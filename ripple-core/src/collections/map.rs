//! Observable Map
//!
//! An insertion-ordered map that behaves like a value node whose equality
//! is always false on a structural edit: every effective insert, remove or
//! clear bumps the node's version, while edits that change nothing (removing
//! an absent key, clearing an empty map) are no-ops.
//!
//! Reads go through a [`Reader`], so a computation that looks at the map
//! depends on all of it. Use a [`ChangeTracker`] to find out what moved.

use std::hash::Hash;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use super::change::{ChangeLog, ChangeRecord, ChangeTracker};
use crate::error::Result;
use crate::graph::{Node, NodeId};
use crate::reactive::{Reader, Runtime, Transaction};

struct MapInner<K, V> {
    id: NodeId,
    rt: Runtime,
    entries: RwLock<IndexMap<K, V>>,
    // Lock order: `entries` before `log`.
    log: Mutex<ChangeLog<K, V>>,
    staged: Mutex<Option<StagedEdits<K, V>>>,
}

/// Edits a reaction made during the current commit round, applied to a
/// private copy of the entries until the round ends.
struct StagedEdits<K, V> {
    entries: IndexMap<K, V>,
    records: Vec<ChangeRecord<K, V>>,
}

impl<K, V> Drop for MapInner<K, V> {
    fn drop(&mut self) {
        self.rt.remove_node(self.id);
    }
}

/// A reactive keyed container.
///
/// # Example
///
/// ```rust,ignore
/// let rt = Runtime::new();
/// let scores = rt.observable_map::<String, u32>();
///
/// scores.insert("ada".into(), 3)?;
/// assert_eq!(scores.get(&rt.reader(), &"ada".into())?, Some(3));
/// ```
pub struct ObservableMap<K, V> {
    inner: Arc<MapInner<K, V>>,
}

impl<K, V> Clone for ObservableMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Runtime {
    /// Create an empty observable map.
    pub fn observable_map<K, V>(&self) -> ObservableMap<K, V>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let id = self.register(Node::value());
        ObservableMap {
            inner: Arc::new(MapInner {
                id,
                rt: self.clone(),
                entries: RwLock::new(IndexMap::new()),
                log: Mutex::new(ChangeLog::new(self.config().change_log_capacity)),
                staged: Mutex::new(None),
            }),
        }
    }
}

impl<K, V> ObservableMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// The container's node id.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// The runtime this container belongs to.
    pub fn runtime(&self) -> &Runtime {
        &self.inner.rt
    }

    /// Give the node a debug name.
    pub fn named(self, name: &str) -> Self {
        self.inner.rt.set_name(self.inner.id, name);
        self
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Insert or overwrite `key`, returning the previous value.
    ///
    /// Always a change, even if the new value equals the old one.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        let mut previous = None;
        self.mutate(|entries, records| {
            previous = entries.insert(key.clone(), value);
            records.push(ChangeRecord {
                key,
                previous: previous.clone(),
            });
            true
        })?;
        Ok(previous)
    }

    /// Insert `key` only if it is absent. Returns whether it was inserted.
    pub fn insert_if_absent(&self, key: K, value: V) -> Result<bool> {
        self.mutate(|entries, records| {
            if entries.contains_key(&key) {
                return false;
            }
            entries.insert(key.clone(), value);
            records.push(ChangeRecord {
                key,
                previous: None,
            });
            true
        })
    }

    /// Insert every pair as one change.
    pub fn extend<I>(&self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        self.mutate(|entries, records| {
            let mut changed = false;
            for (key, value) in pairs {
                let previous = entries.insert(key.clone(), value);
                records.push(ChangeRecord { key, previous });
                changed = true;
            }
            changed
        })
        .map(drop)
    }

    /// Remove `key`, returning its value. Removing an absent key is a no-op.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let mut removed = None;
        self.mutate(|entries, records| {
            removed = entries.shift_remove(key);
            match &removed {
                Some(value) => {
                    records.push(ChangeRecord {
                        key: key.clone(),
                        previous: Some(value.clone()),
                    });
                    true
                }
                None => false,
            }
        })?;
        Ok(removed)
    }

    /// Remove every entry. Clearing an empty map is a no-op.
    pub fn clear(&self) -> Result<()> {
        self.mutate(|entries, records| {
            if entries.is_empty() {
                return false;
            }
            records.extend(entries.drain(..).map(|(key, value)| ChangeRecord {
                key,
                previous: Some(value),
            }));
            true
        })
        .map(drop)
    }

    /// Insert as part of `tx`.
    pub fn insert_in(&self, tx: &Transaction<'_>, key: K, value: V) -> Result<Option<V>> {
        tx.check_runtime(&self.inner.rt, self.inner.id)?;
        self.insert(key, value)
    }

    /// Remove as part of `tx`.
    pub fn remove_in(&self, tx: &Transaction<'_>, key: &K) -> Result<Option<V>> {
        tx.check_runtime(&self.inner.rt, self.inner.id)?;
        self.remove(key)
    }

    /// Apply `edit` to the entries, pushing one record per structural edit.
    /// `edit` reports whether it changed anything.
    ///
    /// Edits made by a reaction during a commit go to a staged copy and
    /// land together once the current round ends.
    pub(crate) fn mutate<F>(&self, edit: F) -> Result<bool>
    where
        F: FnOnce(&mut IndexMap<K, V>, &mut Vec<ChangeRecord<K, V>>) -> bool,
    {
        let inner = &self.inner;
        let _turn = inner.rt.turn();
        if inner.rt.stages_writes(inner.id)? {
            return Ok(self.stage(edit));
        }
        inner.rt.write(inner.id, || {
            let mut entries = inner.entries.write();
            let mut records = Vec::new();
            let changed = edit(&mut entries, &mut records);
            inner.log.lock().extend(records);
            changed
        })
    }

    fn stage<F>(&self, edit: F) -> bool
    where
        F: FnOnce(&mut IndexMap<K, V>, &mut Vec<ChangeRecord<K, V>>) -> bool,
    {
        let mut staged = self.inner.staged.lock();
        let first = staged.is_none();
        let edits = staged.get_or_insert_with(|| StagedEdits {
            entries: self.inner.entries.read().clone(),
            records: Vec::new(),
        });
        let changed = edit(&mut edits.entries, &mut edits.records);
        drop(staged);

        if first {
            let weak = Arc::downgrade(&self.inner);
            self.inner.rt.defer_write(
                self.inner.id,
                Box::new(move || {
                    let Some(inner) = weak.upgrade() else {
                        return false;
                    };
                    let Some(edits) = inner.staged.lock().take() else {
                        return false;
                    };
                    if edits.records.is_empty() {
                        return false;
                    }
                    *inner.entries.write() = edits.entries;
                    inner.log.lock().extend(edits.records);
                    true
                }),
            );
        }
        changed
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Number of entries.
    pub fn len(&self, reader: &Reader<'_>) -> Result<usize> {
        self.with(reader, IndexMap::len)
    }

    /// Whether the map is empty.
    pub fn is_empty(&self, reader: &Reader<'_>) -> Result<bool> {
        self.with(reader, IndexMap::is_empty)
    }

    pub fn contains_key(&self, reader: &Reader<'_>, key: &K) -> Result<bool> {
        self.with(reader, |entries| entries.contains_key(key))
    }

    pub fn get(&self, reader: &Reader<'_>, key: &K) -> Result<Option<V>> {
        self.with(reader, |entries| entries.get(key).cloned())
    }

    /// Keys in insertion order.
    pub fn keys(&self, reader: &Reader<'_>) -> Result<Vec<K>> {
        self.with(reader, |entries| entries.keys().cloned().collect())
    }

    /// A copy of the whole map.
    pub fn snapshot(&self, reader: &Reader<'_>) -> Result<IndexMap<K, V>> {
        self.with(reader, IndexMap::clone)
    }

    /// Borrow the entries. Records a dependency on the whole map.
    pub fn with<R>(&self, reader: &Reader<'_>, f: impl FnOnce(&IndexMap<K, V>) -> R) -> Result<R> {
        self.observe(reader)?;
        Ok(f(&self.inner.entries.read()))
    }

    /// Start tracking structural changes from now on.
    pub fn tracker(&self) -> ChangeTracker<K, V> {
        let cursor = self.inner.log.lock().attach();
        ChangeTracker::new(self.clone(), cursor)
    }

    /// Number of attached change trackers.
    pub fn tracker_count(&self) -> usize {
        self.inner.log.lock().tracker_count()
    }

    pub(crate) fn observe(&self, reader: &Reader<'_>) -> Result<()> {
        reader.check_runtime(&self.inner.rt, self.inner.id)?;
        let version = self.inner.rt.version(self.inner.id)?;
        reader.track(self.inner.id, version);
        Ok(())
    }

    pub(crate) fn with_log<R>(&self, f: impl FnOnce(&IndexMap<K, V>, &ChangeLog<K, V>) -> R) -> R {
        let entries = self.inner.entries.read();
        let log = self.inner.log.lock();
        f(&entries, &log)
    }

    pub(crate) fn detach_tracker(&self) {
        self.inner.log.lock().detach();
    }
}

impl<K, V> std::fmt::Debug for ObservableMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableMap")
            .field("id", &self.inner.id)
            .field("entries", &*self.inner.entries.read())
            .finish()
    }
}
