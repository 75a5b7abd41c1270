//! Change Tracking
//!
//! Containers keep a bounded log of structural edits. Each
//! [`ChangeTracker`] holds a cursor into that log and, when polled, folds
//! the edits since its last poll into a net [`Changes`] set: a key added and
//! then removed again does not show up at all.
//!
//! The log only records while at least one tracker is attached. A tracker
//! whose cursor has fallen out of the log (more than
//! [`change_log_capacity`](crate::RuntimeConfig::change_log_capacity) edits
//! behind) gets a reset: every current key is reported as added.

use std::collections::VecDeque;
use std::hash::Hash;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;

use super::map::ObservableMap;
use crate::error::Result;
use crate::reactive::Reader;

/// One structural edit: `key` held `previous` before it (`None` if absent).
#[derive(Debug, Clone)]
pub(crate) struct ChangeRecord<K, V> {
    pub(crate) key: K,
    pub(crate) previous: Option<V>,
}

#[derive(Debug)]
pub(crate) struct ChangeLog<K, V> {
    /// Sequence number of `records[0]`.
    start: u64,
    records: VecDeque<ChangeRecord<K, V>>,
    capacity: usize,
    trackers: usize,
}

impl<K, V> ChangeLog<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            start: 0,
            records: VecDeque::new(),
            capacity: capacity.max(1),
            trackers: 0,
        }
    }

    /// Sequence number the next record will get.
    pub(crate) fn head(&self) -> u64 {
        self.start + self.records.len() as u64
    }

    pub(crate) fn record(&mut self, key: K, previous: Option<V>) {
        if self.trackers == 0 {
            return;
        }
        self.records.push_back(ChangeRecord { key, previous });
        while self.records.len() > self.capacity {
            self.records.pop_front();
            self.start += 1;
        }
    }

    pub(crate) fn extend(&mut self, records: impl IntoIterator<Item = ChangeRecord<K, V>>) {
        for ChangeRecord { key, previous } in records {
            self.record(key, previous);
        }
    }

    /// Records from `cursor` on, or `None` if some were already trimmed.
    pub(crate) fn since(&self, cursor: u64) -> Option<impl Iterator<Item = &ChangeRecord<K, V>>> {
        if cursor < self.start {
            return None;
        }
        let skip = usize::try_from(cursor - self.start).unwrap_or(usize::MAX);
        Some(self.records.iter().skip(skip))
    }

    pub(crate) fn attach(&mut self) -> u64 {
        self.trackers += 1;
        self.head()
    }

    pub(crate) fn detach(&mut self) {
        self.trackers = self.trackers.saturating_sub(1);
        if self.trackers == 0 {
            self.start = self.head();
            self.records.clear();
        }
    }

    pub(crate) fn tracker_count(&self) -> usize {
        self.trackers
    }
}

/// Net structural changes since a tracker's previous poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changes<K: Eq + Hash> {
    /// Keys present now that were absent before.
    pub added: IndexSet<K>,
    /// Keys absent now that were present before.
    pub removed: IndexSet<K>,
    /// Keys present both times whose value differs.
    pub changed: IndexSet<K>,
    /// The tracker fell behind the log; `added` lists every current key and
    /// the other sets are empty.
    pub reset: bool,
}

impl<K: Eq + Hash> Default for Changes<K> {
    fn default() -> Self {
        Self {
            added: IndexSet::new(),
            removed: IndexSet::new(),
            changed: IndexSet::new(),
            reset: false,
        }
    }
}

impl<K: Eq + Hash> Changes<K> {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        !self.reset && self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Number of keys reported.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }
}

/// Fold a run of records into a net diff against `current`.
pub(crate) fn fold<'a, K, V, I>(records: I, current: &IndexMap<K, V>) -> Changes<K>
where
    K: Eq + Hash + Clone + 'a,
    V: PartialEq + 'a,
    I: IntoIterator<Item = &'a ChangeRecord<K, V>>,
{
    // The first record of a key holds its value before the whole run.
    let mut before: IndexMap<&K, Option<&V>> = IndexMap::new();
    for record in records {
        before.entry(&record.key).or_insert(record.previous.as_ref());
    }

    let mut changes = Changes::default();
    for (key, old) in before {
        match (old, current.get(key)) {
            (None, Some(_)) => {
                changes.added.insert(key.clone());
            }
            (Some(_), None) => {
                changes.removed.insert(key.clone());
            }
            (Some(old), Some(new)) if old != new => {
                changes.changed.insert(key.clone());
            }
            _ => {}
        }
    }
    changes
}

/// Cursor into a container's change log.
///
/// Created by [`ObservableMap::tracker`] or
/// [`ObservableSet::tracker`](super::ObservableSet::tracker).
pub struct ChangeTracker<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    map: ObservableMap<K, V>,
    cursor: Mutex<u64>,
}

impl<K, V> ChangeTracker<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(map: ObservableMap<K, V>, cursor: u64) -> Self {
        Self {
            map,
            cursor: Mutex::new(cursor),
        }
    }

    /// Net changes since the previous call (or since the tracker was
    /// created), advancing the cursor. Reading through a tracking reader
    /// makes the computation depend on the container.
    pub fn changes(&self, reader: &Reader<'_>) -> Result<Changes<K>>
    where
        V: PartialEq,
    {
        self.map.observe(reader)?;
        let mut cursor = self.cursor.lock();
        let (changes, head) = self.map.with_log(|entries, log| {
            let changes = match log.since(*cursor) {
                Some(records) => fold(records, entries),
                None => Changes {
                    added: entries.keys().cloned().collect(),
                    reset: true,
                    ..Changes::default()
                },
            };
            (changes, log.head())
        });
        *cursor = head;
        Ok(changes)
    }
}

impl<K, V> Drop for ChangeTracker<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.map.detach_tracker();
    }
}

impl<K, V> std::fmt::Debug for ChangeTracker<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("container", &self.map.id())
            .field("cursor", &*self.cursor.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(key: &'static str, previous: Option<i32>) -> ChangeRecord<&'static str, i32> {
        ChangeRecord { key, previous }
    }

    #[test]
    fn log_ignores_edits_without_trackers() {
        let mut log: ChangeLog<&str, i32> = ChangeLog::new(8);
        log.record("a", None);
        assert_eq!(log.head(), 0);

        let cursor = log.attach();
        log.record("b", None);
        assert_eq!(log.since(cursor).map(Iterator::count), Some(1));
        assert_eq!(log.tracker_count(), 1);

        log.detach();
        assert_eq!(log.since(log.head()).map(Iterator::count), Some(0));
    }

    #[test]
    fn log_trims_to_capacity() {
        let mut log: ChangeLog<&str, i32> = ChangeLog::new(2);
        let cursor = log.attach();
        log.record("a", None);
        log.record("b", None);
        log.record("c", None);

        assert!(log.since(cursor).is_none());
        assert_eq!(log.since(cursor + 1).map(Iterator::count), Some(2));
    }

    #[test]
    fn fold_reports_net_changes() {
        let records = vec![
            rec("new", None),
            rec("gone", Some(1)),
            rec("edited", Some(1)),
            rec("edited", Some(2)),
            rec("flicker", None),
            rec("restored", Some(5)),
        ];
        let current: IndexMap<&str, i32> =
            [("new", 1), ("edited", 3), ("restored", 5)].into_iter().collect();

        let changes = fold(&records, &current);
        assert_eq!(changes.added.iter().copied().collect::<Vec<_>>(), vec!["new"]);
        assert_eq!(changes.removed.iter().copied().collect::<Vec<_>>(), vec!["gone"]);
        assert_eq!(changes.changed.iter().copied().collect::<Vec<_>>(), vec!["edited"]);
        assert!(!changes.reset);
        assert_eq!(changes.len(), 3);
    }
}
