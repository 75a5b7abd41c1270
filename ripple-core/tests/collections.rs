//! Integration Tests for Observable Collections

use std::sync::Arc;

use parking_lot::Mutex;
use ripple_core::{Changes, Runtime, RuntimeConfig};

/// Two adds in one transaction run the reaction once, observing both.
#[test]
fn set_reaction_runs_once_per_transaction() {
    let rt = Runtime::new();
    let set = rt.observable_set::<&'static str>();
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let reaction = {
        let (set, sizes) = (set.clone(), sizes.clone());
        rt.autorun(move |r| {
            sizes.lock().push(set.len(r)?);
            Ok(())
        })
    };

    rt.transaction(|_| {
        set.add("a").unwrap();
        set.add("b").unwrap();
    });

    assert_eq!(reaction.run_count(), 2);
    assert_eq!(*sizes.lock(), vec![0, 2]);
}

/// Edits that change nothing do not wake readers.
#[test]
fn no_op_edits_do_not_notify() {
    let rt = Runtime::new();
    let set = rt.observable_set::<u32>();
    set.add(1).unwrap();
    let reaction = {
        let set = set.clone();
        rt.autorun(move |r| set.len(r).map(drop))
    };

    set.add(1).unwrap();
    set.remove(&2).unwrap();
    assert_eq!(reaction.run_count(), 1);

    set.clear().unwrap();
    set.clear().unwrap();
    assert_eq!(reaction.run_count(), 2);
}

/// A tracker polled from a reaction sees net diffs per commit.
#[test]
fn tracker_reports_net_changes_per_commit() {
    let rt = Runtime::new();
    let set = rt.observable_set::<&'static str>();
    let tracker = set.tracker();
    let seen: Arc<Mutex<Vec<Changes<&'static str>>>> = Arc::new(Mutex::new(Vec::new()));
    let _r = {
        let seen = seen.clone();
        rt.autorun(move |r| {
            seen.lock().push(tracker.changes(r)?);
            Ok(())
        })
    };

    rt.transaction(|_| {
        set.add("a").unwrap();
        set.add("b").unwrap();
    });
    rt.transaction(|_| {
        set.remove(&"a").unwrap();
        set.add("c").unwrap();
    });
    rt.transaction(|_| {
        set.add("d").unwrap();
        set.remove(&"d").unwrap();
    });

    let seen = seen.lock();
    assert_eq!(seen.len(), 4);
    assert!(seen[0].is_empty());
    assert_eq!(seen[1].added.iter().copied().collect::<Vec<_>>(), vec!["a", "b"]);
    assert_eq!(seen[2].added.iter().copied().collect::<Vec<_>>(), vec!["c"]);
    assert_eq!(seen[2].removed.iter().copied().collect::<Vec<_>>(), vec!["a"]);
    // "d" came and went within one commit
    assert!(seen[3].is_empty());
    assert!(seen.iter().all(|c| c.changed.is_empty()));
}

/// Map trackers report changed values but not equal overwrites.
#[test]
fn map_tracker_reports_value_changes() {
    let rt = Runtime::new();
    let map = rt.observable_map::<String, u32>().named("scores");
    map.insert("ada".into(), 1).unwrap();
    map.insert("bob".into(), 1).unwrap();

    let tracker = map.tracker();
    assert_eq!(map.tracker_count(), 1);

    map.insert("ada".into(), 2).unwrap();
    map.insert("bob".into(), 1).unwrap();
    map.remove(&"bob".to_string()).unwrap();
    map.insert("cy".into(), 7).unwrap();

    let changes = tracker.changes(&rt.reader()).unwrap();
    assert_eq!(changes.changed.iter().cloned().collect::<Vec<_>>(), vec!["ada".to_string()]);
    assert_eq!(changes.removed.iter().cloned().collect::<Vec<_>>(), vec!["bob".to_string()]);
    assert_eq!(changes.added.iter().cloned().collect::<Vec<_>>(), vec!["cy".to_string()]);

    // Polling again with no edits in between yields nothing
    assert!(tracker.changes(&rt.reader()).unwrap().is_empty());

    drop(tracker);
    assert_eq!(map.tracker_count(), 0);
}

/// A tracker that falls behind the log gets a reset with every key.
#[test]
fn lagging_tracker_gets_a_reset() {
    let rt = Runtime::with_config(RuntimeConfig::default().with_change_log_capacity(2));
    let set = rt.observable_set::<u8>();
    set.add(0).unwrap();
    let tracker = set.tracker();

    for n in 1..=3 {
        set.add(n).unwrap();
    }

    let changes = tracker.changes(&rt.reader()).unwrap();
    assert!(changes.reset);
    assert!(!changes.is_empty());
    assert_eq!(changes.added.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3]);

    set.add(4).unwrap();
    let changes = tracker.changes(&rt.reader()).unwrap();
    assert!(!changes.reset);
    assert_eq!(changes.added.iter().copied().collect::<Vec<_>>(), vec![4]);
}

/// Derived values over a map recompute when it changes.
#[test]
fn derived_over_map() {
    let rt = Runtime::new();
    let prices = rt.observable_map::<&'static str, u32>();
    let total = {
        let prices = prices.clone();
        rt.derive(move |r| prices.with(r, |entries| entries.values().sum::<u32>()))
    };

    prices.extend([("tea", 3), ("cake", 5)]).unwrap();
    assert_eq!(total.get().unwrap(), 8);
    prices.remove(&"tea").unwrap();
    assert_eq!(total.get().unwrap(), 5);
    assert_eq!(total.compute_count(), 2);
}

/// Edits a reaction makes to a map land together after its round.
#[test]
fn reaction_edits_to_a_map_land_as_one_change() {
    let rt = Runtime::new();
    let input = rt.value(1_u32);
    let squares = rt.observable_map::<u32, u32>();
    let _mirror = {
        let (input, squares) = (input.clone(), squares.clone());
        rt.autorun(move |r| {
            let n = input.read(r)?;
            squares.insert(n, n * n)?;
            squares.remove(&(n - 1))?;
            Ok(())
        })
    };
    let tracker = squares.tracker();
    let seen: Arc<Mutex<Vec<(Vec<u32>, Changes<u32>)>>> = Arc::new(Mutex::new(Vec::new()));
    let _watch = {
        let (squares, seen) = (squares.clone(), seen.clone());
        rt.autorun(move |r| {
            let keys = squares.keys(r)?;
            seen.lock().push((keys, tracker.changes(r)?));
            Ok(())
        })
    };
    let version = squares.runtime().snapshot().node(squares.id()).unwrap().version;

    input.set(2).unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, vec![1]);
    // The watcher never saw the half-applied state
    assert_eq!(seen[1].0, vec![2]);
    assert_eq!(seen[1].1.added.iter().copied().collect::<Vec<_>>(), vec![2]);
    assert_eq!(seen[1].1.removed.iter().copied().collect::<Vec<_>>(), vec![1]);
    let now = rt.snapshot().node(squares.id()).unwrap().version;
    assert_eq!(now, version + 1);
    assert_eq!(squares.get(&rt.reader(), &2).unwrap(), Some(4));
}
