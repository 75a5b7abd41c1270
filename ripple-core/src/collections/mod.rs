//! Observable Collections
//!
//! Keyed containers that take part in the graph like values do, plus change
//! trackers that report structural diffs.
//!
//! A container is a single node: reading any part of it through a tracking
//! reader depends on the whole container, and every effective edit bumps its
//! version. Edits that leave the contents unchanged are no-ops.

mod change;
mod map;
mod set;

pub use change::{ChangeTracker, Changes};
pub use map::ObservableMap;
pub use set::{ObservableSet, SetChangeTracker};
