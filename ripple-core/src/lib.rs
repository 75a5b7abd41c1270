//! Ripple Core
//!
//! This crate provides the core runtime for Ripple, a lazy, glitch-free
//! incremental computation engine for reactive application state.
//! It implements:
//!
//! - Reactive primitives (values, derived values, autoruns, triggers)
//! - Transactions that batch writes and run each affected reaction once
//! - Observable collections with structural change trackers
//! - A small async bridge onto tokio
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: the runtime, reader contexts and reactive primitives
//! - `graph`: node records, staleness propagation and scheduling order
//! - `collections`: observable maps and sets
//! - `config`: runtime tunables
//! - `error`: the crate-wide error type
//!
//! # Example
//!
//! ```rust,ignore
//! use ripple_core::Runtime;
//!
//! let rt = Runtime::new();
//!
//! // Create a value
//! let count = rt.value(0);
//!
//! // Create a derived value
//! let doubled = {
//!     let count = count.clone();
//!     rt.derive(move |r| Ok(count.read(r)? * 2))
//! };
//!
//! // Create an autorun
//! let _logger = {
//!     let (count, doubled) = (count.clone(), doubled.clone());
//!     rt.autorun(move |r| {
//!         println!("Count: {}, Doubled: {}", count.read(r)?, doubled.read(r)?);
//!         Ok(())
//!     })
//! };
//!
//! // Update the value
//! count.set(5)?;
//! // Autorun runs again, prints: "Count: 5, Doubled: 10"
//! ```

pub mod collections;
pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use collections::{ChangeTracker, Changes, ObservableMap, ObservableSet, SetChangeTracker};
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use graph::{GraphSnapshot, NodeId, NodeKind, NodeSnapshot, NodeState};
pub use reactive::{
    Autorun, AutorunGuard, Derived, KeepObserved, Observable, ObservablePromise, PromiseState,
    ReactionError, Reader, Runtime, Transaction, Trigger, Value,
};
