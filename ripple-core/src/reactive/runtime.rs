//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects values, derived
//! nodes and reactions. It owns the dependency graph, the evaluation stack
//! and the transaction state, and it runs the commit pass.
//!
//! # How It Works
//!
//! 1. Every value, derived node and reaction registers a node with the
//!    runtime that created it.
//!
//! 2. Reading through a [`Reader`] records the dependency together with the
//!    version that was read.
//!
//! 3. When a value changes, the runtime:
//!    a. bumps its version and marks observed dependents stale
//!    b. collects the stale reactions for the enclosing transaction
//!    c. at the outermost commit, pulls stale derived nodes in topological
//!       order and re-runs each stale reaction once
//!
//! 4. Pulling a stale derived node first pulls its recorded dependencies. If
//!    none of their versions moved, the cache is kept without running the
//!    compute function.
//!
//! # Threading
//!
//! Evaluation is synchronous and single-threaded. Handles are `Send + Sync`
//! so another thread (or an async task) may feed values, but every entry
//! point takes the runtime's reentrant turn lock first: one thread drives the
//! graph at a time and nested reads on that thread re-enter freely. The
//! inner state mutex is only ever held for bookkeeping, never while user
//! code runs.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, ReentrantMutex, ReentrantMutexGuard, RwLock};
use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use super::context::{Frame, Reader};
use super::transaction::{BatchState, DeferredWrite, FlushFn};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::graph::{Dependency, GraphSnapshot, Node, NodeId, NodeKind, NodeState, Scheduler};

/// Reaction errors kept for [`Runtime::take_reaction_errors`].
const MAX_RECORDED_ERRORS: usize = 256;

/// A computation the scheduler can re-run: derived nodes and reactions.
pub(crate) trait Reactive: Send + Sync {
    /// Run the computation through [`Runtime::run_evaluation`] on `rt`.
    fn evaluate(&self, rt: &Runtime) -> Result<()>;
}

/// A failure caught at a reaction boundary.
#[derive(Debug, Clone)]
pub struct ReactionError {
    /// The reaction that failed.
    pub node: NodeId,
    /// Its debug name, if it has one.
    pub name: Option<String>,
    /// What went wrong.
    pub error: Error,
}

type ErrorHandler = Arc<dyn Fn(&ReactionError) + Send + Sync>;

/// Mutable runtime state, guarded by one mutex.
#[derive(Debug, Default)]
pub(crate) struct RuntimeState {
    pub(crate) graph: Scheduler,
    pub(crate) batch: BatchState,
    pub(crate) frames: Vec<Frame>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    turn: ReentrantMutex<()>,
    state: Mutex<RuntimeState>,
    error_handler: RwLock<Option<ErrorHandler>>,
    reaction_errors: Mutex<VecDeque<ReactionError>>,
}

/// An isolated reactive graph.
///
/// Cloning a `Runtime` yields another handle to the same graph. Nodes from
/// different runtimes cannot read each other.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("name", &self.inner.config.name)
            .finish()
    }
}

enum Plan {
    Done,
    Validate(SmallVec<[Dependency; 4]>),
    Recompute,
}

impl Runtime {
    /// Create a runtime with default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime with the given configuration.
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                turn: ReentrantMutex::new(()),
                state: Mutex::new(RuntimeState::default()),
                error_handler: RwLock::new(None),
                reaction_errors: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Whether two handles refer to the same runtime.
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A reader that records nothing, for reading outside any computation.
    pub fn reader(&self) -> Reader<'_> {
        Reader::plain(self)
    }

    /// Run `f` with an untracked reader.
    pub fn untracked<R>(&self, f: impl FnOnce(&Reader<'_>) -> R) -> R {
        let reader = self.reader();
        f(&reader)
    }

    /// Produce a serialisable dump of the graph.
    pub fn snapshot(&self) -> GraphSnapshot {
        let _turn = self.turn();
        self.lock().graph.snapshot(self.inner.config.name.clone())
    }

    /// Number of nodes currently registered.
    pub fn node_count(&self) -> usize {
        let _turn = self.turn();
        self.lock().graph.node_count()
    }

    /// Number of reactions that have not been disposed.
    ///
    /// Undisposed reactions keep their whole dependency chain subscribed; a
    /// test that expects a clean teardown can assert this is zero.
    pub fn live_reaction_count(&self) -> usize {
        let _turn = self.turn();
        self.lock()
            .graph
            .nodes()
            .filter(|n| n.kind() == NodeKind::Reaction && !n.is_disposed())
            .count()
    }

    /// Dispose every live reaction in this runtime.
    pub fn dispose_all(&self) {
        let _turn = self.turn();
        let ids: Vec<NodeId> = self
            .lock()
            .graph
            .nodes()
            .filter(|n| n.kind() == NodeKind::Reaction && !n.is_disposed())
            .map(Node::id)
            .collect();
        for id in ids {
            self.dispose(id);
        }
    }

    /// Install a callback for failures caught at reaction boundaries.
    ///
    /// Failures are logged and recorded regardless.
    pub fn set_reaction_error_handler<F>(&self, handler: F)
    where
        F: Fn(&ReactionError) + Send + Sync + 'static,
    {
        *self.inner.error_handler.write() = Some(Arc::new(handler));
    }

    /// Drain the recorded reaction failures, oldest first.
    pub fn take_reaction_errors(&self) -> Vec<ReactionError> {
        self.inner.reaction_errors.lock().drain(..).collect()
    }

    /// The computation currently being evaluated on this runtime, if any.
    ///
    /// Waits for any evaluation running on another thread to finish, so the
    /// answer always describes the calling thread.
    pub fn current_consumer(&self) -> Option<NodeId> {
        let _turn = self.turn();
        self.lock().frames.last().map(|f| f.node)
    }

    // ------------------------------------------------------------------------
    // Internals shared with the node modules
    // ------------------------------------------------------------------------

    pub(crate) fn turn(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.turn.lock()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.inner.state.lock()
    }

    pub(crate) fn register(&self, node: Node) -> NodeId {
        let _turn = self.turn();
        let id = self.lock().graph.add_node(node);
        trace!(node = %id, "registered node");
        id
    }

    /// Remove a node whose last handle was dropped.
    pub(crate) fn remove_node(&self, id: NodeId) {
        let _turn = self.turn();
        let removed = self.lock().graph.remove_node(id);
        drop(removed);
    }

    pub(crate) fn set_name(&self, id: NodeId, name: &str) {
        if let Some(node) = self.lock().graph.get_node_mut(id) {
            node.name = Some(Arc::from(name));
        }
    }

    pub(crate) fn node_name(&self, id: NodeId) -> Option<String> {
        self.lock()
            .graph
            .get_node(id)
            .and_then(|n| n.name().map(str::to_owned))
    }

    pub(crate) fn node_state(&self, id: NodeId) -> Option<NodeState> {
        self.lock().graph.get_node(id).map(Node::state)
    }

    pub(crate) fn is_disposed(&self, id: NodeId) -> bool {
        self.lock().graph.get_node(id).map_or(true, Node::is_disposed)
    }

    /// Current version of `id`, or [`Error::Dropped`] if it is gone.
    pub(crate) fn version(&self, id: NodeId) -> Result<u64> {
        self.lock()
            .graph
            .version(id)
            .ok_or(Error::Dropped { node: id })
    }

    /// Bring `id` up to date.
    ///
    /// Values are always current. A derived node that is observed and
    /// up to date returns immediately; otherwise its recorded dependencies
    /// are pulled and compared by version, and the compute function runs
    /// only if one of them moved.
    ///
    /// A node that failed earlier in the running commit returns that error
    /// again instead of recomputing; outside that commit it retries.
    pub(crate) fn refresh(&self, id: NodeId) -> Result<()> {
        let plan = {
            let mut state = self.lock();
            let RuntimeState { graph, batch, .. } = &mut *state;
            let node = graph.get_node_mut(id).ok_or(Error::Dropped { node: id })?;
            if node.kind() != NodeKind::Derived {
                return Ok(());
            }
            if node.disposed {
                return Err(Error::Disposed { node: id });
            }
            if node.state == NodeState::Updating {
                return Err(Error::Cycle { node: id });
            }
            if let Some(failure) = &node.failure {
                if batch.committing && failure.commit == batch.commit {
                    return Err(failure.error.clone());
                }
            }
            match node.state {
                _ if !node.evaluated || node.failure.is_some() => Plan::Recompute,
                NodeState::UpToDate if node.is_observed() => Plan::Done,
                _ => {
                    node.state = NodeState::Updating;
                    Plan::Validate(node.dependencies.clone())
                }
            }
        };

        match plan {
            Plan::Done => Ok(()),
            Plan::Recompute => self.recompute(id),
            Plan::Validate(deps) => {
                let guard = UpdatingGuard::new(self, id);
                let unchanged = self.dependencies_unchanged(&deps);
                guard.release(if unchanged {
                    NodeState::UpToDate
                } else {
                    NodeState::Stale
                });
                if unchanged {
                    trace!(node = %id, "dependencies unchanged, keeping cache");
                    Ok(())
                } else {
                    self.recompute(id)
                }
            }
        }
    }

    /// Pull every dependency and compare versions. Any error (a dependency
    /// that fails, was disposed or dropped) counts as a change, so the
    /// consumer re-runs and sees the error itself.
    fn dependencies_unchanged(&self, deps: &[Dependency]) -> bool {
        for dep in deps {
            if self.refresh(dep.node).is_err() {
                return false;
            }
            match self.lock().graph.version(dep.node) {
                Some(version) if version == dep.version => {}
                _ => return false,
            }
        }
        true
    }

    fn recompute(&self, id: NodeId) -> Result<()> {
        let reactive = self
            .lock()
            .graph
            .reactive(id)
            .ok_or(Error::Dropped { node: id })?;
        trace!(node = %id, "recomputing");
        reactive.evaluate(self)
    }

    /// Evaluate the computation behind `id` inside a fresh reader context.
    ///
    /// `f` returns whether the node's output changed. On success the
    /// recorded dependencies are replaced by what `f` read. On failure they
    /// are widened to include it, every entry carrying the producer's
    /// current version; a derived node records the failure so the next read
    /// after this commit retries. The error is returned either way.
    pub(crate) fn run_evaluation<F>(&self, id: NodeId, f: F) -> Result<bool>
    where
        F: FnOnce(&Reader<'_>) -> Result<bool>,
    {
        let _turn = self.turn();
        {
            let mut state = self.lock();
            let node = state
                .graph
                .get_node_mut(id)
                .ok_or(Error::Dropped { node: id })?;
            if node.disposed {
                return Err(Error::Disposed { node: id });
            }
            node.state = NodeState::Updating;
            let kind = node.kind();
            state.frames.push(Frame { node: id, kind });
        }

        let guard = EvaluationGuard::new(self, id);
        let reader = Reader::tracking(self, id);
        let result = f(&reader);
        let reads = reader.finish();
        guard.disarm();

        let mut state = self.lock();
        let popped = state.frames.pop();
        debug_assert_eq!(popped.map(|f| f.node), Some(id), "evaluation frame mismatch");

        let RuntimeState { graph, batch, .. } = &mut *state;
        let failed = match &result {
            Ok(changed) => {
                graph.set_dependencies(id, reads);
                if let Some(node) = graph.get_node_mut(id) {
                    // Recovering from a failure is a change even when the
                    // value matches the one cached before it.
                    if *changed || node.failure.is_some() {
                        node.version += 1;
                    }
                    node.evaluated = true;
                    node.failure = None;
                }
                false
            }
            Err(err) => {
                let mut merged = reads;
                if let Some(node) = graph.get_node(id) {
                    for dep in &node.dependencies {
                        if !merged.iter().any(|d| d.node == dep.node) {
                            let version = graph.version(dep.node).unwrap_or(dep.version);
                            merged.push(Dependency {
                                node: dep.node,
                                version,
                            });
                        }
                    }
                }
                graph.set_dependencies(id, merged);
                if let Some(node) = graph.get_node_mut(id) {
                    if node.kind() == NodeKind::Derived {
                        node.record_failure(batch.commit, err.clone());
                    } else {
                        node.evaluated = true;
                    }
                }
                trace!(node = %id, error = %err, "evaluation failed");
                true
            }
        };
        graph.settle(id, failed, &mut batch.pending);
        drop(state);
        result
    }

    /// Decide how a write to source node `id` issued right now is applied.
    ///
    /// Returns true if it must be staged: the caller is a reaction body and
    /// a commit round is running. Fails for writes from derived
    /// computations and for nodes that no longer exist. Callers hold the
    /// turn lock across this check and the write itself.
    pub(crate) fn stages_writes(&self, id: NodeId) -> Result<bool> {
        let state = self.lock();
        let frame = state.frames.last().copied();
        if let Some(frame) = frame {
            if frame.kind == NodeKind::Derived {
                return Err(Error::WriteDuringCompute {
                    target: id,
                    reader: frame.node,
                });
            }
        }
        if state.graph.get_node(id).is_none() {
            return Err(Error::Dropped { node: id });
        }
        Ok(state.batch.committing && frame.is_some_and(|f| f.kind == NodeKind::Reaction))
    }

    /// Queue `flush` to apply a staged write to `id` once the current round
    /// ends. Containers queue one flush per round however often they are
    /// written.
    pub(crate) fn defer_write(&self, id: NodeId, flush: FlushFn) {
        trace!(node = %id, "write staged until the end of the round");
        self.lock().batch.deferred.push(DeferredWrite { node: id, flush });
    }

    /// Apply a write to source node `id`.
    ///
    /// `mutate` performs the store and reports whether anything changed.
    /// Outside a transaction the write commits immediately.
    pub(crate) fn write<F>(&self, id: NodeId, mutate: F) -> Result<bool>
    where
        F: FnOnce() -> bool,
    {
        let _turn = self.turn();
        self.stages_writes(id)?;

        let tx = self.begin();
        let changed = mutate();
        if changed {
            let mut state = self.lock();
            let RuntimeState { graph, batch, .. } = &mut *state;
            graph.mark_changed(id, &mut batch.pending);
        }
        drop(tx);
        Ok(changed)
    }

    /// Dispose a derived node or reaction.
    ///
    /// Dependents are invalidated, so reactions that read the node re-run
    /// (and see [`Error::Disposed`]).
    pub(crate) fn dispose(&self, id: NodeId) {
        let tx = self.begin();
        let detached = {
            let mut state = self.lock();
            let RuntimeState { graph, batch, .. } = &mut *state;
            let detached = graph.dispose(id, &mut batch.pending);
            // Nothing can read a reaction, so its record can go right away.
            if graph.get_node(id).is_some_and(|n| n.kind() == NodeKind::Reaction) {
                graph.remove_node(id);
            }
            detached
        };
        if detached.is_some() {
            debug!(node = %id, "disposed");
        }
        // The computation may own handles whose drop re-enters the runtime.
        drop(detached);
        drop(tx);
    }

    pub(crate) fn retain(&self, id: NodeId) -> Result<()> {
        let _turn = self.turn();
        let mut state = self.lock();
        match state.graph.get_node(id) {
            None => Err(Error::Dropped { node: id }),
            Some(node) if node.is_disposed() => Err(Error::Disposed { node: id }),
            Some(_) => {
                state.graph.retain(id);
                Ok(())
            }
        }
    }

    pub(crate) fn unretain(&self, id: NodeId) {
        let _turn = self.turn();
        self.lock().graph.unretain(id);
    }

    /// Run the commit pass: pull stale observed nodes in topological order,
    /// then re-run stale reactions. Writes staged by reactions are applied
    /// when their round ends and start another round, up to the configured
    /// limit.
    pub(crate) fn commit_rounds(&self) {
        let max_rounds = self.inner.config.max_commit_rounds.max(1);
        let mut rounds = 0;

        loop {
            self.flush_deferred_writes();
            let (order, reactions) = {
                let mut state = self.lock();
                let stale = std::mem::take(&mut state.batch.pending);
                if stale.is_empty() {
                    break;
                }
                if rounds >= max_rounds {
                    let abandoned: Vec<NodeId> = stale.reactions.iter().copied().collect();
                    for id in &abandoned {
                        if let Some(node) = state.graph.get_node_mut(*id) {
                            if node.state == NodeState::Stale {
                                node.state = NodeState::UpToDate;
                            }
                        }
                    }
                    drop(state);
                    warn!(rounds, reactions = abandoned.len(), "abandoning runaway reactions");
                    for id in abandoned {
                        self.report_reaction_error(id, Error::RunawayReactions { rounds });
                    }
                    break;
                }
                let order = state.graph.topological_sort(&stale.nodes);
                (order, stale.reactions)
            };
            rounds += 1;
            debug!(round = rounds, nodes = order.len(), reactions = reactions.len(), "commit round");
            let round = RoundGuard::new(self, &order);

            for id in &order {
                let pull = {
                    let state = self.lock();
                    state.graph.get_node(*id).is_some_and(|n| {
                        n.kind() == NodeKind::Derived
                            && n.is_observed()
                            && n.state() == NodeState::Stale
                    })
                };
                if pull {
                    if let Err(err) = self.refresh(*id) {
                        trace!(node = %id, error = %err, "derived node failed during commit");
                    }
                }
            }

            for id in order.iter().filter(|id| reactions.contains(*id)) {
                self.run_reaction(*id);
            }
            round.complete();
        }
    }

    /// Apply the writes reaction bodies staged during the last round.
    fn flush_deferred_writes(&self) {
        let deferred = std::mem::take(&mut self.lock().batch.deferred);
        for DeferredWrite { node, flush } in deferred {
            if let Err(err) = self.write(node, flush) {
                trace!(node = %node, error = %err, "staged write dropped");
            }
        }
    }

    /// Re-run reaction `id` if one of its dependencies really changed.
    pub(crate) fn run_reaction(&self, id: NodeId) {
        let plan = {
            let mut state = self.lock();
            let Some(node) = state.graph.get_node_mut(id) else {
                return;
            };
            if node.kind() != NodeKind::Reaction || node.disposed {
                return;
            }
            match node.state {
                NodeState::UpToDate | NodeState::Updating => Plan::Done,
                NodeState::Stale if !node.evaluated => Plan::Recompute,
                NodeState::Stale => {
                    node.state = NodeState::Updating;
                    Plan::Validate(node.dependencies.clone())
                }
            }
        };

        let run = match plan {
            Plan::Done => false,
            Plan::Recompute => true,
            Plan::Validate(deps) => {
                let guard = UpdatingGuard::new(self, id);
                let unchanged = self.dependencies_unchanged(&deps);
                guard.release(if unchanged {
                    NodeState::UpToDate
                } else {
                    NodeState::Stale
                });
                !unchanged
            }
        };

        if run {
            let reactive = self.lock().graph.reactive(id);
            if let Some(reactive) = reactive {
                if let Err(err) = reactive.evaluate(self) {
                    self.report_reaction_error(id, err);
                }
            }
        }
    }

    pub(crate) fn report_reaction_error(&self, id: NodeId, err: Error) {
        let name = self.node_name(id);
        error!(
            runtime = self.inner.config.name.as_deref().unwrap_or("-"),
            node = %id,
            name = name.as_deref().unwrap_or("-"),
            error = %err,
            "reaction failed"
        );
        let report = ReactionError {
            node: id,
            name,
            error: err,
        };
        let handler = self.inner.error_handler.read().clone();
        if let Some(handler) = handler {
            handler(&report);
        }
        let mut errors = self.inner.reaction_errors.lock();
        if errors.len() == MAX_RECORDED_ERRORS {
            errors.pop_front();
        }
        errors.push_back(report);
    }
}

/// Holds a node in `Updating` while its dependencies are validated, so a
/// cycle through them is detected.
///
/// If validation unwinds, a reaction falls back to `Stale` (its round
/// re-queues it) and a derived node records a failure, so its next read
/// recomputes.
struct UpdatingGuard<'a> {
    rt: &'a Runtime,
    id: NodeId,
    armed: bool,
}

impl<'a> UpdatingGuard<'a> {
    fn new(rt: &'a Runtime, id: NodeId) -> Self {
        Self { rt, id, armed: true }
    }

    fn release(mut self, state: NodeState) {
        self.armed = false;
        if let Some(node) = self.rt.lock().graph.get_node_mut(self.id) {
            if node.state == NodeState::Updating {
                node.state = state;
            }
        }
    }
}

impl Drop for UpdatingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            unwound(self.rt, self.id, NodeState::Stale);
        }
    }
}

/// Restores the evaluation stack if a computation unwinds.
///
/// A derived node records a failure, so the next read retries; a reaction
/// is left `UpToDate` and re-runs on the next change to its inputs.
struct EvaluationGuard<'a> {
    rt: &'a Runtime,
    id: NodeId,
    armed: bool,
}

impl<'a> EvaluationGuard<'a> {
    fn new(rt: &'a Runtime, id: NodeId) -> Self {
        Self { rt, id, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for EvaluationGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.rt.lock();
            if state.frames.last().map(|f| f.node) == Some(self.id) {
                state.frames.pop();
            }
        }
        unwound(self.rt, self.id, NodeState::UpToDate);
    }
}

/// Settle a node whose evaluation or validation unwound.
///
/// Derived nodes stay `UpToDate` with a failure recorded, so invalidation
/// keeps flowing through them to their consumers.
fn unwound(rt: &Runtime, id: NodeId, reaction_state: NodeState) {
    let mut state = rt.lock();
    let RuntimeState { graph, batch, .. } = &mut *state;
    if let Some(node) = graph.get_node_mut(id) {
        if node.kind() == NodeKind::Derived {
            node.record_failure(batch.commit, Error::msg(format!("node {id} panicked")));
        } else {
            node.state = reaction_state;
        }
    }
}

/// Puts a round's unfinished nodes back in the pending set if the round
/// unwinds, so the next commit picks them up.
struct RoundGuard<'a> {
    rt: &'a Runtime,
    order: &'a [NodeId],
    armed: bool,
}

impl<'a> RoundGuard<'a> {
    fn new(rt: &'a Runtime, order: &'a [NodeId]) -> Self {
        Self {
            rt,
            order,
            armed: true,
        }
    }

    fn complete(mut self) {
        self.armed = false;
    }
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.rt.lock();
        let RuntimeState { graph, batch, .. } = &mut *state;
        let mut requeued = 0;
        for id in self.order {
            if let Some(node) = graph.get_node(*id) {
                if node.state() == NodeState::Stale && !node.is_disposed() {
                    batch.pending.insert(*id, node.kind());
                    requeued += 1;
                }
            }
        }
        warn!(requeued, "commit round unwound; unfinished nodes requeued");
    }
}
