//! Execution engine.
//!
//! [`Engine::evaluate`] materializes one node of an [`ArrayGraph`] and
//! whatever part of its subgraph is not materialized yet. Each node
//! becomes a fresh target [`DistArray`] plus one kernel task per source
//! tile, sent to the worker owning that tile. Intermediate arrays are
//! destroyed on the workers as soon as their last consumer in the
//! evaluation has finished; arrays the caller asked for stay until
//! [`Engine::release`].
//!
//! An engine tracks nodes by [`ExprId`], so it evaluates nodes of a single
//! graph. The graph may keep growing between calls.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tessel_array::{Extent, ReduceOp};
use tracing::{debug, info, warn};

use crate::array::DistArray;
use crate::cluster::WorkerId;
use crate::coordinator::Coordinator;
use crate::error::{Error, SchedulingError};
use crate::expr::{ArrayExpr, ArrayGraph, ExprId};
use crate::protocol::{KernelTask, TaskOp};

/// Lifecycle of one node's evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    Pending,
    /// Building and sending the per-tile tasks.
    Dispatching,
    /// Every task sent; waiting on their replies.
    AwaitingFutures,
    Materialized,
    /// Tiles destroyed on the workers.
    Released,
    /// A task failed. The target may hold writes from tasks that finished.
    Failed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::Dispatching => "dispatching",
            NodeState::AwaitingFutures => "awaiting-futures",
            NodeState::Materialized => "materialized",
            NodeState::Released => "released",
            NodeState::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub struct Engine {
    coordinator: Coordinator,
    states: HashMap<ExprId, NodeState>,
    arrays: HashMap<ExprId, DistArray>,
    partial: HashMap<ExprId, DistArray>,
    pinned: HashSet<ExprId>,
}

impl Engine {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            states: HashMap::new(),
            arrays: HashMap::new(),
            partial: HashMap::new(),
            pinned: HashSet::new(),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn state(&self, id: ExprId) -> NodeState {
        self.states.get(&id).copied().unwrap_or(NodeState::Pending)
    }

    /// The target of a failed evaluation, holding whatever writes landed
    /// before the failure.
    pub fn partial_result(&self, id: ExprId) -> Option<&DistArray> {
        self.partial.get(&id)
    }

    fn set_state(&mut self, id: ExprId, state: NodeState) {
        debug!(node = %id, %state, "node state");
        self.states.insert(id, state);
    }

    /// Materialize `id`, reusing anything already materialized.
    pub fn evaluate(&mut self, graph: &ArrayGraph, id: ExprId) -> Result<DistArray, Error> {
        graph.node(id)?;
        self.pinned.insert(id);
        if let Some(array) = self.arrays.get(&id) {
            return Ok(array.clone());
        }

        // Collect the part of the subgraph that still has to run and count,
        // for each node in it, the parents in it that will read it.
        let mut needed = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            if self.arrays.contains_key(&node) || !needed.insert(node) {
                continue;
            }
            stack.extend(graph.children(node)?);
        }
        let mut consumers: BTreeMap<ExprId, usize> = BTreeMap::new();
        for node in &needed {
            for child in distinct_children(graph, *node)? {
                *consumers.entry(child).or_default() += 1;
            }
        }

        // Children always have smaller ids than their parents.
        let mut done = Vec::new();
        for node in needed {
            let array = match self.evaluate_node(graph, node) {
                Ok(array) => array,
                Err(e) => {
                    warn!(node = %node, "evaluation failed: {e}");
                    self.set_state(node, NodeState::Failed);
                    // Intermediates of this call have no reader left.
                    for earlier in done {
                        if !self.pinned.contains(&earlier) {
                            if let Err(cleanup) = self.drop_array(earlier) {
                                warn!(node = %earlier, "release after failure: {cleanup}");
                            }
                        }
                    }
                    return Err(e);
                }
            };
            done.push(node);
            self.arrays.insert(node, array);
            self.partial.remove(&node);
            self.set_state(node, NodeState::Materialized);

            for child in distinct_children(graph, node)? {
                let Some(left) = consumers.get_mut(&child) else {
                    continue;
                };
                *left -= 1;
                if *left == 0 && !self.pinned.contains(&child) {
                    self.drop_array(child)?;
                }
            }
        }

        let array = self
            .arrays
            .get(&id)
            .cloned()
            .ok_or(SchedulingError::UnknownNode(id.0))?;
        info!(node = %id, array = %array.id, shape = ?array.shape, "evaluated");
        Ok(array)
    }

    /// Drop the caller's hold on `id` and free its tiles.
    pub fn release(&mut self, id: ExprId) -> Result<(), Error> {
        self.pinned.remove(&id);
        if let Some(partial) = self.partial.remove(&id) {
            self.coordinator.destroy(&[&partial])?;
        }
        self.drop_array(id)
    }

    fn drop_array(&mut self, id: ExprId) -> Result<(), Error> {
        if let Some(array) = self.arrays.remove(&id) {
            self.coordinator.destroy(&[&array])?;
            self.set_state(id, NodeState::Released);
        }
        Ok(())
    }

    fn input(&self, id: ExprId) -> Result<&DistArray, SchedulingError> {
        self.arrays.get(&id).ok_or(SchedulingError::UnknownNode(id.0))
    }

    fn evaluate_node(&mut self, graph: &ArrayGraph, id: ExprId) -> Result<DistArray, Error> {
        if let Some(stale) = self.partial.remove(&id) {
            self.coordinator.destroy(&[&stale])?;
        }
        self.set_state(id, NodeState::Dispatching);
        let shape = graph.compute_shape(id)?;
        let coordinator = &self.coordinator;

        let (target, tasks) = match graph.node(id)? {
            ArrayExpr::Literal {
                data,
                dtype,
                tile_hint,
                reducer,
            } => {
                let target = coordinator.create_array(
                    &shape,
                    *dtype,
                    data.is_sparse(),
                    *reducer,
                    tile_hint.as_deref(),
                )?;
                self.set_state(id, NodeState::AwaitingFutures);
                if let Err(e) = self.coordinator.scatter(&target, data) {
                    self.partial.insert(id, target);
                    return Err(e);
                }
                return Ok(target);
            }
            ArrayExpr::Map { inputs, kernel, kw } => {
                let inputs = inputs
                    .iter()
                    .map(|input| self.input(*input).cloned())
                    .collect::<Result<Vec<_>, _>>()?;
                let first = inputs
                    .first()
                    .ok_or_else(|| SchedulingError::InvalidRegion(format!("{id}: map without inputs")))?;
                let target = coordinator.create_like(first, first.dtype, first.sparse, ReduceOp::Sum)?;
                let tasks = per_tile(first, |tile| KernelTask {
                    tile,
                    kernel: kernel.clone(),
                    kw: kw.clone(),
                    op: TaskOp::Map {
                        inputs: inputs.clone(),
                    },
                    target: target.clone(),
                });
                (target, tasks)
            }
            ArrayExpr::Outer {
                a,
                b,
                axes,
                kernel,
                kw,
                tile_hint,
                reducer,
                ..
            } => {
                let a = self.input(*a)?.clone();
                let b = self.input(*b)?.clone();
                let target =
                    coordinator.create_array(&shape, a.dtype, a.sparse, *reducer, tile_hint.as_deref())?;
                let tasks = per_tile(&a, |tile| KernelTask {
                    tile,
                    kernel: kernel.clone(),
                    kw: kw.clone(),
                    op: TaskOp::Outer {
                        a: a.clone(),
                        b: b.clone(),
                        axes: *axes,
                    },
                    target: target.clone(),
                });
                (target, tasks)
            }
            ArrayExpr::Reduce {
                input,
                axis,
                kernel,
                kw,
                reducer,
            } => {
                let input = self.input(*input)?.clone();
                let target = coordinator.create_array(&shape, input.dtype, false, *reducer, None)?;
                let tasks = per_tile(&input, |tile| KernelTask {
                    tile,
                    kernel: kernel.clone(),
                    kw: kw.clone(),
                    op: TaskOp::Reduce {
                        input: input.clone(),
                        axis: *axis,
                    },
                    target: target.clone(),
                });
                (target, tasks)
            }
        };

        if target.shape != shape {
            return Err(SchedulingError::ShapeMismatch {
                expected: shape,
                got: target.shape,
            }
            .into());
        }

        let mut tasks = tasks;
        if let Some(seed) = self.coordinator.config().dispatch_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(u64::from(id.0)));
            tasks.shuffle(&mut rng);
        }
        debug!(node = %id, kind = graph.node(id)?.kind(), tasks = tasks.len(), "dispatching");

        let pending = self.coordinator.issue(tasks);
        self.set_state(id, NodeState::AwaitingFutures);
        match self.coordinator.settle(pending) {
            Ok(updates) => {
                debug!(node = %id, updates = updates.iter().sum::<usize>(), "node complete");
                Ok(target)
            }
            Err(e) => {
                self.partial.insert(id, target);
                Err(e)
            }
        }
    }
}

/// One task per tile of `source`, addressed to the tile's owner.
fn per_tile(
    source: &DistArray,
    task: impl Fn(Extent) -> KernelTask,
) -> Vec<(WorkerId, KernelTask)> {
    source
        .tiles
        .iter()
        .map(|(tile, owner)| (*owner, task(tile.clone())))
        .collect()
}

fn distinct_children(graph: &ArrayGraph, id: ExprId) -> Result<BTreeSet<ExprId>, SchedulingError> {
    Ok(graph.children(id)?.into_iter().collect())
}
