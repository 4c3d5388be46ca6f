//! A named, task-bound vertex in a workflow graph.

use crate::spec::TaskInstance;
use crate::state::{Splitter, State};

/// One vertex of a workflow: a unique name, an owned task instance, and the
/// replication state derived from its bound inputs.
///
/// A node may only be bound to concrete values or to lazy fields referencing
/// strictly earlier nodes or the enclosing workflow's own inputs; this
/// ordering rule is what keeps the graph acyclic by construction.
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    task: TaskInstance,
    state: State,
    observed: bool,
}

impl Node {
    pub(crate) fn new(name: String, task: TaskInstance, state: State) -> Self {
        Self {
            name,
            task,
            state,
            observed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound task instance, exposed read-only for the execution backend
    /// and the audit collaborator.
    pub fn task(&self) -> &TaskInstance {
        &self.task
    }

    /// The derived replication state: every open or combined axis.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// How this node came to be replicated: its own declared axes, an
    /// inherited reference to upstream nodes, both, or nothing.
    pub fn splitter(&self) -> Splitter {
        self.state.splitter()
    }

    /// Dotted names of the axes this node reduces, in combine order.
    pub fn combiner(&self) -> &[String] {
        self.state.combined_ids()
    }

    /// Whether this node's outputs have been bound into a downstream node
    /// or into the workflow's outputs. Observed nodes reject input
    /// mutations that would change their derived state.
    pub fn observed(&self) -> bool {
        self.observed
    }

    /// Whether this node's task is itself workflow-backed, i.e. a nested
    /// graph constructed on demand.
    pub fn is_subgraph(&self) -> bool {
        matches!(
            self.task.spec().kind(),
            crate::spec::TaskKind::Graph { .. },
        )
    }

    pub(crate) fn mark_observed(&mut self) {
        self.observed = true;
    }

    pub(crate) fn replace(&mut self, task: TaskInstance, state: State) {
        self.task = task;
        self.state = state;
    }
}
