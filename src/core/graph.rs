//! Task graph for dependency management within one phase.
//!
//! This module provides the TaskGraph structure that holds a phase's tasks
//! as a directed graph (edges point from a dependency to its dependent),
//! answers which tasks are ready, and detects structural errors before
//! anything runs.

use crate::core::task::{CancelReason, ExecutionOutcome, Task, TaskDef, TaskId, TaskRecord, TaskState};
use crate::error::{Error, Result};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::trace;

/// How a phase treats failed tasks.
///
/// The policy also decides which dependency states unblock a dependent
/// task inside the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPolicy {
    /// Every task must complete; any failure blocks the run.
    #[default]
    RequireAllCompleted,
    /// Failures are recorded but the run continues.
    AllowPartialFailure,
}

impl ExitPolicy {
    /// Whether a dependency in `state` lets its dependents run.
    pub fn satisfies(&self, state: TaskState) -> bool {
        match self {
            ExitPolicy::RequireAllCompleted => state == TaskState::Completed,
            ExitPolicy::AllowPartialFailure => matches!(
                state,
                TaskState::Completed | TaskState::Failed | TaskState::Skipped
            ),
        }
    }
}

impl std::fmt::Display for ExitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitPolicy::RequireAllCompleted => write!(f, "require_all_completed"),
            ExitPolicy::AllowPartialFailure => write!(f, "allow_partial_failure"),
        }
    }
}

/// Task counts by state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl TaskCounts {
    fn add(&mut self, state: TaskState) {
        self.total += 1;
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::Running => self.running += 1,
            TaskState::Completed => self.completed += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Skipped => self.skipped += 1,
            TaskState::Cancelled => self.cancelled += 1,
        }
    }

    /// Failed plus cancelled.
    pub fn failures(&self) -> usize {
        self.failed + self.cancelled
    }
}

/// The dependency graph of one phase.
///
/// Nodes are tasks in insertion order. Edges are maintained as tasks are
/// added, so a dependency may be declared before the task it names.
pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
    policy: ExitPolicy,
}

impl TaskGraph {
    /// Create a new empty graph with the given policy.
    pub fn new(policy: ExitPolicy) -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            policy,
        }
    }

    /// Build a graph from definitions, failing on the first duplicate id.
    pub fn from_defs(policy: ExitPolicy, defs: impl IntoIterator<Item = TaskDef>) -> Result<Self> {
        let mut graph = Self::new(policy);
        for def in defs {
            graph.add_task(def)?;
        }
        Ok(graph)
    }

    pub fn policy(&self) -> ExitPolicy {
        self.policy
    }

    /// Add a task to the graph.
    ///
    /// # Errors
    /// Returns `DuplicateTask` if a task with the same id is present.
    pub fn add_task(&mut self, def: TaskDef) -> Result<()> {
        if self.task_index.contains_key(&def.id) {
            return Err(Error::DuplicateTask(def.id.to_string()));
        }

        let id = def.id.clone();
        let index = self.graph.add_node(Task::new(def));
        self.task_index.insert(id.clone(), index);

        // Edges to dependencies that are already present
        let deps: Vec<NodeIndex> = self.graph[index]
            .dependencies()
            .iter()
            .filter_map(|dep| self.task_index.get(dep).copied())
            .collect();
        for dep in deps {
            self.graph.add_edge(dep, index, ());
        }

        // Edges from earlier tasks that named this one before it existed
        let waiting: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&other| other != index && self.graph[other].dependencies().contains(&id))
            .collect();
        for dependent in waiting {
            self.graph.add_edge(index, dependent, ());
        }

        Ok(())
    }

    /// Structural check over enabled tasks.
    ///
    /// # Errors
    /// - `UnknownDependency` if an enabled task names an id not in this graph
    /// - `CyclicDependency` listing every enabled task that sits on a cycle
    pub fn validate(&self) -> Result<()> {
        for task in self.tasks().filter(|t| t.is_enabled()) {
            if let Some(missing) = task
                .dependencies()
                .iter()
                .find(|dep| !self.task_index.contains_key(*dep))
            {
                return Err(Error::UnknownDependency {
                    task: task.id().to_string(),
                    missing: missing.to_string(),
                });
            }
        }

        let cyclic = self.cyclic_tasks();
        if !cyclic.is_empty() {
            return Err(Error::CyclicDependency {
                ids: cyclic.into_iter().map(|id| id.0).collect(),
            });
        }

        Ok(())
    }

    /// Ids of enabled tasks participating in a cycle, sorted.
    fn cyclic_tasks(&self) -> BTreeSet<TaskId> {
        let enabled = self.graph.filter_map(
            |_, task| task.is_enabled().then(|| task.id().clone()),
            |_, _| Some(()),
        );

        let mut cyclic = BTreeSet::new();
        for component in tarjan_scc(&enabled) {
            let on_cycle = component.len() > 1
                || component
                    .first()
                    .map(|&n| enabled.contains_edge(n, n))
                    .unwrap_or(false);
            if on_cycle {
                cyclic.extend(component.into_iter().map(|n| enabled[n].clone()));
            }
        }
        cyclic
    }

    /// Mark every disabled pending task as skipped.
    pub fn skip_disabled(&mut self) -> Vec<TaskId> {
        let mut skipped = Vec::new();
        for task in self.graph.node_weights_mut() {
            if !task.is_enabled() && task.state == TaskState::Pending {
                task.skip();
                skipped.push(task.id().clone());
            }
        }
        skipped
    }

    /// Get all tasks ready to execute.
    ///
    /// A task is ready when it is pending, enabled, and every dependency is
    /// in a state the graph's policy accepts. Order follows insertion.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        let ready: Vec<TaskId> = self
            .graph
            .node_indices()
            .filter(|&index| {
                let task = &self.graph[index];
                task.state == TaskState::Pending
                    && task.is_enabled()
                    && self.deps_satisfied(index)
            })
            .map(|index| self.graph[index].id().clone())
            .collect();
        trace!(count = ready.len(), "TaskGraph::ready_tasks");
        ready
    }

    fn deps_satisfied(&self, index: NodeIndex) -> bool {
        self.graph[index].dependencies().iter().all(|dep| {
            self.task_index
                .get(dep)
                .map(|&d| self.policy.satisfies(self.graph[d].state))
                .unwrap_or(false)
        })
    }

    /// No task is ready while some are still pending.
    pub fn is_stuck(&self) -> bool {
        self.pending_count() > 0 && self.ready_tasks().is_empty()
    }

    /// Transition a pending task to running.
    pub fn mark_running(&mut self, id: &TaskId) -> Result<()> {
        let task = self.task_mut(id)?;
        if task.state != TaskState::Pending {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: task.state.to_string(),
                to: TaskState::Running.to_string(),
            });
        }
        task.start();
        Ok(())
    }

    /// Record the result of a running task.
    ///
    /// # Errors
    /// `InvalidTransition` if the task is not running or the outcome state
    /// is neither completed nor failed.
    pub fn mark_result(&mut self, id: &TaskId, outcome: ExecutionOutcome) -> Result<()> {
        let task = self.task_mut(id)?;
        let valid_target = matches!(outcome.state, TaskState::Completed | TaskState::Failed);
        if task.state != TaskState::Running || !valid_target {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: task.state.to_string(),
                to: outcome.state.to_string(),
            });
        }
        task.finish(outcome);
        Ok(())
    }

    /// Cancel every pending task with the same reason.
    pub fn cancel_pending(&mut self, reason: CancelReason) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        for task in self.graph.node_weights_mut() {
            if task.state == TaskState::Pending {
                task.cancel(reason);
                cancelled.push(task.id().clone());
            }
        }
        cancelled
    }

    /// Cancel the pending tasks of a stuck graph.
    ///
    /// Tasks downstream of a dependency that can no longer satisfy them are
    /// cancelled as `UpstreamFailed`, the rest as `UnmetOrCyclicDependency`.
    pub fn cancel_stuck(&mut self) -> Vec<(TaskId, CancelReason)> {
        let pending: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&i| self.graph[i].state == TaskState::Pending)
            .collect();

        let mut upstream: BTreeSet<NodeIndex> = BTreeSet::new();
        loop {
            let before = upstream.len();
            for &index in &pending {
                if upstream.contains(&index) {
                    continue;
                }
                let blocked = self.graph[index].dependencies().iter().any(|dep| {
                    self.task_index
                        .get(dep)
                        .map(|&d| {
                            upstream.contains(&d) || {
                                let state = self.graph[d].state;
                                state.is_terminal() && !self.policy.satisfies(state)
                            }
                        })
                        .unwrap_or(false)
                });
                if blocked {
                    upstream.insert(index);
                }
            }
            if upstream.len() == before {
                break;
            }
        }

        pending
            .into_iter()
            .map(|index| {
                let reason = if upstream.contains(&index) {
                    CancelReason::UpstreamFailed
                } else {
                    CancelReason::UnmetOrCyclicDependency
                };
                let task = &mut self.graph[index];
                task.cancel(reason);
                (task.id().clone(), reason)
            })
            .collect()
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        let index = self
            .task_index
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        Ok(&mut self.graph[*index])
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Get all tasks that the given task depends on (present in the graph).
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Get all tasks that depend on the given task.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Get tasks in topological order (respecting dependencies).
    ///
    /// # Errors
    /// `CyclicDependency` naming the task where the sort hit a cycle.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| Error::CyclicDependency {
            ids: vec![self.graph[cycle.node_id()].id().to_string()],
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.tasks().filter(|t| t.state == TaskState::Pending).count()
    }

    /// Every task has reached a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.tasks().all(|t| t.state.is_terminal())
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for task in self.tasks() {
            counts.add(task.state);
        }
        counts
    }

    /// Serializable snapshots in insertion order.
    pub fn records(&self) -> Vec<TaskRecord> {
        self.tasks().map(Task::record).collect()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new(ExitPolicy::default())
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("policy", &self.policy)
            .finish()
    }
}
