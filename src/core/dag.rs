//! Dependency graph store.
//!
//! `GraphStore` holds every task and dependency edge and is the only place
//! task status changes. Edges point from the dependent task to the task it
//! depends on: a hard edge `from -> to` keeps `from` out of `ready` until
//! `to` is completed. Soft edges are advisory and never affect readiness.
//!
//! The hard-edge subgraph is kept acyclic at insertion time. Records restored
//! from persistence bypass that check; the deadlock detector covers them.

use crate::core::task::{BlockReason, Task, TaskId, TaskState, TaskStatus};
use crate::core::worker::WorkerId;
use crate::error::{Error, Result};
use crate::{hlog_debug, hlog_warn};
use chrono::Utc;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Hard,
    Soft,
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::Hard => write!(f, "hard"),
            EdgeKind::Soft => write!(f, "soft"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStatus {
    #[default]
    Pending,
    Satisfied,
}

/// Edge weight stored in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EdgeData {
    kind: EdgeKind,
    status: EdgeStatus,
}

/// A dependency edge as seen outside the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The dependent task.
    pub from: TaskId,
    /// The task depended upon.
    pub to: TaskId,
    pub kind: EdgeKind,
    pub status: EdgeStatus,
}

/// Task and dependency repository.
pub struct GraphStore {
    graph: DiGraph<Task, EdgeData>,
    task_index: HashMap<TaskId, NodeIndex>,
    next_sequence: u64,
}

impl GraphStore {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            next_sequence: 0,
        }
    }

    /// Rebuild a store from persisted records without validating cycles or
    /// touching task status.
    pub fn restore(tasks: Vec<Task>, edges: Vec<DependencyEdge>) -> Self {
        let mut store = Self::new();
        for task in tasks {
            store.next_sequence = store.next_sequence.max(task.sequence + 1);
            let id = task.id.clone();
            let index = store.graph.add_node(task);
            store.task_index.insert(id, index);
        }
        for edge in edges {
            match (store.task_index.get(&edge.from), store.task_index.get(&edge.to)) {
                (Some(&from), Some(&to)) => {
                    store.graph.add_edge(
                        from,
                        to,
                        EdgeData {
                            kind: edge.kind,
                            status: edge.status,
                        },
                    );
                }
                _ => hlog_warn!(
                    "Dropping persisted edge {} -> {}: unknown task",
                    edge.from,
                    edge.to
                ),
            }
        }
        hlog_debug!(
            "GraphStore restored: {} tasks, {} edges",
            store.graph.node_count(),
            store.graph.edge_count()
        );
        store
    }

    /// Insert a task and evaluate its readiness.
    ///
    /// A task with no edges is immediately `ready`; adding a hard dependency
    /// on an unfinished task afterwards moves it to `blocked`.
    pub fn add_task(&mut self, mut task: Task) -> Result<()> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::Validation(format!(
                "Task {} already exists",
                task.id
            )));
        }
        task.sequence = self.next_sequence;
        self.next_sequence += 1;
        task.status = TaskStatus::Pending;
        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id.clone(), index);
        self.reevaluate(index);
        hlog_debug!("GraphStore::add_task {} -> {}", id, self.graph[index].status);
        Ok(())
    }

    /// Add a dependency edge `from -> to` (`from` depends on `to`).
    ///
    /// # Errors
    /// - `TaskNotFound` if either task is missing
    /// - `Cycle` if a hard edge would close a cycle; the graph is left unchanged
    /// - `Validation` for a hard edge onto a task that is already admitted
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId, kind: EdgeKind) -> Result<()> {
        let from_idx = self.index(from)?;
        let to_idx = self.index(to)?;

        if from_idx == to_idx {
            return match kind {
                EdgeKind::Hard => Err(Error::Cycle {
                    from: from.clone(),
                    to: to.clone(),
                }),
                EdgeKind::Soft => Err(Error::Validation(format!(
                    "Task {} cannot depend on itself",
                    from
                ))),
            };
        }

        if kind == EdgeKind::Hard {
            let state = self.graph[from_idx].state();
            if state.is_active() || state.is_terminal() {
                return Err(Error::Validation(format!(
                    "Cannot add hard dependency to {} task {}",
                    state, from
                )));
            }
            if self.hard_path_exists(to_idx, from_idx) {
                hlog_warn!("Rejected dependency {} -> {}: cycle", from, to);
                return Err(Error::Cycle {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
        }

        let status = if self.graph[to_idx].state() == TaskState::Completed {
            EdgeStatus::Satisfied
        } else {
            EdgeStatus::Pending
        };

        match self.graph.find_edge(from_idx, to_idx) {
            Some(edge) => self.graph[edge] = EdgeData { kind, status },
            None => {
                self.graph.add_edge(from_idx, to_idx, EdgeData { kind, status });
            }
        }
        hlog_debug!("GraphStore::add_dependency {} -> {} ({})", from, to, kind);

        self.reevaluate(from_idx);
        Ok(())
    }

    /// Turn a hard edge into a soft one and re-evaluate the dependent.
    pub fn downgrade_edge(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let edge = self.edge(from, to)?;
        self.graph[edge].kind = EdgeKind::Soft;
        hlog_warn!("Downgraded dependency {} -> {} to soft", from, to);
        let from_idx = self.index(from)?;
        self.reevaluate(from_idx);
        Ok(())
    }

    /// Complete a running task, satisfy the edges that point at it and
    /// promote dependents whose hard dependencies are now all satisfied.
    ///
    /// Returns the ids of tasks that became `ready`.
    pub fn mark_completed(&mut self, id: &TaskId) -> Result<Vec<TaskId>> {
        self.transition(id, TaskState::Running, TaskStatus::Completed)?;
        let index = self.index(id)?;

        let incoming: Vec<(EdgeIndex, NodeIndex)> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .map(|e| (e.id(), e.source()))
            .collect();

        let mut dependents = Vec::new();
        for (edge, source) in incoming {
            self.graph[edge].status = EdgeStatus::Satisfied;
            if !dependents.contains(&source) {
                dependents.push(source);
            }
        }

        let mut promoted = Vec::new();
        for dependent in dependents {
            if self.reevaluate(dependent) {
                promoted.push(self.graph[dependent].id.clone());
            }
        }
        hlog_debug!(
            "GraphStore::mark_completed {} promoted {:?}",
            id,
            promoted
        );
        Ok(promoted)
    }

    /// Compare-and-swap a task's status.
    ///
    /// Fails with `InvalidTransition` if the task is not currently in
    /// `expected` or the edge is not permitted. Moving to `ready` also requires
    /// every hard dependency to be satisfied.
    pub fn transition(&mut self, id: &TaskId, expected: TaskState, next: TaskStatus) -> Result<()> {
        let index = self.index(id)?;
        let current = self.graph[index].state();
        let target = next.state();
        if current != expected || !current.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                entity: format!("task {}", id),
                from: current.to_string(),
                to: target.to_string(),
            });
        }
        if target == TaskState::Ready && !self.hard_deps_satisfied(index) {
            return Err(Error::Validation(format!(
                "Task {} has unsatisfied hard dependencies",
                id
            )));
        }

        let now = Utc::now();
        let task = &mut self.graph[index];
        match target {
            TaskState::Running => task.started_at = Some(now),
            TaskState::Completed | TaskState::Failed => task.completed_at = Some(now),
            TaskState::Ready => {
                task.worker_id = None;
            }
            _ => {}
        }
        hlog_debug!("Task {}: {} -> {}", id, current, next);
        task.status = next;
        Ok(())
    }

    /// Operator recovery: `blocked -> pending`, then re-evaluate readiness.
    pub fn unblock(&mut self, id: &TaskId) -> Result<TaskStatus> {
        self.transition(id, TaskState::Blocked, TaskStatus::Pending)?;
        let index = self.index(id)?;
        self.reevaluate(index);
        Ok(self.graph[index].status.clone())
    }

    /// Hide a terminal task from listings.
    pub fn archive(&mut self, id: &TaskId) -> Result<()> {
        let index = self.index(id)?;
        let task = &mut self.graph[index];
        if !task.is_finished() {
            return Err(Error::Validation(format!(
                "Only completed or failed tasks can be archived; {} is {}",
                id,
                task.state()
            )));
        }
        task.archived = true;
        Ok(())
    }

    /// Record which worker and workspace carry an admitted task.
    pub fn record_assignment(
        &mut self,
        id: &TaskId,
        worker: WorkerId,
        path: PathBuf,
        branch: &str,
    ) -> Result<()> {
        let index = self.index(id)?;
        let task = &mut self.graph[index];
        task.worker_id = Some(worker);
        task.set_workspace(path, branch);
        Ok(())
    }

    /// Ready tasks ordered by priority (desc), then estimated effort (asc),
    /// then submission order.
    pub fn list_ready(&self, limit: usize) -> Vec<Task> {
        let mut ready: Vec<&Task> = self
            .graph
            .node_weights()
            .filter(|t| !t.archived && t.state() == TaskState::Ready)
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.effort.cmp(&b.effort))
                .then(a.sequence.cmp(&b.sequence))
        });
        ready.into_iter().take(limit).cloned().collect()
    }

    /// Whether every hard dependency of the task is satisfied.
    pub fn is_ready(&self, id: &TaskId) -> Result<bool> {
        Ok(self.hard_deps_satisfied(self.index(id)?))
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index.get(id).map(|&index| &self.graph[index])
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Tasks not archived, in submission order.
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.graph.node_weights().filter(|t| !t.archived).collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Every task including archived ones.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
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

    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.graph
            .edge_references()
            .map(|e| DependencyEdge {
                from: self.graph[e.source()].id.clone(),
                to: self.graph[e.target()].id.clone(),
                kind: e.weight().kind,
                status: e.weight().status,
            })
            .collect()
    }

    pub fn get_dependency(&self, from: &TaskId, to: &TaskId) -> Option<DependencyEdge> {
        let edge = self.edge(from, to).ok()?;
        let data = self.graph[edge];
        Some(DependencyEdge {
            from: from.clone(),
            to: to.clone(),
            kind: data.kind,
            status: data.status,
        })
    }

    /// Tasks that `id` hard-depends on.
    pub fn hard_dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing, true)
    }

    /// Tasks that depend on `id`, hard or soft.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming, false)
    }

    /// Task counts keyed by state, archived tasks excluded.
    pub fn count_by_state(&self) -> BTreeMap<TaskState, usize> {
        let mut counts: BTreeMap<TaskState, usize> =
            TaskState::ALL.iter().map(|s| (*s, 0)).collect();
        for task in self.graph.node_weights().filter(|t| !t.archived) {
            *counts.entry(task.state()).or_insert(0) += 1;
        }
        counts
    }

    /// Tasks currently holding a concurrency slot (assigned or running).
    pub fn active_count(&self) -> usize {
        self.graph
            .node_weights()
            .filter(|t| t.state().is_active())
            .count()
    }

    /// No task can make further progress without outside intervention.
    pub fn is_settled(&self) -> bool {
        self.graph.node_weights().all(|t| {
            matches!(
                t.state(),
                TaskState::Completed | TaskState::Failed | TaskState::Blocked
            )
        })
    }

    /// Copy of the hard-edge subgraph, with task ids as node weights.
    pub fn hard_subgraph(&self) -> DiGraph<TaskId, ()> {
        let mut graph = DiGraph::new();
        let mut map = HashMap::new();
        for index in self.graph.node_indices() {
            map.insert(index, graph.add_node(self.graph[index].id.clone()));
        }
        for edge in self.graph.edge_references() {
            if edge.weight().kind == EdgeKind::Hard {
                graph.add_edge(map[&edge.source()], map[&edge.target()], ());
            }
        }
        graph
    }

    /// Priority lookup used by remediation ordering.
    pub fn priorities(&self) -> HashMap<TaskId, u32> {
        self.graph
            .node_weights()
            .map(|t| (t.id.clone(), t.priority))
            .collect()
    }

    // ========== Internals ==========

    fn index(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    fn edge(&self, from: &TaskId, to: &TaskId) -> Result<EdgeIndex> {
        let from_idx = self.index(from)?;
        let to_idx = self.index(to)?;
        self.graph.find_edge(from_idx, to_idx).ok_or_else(|| {
            Error::Validation(format!("No dependency {} -> {}", from, to))
        })
    }

    fn neighbors(&self, id: &TaskId, dir: Direction, hard_only: bool) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(index, dir)
            .filter(|e| !hard_only || e.weight().kind == EdgeKind::Hard)
            .map(|e| {
                let other = match dir {
                    Direction::Outgoing => e.target(),
                    Direction::Incoming => e.source(),
                };
                self.graph[other].id.clone()
            })
            .collect()
    }

    fn hard_deps_satisfied(&self, index: NodeIndex) -> bool {
        self.graph
            .edges_directed(index, Direction::Outgoing)
            .filter(|e| e.weight().kind == EdgeKind::Hard)
            .all(|e| e.weight().status == EdgeStatus::Satisfied)
    }

    /// DFS over hard edges from `start` looking for `target`.
    fn hard_path_exists(&self, start: NodeIndex, target: NodeIndex) -> bool {
        let mut stack = vec![start];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            for edge in self.graph.edges_directed(node, Direction::Outgoing) {
                if edge.weight().kind == EdgeKind::Hard {
                    stack.push(edge.target());
                }
            }
        }
        false
    }

    /// Recompute readiness for a task that has not been admitted.
    ///
    /// Only `pending`, `ready` and `blocked` on dependencies are touched;
    /// tasks blocked for any other reason wait for an operator. Returns true
    /// if the task moved to `ready`.
    fn reevaluate(&mut self, index: NodeIndex) -> bool {
        let satisfied = self.hard_deps_satisfied(index);
        let task = &mut self.graph[index];
        let dependency_blocked = matches!(
            task.status,
            TaskStatus::Blocked {
                reason: BlockReason::Dependencies
            }
        );
        let next = match (task.state(), satisfied) {
            (TaskState::Pending, true) => TaskStatus::Ready,
            (TaskState::Blocked, true) if dependency_blocked => TaskStatus::Ready,
            (TaskState::Pending | TaskState::Ready, false) => {
                TaskStatus::blocked(BlockReason::Dependencies)
            }
            _ => return false,
        };
        let became_ready = next == TaskStatus::Ready;
        hlog_debug!("Task {}: {} -> {}", task.id, task.status, next);
        task.status = next;
        became_ready
    }
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphStore")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
