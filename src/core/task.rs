//! Task data model for the dependency graph.
//!
//! Tasks are the schedulable units of work. Each task tracks its status,
//! priority, estimated effort, owning group, and the worker role that
//! executes it.

use crate::core::worker::{WorkerId, WorkerRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Identifier for a task, supplied by the work-submission collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a fresh identifier for callers that do not supply one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for display.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Group that owns a task. Merges within a group are strictly ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl Default for GroupId {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a task is blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BlockReason {
    /// At least one hard dependency has not completed.
    Dependencies,
    /// Workspace creation or spawn failed repeatedly during admission.
    AdmissionFailures { attempts: u32, last_error: String },
    /// The restart budget was exhausted.
    RetriesExhausted { attempts: u32, last_error: String },
    /// Operator escalation for any other reason.
    Escalated { diagnostic: String },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::Dependencies => write!(f, "waiting on dependencies"),
            BlockReason::AdmissionFailures {
                attempts,
                last_error,
            } => write!(f, "admission failed {} times: {}", attempts, last_error),
            BlockReason::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "restart budget exhausted after {}: {}", attempts, last_error),
            BlockReason::Escalated { diagnostic } => write!(f, "escalated: {}", diagnostic),
        }
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Submitted, readiness not yet evaluated.
    #[default]
    Pending,
    /// Cannot be scheduled.
    Blocked { reason: BlockReason },
    /// Every hard dependency is satisfied.
    Ready,
    /// Admitted; workspace and worker are being provisioned.
    Assigned,
    /// A worker is executing the task.
    Running,
    /// Work finished and was merged.
    Completed,
    /// Permanent failure.
    Failed { error: String },
}

impl TaskStatus {
    pub fn state(&self) -> TaskState {
        match self {
            TaskStatus::Pending => TaskState::Pending,
            TaskStatus::Blocked { .. } => TaskState::Blocked,
            TaskStatus::Ready => TaskState::Ready,
            TaskStatus::Assigned => TaskState::Assigned,
            TaskStatus::Running => TaskState::Running,
            TaskStatus::Completed => TaskState::Completed,
            TaskStatus::Failed { .. } => TaskState::Failed,
        }
    }

    pub fn blocked(reason: BlockReason) -> Self {
        TaskStatus::Blocked { reason }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            other => write!(f, "{}", other.state()),
        }
    }
}

/// Field-less view of [`TaskStatus`] used for counting and compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Blocked,
    Ready,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    /// Allowed status edges.
    ///
    /// Forward progress only, except `blocked -> pending` (operator recovery)
    /// and `assigned -> ready` (admission rollback). Readiness can still be
    /// withdrawn (`ready -> blocked`) before admission when a hard edge is added.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Blocked)
                | (Blocked, Ready)
                | (Blocked, Pending)
                | (Ready, Assigned)
                | (Ready, Blocked)
                | (Assigned, Running)
                | (Assigned, Ready)
                | (Assigned, Blocked)
                | (Assigned, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Blocked)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, TaskState::Assigned | TaskState::Running)
    }

    pub const ALL: [TaskState; 7] = [
        TaskState::Pending,
        TaskState::Blocked,
        TaskState::Ready,
        TaskState::Assigned,
        TaskState::Running,
        TaskState::Completed,
        TaskState::Failed,
    ];
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Blocked => "blocked",
            TaskState::Ready => "ready",
            TaskState::Assigned => "assigned",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A single task in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Scope description supplied at submission.
    pub scope: String,
    pub status: TaskStatus,
    /// Higher runs first.
    pub priority: u32,
    /// Estimated effort in arbitrary units; smaller runs first among equal priority.
    pub effort: u32,
    pub group: GroupId,
    /// Worker kind that executes this task.
    pub role: WorkerRole,
    /// Submission order, assigned by the graph store.
    #[serde(default)]
    pub sequence: u64,
    pub worker_id: Option<WorkerId>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Archived tasks are kept for history but hidden from listings.
    #[serde(default)]
    pub archived: bool,
}

impl Task {
    /// Create a pending task with default priority, effort, group and role.
    pub fn new(id: impl Into<TaskId>, scope: &str) -> Self {
        Self {
            id: id.into(),
            scope: scope.to_string(),
            status: TaskStatus::Pending,
            priority: 0,
            effort: 1,
            group: GroupId::default(),
            role: WorkerRole::default(),
            sequence: 0,
            worker_id: None,
            branch_name: None,
            worktree_path: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            archived: false,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_effort(mut self, effort: u32) -> Self {
        self.effort = effort;
        self
    }

    pub fn with_group(mut self, group: impl Into<GroupId>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_role(mut self, role: WorkerRole) -> Self {
        self.role = role;
        self
    }

    pub fn state(&self) -> TaskState {
        self.status.state()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn set_workspace(&mut self, path: PathBuf, branch: &str) {
        self.worktree_path = Some(path);
        self.branch_name = Some(branch.to_string());
    }
}

impl From<String> for GroupId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
