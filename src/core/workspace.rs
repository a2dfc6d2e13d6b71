use crate::core::task::{GroupId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of a workspace: created -> active -> merged -> cleaned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Created,
    Active,
    Merged,
    Cleaned,
}

impl WorkspaceStatus {
    pub fn next(self) -> Option<WorkspaceStatus> {
        match self {
            WorkspaceStatus::Created => Some(WorkspaceStatus::Active),
            WorkspaceStatus::Active => Some(WorkspaceStatus::Merged),
            WorkspaceStatus::Merged => Some(WorkspaceStatus::Cleaned),
            WorkspaceStatus::Cleaned => None,
        }
    }

    pub fn can_transition_to(self, next: WorkspaceStatus) -> bool {
        self.next() == Some(next)
    }
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkspaceStatus::Created => "created",
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Merged => "merged",
            WorkspaceStatus::Cleaned => "cleaned",
        };
        write!(f, "{}", s)
    }
}

/// Isolation handle for a task: a dedicated branch checked out in its own worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceHandle {
    pub branch: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub task_id: TaskId,
    pub group: GroupId,
    pub priority: u32,
    pub handle: WorkspaceHandle,
    pub status: WorkspaceStatus,
    /// Commit of the base branch the worktree was created from.
    pub base_commit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub cleaned_at: Option<DateTime<Utc>>,
}
