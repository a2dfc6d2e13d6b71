//! Worker records managed by the supervisor.

use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// The fixed set of worker kinds. At most one live worker per role.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    #[default]
    Implementer,
    Reviewer,
    Tester,
    Integrator,
    Documenter,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 5] = [
        WorkerRole::Implementer,
        WorkerRole::Reviewer,
        WorkerRole::Tester,
        WorkerRole::Integrator,
        WorkerRole::Documenter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Implementer => "implementer",
            WorkerRole::Reviewer => "reviewer",
            WorkerRole::Tester => "tester",
            WorkerRole::Integrator => "integrator",
            WorkerRole::Documenter => "documenter",
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkerRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        WorkerRole::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown worker role: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Spawned,
    Running,
    /// Heartbeats overdue; still monitored.
    Stalled,
    /// Killed by the supervisor.
    Dead,
    Completed,
    Failed,
}

impl WorkerStatus {
    /// Holds the role slot.
    pub fn is_live(self) -> bool {
        matches!(self, WorkerStatus::Spawned | WorkerStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerStatus::Dead | WorkerStatus::Completed | WorkerStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        match (self, next) {
            (Spawned, Running) | (Stalled, Running) => true,
            (Spawned | Running, Stalled) => true,
            (from, Dead | Completed | Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Spawned => "spawned",
            WorkerStatus::Running => "running",
            WorkerStatus::Stalled => "stalled",
            WorkerStatus::Dead => "dead",
            WorkerStatus::Completed => "completed",
            WorkerStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time resource usage of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub role: WorkerRole,
    pub task_id: TaskId,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    /// Workspace handle; released when the worker is killed.
    pub workspace_path: Option<PathBuf>,
    pub last_heartbeat: DateTime<Utc>,
    pub resource_sample: Option<ResourceSample>,
    /// Restarts performed for this task before this worker was launched.
    pub retry_count: u32,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub spawned_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Worker {
    pub fn new(role: WorkerRole, task_id: TaskId, workspace: PathBuf, now: DateTime<Utc>) -> Self {
        Self {
            id: WorkerId::new(),
            role,
            task_id,
            pid: None,
            status: WorkerStatus::Spawned,
            workspace_path: Some(workspace),
            last_heartbeat: now,
            resource_sample: None,
            retry_count: 0,
            exit_code: None,
            error: None,
            spawned_at: now,
            finished_at: None,
        }
    }
}
