use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::{MessageId, TaskId, WorkerId, WorkerRole};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Adding dependency {from} -> {to} would create a cycle")]
    Cycle { from: TaskId, to: TaskId },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for {entity} from {from} to {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Workspace already exists for task {task_id}: {branch}")]
    WorkspaceExists { task_id: TaskId, branch: String },

    #[error("Workspace not found for task {0}")]
    WorkspaceNotFound(TaskId),

    #[error("Merge conflict for task {task_id} in {}", join_paths(.paths))]
    MergeConflict { task_id: TaskId, paths: Vec<PathBuf> },

    #[error("Failed to spawn {role} worker: {reason}")]
    Spawn { role: WorkerRole, reason: String },

    #[error("Worker role {role} is already occupied by {holder}")]
    RoleBusy { role: WorkerRole, holder: WorkerId },

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Process not found for worker {id} (pid {pid:?})")]
    ProcessNotFound { id: WorkerId, pid: Option<u32> },

    #[error("Worker {id} missed heartbeats for {silence:?}")]
    HeartbeatTimeout { id: WorkerId, silence: Duration },

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Message {id} was not acknowledged after {attempts} attempts")]
    DeliveryTimeout { id: MessageId, attempts: u32 },

    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Whether the failure may be retried by the supervisor.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Spawn { .. }
                | Error::ProcessNotFound { .. }
                | Error::HeartbeatTimeout { .. }
                | Error::DeliveryTimeout { .. }
                | Error::ResourceExhausted(_)
                | Error::Io(_)
                | Error::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
