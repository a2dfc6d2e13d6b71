//! Core domain models for hive orchestration.
//!
//! Tasks and their dependency graph, worker and workspace records, and the
//! messages exchanged between components.

pub mod dag;
pub mod message;
pub mod task;
pub mod worker;
pub mod workspace;

pub use dag::{DependencyEdge, EdgeKind, EdgeStatus, GraphStore};
pub use message::{
    Completion, DependencyUnblocked, Endpoint, ErrorReport, Heartbeat, Message, MessageId,
    MessageKind, MessageStatus, WorkAssignment,
};
pub use task::{BlockReason, GroupId, Task, TaskId, TaskState, TaskStatus};
pub use worker::{ResourceSample, Worker, WorkerId, WorkerRole, WorkerStatus};
pub use workspace::{Workspace, WorkspaceHandle, WorkspaceStatus};
