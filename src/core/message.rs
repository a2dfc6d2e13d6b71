//! Typed messages exchanged through the router.
//!
//! Payloads travel as JSON values so that external workers can produce and
//! consume them; the structs below are the typed views used inside the crate.

use crate::core::task::TaskId;
use crate::core::worker::{ResourceSample, WorkerId, WorkerRole};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A sender or recipient of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Worker(WorkerRole),
    Scheduler,
    Supervisor,
    /// Escalations and alerts for a human.
    Operator,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Worker(role) => write!(f, "worker:{}", role),
            Endpoint::Scheduler => write!(f, "scheduler"),
            Endpoint::Supervisor => write!(f, "supervisor"),
            Endpoint::Operator => write!(f, "operator"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    WorkAssignment,
    Completion,
    Error,
    DependencyUnblocked,
    /// Worker liveness report.
    HeartbeatAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, MessageStatus::Pending)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
            MessageStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: Endpoint,
    pub recipient: Endpoint,
    pub kind: MessageKind,
    pub payload: serde_json::Value,
    pub status: MessageStatus,
    /// Delivery attempts so far (polls that returned this message).
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest time the next poll may return this message.
    pub visible_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// When the message reached a terminal status; drives retention.
    pub closed_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkAssignment {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub scope: String,
    pub branch: String,
    pub workspace: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
    pub error: String,
    /// Set when this report surfaces an undeliverable message.
    #[serde(default)]
    pub undelivered: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyUnblocked {
    pub task_id: TaskId,
    pub completed: TaskId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub sample: Option<ResourceSample>,
}
