//! Read-only state snapshots for dashboards and log shippers.
//!
//! The publisher keeps only the newest snapshot: a slow subscriber sees the
//! latest state, never a backlog.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::orchestration::{DeadlockReport, GateReading, WorkerHealth};
use crate::store::write_atomic;
use crate::util::blocking;
use crate::{hlog_debug, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: Option<DateTime<Utc>>,
    /// Task counts keyed by state.
    pub tasks: BTreeMap<String, usize>,
    pub workers: Vec<WorkerHealth>,
    /// Workspace counts keyed by status.
    pub workspaces: BTreeMap<String, usize>,
    /// Message counts keyed by status.
    pub messages: BTreeMap<String, usize>,
    pub pending_restarts: usize,
    /// Most recent resource gate reading.
    pub gate: Option<GateReading>,
    /// Most recent deadlock analysis.
    pub cycles: Option<DeadlockReport>,
}

impl Snapshot {
    pub fn task_count(&self, state: &str) -> usize {
        self.tasks.get(state).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub async fn write_to(&self, path: &Path) -> Result<()> {
        let contents = self.to_json()?;
        let path = path.to_path_buf();
        blocking(move || write_atomic(&path, &contents)).await
    }

    pub async fn read_from(path: &Path) -> Result<Option<Snapshot>> {
        let path = path.to_path_buf();
        blocking(move || {
            if !path.exists() {
                return Ok(None);
            }
            let contents = std::fs::read_to_string(&path)?;
            Ok(Some(serde_json::from_str(&contents)?))
        })
        .await
    }
}

/// Latest-wins snapshot channel.
#[derive(Clone)]
pub struct SnapshotPublisher {
    tx: Sender<Snapshot>,
    rx: Receiver<Snapshot>,
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Replace whatever snapshot is waiting with `snapshot`.
    pub fn publish(&self, snapshot: Snapshot) {
        while self.rx.try_recv().is_ok() {}
        match self.tx.try_send(snapshot) {
            Ok(()) => {}
            // Another publisher won the slot; theirs is just as fresh.
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                hlog_debug!("Snapshot channel disconnected");
            }
        }
    }

    /// Receiver for the newest snapshot. All subscribers share one slot.
    pub fn subscribe(&self) -> Receiver<Snapshot> {
        self.rx.clone()
    }
}
