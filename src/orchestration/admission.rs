//! Admission control: moves ready tasks onto workers.
//!
//! Each tick admits up to `max_parallel - active` ready tasks in priority
//! order. Every candidate is checked against the resource gate and the
//! supervisor's health signal: `critical` stops the tick (back-pressure),
//! `warning` allows at most one admission per tick.
//!
//! Admission is `ready -> assigned`, workspace creation, worker spawn, then
//! `assigned -> running`. A failed workspace or spawn step rolls the task
//! back to `ready`; after `max_admission_failures` consecutive rollbacks the
//! task is blocked and escalated.

use crate::config::SchedulerConfig;
use crate::core::{
    BlockReason, Endpoint, ErrorReport, GraphStore, MessageKind, Task, TaskId, TaskState,
    TaskStatus, WorkAssignment, WorkerId, WorkspaceStatus,
};
use crate::orchestration::resources::{GateLevel, ResourceGate};
use crate::orchestration::router::MessageRouter;
use crate::orchestration::supervisor::{SpawnRequest, WorkerSupervisor};
use crate::workspace::WorkspaceManager;
use crate::{hlog, hlog_debug, hlog_error, hlog_warn, Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub admitted: Vec<(TaskId, WorkerId)>,
    pub rolled_back: Vec<TaskId>,
    /// Ready tasks skipped because their role is occupied.
    pub deferred: Vec<TaskId>,
    /// Tasks blocked after repeated admission failures.
    pub escalated: Vec<TaskId>,
    /// Worst gate level observed this tick.
    pub gate: GateLevel,
    /// The gate was critical and admission stopped.
    pub back_pressure: bool,
}

#[derive(Debug, Clone, Default)]
struct Rollbacks {
    count: u32,
    last_error: String,
}

pub struct AdmissionController {
    config: SchedulerConfig,
    graph: Arc<RwLock<GraphStore>>,
    workspaces: Arc<WorkspaceManager>,
    supervisor: Arc<RwLock<WorkerSupervisor>>,
    router: Arc<RwLock<MessageRouter>>,
    gate: ResourceGate,
    /// Consecutive rollbacks per task; cleared on a successful admission.
    rollbacks: HashMap<TaskId, Rollbacks>,
}

impl AdmissionController {
    pub fn new(
        config: SchedulerConfig,
        graph: Arc<RwLock<GraphStore>>,
        workspaces: Arc<WorkspaceManager>,
        supervisor: Arc<RwLock<WorkerSupervisor>>,
        router: Arc<RwLock<MessageRouter>>,
        gate: ResourceGate,
    ) -> Self {
        Self {
            config,
            graph,
            workspaces,
            supervisor,
            router,
            gate,
            rollbacks: HashMap::new(),
        }
    }

    pub fn gate(&self) -> &ResourceGate {
        &self.gate
    }

    /// Consecutive rollbacks recorded for a task.
    pub fn failures(&self, task_id: &TaskId) -> u32 {
        self.rollbacks.get(task_id).map_or(0, |r| r.count)
    }

    pub fn reset_failures(&mut self, task_id: &TaskId) {
        self.rollbacks.remove(task_id);
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let candidates = {
            let graph = self.graph.read().await;
            let capacity = self.config.max_parallel.saturating_sub(graph.active_count());
            if capacity == 0 {
                hlog_debug!("Admission: at capacity ({})", self.config.max_parallel);
                return report;
            }
            graph.list_ready(capacity)
        };

        for task in candidates {
            let reading = self.gate.check();
            let health = self.supervisor.read().await.health_level();
            let level = reading.level.max(health);
            report.gate = report.gate.max(level);

            match level {
                GateLevel::Critical => {
                    let err = Error::ResourceExhausted(reading.reasons.join("; "));
                    hlog_warn!("Admission paused: {}", err);
                    report.back_pressure = true;
                    break;
                }
                GateLevel::Warning if !report.admitted.is_empty() => {
                    hlog_debug!("Admission limited to one task under warning");
                    break;
                }
                _ => {}
            }

            if let Some(holder) = self.supervisor.read().await.role_holder(task.role) {
                hlog_debug!("Deferring {}: role {} held by {}", task.id, task.role, holder);
                report.deferred.push(task.id.clone());
                continue;
            }

            // Claim the task; a concurrent tick may already have taken it.
            let claimed = self.graph.write().await.transition(
                &task.id,
                TaskState::Ready,
                TaskStatus::Assigned,
            );
            if let Err(e) = claimed {
                hlog_debug!("Skipping {}: {}", task.id, e);
                continue;
            }

            match self.admit(&task, now).await {
                Ok(worker_id) => {
                    self.rollbacks.remove(&task.id);
                    report.admitted.push((task.id.clone(), worker_id));
                }
                Err(Error::RoleBusy { role, holder }) => {
                    hlog_debug!("Role {} taken by {} during admission of {}", role, holder, task.id);
                    self.restore_ready(&task.id).await;
                    report.deferred.push(task.id.clone());
                }
                Err(e) => {
                    if self.roll_back(&task.id, &e, now).await {
                        report.escalated.push(task.id.clone());
                    } else {
                        report.rolled_back.push(task.id.clone());
                    }
                }
            }
        }

        if !report.admitted.is_empty() {
            hlog!(
                "Admitted {} task(s): {}",
                report.admitted.len(),
                report
                    .admitted
                    .iter()
                    .map(|(t, _)| t.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        report
    }

    /// Provision workspace and worker for an assigned task.
    async fn admit(&self, task: &Task, now: DateTime<Utc>) -> Result<WorkerId> {
        // An active workspace survives a kill, so a re-admitted task resumes in it.
        let existing = self.workspaces.get(&task.id);
        let workspace = match existing {
            Some(ws) if matches!(ws.status, WorkspaceStatus::Active | WorkspaceStatus::Created) => ws,
            _ => self.workspaces.create(task).await?,
        };

        let request = SpawnRequest {
            task_id: task.id.clone(),
            role: task.role,
            workspace: workspace.handle.path.clone(),
            branch: workspace.handle.branch.clone(),
        };
        let spawned = self.supervisor.write().await.spawn(request, now);
        let worker_id = match spawned {
            Ok(id) => id,
            Err(e) => {
                let created = self
                    .workspaces
                    .get(&task.id)
                    .is_some_and(|ws| ws.status == WorkspaceStatus::Created);
                if created {
                    if let Err(discard) = self.workspaces.discard(&task.id).await {
                        hlog_warn!("Could not discard workspace for {}: {}", task.id, discard);
                    }
                }
                return Err(e);
            }
        };

        if workspace.status == WorkspaceStatus::Created {
            self.workspaces.activate(&task.id)?;
        }
        {
            let mut graph = self.graph.write().await;
            graph.record_assignment(
                &task.id,
                worker_id,
                workspace.handle.path.clone(),
                &workspace.handle.branch,
            )?;
            graph.transition(&task.id, TaskState::Assigned, TaskStatus::Running)?;
        }

        let assignment = WorkAssignment {
            task_id: task.id.clone(),
            worker_id,
            scope: task.scope.clone(),
            branch: workspace.handle.branch.clone(),
            workspace: workspace.handle.path.clone(),
        };
        self.router.write().await.send(
            Endpoint::Scheduler,
            Endpoint::Worker(task.role),
            MessageKind::WorkAssignment,
            &assignment,
            now,
        )?;
        Ok(worker_id)
    }

    async fn restore_ready(&self, task_id: &TaskId) {
        let result = self
            .graph
            .write()
            .await
            .transition(task_id, TaskState::Assigned, TaskStatus::Ready);
        if let Err(e) = result {
            hlog_error!("Failed to return {} to ready: {}", task_id, e);
        }
    }

    /// Record a failed admission. Returns true if the task was escalated.
    async fn roll_back(&mut self, task_id: &TaskId, error: &Error, now: DateTime<Utc>) -> bool {
        let entry = self.rollbacks.entry(task_id.clone()).or_default();
        entry.count += 1;
        entry.last_error = error.to_string();
        let attempts = entry.count;
        let last_error = entry.last_error.clone();
        hlog_warn!(
            "Admission of {} rolled back ({}/{}): {}",
            task_id,
            attempts,
            self.config.max_admission_failures,
            error
        );

        if attempts < self.config.max_admission_failures {
            self.restore_ready(task_id).await;
            return false;
        }

        let reason = BlockReason::AdmissionFailures {
            attempts,
            last_error: last_error.clone(),
        };
        let blocked = self.graph.write().await.transition(
            task_id,
            TaskState::Assigned,
            TaskStatus::blocked(reason.clone()),
        );
        if let Err(e) = blocked {
            hlog_error!("Failed to block {}: {}", task_id, e);
            return false;
        }
        self.rollbacks.remove(task_id);
        hlog_error!("Task {} blocked: {}", task_id, reason);

        let escalation = ErrorReport {
            task_id: Some(task_id.clone()),
            worker_id: None,
            error: reason.to_string(),
            undelivered: None,
        };
        let sent = self.router.write().await.send(
            Endpoint::Scheduler,
            Endpoint::Operator,
            MessageKind::Error,
            &escalation,
            now,
        );
        if let Err(e) = sent {
            hlog_error!("Failed to escalate {}: {}", task_id, e);
        }
        true
    }
}
