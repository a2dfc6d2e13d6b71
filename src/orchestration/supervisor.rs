//! Worker supervision.
//!
//! The `WorkerSupervisor` owns every worker record. It launches workers,
//! enforces one live worker per role, tracks heartbeats and resource samples,
//! and decides whether a failed task is restarted or escalated.
//!
//! Health checks are pure bookkeeping: they report [`SupervisorEvent`]s and
//! leave acting on them (killing, merging, restarting) to the scheduler.
//! Killing a worker is the async [`kill_worker`], which releases the
//! supervisor lock while it waits out the grace period. [`complete_worker`]
//! does the same for a worker that reported success.

use crate::config::{Config, SupervisorConfig, WorkersConfig};
use crate::core::{ResourceSample, TaskId, Worker, WorkerId, WorkerRole, WorkerStatus};
use crate::orchestration::process::{LaunchSpec, WorkerLauncher, WorkerProcess};
use crate::orchestration::recovery::{
    self, FailureClass, FailureClassifier, RecoveryDecision, RetryTracker,
};
use crate::orchestration::resources::GateLevel;
use crate::util::elapsed;
use crate::{hlog, hlog_debug, hlog_error, hlog_warn, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Poll interval while waiting for a terminated worker to exit.
const KILL_POLL: Duration = Duration::from_millis(100);

/// What is needed to (re)launch a worker for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub task_id: TaskId,
    pub role: WorkerRole,
    pub workspace: PathBuf,
    pub branch: String,
}

/// A restart waiting out its backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRestart {
    pub request: SpawnRequest,
    /// 1-based restart number for the task.
    pub attempt: u32,
    pub due: DateTime<Utc>,
}

/// Observations from a health check.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// Heartbeats are overdue but the timeout has not elapsed.
    Stalled {
        worker_id: WorkerId,
        task_id: TaskId,
        silence: Duration,
    },
    /// Heartbeat timeout elapsed; the worker must be killed.
    KillRequired {
        worker_id: WorkerId,
        task_id: TaskId,
        silence: Duration,
    },
    /// The process exited on its own.
    Exited {
        worker_id: WorkerId,
        task_id: TaskId,
        code: i32,
    },
    /// No process handle, or the process cannot be queried.
    Lost {
        worker_id: WorkerId,
        task_id: TaskId,
        pid: Option<u32>,
    },
    /// Resource ceiling exceeded for the configured number of samples.
    Overshoot {
        worker_id: WorkerId,
        task_id: TaskId,
        sample: ResourceSample,
    },
}

/// Per-worker health summary for snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub worker_id: WorkerId,
    pub role: WorkerRole,
    pub task_id: TaskId,
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub silence_secs: u64,
    pub sample: Option<ResourceSample>,
    pub retries: u32,
    pub overshooting: bool,
}

struct Entry {
    record: Worker,
    process: Option<Arc<dyn WorkerProcess>>,
    /// Consecutive samples above a ceiling.
    overshoot: u32,
    killing: bool,
}

pub struct WorkerSupervisor {
    config: SupervisorConfig,
    commands: WorkersConfig,
    launcher: Arc<dyn WorkerLauncher>,
    classifier: FailureClassifier,
    /// Workers that have not reached a terminal status.
    workers: HashMap<WorkerId, Entry>,
    /// Role slot holders. A slot is held until its worker is terminal.
    role_slots: HashMap<WorkerRole, WorkerId>,
    retries: RetryTracker,
    pending_restarts: Vec<PendingRestart>,
    /// Terminal workers, oldest first.
    history: Vec<Worker>,
}

impl WorkerSupervisor {
    pub fn new(
        config: SupervisorConfig,
        commands: WorkersConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            config,
            commands,
            launcher,
            classifier: FailureClassifier::default(),
            workers: HashMap::new(),
            role_slots: HashMap::new(),
            retries: RetryTracker::new(),
            pending_restarts: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn from_config(config: &Config, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self::new(config.supervisor.clone(), config.workers.clone(), launcher)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn classifier(&self) -> &FailureClassifier {
        &self.classifier
    }

    /// Launch a worker for a task in its workspace.
    ///
    /// Fails with `RoleBusy` while another worker holds the role slot; the
    /// slot is taken only if the launch succeeds.
    pub fn spawn(&mut self, request: SpawnRequest, now: DateTime<Utc>) -> Result<WorkerId> {
        if let Some(holder) = self.role_holder(request.role) {
            return Err(Error::RoleBusy {
                role: request.role,
                holder,
            });
        }

        let mut worker = Worker::new(
            request.role,
            request.task_id.clone(),
            request.workspace.clone(),
            now,
        );
        worker.retry_count = self.retries.get_retries(&request.task_id);
        let command = self.commands.command_for(request.role);
        let spec = LaunchSpec {
            worker_id: worker.id,
            role: request.role,
            task_id: request.task_id.clone(),
            workspace: request.workspace,
            branch: request.branch,
            command: command.command,
            args: command.args,
            env: BTreeMap::new(),
        };

        let process = self.launcher.launch(&spec).inspect_err(|e| {
            hlog_error!(
                "Failed to launch {} worker for {}: {}",
                request.role,
                request.task_id,
                e
            );
        })?;
        worker.pid = process.pid();
        let id = worker.id;
        hlog!(
            "Spawned {} worker {} for task {} (pid {:?}, retry {})",
            worker.role,
            id,
            worker.task_id,
            worker.pid,
            worker.retry_count
        );
        self.role_slots.insert(request.role, id);
        self.workers.insert(
            id,
            Entry {
                record: worker,
                process: Some(process),
                overshoot: 0,
                killing: false,
            },
        );
        Ok(id)
    }

    /// Record a heartbeat. Heartbeats from terminal or dying workers are ignored.
    pub fn heartbeat(
        &mut self,
        id: WorkerId,
        sample: Option<ResourceSample>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(entry) = self.workers.get_mut(&id) else {
            if self.history.iter().any(|w| w.id == id) {
                hlog_debug!("Ignoring heartbeat from finished worker {}", id);
                return Ok(());
            }
            return Err(Error::WorkerNotFound(id));
        };
        if entry.killing {
            return Ok(());
        }
        entry.record.last_heartbeat = now;
        if sample.is_some() {
            entry.record.resource_sample = sample;
        }
        if entry.record.status != WorkerStatus::Running {
            hlog_debug!("Worker {} is running", id);
            entry.record.status = WorkerStatus::Running;
        }
        Ok(())
    }

    /// Inspect every live worker.
    ///
    /// Silence beyond the heartbeat interval marks a worker stalled; beyond
    /// the timeout it must be killed. Exited and unreachable processes are
    /// reported so the scheduler can finish or recover their tasks.
    pub fn check_health(&mut self, now: DateTime<Utc>) -> Vec<SupervisorEvent> {
        let interval = self.config.heartbeat_interval();
        let timeout = self.config.heartbeat_timeout();
        let cpu_ceiling = self.config.cpu_ceiling_percent;
        let memory_ceiling = self.config.memory_ceiling_mb;
        let overshoot_samples = self.config.overshoot_samples.max(1);

        let mut ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        ids.sort_by_key(|id| self.workers[id].record.spawned_at);

        let mut events = Vec::new();
        for id in ids {
            let Some(entry) = self.workers.get_mut(&id) else {
                continue;
            };
            if entry.killing {
                continue;
            }
            let task_id = entry.record.task_id.clone();

            match entry.process.as_ref().map(|p| p.try_wait()) {
                Some(Ok(Some(code))) => {
                    entry.record.exit_code = Some(code);
                    events.push(SupervisorEvent::Exited {
                        worker_id: id,
                        task_id,
                        code,
                    });
                    continue;
                }
                Some(Ok(None)) => {}
                Some(Err(e)) => {
                    hlog_warn!("Cannot query worker {}: {}", id, e);
                    events.push(SupervisorEvent::Lost {
                        worker_id: id,
                        task_id,
                        pid: entry.record.pid,
                    });
                    continue;
                }
                None => {
                    events.push(SupervisorEvent::Lost {
                        worker_id: id,
                        task_id,
                        pid: entry.record.pid,
                    });
                    continue;
                }
            }

            let silence = elapsed(entry.record.last_heartbeat, now);
            if silence > timeout {
                hlog_warn!("Worker {} silent for {:?}; killing", id, silence);
                events.push(SupervisorEvent::KillRequired {
                    worker_id: id,
                    task_id: task_id.clone(),
                    silence,
                });
                continue;
            }
            if silence > interval && entry.record.status != WorkerStatus::Stalled {
                hlog_warn!("Worker {} stalled ({:?} since heartbeat)", id, silence);
                entry.record.status = WorkerStatus::Stalled;
                events.push(SupervisorEvent::Stalled {
                    worker_id: id,
                    task_id: task_id.clone(),
                    silence,
                });
            }

            if let Some(sample) = entry.record.resource_sample {
                if sample.cpu_percent > cpu_ceiling || sample.memory_mb > memory_ceiling {
                    entry.overshoot += 1;
                    if entry.overshoot == overshoot_samples {
                        hlog_warn!(
                            "Worker {} over resource ceiling: {:.0}% cpu, {} MB",
                            id,
                            sample.cpu_percent,
                            sample.memory_mb
                        );
                        events.push(SupervisorEvent::Overshoot {
                            worker_id: id,
                            task_id,
                            sample,
                        });
                    }
                } else {
                    entry.overshoot = 0;
                }
            }
        }
        events
    }

    /// Refresh resource samples from the live processes.
    pub fn sample_resources(&mut self) {
        for entry in self.workers.values_mut() {
            if entry.killing {
                continue;
            }
            if let Some(sample) = entry.process.as_ref().and_then(|p| p.sample()) {
                entry.record.resource_sample = Some(sample);
            }
        }
    }

    /// Start killing a worker. Returns its process, if any, for signalling.
    pub fn begin_kill(&mut self, id: WorkerId) -> Result<Option<Arc<dyn WorkerProcess>>> {
        let entry = self.workers.get_mut(&id).ok_or(Error::WorkerNotFound(id))?;
        entry.killing = true;
        Ok(entry.process.clone())
    }

    /// Record a killed worker as dead and release its workspace and role slot.
    pub fn finish_kill(&mut self, id: WorkerId, reason: &str, now: DateTime<Utc>) -> Result<Worker> {
        self.finish(id, WorkerStatus::Dead, None, Some(reason.to_string()), now)
    }

    /// Record a worker whose process exited on its own.
    pub fn worker_exited(&mut self, id: WorkerId, code: i32, now: DateTime<Utc>) -> Result<Worker> {
        if code == 0 {
            self.finish(id, WorkerStatus::Completed, Some(code), None, now)
        } else {
            let error = format!("worker exited with code {}", code);
            self.finish(id, WorkerStatus::Failed, Some(code), Some(error), now)
        }
    }

    /// Record a worker that reported completion through a message. Its
    /// process must already be gone; see [`complete_worker`].
    fn worker_completed(
        &mut self,
        id: WorkerId,
        exit_code: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<Worker> {
        self.finish(id, WorkerStatus::Completed, exit_code, None, now)
    }

    fn finish(
        &mut self,
        id: WorkerId,
        status: WorkerStatus,
        exit_code: Option<i32>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Worker> {
        let current = self
            .workers
            .get(&id)
            .map(|e| e.record.status)
            .ok_or(Error::WorkerNotFound(id))?;
        if !current.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                entity: format!("worker {}", id),
                from: current.to_string(),
                to: status.to_string(),
            });
        }
        let Some(entry) = self.workers.remove(&id) else {
            return Err(Error::WorkerNotFound(id));
        };

        let mut worker = entry.record;
        worker.status = status;
        worker.error = error;
        if exit_code.is_some() {
            worker.exit_code = exit_code;
        }
        worker.finished_at = Some(now);
        worker.workspace_path = None;
        if self.role_slots.get(&worker.role) == Some(&id) {
            self.role_slots.remove(&worker.role);
        }
        hlog!(
            "Worker {} ({}) for task {} is {}",
            id,
            worker.role,
            worker.task_id,
            status
        );
        self.history.push(worker.clone());
        self.prune_history();
        Ok(worker)
    }

    fn prune_history(&mut self) {
        let excess = self.history.len().saturating_sub(self.config.history_limit);
        if excess > 0 {
            self.history.drain(..excess);
        }
    }

    /// Decide how to recover a task whose worker failed, queueing a restart
    /// when one is granted.
    pub fn on_failure(
        &mut self,
        request: SpawnRequest,
        class: FailureClass,
        error: &str,
        now: DateTime<Utc>,
    ) -> RecoveryDecision {
        let decision = recovery::decide(
            &mut self.retries,
            &request.task_id,
            class,
            error,
            self.config.max_retries,
            self.config.backoff_cap(),
            now,
        );
        match &decision {
            RecoveryDecision::Restart {
                attempt,
                delay,
                due,
            } => {
                hlog_warn!(
                    "Restarting task {} in {:?} (attempt {}/{}): {}",
                    request.task_id,
                    delay,
                    attempt,
                    self.config.max_retries,
                    error
                );
                self.pending_restarts.push(PendingRestart {
                    request,
                    attempt: *attempt,
                    due: *due,
                });
            }
            RecoveryDecision::Block(reason) => {
                hlog_error!("Task {} blocked: {}", request.task_id, reason);
            }
            RecoveryDecision::Fail(error) => {
                hlog_error!("Task {} failed permanently: {}", request.task_id, error);
            }
        }
        decision
    }

    /// Queue a restart directly, bypassing the retry budget.
    pub fn schedule_restart(&mut self, restart: PendingRestart) {
        self.pending_restarts.push(restart);
    }

    /// Remove and return restarts whose backoff has elapsed.
    pub fn due_restarts(&mut self, now: DateTime<Utc>) -> Vec<PendingRestart> {
        let (due, waiting): (Vec<_>, Vec<_>) = self
            .pending_restarts
            .drain(..)
            .partition(|r| r.due <= now);
        self.pending_restarts = waiting;
        due
    }

    pub fn pending_restarts(&self) -> &[PendingRestart] {
        &self.pending_restarts
    }

    pub fn has_pending_restart(&self, task_id: &TaskId) -> bool {
        self.pending_restarts
            .iter()
            .any(|r| &r.request.task_id == task_id)
    }

    /// Drop a pending restart, e.g. when its task was resolved another way.
    pub fn cancel_restart(&mut self, task_id: &TaskId) {
        self.pending_restarts.retain(|r| &r.request.task_id != task_id);
    }

    /// The task finished; its restart budget starts over.
    pub fn task_succeeded(&mut self, task_id: &TaskId) {
        self.retries.reset(task_id);
    }

    pub fn retries_for(&self, task_id: &TaskId) -> u32 {
        self.retries.get_retries(task_id)
    }

    pub fn role_holder(&self, role: WorkerRole) -> Option<WorkerId> {
        self.role_slots.get(&role).copied()
    }

    pub fn get(&self, id: WorkerId) -> Option<&Worker> {
        self.workers
            .get(&id)
            .map(|e| &e.record)
            .or_else(|| self.history.iter().rev().find(|w| w.id == id))
    }

    /// The non-terminal worker carrying a task, if any.
    pub fn worker_for_task(&self, task_id: &TaskId) -> Option<&Worker> {
        self.workers
            .values()
            .map(|e| &e.record)
            .find(|w| &w.task_id == task_id)
    }

    pub fn live_count(&self) -> usize {
        self.workers.len()
    }

    /// Every worker record, live ones first.
    pub fn workers(&self) -> Vec<Worker> {
        let mut live: Vec<Worker> = self.workers.values().map(|e| e.record.clone()).collect();
        live.sort_by_key(|w| w.spawned_at);
        live.extend(self.history.iter().cloned());
        live
    }

    pub fn worker_health(&self, now: DateTime<Utc>) -> Vec<WorkerHealth> {
        let mut health: Vec<WorkerHealth> = self
            .workers
            .values()
            .map(|e| WorkerHealth {
                worker_id: e.record.id,
                role: e.record.role,
                task_id: e.record.task_id.clone(),
                status: e.record.status,
                pid: e.record.pid,
                silence_secs: elapsed(e.record.last_heartbeat, now).as_secs(),
                sample: e.record.resource_sample,
                retries: self.retries.get_retries(&e.record.task_id),
                overshooting: e.overshoot >= self.config.overshoot_samples.max(1),
            })
            .collect();
        health.sort_by_key(|h| h.role);
        health
    }

    /// `warning` while any worker is stalled or over its resource ceiling.
    pub fn health_level(&self) -> GateLevel {
        let threshold = self.config.overshoot_samples.max(1);
        let degraded = self
            .workers
            .values()
            .any(|e| e.record.status == WorkerStatus::Stalled || e.overshoot >= threshold);
        if degraded {
            GateLevel::Warning
        } else {
            GateLevel::Ok
        }
    }

    /// Load persisted workers.
    ///
    /// Non-terminal workers come back without a process handle, so the next
    /// health check reports them lost and their tasks go through recovery.
    pub fn restore(&mut self, workers: Vec<Worker>) {
        self.workers.clear();
        self.role_slots.clear();
        self.history.clear();
        for worker in workers {
            if worker.status.is_terminal() {
                self.history.push(worker);
                continue;
            }
            self.role_slots.insert(worker.role, worker.id);
            self.workers.insert(
                worker.id,
                Entry {
                    record: worker,
                    process: None,
                    overshoot: 0,
                    killing: false,
                },
            );
        }
        self.prune_history();
    }
}

/// Terminate a worker: SIGTERM, wait out the grace period, then SIGKILL.
///
/// The supervisor lock is not held while waiting. The worker ends `dead`
/// with its workspace handle and role slot released.
pub async fn kill_worker(
    supervisor: &RwLock<WorkerSupervisor>,
    id: WorkerId,
    reason: &str,
) -> Result<Worker> {
    let (process, grace) = {
        let mut sup = supervisor.write().await;
        (sup.begin_kill(id)?, sup.config.kill_grace())
    };
    if let Some(process) = process {
        stop_process(id, process.as_ref(), grace).await;
    }
    supervisor
        .write()
        .await
        .finish_kill(id, reason, chrono::Utc::now())
}

/// Finish a worker that reported completion through a message.
///
/// The role slot stays held until the process is gone: a worker still
/// running after its report is stopped the same way [`kill_worker`] does it.
/// The worker ends `completed`.
pub async fn complete_worker(supervisor: &RwLock<WorkerSupervisor>, id: WorkerId) -> Result<Worker> {
    let (process, grace) = {
        let mut sup = supervisor.write().await;
        (sup.begin_kill(id)?, sup.config.kill_grace())
    };
    let code = match process {
        Some(process) => match process.try_wait() {
            Ok(Some(code)) => Some(code),
            _ => {
                hlog_debug!("Worker {} still running after completion; stopping it", id);
                stop_process(id, process.as_ref(), grace).await
            }
        },
        None => None,
    };
    supervisor
        .write()
        .await
        .worker_completed(id, code, chrono::Utc::now())
}

/// SIGTERM, poll for exit until `grace` runs out, then SIGKILL.
/// Returns the exit code if the process exited on SIGTERM.
async fn stop_process(id: WorkerId, process: &dyn WorkerProcess, grace: Duration) -> Option<i32> {
    if let Err(e) = process.terminate() {
        hlog_warn!("SIGTERM to worker {} failed: {}", id, e);
    }
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        match process.try_wait() {
            Ok(Some(code)) => {
                hlog_debug!("Worker {} exited with {} after SIGTERM", id, code);
                return Some(code);
            }
            Ok(None) => {}
            Err(e) => {
                hlog_warn!("Lost track of worker {} during kill: {}", id, e);
                return None;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            hlog_warn!("Worker {} ignored SIGTERM for {:?}; sending SIGKILL", id, grace);
            if let Err(e) = process.force_kill() {
                hlog_error!("SIGKILL to worker {} failed: {}", id, e);
            }
            return None;
        }
        tokio::time::sleep(KILL_POLL.min(grace)).await;
    }
}
