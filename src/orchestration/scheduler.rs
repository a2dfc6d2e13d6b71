//! The scheduler loop.
//!
//! One [`Scheduler::step`] drains worker messages, acts on supervisor health
//! events, relaunches workers whose backoff has elapsed, admits ready tasks
//! and expires undeliverable messages. [`Scheduler::run`] repeats it on the
//! tick interval with the deadlock detector running alongside, until every
//! task is settled or the run is cancelled.

use crate::config::Config;
use crate::core::{
    BlockReason, Completion, DependencyUnblocked, Endpoint, ErrorReport, GraphStore, Heartbeat,
    MessageId, MessageKind, TaskId, TaskState, TaskStatus, WorkAssignment, WorkerId, WorkerRole,
};
use crate::orchestration::admission::{AdmissionController, TickReport};
use crate::orchestration::deadlock::{analyze, DeadlockDetector};
use crate::orchestration::inbox::Inbox;
use crate::orchestration::process::WorkerLauncher;
use crate::orchestration::recovery::{FailureClass, RecoveryDecision};
use crate::orchestration::resources::{ResourceGate, ResourceProbe};
use crate::orchestration::router::MessageRouter;
use crate::orchestration::supervisor::{
    complete_worker, kill_worker, PendingRestart, SpawnRequest, SupervisorEvent, WorkerSupervisor,
};
use crate::snapshot::{Snapshot, SnapshotPublisher};
use crate::store::{PersistedState, StateStore, STATE_VERSION};
use crate::util::elapsed;
use crate::workspace::WorkspaceManager;
use crate::{hlog, hlog_debug, hlog_error, hlog_warn, Error, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Messages taken from one inbox per step.
const MESSAGE_BATCH: usize = 64;

/// Task lifecycle changes, for callers that want to react without polling.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A worker was launched for the task, on admission or restart.
    TaskStarted { task_id: TaskId, worker_id: WorkerId },
    /// The task's worker failed and a restart is queued.
    TaskRestarting {
        task_id: TaskId,
        attempt: u32,
        delay: Duration,
    },
    /// Merged into the base branch.
    TaskCompleted {
        task_id: TaskId,
        commit: Option<String>,
    },
    TaskFailed { task_id: TaskId, error: String },
    TaskBlocked { task_id: TaskId, reason: BlockReason },
    /// Nothing left that can progress without an operator.
    AllTasksSettled,
}

/// What one step did.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub admission: TickReport,
    pub completed: Vec<TaskId>,
    /// Tasks whose worker was relaunched after a backoff.
    pub restarted: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub blocked: Vec<TaskId>,
    pub killed: Vec<WorkerId>,
    /// Messages addressed to the scheduler that were handled.
    pub messages: usize,
}

pub struct Scheduler {
    config: Config,
    graph: Arc<RwLock<GraphStore>>,
    workspaces: Arc<WorkspaceManager>,
    supervisor: Arc<RwLock<WorkerSupervisor>>,
    router: Arc<RwLock<MessageRouter>>,
    admission: AdmissionController,
    store: Option<StateStore>,
    inbox: Option<Inbox>,
    snapshot_path: Option<PathBuf>,
    snapshots: SnapshotPublisher,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
    last_sample: Option<DateTime<Utc>>,
    last_sweep: Option<DateTime<Utc>>,
    last_snapshot: Option<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        workspaces: Arc<WorkspaceManager>,
        launcher: Arc<dyn WorkerLauncher>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        let graph = Arc::new(RwLock::new(GraphStore::new()));
        let supervisor = Arc::new(RwLock::new(WorkerSupervisor::from_config(&config, launcher)));
        let router = Arc::new(RwLock::new(MessageRouter::new(config.router.clone())));
        let admission = AdmissionController::new(
            config.scheduler.clone(),
            graph.clone(),
            workspaces.clone(),
            supervisor.clone(),
            router.clone(),
            ResourceGate::new(config.resources.clone(), probe),
        );
        Self {
            config,
            graph,
            workspaces,
            supervisor,
            router,
            admission,
            store: None,
            inbox: None,
            snapshot_path: None,
            snapshots: SnapshotPublisher::new(),
            event_tx: None,
            last_sample: None,
            last_sweep: None,
            last_snapshot: None,
        }
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_inbox(mut self, inbox: Inbox) -> Self {
        self.inbox = Some(inbox);
        self
    }

    pub fn with_snapshot_path(mut self, path: PathBuf) -> Self {
        self.snapshot_path = Some(path);
        self
    }

    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn graph(&self) -> &Arc<RwLock<GraphStore>> {
        &self.graph
    }

    pub fn supervisor(&self) -> &Arc<RwLock<WorkerSupervisor>> {
        &self.supervisor
    }

    pub fn router(&self) -> &Arc<RwLock<MessageRouter>> {
        &self.router
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }

    pub fn snapshots(&self) -> &SnapshotPublisher {
        &self.snapshots
    }

    /// Run steps on the tick interval until every task is settled or
    /// `cancel` fires. Returns the final snapshot.
    ///
    /// On cancellation live workers are killed; their tasks stay `running`
    /// and are relaunched by the next [`Scheduler::restore`].
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<Snapshot> {
        let detector = DeadlockDetector::new(
            self.graph.clone(),
            self.router.clone(),
            self.config.deadlock.interval(),
        );
        let detector_cancel = cancel.child_token();
        let detector_handle = tokio::spawn(detector.run(detector_cancel.clone()));

        let mut ticker = tokio::time::interval(self.config.scheduler.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        hlog!(
            "Scheduler started: max_parallel={}, tick={:?}",
            self.config.scheduler.max_parallel,
            self.config.scheduler.tick_interval()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    hlog!("Scheduler cancelled");
                    self.shutdown_workers().await;
                    break;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.step(Utc::now()).await {
                hlog_error!("Scheduler step failed: {}", e);
            }
            if self.is_drained().await {
                hlog!("All tasks settled");
                self.emit(SchedulerEvent::AllTasksSettled);
                break;
            }
        }

        detector_cancel.cancel();
        if let Err(e) = detector_handle.await {
            hlog_warn!("Deadlock detector ended abnormally: {}", e);
        }

        let now = Utc::now();
        let snapshot = self.publish_snapshot(now).await?;
        self.persist(now).await?;
        Ok(snapshot)
    }

    /// One pass of the scheduling loop at time `now`.
    pub async fn step(&mut self, now: DateTime<Utc>) -> Result<StepReport> {
        let mut report = StepReport::default();

        if let Some(inbox) = &self.inbox {
            if let Err(e) = inbox.drain(&self.router, now).await {
                hlog_warn!("Inbox drain failed: {}", e);
            }
        }
        self.process_heartbeats(now).await;
        self.process_messages(now, &mut report).await;
        self.process_health(now, &mut report).await;

        if due(self.last_sample, self.config.supervisor.health_interval(), now) {
            self.supervisor.write().await.sample_resources();
            self.last_sample = Some(now);
        }

        self.relaunch_due(now, &mut report).await;

        report.admission = self.admission.tick(now).await;
        for (task_id, worker_id) in &report.admission.admitted {
            self.emit(SchedulerEvent::TaskStarted {
                task_id: task_id.clone(),
                worker_id: *worker_id,
            });
        }
        for task_id in &report.admission.escalated {
            let reason = self.block_reason(task_id).await;
            report.blocked.push(task_id.clone());
            if let Some(reason) = reason {
                self.emit(SchedulerEvent::TaskBlocked {
                    task_id: task_id.clone(),
                    reason,
                });
            }
        }

        if let Some(inbox) = &self.inbox {
            if let Err(e) = inbox.deliver(&self.router, &WorkerRole::ALL, now).await {
                hlog_warn!("Inbox delivery failed: {}", e);
            }
        }

        if due(self.last_sweep, self.config.router.sweep_interval(), now) {
            self.router.write().await.sweep(now);
            self.last_sweep = Some(now);
        }

        if due(self.last_snapshot, self.config.scheduler.snapshot_interval(), now) {
            self.last_snapshot = Some(now);
            self.publish_snapshot(now).await?;
            self.persist(now).await?;
        }

        Ok(report)
    }

    /// Every task is settled, no worker is alive and no restart is queued.
    pub async fn is_drained(&self) -> bool {
        if !self.graph.read().await.is_settled() {
            return false;
        }
        let supervisor = self.supervisor.read().await;
        supervisor.live_count() == 0 && supervisor.pending_restarts().is_empty()
    }

    /// Operator recovery for a blocked task. Its restart budget and
    /// admission failure count start over.
    pub async fn unblock(&mut self, task_id: &TaskId) -> Result<TaskStatus> {
        let status = self.graph.write().await.unblock(task_id)?;
        {
            let mut supervisor = self.supervisor.write().await;
            supervisor.task_succeeded(task_id);
            supervisor.cancel_restart(task_id);
        }
        self.admission.reset_failures(task_id);
        hlog!("Task {} unblocked, now {}", task_id, status.state());
        Ok(status)
    }

    async fn process_heartbeats(&self, now: DateTime<Utc>) {
        let messages = self
            .router
            .write()
            .await
            .poll(Endpoint::Supervisor, MESSAGE_BATCH, now);
        for message in messages {
            match message.kind {
                MessageKind::HeartbeatAck => match message.payload_as::<Heartbeat>() {
                    Ok(beat) => {
                        let recorded = self
                            .supervisor
                            .write()
                            .await
                            .heartbeat(beat.worker_id, beat.sample, now);
                        if let Err(e) = recorded {
                            hlog_debug!("Ignoring heartbeat: {}", e);
                        }
                    }
                    Err(e) => hlog_warn!("Malformed heartbeat {}: {}", message.id, e),
                },
                other => hlog_debug!("Supervisor ignoring {:?} message {}", other, message.id),
            }
            self.acknowledge(message.id, now).await;
        }
    }

    async fn process_messages(&mut self, now: DateTime<Utc>, report: &mut StepReport) {
        let messages = self
            .router
            .write()
            .await
            .poll(Endpoint::Scheduler, MESSAGE_BATCH, now);
        for message in messages {
            report.messages += 1;
            match message.kind {
                MessageKind::Completion => match message.payload_as::<Completion>() {
                    Ok(completion) => self.on_completion_report(completion, now, report).await,
                    Err(e) => hlog_warn!("Malformed completion {}: {}", message.id, e),
                },
                MessageKind::Error => match message.payload_as::<ErrorReport>() {
                    Ok(error) => self.on_error_report(error, now, report).await,
                    Err(e) => hlog_warn!("Malformed error report {}: {}", message.id, e),
                },
                MessageKind::DependencyUnblocked => {
                    if let Ok(note) = message.payload_as::<DependencyUnblocked>() {
                        hlog_debug!("Task {} unblocked by {}", note.task_id, note.completed);
                    }
                }
                other => hlog_debug!("Scheduler ignoring {:?} message {}", other, message.id),
            }
            self.acknowledge(message.id, now).await;
        }
    }

    async fn acknowledge(&self, id: MessageId, now: DateTime<Utc>) {
        if let Err(e) = self.router.write().await.acknowledge(id, now) {
            hlog_debug!("Could not acknowledge {}: {}", id, e);
        }
    }

    /// A worker says it is done. Repeated reports for the same worker are
    /// ignored because the worker is already terminal.
    async fn on_completion_report(
        &mut self,
        completion: Completion,
        now: DateTime<Utc>,
        report: &mut StepReport,
    ) {
        match complete_worker(&self.supervisor, completion.worker_id).await {
            Ok(worker) => {
                if worker.task_id != completion.task_id {
                    hlog_warn!(
                        "Worker {} reported completion of {} but carries {}",
                        worker.id,
                        completion.task_id,
                        worker.task_id
                    );
                }
                self.complete_task(&worker.task_id, now, report).await;
            }
            Err(e) => hlog_debug!("Ignoring completion from {}: {}", completion.worker_id, e),
        }
    }

    async fn on_error_report(&mut self, error: ErrorReport, now: DateTime<Utc>, report: &mut StepReport) {
        if let Some(id) = error.undelivered {
            hlog_warn!("Message {} was never delivered: {}", id, error.error);
            return;
        }
        let Some(worker_id) = error.worker_id else {
            hlog_warn!("Error report without a worker: {}", error.error);
            return;
        };
        let task_id = match self.supervisor.read().await.get(worker_id) {
            Some(worker) if !worker.status.is_terminal() => worker.task_id.clone(),
            _ => {
                hlog_debug!("Ignoring error from finished worker {}", worker_id);
                return;
            }
        };

        hlog_warn!("Worker {} reported failure: {}", worker_id, error.error);
        if let Err(e) = kill_worker(&self.supervisor, worker_id, &error.error).await {
            hlog_warn!("Kill of worker {} failed: {}", worker_id, e);
        }
        report.killed.push(worker_id);
        let class = self.supervisor.read().await.classifier().classify_report(&error.error);
        self.recover(&task_id, class, &error.error, now, report).await;
    }

    async fn process_health(&mut self, now: DateTime<Utc>, report: &mut StepReport) {
        let events = self.supervisor.write().await.check_health(now);
        let mut kills = Vec::new();

        for event in events {
            match event {
                SupervisorEvent::KillRequired {
                    worker_id,
                    task_id,
                    silence,
                } => kills.push((worker_id, task_id, silence)),
                SupervisorEvent::Exited {
                    worker_id,
                    task_id,
                    code,
                } => {
                    let finished = self.supervisor.write().await.worker_exited(worker_id, code, now);
                    match finished {
                        Ok(_) if code == 0 => self.complete_task(&task_id, now, report).await,
                        Ok(worker) => {
                            let error = worker
                                .error
                                .unwrap_or_else(|| format!("worker exited with code {}", code));
                            let class =
                                self.supervisor.read().await.classifier().classify_report(&error);
                            self.recover(&task_id, class, &error, now, report).await;
                        }
                        Err(e) => hlog_warn!("Could not record exit of {}: {}", worker_id, e),
                    }
                }
                SupervisorEvent::Lost {
                    worker_id,
                    task_id,
                    pid,
                } => {
                    let error = Error::ProcessNotFound { id: worker_id, pid };
                    if let Err(e) =
                        self.supervisor
                            .write()
                            .await
                            .finish_kill(worker_id, &error.to_string(), now)
                    {
                        hlog_warn!("Could not retire lost worker {}: {}", worker_id, e);
                    }
                    self.recover_from(&task_id, &error, now, report).await;
                }
                // Logged by the supervisor and folded into its health level.
                SupervisorEvent::Stalled { .. } | SupervisorEvent::Overshoot { .. } => {}
            }
        }

        if kills.is_empty() {
            return;
        }
        let supervisor = &self.supervisor;
        let results = join_all(
            kills
                .iter()
                .map(|(worker_id, _, _)| kill_worker(supervisor, *worker_id, "heartbeat timeout")),
        )
        .await;
        for ((worker_id, task_id, silence), result) in kills.into_iter().zip(results) {
            if let Err(e) = result {
                hlog_warn!("Kill of worker {} failed: {}", worker_id, e);
            }
            report.killed.push(worker_id);
            let error = Error::HeartbeatTimeout {
                id: worker_id,
                silence,
            };
            self.recover_from(&task_id, &error, now, report).await;
        }
    }

    async fn recover_from(&mut self, task_id: &TaskId, error: &Error, now: DateTime<Utc>, report: &mut StepReport) {
        let class = self.supervisor.read().await.classifier().classify(error);
        self.recover(task_id, class, &error.to_string(), now, report).await;
    }

    /// The worker for a running task is gone. Queue a restart, or settle the
    /// task as blocked or failed and escalate once.
    async fn recover(
        &mut self,
        task_id: &TaskId,
        class: FailureClass,
        error: &str,
        now: DateTime<Utc>,
        report: &mut StepReport,
    ) {
        let Some(request) = self.spawn_request(task_id).await else {
            hlog_debug!("Task {} is not running; nothing to recover", task_id);
            return;
        };
        let decision = self
            .supervisor
            .write()
            .await
            .on_failure(request, class, error, now);
        match decision {
            RecoveryDecision::Restart { attempt, delay, .. } => {
                self.emit(SchedulerEvent::TaskRestarting {
                    task_id: task_id.clone(),
                    attempt,
                    delay,
                });
            }
            RecoveryDecision::Block(reason) => {
                if self
                    .settle(task_id, TaskStatus::blocked(reason.clone()), &reason.to_string(), now)
                    .await
                {
                    report.blocked.push(task_id.clone());
                    self.emit(SchedulerEvent::TaskBlocked {
                        task_id: task_id.clone(),
                        reason,
                    });
                }
            }
            RecoveryDecision::Fail(error) => {
                self.fail(task_id, error, now, report).await;
            }
        }
    }

    async fn fail(&mut self, task_id: &TaskId, error: String, now: DateTime<Utc>, report: &mut StepReport) {
        let status = TaskStatus::Failed {
            error: error.clone(),
        };
        if self.settle(task_id, status, &error, now).await {
            report.failed.push(task_id.clone());
            self.emit(SchedulerEvent::TaskFailed {
                task_id: task_id.clone(),
                error,
            });
        }
    }

    /// Move a running task to a terminal or blocked status and tell the
    /// operator. Returns false if the task had already moved on.
    async fn settle(&self, task_id: &TaskId, status: TaskStatus, error: &str, now: DateTime<Utc>) -> bool {
        let worker_id = {
            let mut graph = self.graph.write().await;
            let worker_id = graph.get_task(task_id).and_then(|t| t.worker_id);
            if let Err(e) = graph.transition(task_id, TaskState::Running, status) {
                hlog_error!("Could not settle {}: {}", task_id, e);
                return false;
            }
            worker_id
        };
        self.supervisor.write().await.cancel_restart(task_id);

        let escalation = ErrorReport {
            task_id: Some(task_id.clone()),
            worker_id,
            error: error.to_string(),
            undelivered: None,
        };
        self.send(Endpoint::Operator, MessageKind::Error, &escalation, now)
            .await;
        true
    }

    /// Merge, clean up and complete a task whose worker finished, then
    /// promote its dependents.
    async fn complete_task(&mut self, task_id: &TaskId, now: DateTime<Utc>, report: &mut StepReport) {
        let outcome = match self.workspaces.merge(task_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail(task_id, e.to_string(), now, report).await;
                return;
            }
        };
        if let Err(e) = self.workspaces.cleanup(task_id).await {
            hlog_warn!("Cleanup of {} left for the orphan sweep: {}", task_id, e);
        }

        let promoted = match self.graph.write().await.mark_completed(task_id) {
            Ok(promoted) => promoted,
            Err(e) => {
                hlog_error!("Could not complete {}: {}", task_id, e);
                return;
            }
        };
        self.supervisor.write().await.task_succeeded(task_id);
        self.admission.reset_failures(task_id);

        for dependent in &promoted {
            let note = DependencyUnblocked {
                task_id: dependent.clone(),
                completed: task_id.clone(),
            };
            self.send(Endpoint::Scheduler, MessageKind::DependencyUnblocked, &note, now)
                .await;
        }
        hlog!(
            "Task {} completed; {} dependent(s) ready",
            task_id,
            promoted.len()
        );
        report.completed.push(task_id.clone());
        self.emit(SchedulerEvent::TaskCompleted {
            task_id: task_id.clone(),
            commit: outcome.commit().map(str::to_string),
        });
    }

    /// Relaunch workers whose backoff has elapsed, in their existing workspace.
    async fn relaunch_due(&mut self, now: DateTime<Utc>, report: &mut StepReport) {
        let due = self.supervisor.write().await.due_restarts(now);
        for restart in due {
            let task_id = restart.request.task_id.clone();
            let scope = match self.graph.read().await.get_task(&task_id) {
                Some(task) if task.state() == TaskState::Running => task.scope.clone(),
                _ => {
                    hlog_debug!("Dropping restart for {}: no longer running", task_id);
                    continue;
                }
            };

            let spawned = self
                .supervisor
                .write()
                .await
                .spawn(restart.request.clone(), now);
            match spawned {
                Ok(worker_id) => {
                    let recorded = self.graph.write().await.record_assignment(
                        &task_id,
                        worker_id,
                        restart.request.workspace.clone(),
                        &restart.request.branch,
                    );
                    if let Err(e) = recorded {
                        hlog_error!("Could not record restart of {}: {}", task_id, e);
                    }
                    let assignment = WorkAssignment {
                        task_id: task_id.clone(),
                        worker_id,
                        scope,
                        branch: restart.request.branch.clone(),
                        workspace: restart.request.workspace.clone(),
                    };
                    self.send(
                        Endpoint::Worker(restart.request.role),
                        MessageKind::WorkAssignment,
                        &assignment,
                        now,
                    )
                    .await;
                    hlog!(
                        "Relaunched task {} (attempt {}) as worker {}",
                        task_id,
                        restart.attempt,
                        worker_id
                    );
                    report.restarted.push(task_id.clone());
                    self.emit(SchedulerEvent::TaskStarted { task_id, worker_id });
                }
                Err(Error::RoleBusy { role, holder }) => {
                    hlog_debug!("Restart of {} waits for role {} ({})", task_id, role, holder);
                    self.supervisor.write().await.schedule_restart(restart);
                }
                Err(e) => self.recover_from(&task_id, &e, now, report).await,
            }
        }
    }

    async fn spawn_request(&self, task_id: &TaskId) -> Option<SpawnRequest> {
        let graph = self.graph.read().await;
        let task = graph.get_task(task_id)?;
        if task.state() != TaskState::Running {
            return None;
        }
        let handle = self.workspaces.handle_for(task_id);
        Some(SpawnRequest {
            task_id: task_id.clone(),
            role: task.role,
            workspace: task.worktree_path.clone().unwrap_or(handle.path),
            branch: task.branch_name.clone().unwrap_or(handle.branch),
        })
    }

    async fn block_reason(&self, task_id: &TaskId) -> Option<BlockReason> {
        match &self.graph.read().await.get_task(task_id)?.status {
            TaskStatus::Blocked { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    async fn send<T: Serialize>(&self, recipient: Endpoint, kind: MessageKind, payload: &T, now: DateTime<Utc>) {
        let sent = self
            .router
            .write()
            .await
            .send(Endpoint::Scheduler, recipient, kind, payload, now);
        if let Err(e) = sent {
            hlog_error!("Failed to send {:?} to {}: {}", kind, recipient, e);
        }
    }

    async fn shutdown_workers(&self) {
        let live: Vec<WorkerId> = self
            .supervisor
            .read()
            .await
            .workers()
            .into_iter()
            .filter(|w| !w.status.is_terminal())
            .map(|w| w.id)
            .collect();
        if live.is_empty() {
            return;
        }
        hlog!("Stopping {} worker(s)", live.len());
        let supervisor = &self.supervisor;
        let results = join_all(
            live.iter()
                .map(|id| kill_worker(supervisor, *id, "scheduler shutdown")),
        )
        .await;
        for (id, result) in live.iter().zip(results) {
            if let Err(e) = result {
                hlog_warn!("Could not stop worker {}: {}", id, e);
            }
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            if let Err(e) = tx.try_send(event) {
                hlog_debug!("Scheduler event dropped: {}", e);
            }
        }
    }

    // ---- persistence and snapshots ----

    /// Load saved state, if a store is configured and holds any.
    pub async fn restore(&mut self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(state) = store.load().await? else {
            return Ok(false);
        };
        self.restore_state(state, Utc::now()).await;
        Ok(true)
    }

    /// Replace in-memory state with `state`.
    ///
    /// Tasks caught mid-admission go back to `ready`. Running tasks whose
    /// worker was stopped cleanly get a restart that does not count against
    /// their budget; workers that were still alive come back without a
    /// process and are reported lost by the next health check.
    pub async fn restore_state(&mut self, state: PersistedState, now: DateTime<Utc>) {
        let task_count = state.tasks.len();
        let worker_count = state.workers.len();
        *self.graph.write().await = GraphStore::restore(state.tasks, state.edges);
        self.workspaces.restore(state.workspaces);
        self.supervisor.write().await.restore(state.workers);
        self.router.write().await.restore(state.messages);

        let (assigned, running): (Vec<TaskId>, Vec<TaskId>) = {
            let graph = self.graph.read().await;
            let assigned = graph
                .tasks()
                .into_iter()
                .filter(|t| t.state() == TaskState::Assigned)
                .map(|t| t.id.clone())
                .collect();
            let running = graph
                .tasks()
                .into_iter()
                .filter(|t| t.state() == TaskState::Running)
                .map(|t| t.id.clone())
                .collect();
            (assigned, running)
        };

        for id in &assigned {
            let reverted = self
                .graph
                .write()
                .await
                .transition(id, TaskState::Assigned, TaskStatus::Ready);
            if let Err(e) = reverted {
                hlog_warn!("Could not return {} to ready: {}", id, e);
            }
        }

        for id in &running {
            let orphaned = {
                let supervisor = self.supervisor.read().await;
                supervisor.worker_for_task(id).is_none() && !supervisor.has_pending_restart(id)
            };
            if !orphaned {
                continue;
            }
            if let Some(request) = self.spawn_request(id).await {
                let mut supervisor = self.supervisor.write().await;
                let attempt = supervisor.retries_for(id);
                supervisor.schedule_restart(PendingRestart {
                    request,
                    attempt,
                    due: now,
                });
            }
        }

        let cycles = analyze(&*self.graph.read().await, now);
        if !cycles.is_clear() {
            hlog_warn!("Restored graph has {} dependency cycle(s)", cycles.cycles.len());
        }
        hlog!(
            "Restored {} task(s), {} worker record(s); {} resumed, {} re-queued",
            task_count,
            worker_count,
            running.len(),
            assigned.len()
        );
    }

    pub async fn persisted_state(&self, now: DateTime<Utc>) -> PersistedState {
        let (tasks, edges) = {
            let graph = self.graph.read().await;
            (
                graph.all_tasks().into_iter().cloned().collect(),
                graph.edges(),
            )
        };
        let workers = self.supervisor.read().await.workers();
        let messages = self.router.read().await.messages();
        PersistedState {
            version: STATE_VERSION,
            saved_at: now,
            tasks,
            edges,
            workers,
            workspaces: self.workspaces.list(),
            messages,
        }
    }

    /// Save state, if a store is configured.
    pub async fn persist(&self, now: DateTime<Utc>) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.save(&self.persisted_state(now).await).await
    }

    pub async fn snapshot(&self, now: DateTime<Utc>) -> Snapshot {
        let (tasks, cycles) = {
            let graph = self.graph.read().await;
            let tasks = graph
                .count_by_state()
                .into_iter()
                .map(|(state, n)| (state.to_string(), n))
                .collect();
            (tasks, analyze(&graph, now))
        };
        let (workers, pending_restarts) = {
            let supervisor = self.supervisor.read().await;
            (
                supervisor.worker_health(now),
                supervisor.pending_restarts().len(),
            )
        };
        let workspaces = self
            .workspaces
            .count_by_status()
            .into_iter()
            .map(|(status, n)| (status.to_string(), n))
            .collect();
        let messages = self.router.read().await.count_by_status();
        Snapshot {
            taken_at: Some(now),
            tasks,
            workers,
            workspaces,
            messages,
            pending_restarts,
            gate: Some(self.admission.gate().check()),
            cycles: Some(cycles),
        }
    }

    async fn publish_snapshot(&self, now: DateTime<Utc>) -> Result<Snapshot> {
        let snapshot = self.snapshot(now).await;
        if let Some(path) = &self.snapshot_path {
            snapshot.write_to(path).await?;
        }
        self.snapshots.publish(snapshot.clone());
        Ok(snapshot)
    }
}

fn due(last: Option<DateTime<Utc>>, every: Duration, now: DateTime<Utc>) -> bool {
    last.map_or(true, |at| elapsed(at, now) >= every)
}
