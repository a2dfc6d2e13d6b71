//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Scripted worker processes that exit, hang or commit on demand
//! - A scheduler wired to both

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use git2::{Repository, Signature};
use tempfile::TempDir;
use tokio::sync::mpsc;

use hive::config::Config;
use hive::core::{ResourceSample, Task, TaskId, TaskState, TaskStatus, WorkerRole};
use hive::git::GitOps;
use hive::orchestration::{
    HostSample, LaunchSpec, Scheduler, SchedulerEvent, StaticProbe, WorkerLauncher, WorkerProcess,
};
use hive::store::StateStore;
use hive::workspace::WorkspaceManager;
use hive::{Error, Result};

/// A test repository with one commit on its default branch.
pub struct TestRepo {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        let repo = Repository::init(&path).expect("Failed to init repository");
        std::fs::write(path.join("README.md"), "# Test Repository\n").unwrap();
        commit_all(&repo, "Initial commit");
        Self { temp_dir, path }
    }

    /// Content of `file` at the tip of `branch`, if present.
    pub fn read_on_branch(&self, branch: &str, file: &str) -> Option<String> {
        let repo = Repository::open(&self.path).ok()?;
        let commit = repo
            .find_branch(branch, git2::BranchType::Local)
            .ok()?
            .into_reference()
            .peel_to_commit()
            .ok()?;
        let entry = commit.tree().ok()?.get_path(Path::new(file)).ok()?;
        let blob = repo.find_blob(entry.id()).ok()?;
        Some(String::from_utf8_lossy(blob.content()).to_string())
    }
}

fn commit_all(repo: &Repository, message: &str) {
    let mut index = repo.index().unwrap();
    index
        .add_all(["."].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("Test User", "test@test.com").unwrap();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap();
}

/// A worker process driven by the test.
#[derive(Default)]
pub struct ScriptedProcess {
    exit: Mutex<Option<i32>>,
    /// Ignore SIGTERM; only SIGKILL ends it.
    pub stubborn: bool,
    pub terminated: AtomicU32,
    pub killed: AtomicU32,
}

impl ScriptedProcess {
    pub fn exit_with(&self, code: i32) {
        *self.exit.lock().unwrap() = Some(code);
    }
}

impl WorkerProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(31337)
    }

    fn try_wait(&self) -> Result<Option<i32>> {
        Ok(*self.exit.lock().unwrap())
    }

    fn terminate(&self) -> Result<()> {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        if !self.stubborn {
            self.exit_with(143);
        }
        Ok(())
    }

    fn force_kill(&self) -> Result<()> {
        self.killed.fetch_add(1, Ordering::SeqCst);
        self.exit_with(137);
        Ok(())
    }

    fn sample(&self) -> Option<ResourceSample> {
        None
    }
}

/// Launcher that hands out [`ScriptedProcess`]es and can simulate work by
/// committing a file in the task's workspace at launch.
#[derive(Default)]
pub struct ScriptedLauncher {
    launched: Mutex<Vec<(LaunchSpec, Arc<ScriptedProcess>)>>,
    /// File (name, content) committed in the workspace when a task launches.
    work: Mutex<HashMap<TaskId, (String, String)>>,
    failures: AtomicU32,
    /// Hand out processes that ignore SIGTERM.
    stubborn: AtomicBool,
}

impl ScriptedLauncher {
    pub fn commit_on_launch(&self, task: &str, file: &str, content: &str) {
        self.work.lock().unwrap().insert(
            TaskId::from(task),
            (file.to_string(), content.to_string()),
        );
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn stubborn_workers(&self) {
        self.stubborn.store(true, Ordering::SeqCst);
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().unwrap().len()
    }

    pub fn launches_for(&self, task: &str) -> usize {
        let id = TaskId::from(task);
        self.launched
            .lock()
            .unwrap()
            .iter()
            .filter(|(spec, _)| spec.task_id == id)
            .count()
    }

    /// Most recent process launched for a task.
    pub fn process(&self, task: &str) -> Arc<ScriptedProcess> {
        let id = TaskId::from(task);
        self.launched
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(spec, _)| spec.task_id == id)
            .map(|(_, p)| p.clone())
            .expect("no process launched for task")
    }

    /// Order in which tasks were launched.
    pub fn launch_order(&self) -> Vec<String> {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .map(|(spec, _)| spec.task_id.to_string())
            .collect()
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn WorkerProcess>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Spawn {
                role: spec.role,
                reason: "scripted launch failure".to_string(),
            });
        }
        if let Some((file, content)) = self.work.lock().unwrap().get(&spec.task_id) {
            std::fs::write(spec.workspace.join(file), content)?;
            GitOps::new(&spec.workspace)?.commit_all(&spec.workspace, &format!("work on {}", spec.task_id))?;
        }
        let process = Arc::new(ScriptedProcess {
            stubborn: self.stubborn.load(Ordering::SeqCst),
            ..Default::default()
        });
        self.launched
            .lock()
            .unwrap()
            .push((spec.clone(), process.clone()));
        Ok(process)
    }
}

/// A scheduler over a temporary repository with scripted workers. State is
/// saved to `state.json` in `dir`, so a hive can be reopened.
pub struct TestHive {
    pub repo: TestRepo,
    pub dir: TempDir,
    pub config: Config,
    pub launcher: Arc<ScriptedLauncher>,
    pub probe: StaticProbe,
    pub scheduler: Scheduler,
    pub events: mpsc::Receiver<SchedulerEvent>,
}

impl TestHive {
    pub fn new(max_parallel: usize) -> Self {
        let mut config = Config::default();
        config.scheduler.max_parallel = max_parallel;
        Self::with_config(config)
    }

    pub fn with_config(config: Config) -> Self {
        let repo = TestRepo::new();
        let dir = TempDir::new().expect("Failed to create temp directory");
        let launcher = Arc::new(ScriptedLauncher::default());
        let probe = StaticProbe::new(HostSample::default());
        let (scheduler, events) = build_scheduler(&repo, &dir, &config, &launcher, &probe);
        Self {
            repo,
            dir,
            config,
            launcher,
            probe,
            scheduler,
            events,
        }
    }

    /// Replace the scheduler with a fresh one over the same repository,
    /// worktrees and state file, as after a process restart.
    pub fn reopen(&mut self) {
        let (scheduler, events) =
            build_scheduler(&self.repo, &self.dir, &self.config, &self.launcher, &self.probe);
        self.scheduler = scheduler;
        self.events = events;
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.path().join("state.json")
    }

    pub async fn add(&self, id: &str, role: WorkerRole, priority: u32) {
        self.scheduler
            .graph()
            .write()
            .await
            .add_task(Task::new(id, "scripted").with_role(role).with_priority(priority))
            .unwrap();
    }

    pub async fn status(&self, id: &str) -> TaskStatus {
        self.scheduler
            .graph()
            .read()
            .await
            .get_task(&TaskId::from(id))
            .expect("unknown task")
            .status
            .clone()
    }

    pub async fn state(&self, id: &str) -> TaskState {
        self.status(id).await.state()
    }

    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn build_scheduler(
    repo: &TestRepo,
    dir: &TempDir,
    config: &Config,
    launcher: &Arc<ScriptedLauncher>,
    probe: &StaticProbe,
) -> (Scheduler, mpsc::Receiver<SchedulerEvent>) {
    let workspaces = Arc::new(
        WorkspaceManager::new(&repo.path, dir.path().join("worktrees"), &config.workspace)
            .expect("Failed to open workspace manager"),
    );
    let (tx, events) = mpsc::channel(1024);
    let scheduler = Scheduler::new(
        config.clone(),
        workspaces,
        launcher.clone(),
        Arc::new(probe.clone()),
    )
    .with_store(StateStore::new(dir.path().join("state.json")))
    .with_events(tx);
    (scheduler, events)
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}
