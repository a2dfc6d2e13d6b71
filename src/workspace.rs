//! Isolated per-task workspaces.
//!
//! Each task gets its own branch checked out in its own worktree, derived
//! deterministically from the task id. Finished work is merged into a shared
//! base branch one task at a time per group; different groups merge
//! concurrently. The manager owns every workspace record.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use regex::{Regex, RegexSet};
use serde::Serialize;
use tokio::sync::Notify;

use crate::config::{Config, WorkspaceConfig};
use crate::core::{GroupId, Task, TaskId, Workspace, WorkspaceHandle, WorkspaceStatus};
use crate::git::{GitOps, MergeOutcome};
use crate::util::{blocking, blocking_with_timeout};
use crate::{hlog, hlog_debug, hlog_error, hlog_warn, Error, Result};

/// Position in a group's merge queue: higher priority first, then arrival.
type Ticket = (Reverse<u32>, u64);

#[derive(Default)]
struct MergeLane {
    busy: bool,
    queue: BTreeSet<Ticket>,
}

/// Leftover worktrees and branches with no live workspace record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub orphaned_worktrees: Vec<PathBuf>,
    pub orphaned_branches: Vec<String>,
    pub removed_worktrees: Vec<PathBuf>,
    pub deleted_branches: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl SweepReport {
    pub fn orphan_count(&self) -> usize {
        self.orphaned_worktrees.len() + self.orphaned_branches.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct WorkspaceManager {
    git: GitOps,
    worktree_dir: PathBuf,
    base_branch: String,
    branch_prefix: String,
    auxiliary: RegexSet,
    merge_timeout: Duration,
    records: Mutex<HashMap<TaskId, Workspace>>,
    lanes: Mutex<HashMap<GroupId, MergeLane>>,
    merge_turn: Notify,
    tickets: AtomicU64,
}

impl WorkspaceManager {
    /// Open the repository at `repo_path` and make sure the base branch exists.
    pub fn new(repo_path: &Path, worktree_dir: PathBuf, config: &WorkspaceConfig) -> Result<Self> {
        let git = GitOps::new(repo_path)?;
        git.ensure_branch(&config.base_branch)?;
        std::fs::create_dir_all(&worktree_dir)?;
        hlog_debug!(
            "WorkspaceManager::new repo={} worktrees={} base={}",
            repo_path.display(),
            worktree_dir.display(),
            config.base_branch
        );
        Ok(Self {
            git,
            worktree_dir,
            base_branch: config.base_branch.clone(),
            branch_prefix: config.branch_prefix.trim_end_matches('/').to_string(),
            auxiliary: RegexSet::new(&config.auxiliary_patterns)?,
            merge_timeout: config.merge_timeout(),
            records: Mutex::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
            merge_turn: Notify::new(),
            tickets: AtomicU64::new(0),
        })
    }

    pub fn from_config(repo_path: &Path, config: &Config) -> Result<Self> {
        Self::new(repo_path, config.worktrees_dir()?, &config.workspace)
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn git(&self) -> &GitOps {
        &self.git
    }

    /// Branch and worktree path for a task. Same id, same handle.
    ///
    /// Ids that are not already safe ref names get a hash of the raw id
    /// appended, so distinct ids never share a handle.
    pub fn handle_for(&self, task_id: &TaskId) -> WorkspaceHandle {
        let name = workspace_name(task_id.as_str());
        WorkspaceHandle {
            branch: format!("{}/{}", self.branch_prefix, name),
            path: self.worktree_dir.join(&name),
        }
    }

    /// Allocate the isolated workspace for a task.
    ///
    /// Fails with `WorkspaceExists` if a record for the task is not yet
    /// cleaned, or if the branch or worktree path is already taken.
    pub async fn create(&self, task: &Task) -> Result<Workspace> {
        let handle = self.handle_for(&task.id);
        {
            let records = self.records();
            if let Some(existing) = records.get(&task.id) {
                if existing.status != WorkspaceStatus::Cleaned {
                    return Err(Error::WorkspaceExists {
                        task_id: task.id.clone(),
                        branch: existing.handle.branch.clone(),
                    });
                }
            }
            let taken = records.values().any(|w| {
                w.task_id != task.id
                    && w.status != WorkspaceStatus::Cleaned
                    && (w.handle.branch == handle.branch || w.handle.path == handle.path)
            });
            if taken {
                return Err(Error::WorkspaceExists {
                    task_id: task.id.clone(),
                    branch: handle.branch,
                });
            }
        }

        let git = self.git.clone();
        let base = self.base_branch.clone();
        let h = handle.clone();
        let task_id = task.id.clone();
        let base_commit = blocking(move || {
            if git.branch_exists(&h.branch)? || h.path.exists() {
                return Err(Error::WorkspaceExists {
                    task_id,
                    branch: h.branch,
                });
            }
            git.create_worktree(&h.branch, &h.path, &base)
        })
        .await?;

        let workspace = Workspace {
            task_id: task.id.clone(),
            group: task.group.clone(),
            priority: task.priority,
            handle,
            status: WorkspaceStatus::Created,
            base_commit: Some(base_commit),
            created_at: Utc::now(),
            merged_at: None,
            cleaned_at: None,
        };
        self.records().insert(task.id.clone(), workspace.clone());
        hlog!(
            "Workspace created for {} at {}",
            task.id,
            workspace.handle.path.display()
        );
        Ok(workspace)
    }

    /// A worker has been bound to the workspace: created -> active.
    pub fn activate(&self, task_id: &TaskId) -> Result<()> {
        self.advance(task_id, WorkspaceStatus::Active)
    }

    /// Undo a `create` whose admission did not go through.
    ///
    /// Only valid while the workspace is still `created`; removes the worktree,
    /// the branch and the record.
    pub async fn discard(&self, task_id: &TaskId) -> Result<()> {
        let handle = {
            let records = self.records();
            let ws = records
                .get(task_id)
                .ok_or_else(|| Error::WorkspaceNotFound(task_id.clone()))?;
            if ws.status != WorkspaceStatus::Created {
                return Err(invalid(task_id, ws.status, "discarded"));
            }
            ws.handle.clone()
        };
        let git = self.git.clone();
        blocking(move || {
            git.remove_worktree(&handle.path)?;
            git.delete_branch(&handle.branch)
        })
        .await?;
        self.records().remove(task_id);
        hlog_warn!("Workspace for {} discarded", task_id);
        Ok(())
    }

    /// Integrate the task branch into the base branch.
    ///
    /// Waits for the task's turn in its group: one merge at a time per group,
    /// highest priority first, then submission order. A conflict outside the
    /// auxiliary paths is returned as `MergeConflict` and the workspace stays
    /// `active`.
    pub async fn merge(&self, task_id: &TaskId) -> Result<MergeOutcome> {
        let (group, priority, handle) = {
            let records = self.records();
            let ws = records
                .get(task_id)
                .ok_or_else(|| Error::WorkspaceNotFound(task_id.clone()))?;
            if ws.status != WorkspaceStatus::Active {
                return Err(invalid(task_id, ws.status, "merged"));
            }
            (ws.group.clone(), ws.priority, ws.handle.clone())
        };

        let _turn = self.wait_for_turn(&group, priority).await;
        hlog_debug!("Merge turn acquired for {} in group {}", task_id, group);

        let git = self.git.clone();
        let base = self.base_branch.clone();
        let auxiliary = self.auxiliary.clone();
        let id = task_id.clone();
        let outcome = blocking_with_timeout(self.merge_timeout, move || {
            if handle.path.exists() && git.is_dirty(&handle.path)? {
                hlog_debug!("Workspace for {} is dirty, committing before merge", id);
                git.commit_all(&handle.path, &format!("[hive] uncommitted work from {}", id))?;
            }
            git.merge_branch(&handle.branch, &base, &auxiliary)
        })
        .await?;

        if let MergeOutcome::Conflicts { paths } = outcome {
            hlog_error!("Merge conflict for {}: {:?}", task_id, paths);
            return Err(Error::MergeConflict {
                task_id: task_id.clone(),
                paths,
            });
        }

        self.advance(task_id, WorkspaceStatus::Merged)?;
        hlog!(
            "Merged {} into {} ({:?})",
            task_id,
            self.base_branch,
            outcome.commit()
        );
        Ok(outcome)
    }

    /// Remove a merged workspace. Cleaning twice is the same as once.
    ///
    /// Returns true if this call did the removal.
    pub async fn cleanup(&self, task_id: &TaskId) -> Result<bool> {
        let handle = {
            let records = self.records();
            let ws = records
                .get(task_id)
                .ok_or_else(|| Error::WorkspaceNotFound(task_id.clone()))?;
            match ws.status {
                WorkspaceStatus::Cleaned => return Ok(false),
                WorkspaceStatus::Merged => ws.handle.clone(),
                other => return Err(invalid(task_id, other, "cleaned")),
            }
        };
        let git = self.git.clone();
        blocking(move || {
            git.remove_worktree(&handle.path)?;
            git.delete_branch(&handle.branch)
        })
        .await?;
        self.advance(task_id, WorkspaceStatus::Cleaned)?;
        hlog!("Workspace for {} cleaned", task_id);
        Ok(true)
    }

    pub fn get(&self, task_id: &TaskId) -> Option<Workspace> {
        self.records().get(task_id).cloned()
    }

    pub fn list(&self) -> Vec<Workspace> {
        let mut all: Vec<Workspace> = self.records().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn count_by_status(&self) -> HashMap<WorkspaceStatus, usize> {
        let mut counts = HashMap::new();
        for ws in self.records().values() {
            *counts.entry(ws.status).or_insert(0) += 1;
        }
        counts
    }

    /// Load persisted records, replacing any in memory.
    pub fn restore(&self, workspaces: Vec<Workspace>) {
        let mut records = self.records();
        records.clear();
        for ws in workspaces {
            records.insert(ws.task_id.clone(), ws);
        }
    }

    /// Worktrees under the worktree directory and branches under the task
    /// prefix that no live (not cleaned) record accounts for.
    pub async fn detect_orphans(&self) -> Result<SweepReport> {
        let (known_paths, known_branches) = self.live_handles();
        let git = self.git.clone();
        let dir = self.worktree_dir.clone();
        let prefix = self.branch_prefix.clone();
        blocking(move || {
            let mut report = SweepReport::default();
            if dir.exists() {
                for entry in std::fs::read_dir(&dir)?.flatten() {
                    let path = entry.path();
                    if path.is_dir() && !known_paths.contains(&path) {
                        report.orphaned_worktrees.push(path);
                    }
                }
            }
            report.orphaned_worktrees.sort();
            report.orphaned_branches = git
                .branches_with_prefix(&prefix)?
                .into_iter()
                .filter(|b| !known_branches.contains(b))
                .collect();
            Ok(report)
        })
        .await
    }

    /// Detect orphans and remove them.
    pub async fn sweep_orphans(&self) -> Result<SweepReport> {
        let mut report = self.detect_orphans().await?;
        if report.orphan_count() == 0 {
            return Ok(report);
        }
        let git = self.git.clone();
        report = blocking(move || {
            for path in report.orphaned_worktrees.clone() {
                match git.remove_worktree(&path) {
                    Ok(()) => report.removed_worktrees.push(path),
                    Err(e) => report
                        .failed
                        .push((path.display().to_string(), e.to_string())),
                }
            }
            git.prune_stale_worktrees()?;
            for branch in report.orphaned_branches.clone() {
                match git.delete_branch(&branch) {
                    Ok(()) => report.deleted_branches.push(branch),
                    Err(e) => report.failed.push((branch, e.to_string())),
                }
            }
            Ok(report)
        })
        .await?;
        hlog_warn!(
            "Orphan sweep removed {} worktrees and {} branches ({} failures)",
            report.removed_worktrees.len(),
            report.deleted_branches.len(),
            report.failed.len()
        );
        Ok(report)
    }

    // ========== Internals ==========

    fn records(&self) -> MutexGuard<'_, HashMap<TaskId, Workspace>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<GroupId, MergeLane>> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live_handles(&self) -> (HashSet<PathBuf>, HashSet<String>) {
        let records = self.records();
        let live = records
            .values()
            .filter(|w| w.status != WorkspaceStatus::Cleaned);
        let mut paths = HashSet::new();
        let mut branches = HashSet::new();
        for ws in live {
            paths.insert(ws.handle.path.clone());
            branches.insert(ws.handle.branch.clone());
        }
        (paths, branches)
    }

    fn advance(&self, task_id: &TaskId, next: WorkspaceStatus) -> Result<()> {
        let mut records = self.records();
        let ws = records
            .get_mut(task_id)
            .ok_or_else(|| Error::WorkspaceNotFound(task_id.clone()))?;
        if !ws.status.can_transition_to(next) {
            return Err(invalid(task_id, ws.status, &next.to_string()));
        }
        hlog_debug!("Workspace {}: {} -> {}", task_id, ws.status, next);
        ws.status = next;
        let now = Utc::now();
        match next {
            WorkspaceStatus::Merged => ws.merged_at = Some(now),
            WorkspaceStatus::Cleaned => ws.cleaned_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    async fn wait_for_turn(&self, group: &GroupId, priority: u32) -> MergeTurn<'_> {
        let ticket: Ticket = (Reverse(priority), self.tickets.fetch_add(1, Ordering::SeqCst));
        self.lanes()
            .entry(group.clone())
            .or_default()
            .queue
            .insert(ticket);
        let mut turn = MergeTurn {
            manager: self,
            group: group.clone(),
            ticket,
            holding: false,
        };

        loop {
            let notified = self.merge_turn.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut lanes = self.lanes();
                let lane = lanes.entry(group.clone()).or_default();
                if !lane.busy && lane.queue.first() == Some(&ticket) {
                    lane.queue.remove(&ticket);
                    lane.busy = true;
                    turn.holding = true;
                    return turn;
                }
            }
            notified.await;
        }
    }
}

/// Held while a task owns its group's merge slot, or while it waits in the
/// queue. Dropping it frees whichever it holds.
struct MergeTurn<'a> {
    manager: &'a WorkspaceManager,
    group: GroupId,
    ticket: Ticket,
    holding: bool,
}

impl Drop for MergeTurn<'_> {
    fn drop(&mut self) {
        {
            let mut lanes = self.manager.lanes();
            if let Some(lane) = lanes.get_mut(&self.group) {
                if self.holding {
                    lane.busy = false;
                } else {
                    lane.queue.remove(&self.ticket);
                }
            }
        }
        self.manager.merge_turn.notify_waiters();
    }
}

fn workspace_name(id: &str) -> String {
    let name = sanitize(id);
    if name == id {
        name
    } else {
        format!("{}-{:08x}", name, fnv1a(id))
    }
}

/// 32-bit FNV-1a. Stable across runs and platforms, unlike `DefaultHasher`.
fn fnv1a(input: &str) -> u32 {
    input.bytes().fold(0x811c_9dc5, |hash, b| {
        (hash ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}

fn sanitize(id: &str) -> String {
    static UNSAFE: std::sync::OnceLock<Option<Regex>> = std::sync::OnceLock::new();
    let cleaned = match UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").ok()) {
        Some(re) => re.replace_all(id, "-").into_owned(),
        None => id.to_string(),
    };
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '-');
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.to_string()
    }
}

fn invalid(task_id: &TaskId, from: WorkspaceStatus, to: &str) -> Error {
    Error::InvalidTransition {
        entity: format!("workspace {}", task_id),
        from: from.to_string(),
        to: to.to_string(),
    }
}
