use std::path::{Path, PathBuf};

use git2::{
    BranchType, ErrorCode, FileFavor, IndexAddOption, MergeOptions, Oid, Repository, Signature,
    WorktreePruneOptions,
};
use regex::RegexSet;

use crate::{hlog_debug, hlog_warn, Error, Result};

/// Times a merge is recomputed when a concurrent merge moves the base first.
const MAX_REF_RACES: u32 = 8;

/// Result of integrating a task branch into the base branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Base already contains the task branch.
    UpToDate,
    FastForward { commit: String },
    /// Three-way merge commit. `unioned` lists auxiliary paths merged by union.
    Merged {
        commit: String,
        unioned: Vec<PathBuf>,
    },
    /// Conflicting paths that could not be merged automatically.
    Conflicts { paths: Vec<PathBuf> },
}

impl MergeOutcome {
    pub fn commit(&self) -> Option<&str> {
        match self {
            MergeOutcome::FastForward { commit } | MergeOutcome::Merged { commit, .. } => {
                Some(commit)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        hlog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    /// Create `branch` from HEAD if it does not exist yet.
    pub fn ensure_branch(&self, branch: &str) -> Result<()> {
        if self.branch_exists(branch)? {
            return Ok(());
        }
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        repo.branch(branch, &commit, false)?;
        hlog_debug!("Created branch {} at {}", branch, commit.id());
        Ok(())
    }

    /// Create `branch` at the tip of `base` and check it out in a new worktree.
    ///
    /// Returns the base commit id.
    pub fn create_worktree(&self, branch: &str, worktree_path: &Path, base: &str) -> Result<String> {
        hlog_debug!(
            "GitOps::create_worktree branch={} path={} base={}",
            branch,
            worktree_path.display(),
            base
        );
        let repo = self.repo()?;
        let commit = repo
            .find_branch(base, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        let branch_ref = repo.branch(branch, &commit, false)?.into_reference();

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes; the folder name is the worktree name.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        if let Err(e) = repo.worktree(worktree_name, worktree_path, Some(&opts)) {
            drop(branch_ref);
            self.delete_branch(branch)?;
            return Err(e.into());
        }
        Ok(commit.id().to_string())
    }

    /// Remove a worktree directory and its admin entry. Succeeds if already gone.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        hlog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());

        let worktree_name: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
                    || folder_name.as_deref() == Some(*name)
            })
            .map(|s| s.to_string());

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    hlog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
            // A leftover admin dir makes git think the branch is still checked out.
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }
        Ok(())
    }

    /// Delete a local branch. Succeeds if the branch does not exist.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        hlog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => branch_ref.delete()?,
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        exists
    }

    pub fn branch_head(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo
            .find_branch(branch, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Local branches whose name starts with `prefix/`.
    pub fn branches_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let wanted = format!("{}/", prefix.trim_end_matches('/'));
        let mut names = Vec::new();
        for entry in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = entry?;
            if let Some(name) = branch.name()? {
                if name.starts_with(&wanted) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Prune admin entries of worktrees whose directory no longer exists.
    pub fn prune_stale_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                if !wt.path().exists()
                    && wt
                        .prune(Some(WorktreePruneOptions::new().valid(true).locked(true)))
                        .is_ok()
                {
                    pruned += 1;
                }
            }
        }
        hlog_debug!("prune_stale_worktrees: pruned {}", pruned);
        Ok(pruned)
    }

    /// True if the worktree has staged, unstaged or untracked changes.
    pub fn is_dirty(&self, worktree_path: &Path) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Stage everything in a worktree and commit it on the worktree's branch.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<String> {
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree = repo.find_tree(index.write_tree()?)?;
        let sig = signature(&repo)?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(commit_id.to_string())
    }

    /// Merge `branch` into `base` without touching any working tree.
    ///
    /// Conflicts confined to paths matching `auxiliary` are retried with a
    /// union merge; any other conflict is reported back unchanged. The base
    /// ref is updated compare-and-swap; if another merge moved it first the
    /// merge is recomputed against the new tip.
    pub fn merge_branch(&self, branch: &str, base: &str, auxiliary: &RegexSet) -> Result<MergeOutcome> {
        hlog_debug!("GitOps::merge_branch {} -> {}", branch, base);
        let mut attempt = 0;
        loop {
            match self.merge_once(branch, base, auxiliary) {
                Err(Error::Git(e)) if e.code() == ErrorCode::Modified && attempt < MAX_REF_RACES => {
                    attempt += 1;
                    hlog_debug!("Base {} moved during merge of {}; retrying", base, branch);
                }
                other => return other,
            }
        }
    }

    fn merge_once(&self, branch: &str, base: &str, auxiliary: &RegexSet) -> Result<MergeOutcome> {
        let repo = self.repo()?;
        let ours = repo
            .find_branch(base, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        let theirs = repo
            .find_branch(branch, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        let base_ref = format!("refs/heads/{}", base);

        if ours.id() == theirs.id() || repo.graph_descendant_of(ours.id(), theirs.id())? {
            return Ok(MergeOutcome::UpToDate);
        }
        if repo.graph_descendant_of(theirs.id(), ours.id())? {
            repo.reference_matching(
                &base_ref,
                theirs.id(),
                true,
                ours.id(),
                &format!("hive: fast-forward {} to {}", base, branch),
            )?;
            return Ok(MergeOutcome::FastForward {
                commit: theirs.id().to_string(),
            });
        }

        let mut index = repo.merge_commits(&ours, &theirs, Some(&MergeOptions::new()))?;
        let mut unioned = Vec::new();
        if index.has_conflicts() {
            let paths = conflict_paths(&index)?;
            let all_auxiliary = paths
                .iter()
                .all(|p| auxiliary.is_match(&p.to_string_lossy()));
            if !all_auxiliary {
                return Ok(MergeOutcome::Conflicts { paths });
            }
            let mut opts = MergeOptions::new();
            opts.file_favor(FileFavor::Union);
            index = repo.merge_commits(&ours, &theirs, Some(&opts))?;
            if index.has_conflicts() {
                return Ok(MergeOutcome::Conflicts {
                    paths: conflict_paths(&index)?,
                });
            }
            hlog_debug!("Union-merged auxiliary paths: {:?}", paths);
            unioned = paths;
        }

        let tree = repo.find_tree(index.write_tree_to(&repo)?)?;
        let sig = signature(&repo)?;
        let message = format!("Merge {} into {}", branch, base);
        let commit: Oid = repo.commit(
            Some(base_ref.as_str()),
            &sig,
            &sig,
            &message,
            &tree,
            &[&ours, &theirs],
        )?;
        Ok(MergeOutcome::Merged {
            commit: commit.to_string(),
            unioned,
        })
    }
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    Ok(repo
        .signature()
        .or_else(|_| Signature::now("hive", "hive@localhost"))?)
}

fn conflict_paths(index: &git2::Index) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        if let Some(entry) = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref())
        {
            paths.push(PathBuf::from(
                String::from_utf8_lossy(&entry.path).to_string(),
            ));
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}
