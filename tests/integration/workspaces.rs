//! Workspace isolation, merge and cleanup tests through the scheduler.

use chrono::Utc;

use hive::core::{Endpoint, TaskId, TaskState, WorkerRole, WorkspaceStatus};
use hive::orchestration::SchedulerEvent;

use crate::fixtures::{secs, TestHive};

/// Test: Finished work lands on the base branch
/// Given a task whose worker commits a file in its workspace
/// When the worker exits 0
/// Then the file is on the base branch and the workspace is cleaned
#[tokio::test]
async fn test_completed_work_is_merged_and_cleaned() {
    let mut hive = TestHive::new(1);
    hive.launcher.commit_on_launch("a", "feature.txt", "from a\n");
    hive.add("a", WorkerRole::Implementer, 0).await;

    let t0 = Utc::now();
    hive.scheduler.step(t0).await.unwrap();
    let ws = hive.scheduler.workspaces().get(&TaskId::from("a")).unwrap();
    assert_eq!(ws.status, WorkspaceStatus::Active);
    assert!(ws.handle.path.join("feature.txt").exists());
    assert_eq!(hive.repo.read_on_branch("hive/staging", "feature.txt"), None);

    hive.launcher.process("a").exit_with(0);
    hive.scheduler.step(t0 + secs(1)).await.unwrap();

    assert_eq!(
        hive.repo.read_on_branch("hive/staging", "feature.txt").as_deref(),
        Some("from a\n")
    );
    let ws = hive.scheduler.workspaces().get(&TaskId::from("a")).unwrap();
    assert_eq!(ws.status, WorkspaceStatus::Cleaned);
    assert!(!ws.handle.path.exists());

    let commit = hive.drain_events().into_iter().find_map(|e| match e {
        SchedulerEvent::TaskCompleted { commit, .. } => commit,
        _ => None,
    });
    assert!(commit.is_some());

    // A second cleanup is a no-op.
    assert!(!hive
        .scheduler
        .workspaces()
        .cleanup(&TaskId::from("a"))
        .await
        .unwrap());
}

/// Test: Conflicting edits fail the later task
/// Given two tasks that write different content to the same file
/// When both finish
/// Then the first merges, the second fails with a conflict, and the
/// operator hears about it once
#[tokio::test]
async fn test_merge_conflict_fails_second_task() {
    let mut hive = TestHive::new(2);
    hive.launcher.commit_on_launch("a", "shared.txt", "a's version\n");
    hive.launcher.commit_on_launch("b", "shared.txt", "b's version\n");
    hive.add("a", WorkerRole::Implementer, 5).await;
    hive.add("b", WorkerRole::Tester, 1).await;

    let t0 = Utc::now();
    hive.scheduler.step(t0).await.unwrap();
    assert_eq!(hive.launcher.launch_count(), 2);

    hive.launcher.process("a").exit_with(0);
    hive.scheduler.step(t0 + secs(1)).await.unwrap();
    hive.launcher.process("b").exit_with(0);
    let report = hive.scheduler.step(t0 + secs(2)).await.unwrap();

    assert_eq!(report.failed, vec![TaskId::from("b")]);
    assert_eq!(hive.state("a").await, TaskState::Completed);
    assert_eq!(hive.state("b").await, TaskState::Failed);
    assert_eq!(
        hive.repo.read_on_branch("hive/staging", "shared.txt").as_deref(),
        Some("a's version\n")
    );
    // The conflicting branch is kept for inspection.
    let ws = hive.scheduler.workspaces().get(&TaskId::from("b")).unwrap();
    assert_eq!(ws.status, WorkspaceStatus::Active);
    assert_eq!(
        hive.scheduler
            .router()
            .read()
            .await
            .pending_count(Some(Endpoint::Operator)),
        1
    );
    assert!(hive.scheduler.is_drained().await);
}

/// Test: Disjoint edits from parallel tasks both land
#[tokio::test]
async fn test_parallel_disjoint_work_merges() {
    let mut hive = TestHive::new(3);
    for (id, role) in [
        ("a", WorkerRole::Implementer),
        ("b", WorkerRole::Tester),
        ("c", WorkerRole::Documenter),
    ] {
        hive.launcher
            .commit_on_launch(id, &format!("{}.txt", id), &format!("{}\n", id));
        hive.add(id, role, 0).await;
    }

    let t0 = Utc::now();
    hive.scheduler.step(t0).await.unwrap();
    for id in ["a", "b", "c"] {
        hive.launcher.process(id).exit_with(0);
    }
    let report = hive.scheduler.step(t0 + secs(1)).await.unwrap();
    assert_eq!(report.completed.len(), 3);

    for id in ["a", "b", "c"] {
        assert_eq!(
            hive.repo
                .read_on_branch("hive/staging", &format!("{}.txt", id))
                .as_deref(),
            Some(format!("{}\n", id).as_str())
        );
    }
    assert!(hive.scheduler.is_drained().await);
}

/// Test: Leftover worktrees and branches are found and swept
/// Given a task branch and worktree with no workspace record
/// When orphans are swept
/// Then both are removed and live workspaces are untouched
#[tokio::test]
async fn test_orphan_sweep() {
    let mut hive = TestHive::new(1);
    hive.add("live", WorkerRole::Implementer, 0).await;
    hive.scheduler.step(Utc::now()).await.unwrap();

    let workspaces = hive.scheduler.workspaces().clone();
    let stray = workspaces.handle_for(&TaskId::from("stray"));
    workspaces
        .git()
        .create_worktree(&stray.branch, &stray.path, workspaces.base_branch())
        .unwrap();

    let report = workspaces.detect_orphans().await.unwrap();
    assert_eq!(report.orphaned_worktrees, vec![stray.path.clone()]);
    assert_eq!(report.orphaned_branches, vec![stray.branch.clone()]);
    assert!(stray.path.exists());

    let report = workspaces.sweep_orphans().await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.deleted_branches, vec![stray.branch.clone()]);
    assert!(!stray.path.exists());
    assert!(!workspaces.git().branch_exists(&stray.branch).unwrap());

    let live = workspaces.get(&TaskId::from("live")).unwrap();
    assert!(live.handle.path.exists());
    assert_eq!(workspaces.detect_orphans().await.unwrap().orphan_count(), 0);
}
