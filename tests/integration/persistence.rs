//! Saving state and resuming after a restart.

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use hive::core::{EdgeKind, TaskId, TaskState, WorkerRole};
use hive::store::StateStore;

use crate::fixtures::{secs, TestHive};

/// Test: Clean shutdown then resume
/// Given a running task when the run is cancelled
/// When a new scheduler restores the saved state
/// Then the task is relaunched in its workspace without using its restart budget
#[tokio::test]
async fn test_resume_after_clean_shutdown() {
    let mut hive = TestHive::new(1);
    hive.add("a", WorkerRole::Implementer, 0).await;
    hive.scheduler.step(Utc::now()).await.unwrap();
    let first = hive.launcher.process("a");

    let cancel = CancellationToken::new();
    cancel.cancel();
    hive.scheduler.run(cancel).await.unwrap();
    assert_eq!(first.terminated.load(std::sync::atomic::Ordering::SeqCst), 1);

    hive.reopen();
    assert!(hive.scheduler.restore().await.unwrap());
    assert_eq!(hive.state("a").await, TaskState::Running);

    let report = hive.scheduler.step(Utc::now()).await.unwrap();
    assert_eq!(report.restarted, vec![TaskId::from("a")]);
    assert_eq!(hive.launcher.launches_for("a"), 2);
    assert_eq!(
        hive.scheduler
            .supervisor()
            .read()
            .await
            .retries_for(&TaskId::from("a")),
        0
    );

    hive.launcher.process("a").exit_with(0);
    hive.scheduler.step(Utc::now() + secs(1)).await.unwrap();
    assert_eq!(hive.state("a").await, TaskState::Completed);
}

/// Test: Crash then resume
/// Given state saved while a worker was alive
/// When a new scheduler restores it
/// Then the worker is reported lost and the task restarts after a backoff
#[tokio::test]
async fn test_resume_after_crash_counts_a_restart() {
    let mut hive = TestHive::new(1);
    hive.add("a", WorkerRole::Implementer, 0).await;
    hive.scheduler.step(Utc::now()).await.unwrap();
    hive.scheduler.persist(Utc::now()).await.unwrap();

    hive.reopen();
    assert!(hive.scheduler.restore().await.unwrap());
    let t0 = Utc::now();
    hive.scheduler.step(t0).await.unwrap();
    assert_eq!(hive.launcher.launches_for("a"), 1);
    assert_eq!(
        hive.scheduler
            .supervisor()
            .read()
            .await
            .retries_for(&TaskId::from("a")),
        1
    );

    let report = hive.scheduler.step(t0 + secs(2)).await.unwrap();
    assert_eq!(report.restarted, vec![TaskId::from("a")]);
    assert_eq!(hive.state("a").await, TaskState::Running);
}

/// Test: Graph, edges and workspace records survive a round trip
#[tokio::test]
async fn test_saved_state_keeps_graph_and_workspaces() {
    let mut hive = TestHive::new(1);
    hive.add("a", WorkerRole::Implementer, 5).await;
    hive.add("b", WorkerRole::Tester, 0).await;
    hive.scheduler
        .graph()
        .write()
        .await
        .add_dependency(&TaskId::from("b"), &TaskId::from("a"), EdgeKind::Hard)
        .unwrap();
    hive.scheduler.step(Utc::now()).await.unwrap();
    hive.scheduler.persist(Utc::now()).await.unwrap();

    let saved = StateStore::new(hive.state_path())
        .load()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.tasks.len(), 2);
    assert_eq!(saved.edges.len(), 1);
    assert_eq!(saved.workspaces.len(), 1);
    assert_eq!(saved.workers.len(), 1);

    hive.reopen();
    hive.scheduler.restore().await.unwrap();
    assert_eq!(hive.state("b").await, TaskState::Blocked);
    let graph = hive.scheduler.graph().read().await;
    assert_eq!(graph.hard_dependencies(&TaskId::from("b")), vec![TaskId::from("a")]);
    assert_eq!(graph.get_task(&TaskId::from("a")).unwrap().priority, 5);
    drop(graph);
    assert!(hive
        .scheduler
        .workspaces()
        .get(&TaskId::from("a"))
        .is_some());
}
