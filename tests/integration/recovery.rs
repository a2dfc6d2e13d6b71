//! Worker failure and restart tests.

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;

use hive::config::Config;
use hive::core::{BlockReason, Endpoint, ErrorReport, MessageKind, TaskId, TaskState, TaskStatus, WorkerRole};
use hive::orchestration::SchedulerEvent;

use crate::fixtures::{secs, TestHive};

fn restarts(events: &[SchedulerEvent]) -> Vec<(u32, Duration)> {
    events
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::TaskRestarting { attempt, delay, .. } => Some((*attempt, *delay)),
            _ => None,
        })
        .collect()
}

/// Test: Silent worker is killed and eventually blocked
/// Given a worker that never sends a heartbeat
/// When 130 seconds pass after each launch
/// Then every worker gets SIGTERM (not SIGKILL), the task is restarted
/// three times with doubling backoff, and the fourth silence blocks it
#[tokio::test]
async fn test_silent_worker_blocks_after_restart_budget() {
    let mut hive = TestHive::new(1);
    hive.add("a", WorkerRole::Implementer, 0).await;

    let mut now = Utc::now();
    hive.scheduler.step(now).await.unwrap();
    for kill in 1..=4 {
        let process = hive.launcher.process("a");
        now += secs(130);
        let report = hive.scheduler.step(now).await.unwrap();
        assert_eq!(report.killed.len(), 1, "kill {}", kill);
        assert_eq!(process.terminated.load(Ordering::SeqCst), 1);
        assert_eq!(process.killed.load(Ordering::SeqCst), 0);
        now += secs(5);
        hive.scheduler.step(now).await.unwrap();
    }

    assert_eq!(hive.launcher.launches_for("a"), 4);
    assert!(matches!(
        hive.status("a").await,
        TaskStatus::Blocked {
            reason: BlockReason::RetriesExhausted { attempts: 3, .. }
        }
    ));

    let events = hive.drain_events();
    assert_eq!(
        restarts(&events),
        vec![
            (1, Duration::from_secs(1)),
            (2, Duration::from_secs(2)),
            (3, Duration::from_secs(4)),
        ]
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, SchedulerEvent::TaskFailed { .. })));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, SchedulerEvent::TaskBlocked { .. }))
            .count(),
        1
    );
    assert!(hive.scheduler.is_drained().await);
}

/// Test: A worker that ignores SIGTERM is force-killed after the grace period
#[tokio::test]
async fn test_stubborn_worker_gets_sigkill() {
    let mut config = Config::default();
    config.supervisor.kill_grace_secs = 0;
    let mut hive = TestHive::with_config(config);
    hive.launcher.stubborn_workers();
    hive.add("a", WorkerRole::Implementer, 0).await;

    let t0 = Utc::now();
    hive.scheduler.step(t0).await.unwrap();
    let process = hive.launcher.process("a");
    hive.scheduler.step(t0 + secs(121)).await.unwrap();

    assert_eq!(process.terminated.load(Ordering::SeqCst), 1);
    assert_eq!(process.killed.load(Ordering::SeqCst), 1);
    assert_eq!(hive.state("a").await, TaskState::Running);
    assert!(hive
        .scheduler
        .supervisor()
        .read()
        .await
        .has_pending_restart(&TaskId::from("a")));
}

/// Test: Crash then success
/// Given a worker that exits with code 1
/// When the backoff elapses and the relaunched worker exits 0
/// Then the task completes and its restart count starts over
#[tokio::test]
async fn test_crash_then_success() {
    let mut hive = TestHive::new(1);
    hive.add("a", WorkerRole::Implementer, 0).await;

    let t0 = Utc::now();
    hive.scheduler.step(t0).await.unwrap();
    hive.launcher.process("a").exit_with(1);
    hive.scheduler.step(t0 + secs(1)).await.unwrap();
    assert_eq!(hive.state("a").await, TaskState::Running);

    // Backoff not yet over.
    let report = hive.scheduler.step(t0 + secs(1)).await.unwrap();
    assert!(report.restarted.is_empty());

    let report = hive.scheduler.step(t0 + secs(3)).await.unwrap();
    assert_eq!(report.restarted, vec![TaskId::from("a")]);
    hive.launcher.process("a").exit_with(0);
    let report = hive.scheduler.step(t0 + secs(4)).await.unwrap();
    assert_eq!(report.completed, vec![TaskId::from("a")]);

    assert_eq!(hive.state("a").await, TaskState::Completed);
    assert_eq!(
        hive.scheduler
            .supervisor()
            .read()
            .await
            .retries_for(&TaskId::from("a")),
        0
    );
    let events = hive.drain_events();
    assert_eq!(restarts(&events), vec![(1, Duration::from_secs(1))]);
}

/// Test: A transient error report restarts the task instead of failing it
#[tokio::test]
async fn test_transient_error_report_restarts() {
    let mut hive = TestHive::new(1);
    hive.add("a", WorkerRole::Implementer, 0).await;
    let t0 = Utc::now();
    hive.scheduler.step(t0).await.unwrap();
    let process = hive.launcher.process("a");
    let worker_id = hive
        .scheduler
        .supervisor()
        .read()
        .await
        .worker_for_task(&TaskId::from("a"))
        .unwrap()
        .id;

    let error = ErrorReport {
        task_id: Some(TaskId::from("a")),
        worker_id: Some(worker_id),
        error: "upstream rate limit hit, try again later".to_string(),
        undelivered: None,
    };
    hive.scheduler
        .router()
        .write()
        .await
        .send(
            Endpoint::Worker(WorkerRole::Implementer),
            Endpoint::Scheduler,
            MessageKind::Error,
            &error,
            t0,
        )
        .unwrap();

    hive.scheduler.step(t0 + secs(1)).await.unwrap();
    assert_eq!(process.terminated.load(Ordering::SeqCst), 1);
    assert_eq!(hive.state("a").await, TaskState::Running);

    hive.scheduler.step(t0 + secs(3)).await.unwrap();
    assert_eq!(hive.launcher.launches_for("a"), 2);
}

/// Test: A restart waits while another task holds the role
/// Given two implementer tasks and room for both
/// When the first crashes and the second takes the implementer slot
/// Then the first is relaunched only after the second finishes
#[tokio::test]
async fn test_restart_waits_for_role_slot() {
    let mut hive = TestHive::new(2);
    hive.add("a", WorkerRole::Implementer, 9).await;
    hive.add("b", WorkerRole::Implementer, 1).await;

    let t0 = Utc::now();
    hive.scheduler.step(t0).await.unwrap();
    assert_eq!(hive.launcher.launch_order(), vec!["a"]);

    hive.launcher.process("a").exit_with(1);
    hive.scheduler.step(t0 + secs(1)).await.unwrap();
    assert_eq!(hive.launcher.launch_order(), vec!["a", "b"]);

    hive.scheduler.step(t0 + secs(3)).await.unwrap();
    assert_eq!(hive.launcher.launches_for("a"), 1);
    assert_eq!(hive.state("a").await, TaskState::Running);

    hive.launcher.process("b").exit_with(0);
    hive.scheduler.step(t0 + secs(4)).await.unwrap();
    assert_eq!(hive.state("b").await, TaskState::Completed);
    assert_eq!(hive.launcher.launch_order(), vec!["a", "b", "a"]);
}
