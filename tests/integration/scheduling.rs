//! Admission order, parallelism and resource gate tests.

use chrono::Utc;

use hive::core::{EdgeKind, Endpoint, TaskId, TaskState, WorkerRole};
use hive::orchestration::{GateLevel, HostSample, SchedulerEvent};
use hive::Plan;

use crate::fixtures::{secs, TestHive};

/// Test: Dependent task waits for its dependency
/// Given A (no deps) and B hard-depending on A with max_parallel = 1
/// When the scheduler steps until both finish
/// Then B is blocked, becomes ready when A completes, and A's worker
/// finished before B's was launched
#[tokio::test]
async fn test_dependency_order_with_single_slot() {
    let mut hive = TestHive::new(1);
    hive.add("a", WorkerRole::Implementer, 0).await;
    hive.add("b", WorkerRole::Tester, 100).await;
    hive.scheduler
        .graph()
        .write()
        .await
        .add_dependency(&TaskId::from("b"), &TaskId::from("a"), EdgeKind::Hard)
        .unwrap();
    assert_eq!(hive.state("b").await, TaskState::Blocked);

    let t0 = Utc::now();
    hive.scheduler.step(t0).await.unwrap();
    assert_eq!(hive.state("a").await, TaskState::Running);
    assert_eq!(hive.state("b").await, TaskState::Blocked);
    assert_eq!(hive.launcher.launch_order(), vec!["a"]);

    hive.launcher.process("a").exit_with(0);
    hive.scheduler.step(t0 + secs(1)).await.unwrap();
    assert_eq!(hive.state("a").await, TaskState::Completed);
    assert_eq!(hive.state("b").await, TaskState::Running);
    assert_eq!(hive.launcher.launch_order(), vec!["a", "b"]);

    hive.launcher.process("b").exit_with(0);
    hive.scheduler.step(t0 + secs(2)).await.unwrap();
    assert_eq!(hive.state("b").await, TaskState::Completed);
    assert!(hive.scheduler.is_drained().await);

    let completed: Vec<String> = hive
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            SchedulerEvent::TaskCompleted { task_id, .. } => Some(task_id.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec!["a", "b"]);
}

/// Test: Critical gate stops admission
/// Given ready tasks and a host at critical memory use
/// When the scheduler steps
/// Then nothing is admitted that tick
#[tokio::test]
async fn test_critical_gate_admits_nothing() {
    let mut hive = TestHive::new(4);
    hive.add("a", WorkerRole::Implementer, 0).await;
    hive.add("b", WorkerRole::Tester, 0).await;
    hive.probe.set(HostSample {
        load_per_cpu: 0.1,
        memory_used_percent: 97.0,
        disk_used_percent: 20.0,
    });

    let report = hive.scheduler.step(Utc::now()).await.unwrap();
    assert!(report.admission.back_pressure);
    assert_eq!(report.admission.gate, GateLevel::Critical);
    assert!(report.admission.admitted.is_empty());
    assert_eq!(hive.launcher.launch_count(), 0);
    assert_eq!(hive.state("a").await, TaskState::Ready);

    // Pressure clears; both go out on the next tick.
    hive.probe.set(HostSample::default());
    let report = hive.scheduler.step(Utc::now() + secs(1)).await.unwrap();
    assert_eq!(report.admission.admitted.len(), 2);
}

/// Test: Warning gate admits one task per tick
#[tokio::test]
async fn test_warning_gate_admits_one_per_tick() {
    let mut hive = TestHive::new(4);
    hive.add("a", WorkerRole::Implementer, 0).await;
    hive.add("b", WorkerRole::Tester, 0).await;
    hive.add("c", WorkerRole::Reviewer, 0).await;
    hive.probe.set(HostSample {
        load_per_cpu: 0.1,
        memory_used_percent: 10.0,
        disk_used_percent: 90.0,
    });

    let t0 = Utc::now();
    for (i, expected) in [1, 2, 3].into_iter().enumerate() {
        hive.scheduler.step(t0 + secs(i as i64)).await.unwrap();
        assert_eq!(hive.launcher.launch_count(), expected);
    }
}

/// Test: Priority decides which ready task takes the only slot
#[tokio::test]
async fn test_priority_then_submission_order() {
    let mut hive = TestHive::new(1);
    hive.add("low", WorkerRole::Implementer, 1).await;
    hive.add("high", WorkerRole::Tester, 9).await;
    hive.add("high-later", WorkerRole::Reviewer, 9).await;

    let t0 = Utc::now();
    hive.scheduler.step(t0).await.unwrap();
    hive.launcher.process("high").exit_with(0);
    hive.scheduler.step(t0 + secs(1)).await.unwrap();
    hive.launcher.process("high-later").exit_with(0);
    hive.scheduler.step(t0 + secs(2)).await.unwrap();

    assert_eq!(hive.launcher.launch_order(), vec!["high", "high-later", "low"]);
}

/// Test: Repeated launch failures block the task and escalate once
#[tokio::test]
async fn test_admission_failures_escalate_once() {
    let mut hive = TestHive::new(1);
    hive.add("a", WorkerRole::Implementer, 0).await;
    hive.launcher.fail_next(3);

    let t0 = Utc::now();
    for i in 0..3 {
        hive.scheduler.step(t0 + secs(i)).await.unwrap();
    }
    assert_eq!(hive.state("a").await, TaskState::Blocked);
    assert_eq!(
        hive.scheduler
            .router()
            .read()
            .await
            .pending_count(Some(Endpoint::Operator)),
        1
    );
    assert!(hive
        .drain_events()
        .iter()
        .any(|e| matches!(e, SchedulerEvent::TaskBlocked { .. })));

    // The operator clears it and the next launch succeeds.
    hive.scheduler.unblock(&TaskId::from("a")).await.unwrap();
    hive.scheduler.step(t0 + secs(10)).await.unwrap();
    assert_eq!(hive.state("a").await, TaskState::Running);
}

/// Test: A submitted plan runs to completion through `run`
#[tokio::test]
async fn test_plan_runs_to_completion() {
    let mut hive = TestHive::new(2);
    let plan = Plan::parse(
        r#"
[[task]]
id = "docs"
scope = "write docs"
role = "documenter"
"#,
    )
    .unwrap();
    plan.submit(&mut *hive.scheduler.graph().write().await).unwrap();

    hive.scheduler.step(Utc::now()).await.unwrap();
    hive.launcher.process("docs").exit_with(0);

    let snapshot = hive
        .scheduler
        .run(tokio_util::sync::CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(snapshot.task_count("completed"), 1);
    assert!(hive.drain_events().contains(&SchedulerEvent::AllTasksSettled));
}
