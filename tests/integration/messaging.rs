//! Message delivery between workers, scheduler and supervisor.

use chrono::Utc;

use hive::config::Config;
use hive::core::{
    Completion, Endpoint, ErrorReport, Heartbeat, MessageKind, MessageStatus, TaskId, TaskState,
    WorkAssignment, WorkerRole, WorkerStatus,
};

use crate::fixtures::{secs, TestHive};

const IMPLEMENTER: Endpoint = Endpoint::Worker(WorkerRole::Implementer);

async fn worker_of(hive: &TestHive, task: &str) -> hive::core::WorkerId {
    hive.scheduler
        .supervisor()
        .read()
        .await
        .worker_for_task(&TaskId::from(task))
        .expect("no live worker")
        .id
}

/// Test: Heartbeats keep a worker alive
/// Given a worker that reports a heartbeat every minute
/// When three minutes pass
/// Then it is never killed and finishes through a completion message
#[tokio::test]
async fn test_heartbeats_keep_worker_alive() {
    let mut hive = TestHive::new(1);
    hive.add("a", WorkerRole::Implementer, 0).await;
    let t0 = Utc::now();
    hive.scheduler.step(t0).await.unwrap();
    let worker_id = worker_of(&hive, "a").await;

    for minute in 1..=3 {
        let at = t0 + secs(60 * minute);
        hive.scheduler
            .router()
            .write()
            .await
            .send(
                IMPLEMENTER,
                Endpoint::Supervisor,
                MessageKind::HeartbeatAck,
                &Heartbeat {
                    worker_id,
                    sample: None,
                },
                at,
            )
            .unwrap();
        let report = hive.scheduler.step(at).await.unwrap();
        assert!(report.killed.is_empty(), "killed at minute {}", minute);
    }
    assert_eq!(
        hive.scheduler
            .supervisor()
            .read()
            .await
            .get(worker_id)
            .unwrap()
            .status,
        WorkerStatus::Running
    );

    let done = t0 + secs(200);
    hive.scheduler
        .router()
        .write()
        .await
        .send(
            IMPLEMENTER,
            Endpoint::Scheduler,
            MessageKind::Completion,
            &Completion {
                task_id: TaskId::from("a"),
                worker_id,
                summary: Some("done".to_string()),
            },
            done,
        )
        .unwrap();
    let report = hive.scheduler.step(done).await.unwrap();
    assert_eq!(report.completed, vec![TaskId::from("a")]);
    assert_eq!(hive.state("a").await, TaskState::Completed);
}

/// Test: Admission sends the worker its assignment
#[tokio::test]
async fn test_assignment_sent_on_admission() {
    let mut hive = TestHive::new(1);
    hive.add("a", WorkerRole::Implementer, 0).await;
    let t0 = Utc::now();
    hive.scheduler.step(t0).await.unwrap();
    let worker_id = worker_of(&hive, "a").await;

    let messages = hive
        .scheduler
        .router()
        .write()
        .await
        .poll(IMPLEMENTER, 10, t0);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].kind, MessageKind::WorkAssignment);
    let assignment: WorkAssignment = messages[0].payload_as().unwrap();
    assert_eq!(assignment.task_id, TaskId::from("a"));
    assert_eq!(assignment.worker_id, worker_id);
    assert_eq!(assignment.branch, "hive/task/a");
}

/// Test: Unacknowledged assignment
/// Given a worker that reads its assignment but never acknowledges it
/// When it is redelivered on the 0/30/60/120s schedule and the last window passes
/// Then the message fails and the scheduler receives an error naming it,
/// while the task itself keeps running
#[tokio::test]
async fn test_unacknowledged_assignment_fails_back_to_sender() {
    let mut hive = TestHive::new(1);
    hive.add("a", WorkerRole::Implementer, 0).await;
    let t0 = Utc::now();
    hive.scheduler.step(t0).await.unwrap();
    let worker_id = worker_of(&hive, "a").await;

    let mut at = t0;
    let mut assignment_id = None;
    for wait in [0, 30, 60, 120] {
        at += secs(wait);
        let polled = hive
            .scheduler
            .router()
            .write()
            .await
            .poll(IMPLEMENTER, 10, at);
        assert_eq!(polled.len(), 1, "attempt at +{}s", (at - t0).num_seconds());
        assignment_id = Some(polled[0].id);
        // Keep the worker alive so only the message is at stake.
        hive.scheduler
            .supervisor()
            .write()
            .await
            .heartbeat(worker_id, None, at)
            .unwrap();
    }
    let assignment_id = assignment_id.unwrap();
    assert!(hive
        .scheduler
        .router()
        .write()
        .await
        .poll(IMPLEMENTER, 10, at + secs(119))
        .is_empty());

    // The sweep fails the message and the report is handled on the next step.
    hive.scheduler
        .supervisor()
        .write()
        .await
        .heartbeat(worker_id, None, at + secs(120))
        .unwrap();
    hive.scheduler.step(at + secs(120)).await.unwrap();
    let report = hive.scheduler.step(at + secs(121)).await.unwrap();
    assert_eq!(report.messages, 1);

    let router = hive.scheduler.router().read().await;
    assert_eq!(
        router.get(assignment_id).unwrap().status,
        MessageStatus::Failed
    );
    let error = router
        .messages()
        .into_iter()
        .filter(|m| m.kind == MessageKind::Error && m.recipient == Endpoint::Scheduler)
        .map(|m| (m.status, m.payload_as::<ErrorReport>().unwrap()))
        .next()
        .unwrap();
    assert_eq!(error.0, MessageStatus::Delivered);
    assert_eq!(error.1.undelivered, Some(assignment_id));
    drop(router);
    assert_eq!(hive.state("a").await, TaskState::Running);
}

/// Test: Polling alone does not deliver
#[tokio::test]
async fn test_poll_without_ack_stays_pending() {
    let hive = TestHive::new(1);
    let t0 = Utc::now();
    let mut router = hive.scheduler.router().write().await;
    let id = router
        .send(
            Endpoint::Scheduler,
            Endpoint::Operator,
            MessageKind::Error,
            &ErrorReport {
                task_id: None,
                worker_id: None,
                error: "look at this".to_string(),
                undelivered: None,
            },
            t0,
        )
        .unwrap();

    assert_eq!(router.poll(Endpoint::Operator, 10, t0).len(), 1);
    assert_eq!(router.get(id).unwrap().status, MessageStatus::Pending);
    // Hidden until its next slot.
    assert!(router.poll(Endpoint::Operator, 10, t0 + secs(29)).is_empty());
    assert_eq!(router.poll(Endpoint::Operator, 10, t0 + secs(30)).len(), 1);

    router.acknowledge(id, t0 + secs(31)).unwrap();
    router.acknowledge(id, t0 + secs(32)).unwrap();
    assert_eq!(router.get(id).unwrap().status, MessageStatus::Delivered);
    assert!(router.poll(Endpoint::Operator, 10, t0 + secs(500)).is_empty());
}

/// Test: Messages past their TTL expire instead of being delivered
/// Given a router with a 30 second default TTL
/// When an escalation sits unread for 30 seconds
/// Then the sweep expires it and a poll never returns it
#[tokio::test]
async fn test_default_ttl_expires_unread_escalations() {
    let mut config = Config::default();
    config.router.default_ttl_secs = Some(30);
    let mut hive = TestHive::with_config(config);
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

    hive.scheduler.step(t0 + secs(40)).await.unwrap();
    let mut router = hive.scheduler.router().write().await;
    assert_eq!(router.pending_count(Some(Endpoint::Operator)), 0);
    assert!(router.poll(Endpoint::Operator, 10, t0 + secs(41)).is_empty());
    assert_eq!(router.count_by_status().get("expired"), Some(&1));
}
