//! Worker supervision under concurrency.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use hive::config::Config;
use hive::core::{TaskId, WorkerRole, WorkerStatus};
use hive::orchestration::{kill_worker, SpawnRequest, SupervisorEvent, WorkerSupervisor};
use hive::Error;

use crate::fixtures::{secs, ScriptedLauncher, TestHive};

fn request(task: &str, role: WorkerRole) -> SpawnRequest {
    SpawnRequest {
        task_id: TaskId::from(task),
        role,
        workspace: PathBuf::from(format!("/tmp/hive-test/{}", task)),
        branch: format!("hive/task/{}", task),
    }
}

/// Test: One worker per role
/// Given sixteen concurrent spawn requests for the same role
/// When they race on a shared supervisor
/// Then exactly one succeeds and every other one fails with RoleBusy
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_spawns_hold_singleton_role() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let supervisor = Arc::new(RwLock::new(WorkerSupervisor::from_config(
        &Config::default(),
        launcher.clone(),
    )));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                supervisor
                    .write()
                    .await
                    .spawn(request(&format!("t{}", i), WorkerRole::Reviewer), Utc::now())
            })
        })
        .collect();

    let mut winners = Vec::new();
    let mut busy = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(id) => winners.push(id),
            Err(Error::RoleBusy { role, .. }) => {
                assert_eq!(role, WorkerRole::Reviewer);
                busy += 1;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(busy, 15);
    assert_eq!(launcher.launch_count(), 1);

    let sup = supervisor.read().await;
    assert_eq!(sup.role_holder(WorkerRole::Reviewer), Some(winners[0]));
    assert_eq!(sup.live_count(), 1);
    assert_eq!(sup.role_holder(WorkerRole::Tester), None);
}

/// Test: Killing the holder frees the role
#[tokio::test]
async fn test_kill_releases_role_slot() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let supervisor = Arc::new(RwLock::new(WorkerSupervisor::from_config(
        &Config::default(),
        launcher.clone(),
    )));
    let first = supervisor
        .write()
        .await
        .spawn(request("a", WorkerRole::Integrator), Utc::now())
        .unwrap();
    assert!(matches!(
        supervisor
            .write()
            .await
            .spawn(request("b", WorkerRole::Integrator), Utc::now()),
        Err(Error::RoleBusy { holder, .. }) if holder == first
    ));

    let dead = kill_worker(&supervisor, first, "operator request").await.unwrap();
    assert_eq!(dead.status, WorkerStatus::Dead);
    assert_eq!(dead.error.as_deref(), Some("operator request"));
    assert!(dead.workspace_path.is_none());

    let second = supervisor
        .write()
        .await
        .spawn(request("b", WorkerRole::Integrator), Utc::now())
        .unwrap();
    assert_ne!(first, second);
}

/// Test: Stalled workers keep their slot until the timeout
/// Given a worker silent for longer than the heartbeat interval
/// When health is checked
/// Then it is reported stalled, still holds the role, and a heartbeat
/// brings it back to running
#[tokio::test]
async fn test_stalled_worker_recovers_on_heartbeat() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let mut supervisor = WorkerSupervisor::from_config(&Config::default(), launcher);
    let t0 = Utc::now();
    let id = supervisor
        .spawn(request("a", WorkerRole::Implementer), t0)
        .unwrap();
    supervisor.heartbeat(id, None, t0).unwrap();

    let events = supervisor.check_health(t0 + secs(45));
    assert!(matches!(events.as_slice(), [SupervisorEvent::Stalled { .. }]));
    assert_eq!(supervisor.get(id).unwrap().status, WorkerStatus::Stalled);
    assert_eq!(supervisor.role_holder(WorkerRole::Implementer), Some(id));
    // Reported once per stall.
    assert!(supervisor.check_health(t0 + secs(50)).is_empty());

    supervisor.heartbeat(id, None, t0 + secs(55)).unwrap();
    assert_eq!(supervisor.get(id).unwrap().status, WorkerStatus::Running);
    assert!(supervisor.check_health(t0 + secs(60)).is_empty());
}

/// Test: Snapshots show each worker's health
#[tokio::test]
async fn test_snapshot_reports_worker_health() {
    let mut hive = TestHive::new(2);
    hive.add("a", WorkerRole::Implementer, 0).await;
    hive.add("b", WorkerRole::Tester, 0).await;
    let t0 = Utc::now();
    hive.scheduler.step(t0).await.unwrap();

    let snapshot = hive.scheduler.snapshot(t0 + secs(40)).await;
    assert_eq!(snapshot.task_count("running"), 2);
    assert_eq!(snapshot.workers.len(), 2);
    assert!(snapshot.workers.iter().all(|w| w.silence_secs == 40));
    assert_eq!(snapshot.workspaces.get("active"), Some(&2));
    assert_eq!(snapshot.pending_restarts, 0);
    assert!(snapshot.to_json().unwrap().contains("\"running\""));
}
