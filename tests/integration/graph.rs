//! Dependency graph tests: cycle rejection and readiness over random graphs.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_test::{assert_err, assert_ok};

use hive::core::{EdgeKind, GraphStore, Task, TaskId, TaskState, TaskStatus};
use hive::orchestration::{analyze, Remediation, Severity};
use hive::Error;

fn id(s: &str) -> TaskId {
    TaskId::from(s)
}

/// Test: Cycle rejection
/// Given A -> B and B -> C as hard edges
/// When C -> A is added
/// Then it fails with a cycle error and the graph is unchanged
#[test]
fn test_third_edge_closing_cycle_is_rejected() {
    let mut graph = GraphStore::new();
    for name in ["a", "b", "c"] {
        graph.add_task(Task::new(name, "scope")).unwrap();
    }
    assert_ok!(graph.add_dependency(&id("a"), &id("b"), EdgeKind::Hard));
    assert_ok!(graph.add_dependency(&id("b"), &id("c"), EdgeKind::Hard));
    let edges_before = graph.edges();
    let states_before: Vec<TaskState> = ["a", "b", "c"]
        .iter()
        .map(|n| graph.get_task(&id(n)).unwrap().state())
        .collect();

    let err = assert_err!(graph.add_dependency(&id("c"), &id("a"), EdgeKind::Hard));
    assert!(matches!(err, Error::Cycle { .. }));
    assert_eq!(graph.edges(), edges_before);
    let states_after: Vec<TaskState> = ["a", "b", "c"]
        .iter()
        .map(|n| graph.get_task(&id(n)).unwrap().state())
        .collect();
    assert_eq!(states_after, states_before);
    assert!(analyze(&graph, Utc::now()).is_clear());

    // The same edge is fine as a soft hint.
    assert_ok!(graph.add_dependency(&id("c"), &id("a"), EdgeKind::Soft));
    assert!(analyze(&graph, Utc::now()).is_clear());
}

/// Test: Restored state with a cycle is reported with remediations
#[test]
fn test_restored_cycle_is_detected() {
    let mut graph = GraphStore::new();
    for name in ["a", "b"] {
        graph.add_task(Task::new(name, "scope")).unwrap();
    }
    graph.add_dependency(&id("a"), &id("b"), EdgeKind::Hard).unwrap();
    let mut edges = graph.edges();
    let mut back = edges[0].clone();
    back.from = id("b");
    back.to = id("a");
    edges.push(back);
    let tasks: Vec<Task> = graph.all_tasks().into_iter().cloned().collect();

    let restored = GraphStore::restore(tasks, edges);
    let report = analyze(&restored, Utc::now());
    assert_eq!(report.cycles.len(), 1);
    assert_eq!(report.cycles[0].severity, Severity::Critical);
    assert!(report.cycles[0]
        .remediations
        .iter()
        .any(|r| matches!(r, Remediation::Parallelize { .. })));
}

fn assert_ready_iff_deps_completed(graph: &GraphStore) {
    for task in graph.tasks() {
        let deps_done = graph.hard_dependencies(&task.id).iter().all(|dep| {
            graph.get_task(dep).unwrap().state() == TaskState::Completed
        });
        match task.state() {
            TaskState::Ready => assert!(deps_done, "{} ready with open dependencies", task.id),
            TaskState::Blocked | TaskState::Pending => {
                assert!(!deps_done, "{} waiting with all dependencies done", task.id)
            }
            _ => {}
        }
    }
}

/// Test: Readiness over random acyclic graphs
/// Given random tasks with random hard and soft edges pointing at earlier tasks
/// When ready tasks are completed in random order
/// Then at every step a task is ready exactly when its hard dependencies are completed
#[test]
fn test_ready_iff_hard_dependencies_completed() {
    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut graph = GraphStore::new();
        let n = rng.gen_range(2..25);
        for i in 0..n {
            graph.add_task(Task::new(format!("t{}", i), "scope")).unwrap();
        }
        for i in 1..n {
            for j in 0..i {
                if rng.gen_bool(0.15) {
                    let kind = if rng.gen_bool(0.8) {
                        EdgeKind::Hard
                    } else {
                        EdgeKind::Soft
                    };
                    graph
                        .add_dependency(&id(&format!("t{}", i)), &id(&format!("t{}", j)), kind)
                        .unwrap();
                }
            }
        }
        assert_ready_iff_deps_completed(&graph);

        loop {
            let ready = graph.list_ready(usize::MAX);
            if ready.is_empty() {
                break;
            }
            let pick = ready[rng.gen_range(0..ready.len())].id.clone();
            graph
                .transition(&pick, TaskState::Ready, TaskStatus::Assigned)
                .unwrap();
            graph
                .transition(&pick, TaskState::Assigned, TaskStatus::Running)
                .unwrap();
            graph.mark_completed(&pick).unwrap();
            assert_ready_iff_deps_completed(&graph);
        }
        assert!(
            graph.tasks().iter().all(|t| t.state() == TaskState::Completed),
            "seed {} left tasks unfinished",
            seed
        );
    }
}

/// Test: A failed dependency keeps its dependents blocked; unblocking a
/// dependent without completing the dependency puts it back to blocked
#[test]
fn test_failed_dependency_keeps_dependents_waiting() {
    let mut graph = GraphStore::new();
    graph.add_task(Task::new("a", "scope")).unwrap();
    graph.add_task(Task::new("b", "scope")).unwrap();
    graph.add_dependency(&id("b"), &id("a"), EdgeKind::Hard).unwrap();

    graph
        .transition(&id("a"), TaskState::Ready, TaskStatus::Assigned)
        .unwrap();
    graph
        .transition(&id("a"), TaskState::Assigned, TaskStatus::Running)
        .unwrap();
    graph
        .transition(
            &id("a"),
            TaskState::Running,
            TaskStatus::Failed {
                error: "boom".to_string(),
            },
        )
        .unwrap();

    assert_eq!(graph.get_task(&id("b")).unwrap().state(), TaskState::Blocked);
    let status = graph.unblock(&id("b")).unwrap();
    assert_eq!(status.state(), TaskState::Blocked);
    assert!(graph.list_ready(10).is_empty());
}
