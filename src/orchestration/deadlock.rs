//! Cycle analysis over the hard-dependency subgraph.
//!
//! `add_dependency` rejects cycle-closing edges, so a cycle can only appear
//! through restored or partially constructed graphs. The detector finds them
//! with Tarjan's SCC algorithm and suggests remediations; it never changes
//! the graph.

use crate::core::{Endpoint, ErrorReport, GraphStore, MessageKind, TaskId};
use crate::orchestration::router::MessageRouter;
use crate::{hlog, hlog_debug, hlog_error};
use chrono::{DateTime, Utc};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl Severity {
    /// 2 tasks: critical, 3-4: high, 5 or more: medium.
    pub fn for_cycle_len(len: usize) -> Self {
        match len {
            0..=2 => Severity::Critical,
            3..=4 => Severity::High,
            _ => Severity::Medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Remediation {
    /// Turn the hard edge `from -> to` into a soft one.
    DowngradeEdge { from: TaskId, to: TaskId },
    /// Let two mutually dependent tasks run side by side.
    Parallelize { a: TaskId, b: TaskId },
    /// Run the tasks in this order, dropping the back edges.
    Reorder { order: Vec<TaskId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Tasks along the cycle; each depends on the next, the last on the first.
    pub tasks: Vec<TaskId>,
    pub severity: Severity,
    pub remediations: Vec<Remediation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockReport {
    pub cycles: Vec<CycleReport>,
    pub checked_at: DateTime<Utc>,
}

impl DeadlockReport {
    pub fn is_clear(&self) -> bool {
        self.cycles.is_empty()
    }

    /// Task sets of every cycle, for change detection.
    fn signature(&self) -> Vec<Vec<TaskId>> {
        self.cycles.iter().map(|c| c.tasks.clone()).collect()
    }
}

/// Find every cycle in the hard-edge subgraph. One cycle is reported per
/// strongly connected component of more than one task.
pub fn analyze(graph: &GraphStore, now: DateTime<Utc>) -> DeadlockReport {
    let hard = graph.hard_subgraph();
    let priorities = graph.priorities();

    let mut cycles: Vec<CycleReport> = tarjan_scc(&hard)
        .into_iter()
        .filter(|scc| scc.len() > 1)
        .filter_map(|scc| {
            let tasks = ordered_cycle(&hard, &scc)?;
            let severity = Severity::for_cycle_len(tasks.len());
            let remediations = remediate(&tasks, &priorities);
            Some(CycleReport {
                tasks,
                severity,
                remediations,
            })
        })
        .collect();
    cycles.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.tasks.cmp(&b.tasks)));

    DeadlockReport {
        cycles,
        checked_at: now,
    }
}

/// A simple cycle through the component, starting at its smallest task id.
///
/// Breadth-first search from the start's successors back to the start,
/// staying inside the component, yields a shortest such cycle.
fn ordered_cycle(graph: &DiGraph<TaskId, ()>, scc: &[NodeIndex]) -> Option<Vec<TaskId>> {
    let members: HashSet<NodeIndex> = scc.iter().copied().collect();
    let start = *scc.iter().min_by(|a, b| graph[**a].cmp(&graph[**b]))?;

    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    let mut seen = HashSet::from([start]);
    while let Some(node) = queue.pop_front() {
        let mut next: Vec<NodeIndex> = graph
            .neighbors_directed(node, Direction::Outgoing)
            .filter(|n| members.contains(n))
            .collect();
        next.sort_by(|a, b| graph[*a].cmp(&graph[*b]));
        for succ in next {
            if succ == start {
                let mut path = vec![node];
                let mut cursor = node;
                while cursor != start {
                    cursor = *parent.get(&cursor)?;
                    path.push(cursor);
                }
                path.reverse();
                return Some(path.into_iter().map(|n| graph[n].clone()).collect());
            }
            if seen.insert(succ) {
                parent.insert(succ, node);
                queue.push_back(succ);
            }
        }
    }
    None
}

fn remediate(cycle: &[TaskId], priorities: &HashMap<TaskId, u32>) -> Vec<Remediation> {
    let priority = |id: &TaskId| priorities.get(id).copied().unwrap_or(0);
    let mut out = Vec::new();

    // Cheapest break: the edge whose dependent matters least.
    let weakest = (0..cycle.len()).min_by(|&a, &b| {
        priority(&cycle[a])
            .cmp(&priority(&cycle[b]))
            .then(cycle[a].cmp(&cycle[b]))
    });
    if let Some(i) = weakest {
        out.push(Remediation::DowngradeEdge {
            from: cycle[i].clone(),
            to: cycle[(i + 1) % cycle.len()].clone(),
        });
    }

    if cycle.len() == 2 {
        out.push(Remediation::Parallelize {
            a: cycle[0].clone(),
            b: cycle[1].clone(),
        });
    } else {
        let mut order = cycle.to_vec();
        order.sort_by(|a, b| priority(b).cmp(&priority(a)).then(a.cmp(b)));
        out.push(Remediation::Reorder { order });
    }
    out
}

/// Runs `analyze` on an interval and alerts the operator when the set of
/// cycles changes.
pub struct DeadlockDetector {
    graph: Arc<RwLock<GraphStore>>,
    router: Arc<RwLock<MessageRouter>>,
    interval: Duration,
    last: Option<DeadlockReport>,
}

impl DeadlockDetector {
    pub fn new(
        graph: Arc<RwLock<GraphStore>>,
        router: Arc<RwLock<MessageRouter>>,
        interval: Duration,
    ) -> Self {
        Self {
            graph,
            router,
            interval,
            last: None,
        }
    }

    pub fn last_report(&self) -> Option<&DeadlockReport> {
        self.last.as_ref()
    }

    /// Analyze once. Sends one operator alert per newly observed cycle set.
    pub async fn check(&mut self) -> DeadlockReport {
        let now = Utc::now();
        let report = analyze(&*self.graph.read().await, now);
        let changed = self
            .last
            .as_ref()
            .map_or(!report.is_clear(), |last| last.signature() != report.signature());

        if changed && !report.is_clear() {
            for cycle in &report.cycles {
                hlog_error!(
                    "Deadlock ({:?}): {}",
                    cycle.severity,
                    cycle
                        .tasks
                        .iter()
                        .map(|t| t.as_str())
                        .collect::<Vec<_>>()
                        .join(" -> ")
                );
            }
            let alert = ErrorReport {
                task_id: report.cycles.first().and_then(|c| c.tasks.first().cloned()),
                worker_id: None,
                error: format!("{} dependency cycle(s) detected", report.cycles.len()),
                undelivered: None,
            };
            let sent = self.router.write().await.send(
                Endpoint::Scheduler,
                Endpoint::Operator,
                MessageKind::Error,
                &alert,
                now,
            );
            if let Err(e) = sent {
                hlog_error!("Failed to send deadlock alert: {}", e);
            }
        } else if changed {
            hlog!("Dependency cycles resolved");
        } else {
            hlog_debug!("Deadlock check: {} cycle(s), unchanged", report.cycles.len());
        }

        self.last = Some(report.clone());
        report
    }

    /// Check on every interval until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        hlog_debug!("Deadlock detector started ({:?} interval)", self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.check().await;
                }
            }
        }
        hlog_debug!("Deadlock detector stopped");
    }
}
