//! Plan files: the TOML form of a batch of work.
//!
//! ```toml
//! [[task]]
//! id = "parser"
//! scope = "Rewrite the config parser"
//! priority = 10
//! role = "implementer"
//!
//! [[task]]
//! id = "parser-tests"
//! scope = "Cover the new parser"
//! role = "tester"
//! depends_on = ["parser"]
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{DependencyEdge, EdgeKind, EdgeStatus, GraphStore, Task, TaskId, WorkerRole};
use crate::{hlog, hlog_debug, Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub id: String,
    pub scope: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_effort")]
    pub effort: u32,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub role: WorkerRole,
    /// Hard dependencies: this task waits for each of these to complete.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Ordering hints that never block.
    #[serde(default)]
    pub soft_depends_on: Vec<String>,
}

fn default_effort() -> u32 {
    1
}

impl PlannedTask {
    fn to_task(&self) -> Task {
        let mut task = Task::new(self.id.as_str(), &self.scope)
            .with_priority(self.priority)
            .with_effort(self.effort)
            .with_role(self.role);
        if let Some(group) = &self.group {
            task = task.with_group(group.as_str());
        }
        task
    }

    fn edges(&self) -> impl Iterator<Item = (TaskId, TaskId, EdgeKind)> + '_ {
        let hard = self.depends_on.iter().map(|d| (d, EdgeKind::Hard));
        let soft = self.soft_depends_on.iter().map(|d| (d, EdgeKind::Soft));
        hard.chain(soft).map(move |(dep, kind)| {
            (TaskId::from(self.id.as_str()), TaskId::from(dep.as_str()), kind)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default, rename = "task")]
    pub tasks: Vec<PlannedTask>,
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        hlog_debug!("Plan::load path={}", path.display());
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let plan: Plan = toml::from_str(contents)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Structural checks that need no graph: non-empty unique ids and
    /// dependencies that name tasks in this plan.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for task in &self.tasks {
            if task.id.trim().is_empty() {
                return Err(Error::Validation("task id must not be empty".to_string()));
            }
            if !ids.insert(task.id.as_str()) {
                return Err(Error::Validation(format!("duplicate task id: {}", task.id)));
            }
        }
        for task in &self.tasks {
            for dep in task.depends_on.iter().chain(&task.soft_depends_on) {
                if !ids.contains(dep.as_str()) {
                    return Err(Error::Validation(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
            }
        }
        Ok(())
    }

    /// Add every task, then every edge, to `graph`.
    ///
    /// The plan is first applied to an empty graph so that a cycle or a
    /// clash with an existing task id leaves `graph` untouched.
    pub fn submit(&self, graph: &mut GraphStore) -> Result<()> {
        self.validate()?;
        if let Some(clash) = self
            .tasks
            .iter()
            .find(|t| graph.contains_task(&TaskId::from(t.id.as_str())))
        {
            return Err(Error::Validation(format!("Task {} already exists", clash.id)));
        }
        self.apply(&mut GraphStore::new())?;
        self.apply(graph)?;
        hlog!("Submitted plan with {} task(s)", self.tasks.len());
        Ok(())
    }

    fn apply(&self, graph: &mut GraphStore) -> Result<()> {
        for planned in &self.tasks {
            graph.add_task(planned.to_task())?;
        }
        for planned in &self.tasks {
            for (from, to, kind) in planned.edges() {
                graph.add_dependency(&from, &to, kind)?;
            }
        }
        Ok(())
    }

    /// Tasks and edges as records, without cycle checks. Used to analyze
    /// plans that `submit` would reject.
    pub fn into_records(self) -> (Vec<Task>, Vec<DependencyEdge>) {
        let edges = self
            .tasks
            .iter()
            .flat_map(|t| t.edges())
            .map(|(from, to, kind)| DependencyEdge {
                from,
                to,
                kind,
                status: EdgeStatus::Pending,
            })
            .collect();
        let tasks = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mut task = t.to_task();
                task.sequence = i as u64;
                task
            })
            .collect();
        (tasks, edges)
    }
}
