use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::WorkerRole;
use crate::{hlog_debug, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub deadlock: DeadlockConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Ceiling on tasks that are assigned or running at once.
    pub max_parallel: usize,
    pub tick_interval_ms: u64,
    /// Consecutive admission rollbacks before a task is blocked.
    pub max_admission_failures: u32,
    pub snapshot_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            tick_interval_ms: 1000,
            max_admission_failures: 3,
            snapshot_interval_secs: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Expected heartbeat cadence; silence beyond this marks a worker stalled.
    pub heartbeat_interval_secs: u64,
    /// Silence beyond this kills the worker.
    pub heartbeat_timeout_secs: u64,
    pub kill_grace_secs: u64,
    pub max_retries: u32,
    pub backoff_cap_secs: u64,
    /// Per-worker CPU ceiling in percent of one core.
    pub cpu_ceiling_percent: f32,
    pub memory_ceiling_mb: u64,
    /// Consecutive samples above a ceiling before the overshoot is reported.
    pub overshoot_samples: u32,
    pub health_interval_ms: u64,
    /// Finished workers kept for reporting; the oldest are dropped first.
    pub history_limit: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 120,
            kill_grace_secs: 10,
            max_retries: 3,
            backoff_cap_secs: 60,
            cpu_ceiling_percent: 90.0,
            memory_ceiling_mb: 2048,
            overshoot_samples: 3,
            health_interval_ms: 5000,
            history_limit: 256,
        }
    }
}

impl SupervisorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

/// Host thresholds for the admission gate. Each pair is (warning, critical).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// 1-minute load average divided by CPU count.
    pub load_warning: f64,
    pub load_critical: f64,
    pub memory_warning_percent: f64,
    pub memory_critical_percent: f64,
    pub disk_warning_percent: f64,
    pub disk_critical_percent: f64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            load_warning: 0.8,
            load_critical: 1.5,
            memory_warning_percent: 80.0,
            memory_critical_percent: 95.0,
            disk_warning_percent: 85.0,
            disk_critical_percent: 95.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Delay before each delivery attempt, relative to the previous one.
    pub retry_schedule_secs: Vec<u64>,
    pub retention_days: u64,
    /// TTL applied to messages sent without an explicit one.
    pub default_ttl_secs: Option<u64>,
    pub sweep_interval_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            retry_schedule_secs: vec![0, 30, 60, 120],
            retention_days: 7,
            default_ttl_secs: None,
            sweep_interval_ms: 5000,
        }
    }
}

impl RouterConfig {
    pub fn retry_schedule(&self) -> Vec<Duration> {
        self.retry_schedule_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }

    /// One attempt per schedule slot.
    pub fn max_attempts(&self) -> u32 {
        self.retry_schedule_secs.len().max(1) as u32
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub worktree_dir: Option<String>,
    /// Shared branch that task branches merge into.
    pub base_branch: String,
    pub branch_prefix: String,
    /// Paths (regex) eligible for automatic union merge.
    pub auxiliary_patterns: Vec<String>,
    pub merge_timeout_secs: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            worktree_dir: None,
            base_branch: "hive/staging".to_string(),
            branch_prefix: "hive/task".to_string(),
            auxiliary_patterns: vec![
                r"(^|/)CHANGELOG(\.md)?$".to_string(),
                r"(^|/)MANIFEST(\.[a-z]+)?$".to_string(),
                r"\.log$".to_string(),
            ],
            merge_timeout_secs: 300,
        }
    }
}

impl WorkspaceConfig {
    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlockConfig {
    pub interval_secs: u64,
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl DeadlockConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Executable launched for a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Per-role overrides keyed by role name (`implementer`, `tester`, ...).
    pub roles: BTreeMap<String, WorkerCommand>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            command: "hive-worker".to_string(),
            args: Vec::new(),
            roles: BTreeMap::new(),
        }
    }
}

impl WorkersConfig {
    pub fn command_for(&self, role: WorkerRole) -> WorkerCommand {
        self.roles
            .get(role.as_str())
            .cloned()
            .unwrap_or_else(|| WorkerCommand {
                command: self.command.clone(),
                args: self.args.clone(),
            })
    }
}

impl Config {
    pub fn hive_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".hive"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("hive.toml"))
    }

    pub fn state_path() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("state.json"))
    }

    pub fn snapshot_path() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("snapshot.json"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.workspace.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::hive_dir()?.join("worktrees")),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        hlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            hlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        hlog_debug!(
            "Config loaded: max_parallel={}, heartbeat_timeout={}s, base_branch={}",
            config.scheduler.max_parallel,
            config.supervisor.heartbeat_timeout_secs,
            config.workspace.base_branch
        );
        Ok(config)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let hive_dir = Self::hive_dir()?;
        let worktrees_dir = self.worktrees_dir()?;
        if !hive_dir.exists() {
            hlog_debug!("Creating hive directory: {}", hive_dir.display());
            fs::create_dir_all(&hive_dir)?;
        }
        if !worktrees_dir.exists() {
            hlog_debug!("Creating worktrees directory: {}", worktrees_dir.display());
            fs::create_dir_all(&worktrees_dir)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_parallel == 0 {
            return Err(Error::Validation(
                "scheduler.max_parallel must be at least 1".to_string(),
            ));
        }
        if self.supervisor.heartbeat_timeout_secs < self.supervisor.heartbeat_interval_secs {
            return Err(Error::Validation(
                "supervisor.heartbeat_timeout_secs must not be below heartbeat_interval_secs"
                    .to_string(),
            ));
        }
        if self.router.retry_schedule_secs.is_empty() {
            return Err(Error::Validation(
                "router.retry_schedule_secs must not be empty".to_string(),
            ));
        }
        if self.resources.load_warning > self.resources.load_critical
            || self.resources.memory_warning_percent > self.resources.memory_critical_percent
            || self.resources.disk_warning_percent > self.resources.disk_critical_percent
        {
            return Err(Error::Validation(
                "resource warning thresholds must not exceed critical thresholds".to_string(),
            ));
        }
        for role in self.workers.roles.keys() {
            if role.parse::<WorkerRole>().is_err() {
                return Err(Error::Validation(format!("unknown worker role: {}", role)));
            }
        }
        Ok(())
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
