//! Worker process launching and control.
//!
//! The supervisor never touches `std::process` directly; it goes through
//! [`WorkerLauncher`] and [`WorkerProcess`] so tests can substitute
//! scripted processes.

use crate::core::{ResourceSample, TaskId, WorkerId, WorkerRole};
use crate::{hlog_debug, hlog_warn, Error, Result};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Everything needed to start one worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub worker_id: WorkerId,
    pub role: WorkerRole,
    pub task_id: TaskId,
    pub workspace: PathBuf,
    pub branch: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Environment handed to the worker: identity, task and workspace.
    pub fn worker_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.insert("HIVE_WORKER_ID".into(), self.worker_id.0.to_string());
        env.insert("HIVE_TASK_ID".into(), self.task_id.to_string());
        env.insert("HIVE_ROLE".into(), self.role.to_string());
        env.insert(
            "HIVE_WORKSPACE".into(),
            self.workspace.display().to_string(),
        );
        env.insert("HIVE_BRANCH".into(), self.branch.clone());
        env
    }
}

/// A running worker process.
pub trait WorkerProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// `Some(code)` once the process has exited. Signals map to `128 + signo`.
    fn try_wait(&self) -> Result<Option<i32>>;

    /// Ask the process to stop (SIGTERM).
    fn terminate(&self) -> Result<()>;

    /// Stop the process unconditionally (SIGKILL).
    fn force_kill(&self) -> Result<()>;

    /// Current CPU and memory use, if the platform exposes it.
    fn sample(&self) -> Option<ResourceSample>;
}

pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn WorkerProcess>>;
}

/// Launches workers as local child processes.
#[derive(Debug, Clone, Default)]
pub struct LocalLauncher {
    /// Directory for per-worker output logs; output is discarded when unset.
    log_dir: Option<PathBuf>,
    /// Directory where each worker's inbox file lives.
    inbox_dir: Option<PathBuf>,
}

impl LocalLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }

    pub fn with_inbox_dir(mut self, dir: PathBuf) -> Self {
        self.inbox_dir = Some(dir);
        self
    }

    fn output_file(&self, spec: &LaunchSpec) -> Result<Option<File>> {
        let Some(dir) = &self.log_dir else {
            return Ok(None);
        };
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}-{}.log", spec.role, spec.worker_id.short()));
        Ok(Some(
            OpenOptions::new().create(true).append(true).open(path)?,
        ))
    }
}

impl WorkerLauncher for LocalLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn WorkerProcess>> {
        let program = which::which(&spec.command).map_err(|e| Error::Spawn {
            role: spec.role,
            reason: format!("{}: {}", spec.command, e),
        })?;

        let mut command = Command::new(&program);
        command
            .args(&spec.args)
            .current_dir(&spec.workspace)
            .envs(spec.worker_env())
            .stdin(Stdio::null());
        if let Some(dir) = &self.inbox_dir {
            command.env("HIVE_INBOX", dir);
        }
        match self.output_file(spec)? {
            Some(file) => {
                let err = file.try_clone()?;
                command.stdout(Stdio::from(file)).stderr(Stdio::from(err));
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = command.spawn().map_err(|e| Error::Spawn {
            role: spec.role,
            reason: e.to_string(),
        })?;
        hlog_debug!(
            "Launched {} worker {} as pid {} in {}",
            spec.role,
            spec.worker_id,
            child.id(),
            spec.workspace.display()
        );
        Ok(Arc::new(LocalProcess::new(child)))
    }
}

struct CpuMark {
    ticks: u64,
    at: Instant,
}

/// A child process owned by the supervisor.
pub struct LocalProcess {
    child: Mutex<Child>,
    pid: u32,
    last_cpu: Mutex<Option<CpuMark>>,
}

impl LocalProcess {
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child: Mutex::new(child),
            pid,
            last_cpu: Mutex::new(None),
        }
    }

    fn signal(&self, signal: libc::c_int) -> Result<()> {
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Already gone; try_wait will report the exit.
            return Ok(());
        }
        Err(err.into())
    }

    /// CPU percent since the previous sample; the first sample reports 0.
    fn cpu_percent(&self) -> Option<f32> {
        let ticks = read_cpu_ticks(self.pid)?;
        let now = Instant::now();
        let mut last = self.last_cpu.lock().unwrap_or_else(|e| e.into_inner());
        let percent = match last.as_ref() {
            Some(mark) => {
                let wall = now.duration_since(mark.at).as_secs_f64();
                let hz = clock_ticks_per_sec();
                if wall <= 0.0 || hz <= 0.0 {
                    0.0
                } else {
                    let used = ticks.saturating_sub(mark.ticks) as f64 / hz;
                    (used / wall * 100.0) as f32
                }
            }
            None => 0.0,
        };
        *last = Some(CpuMark { ticks, at: now });
        Some(percent)
    }
}

impl WorkerProcess for LocalProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&self) -> Result<Option<i32>> {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        let Some(status) = child.try_wait()? else {
            return Ok(None);
        };
        if let Some(code) = status.code() {
            return Ok(Some(code));
        }
        use std::os::unix::process::ExitStatusExt;
        Ok(Some(128 + status.signal().unwrap_or(0)))
    }

    fn terminate(&self) -> Result<()> {
        self.signal(libc::SIGTERM)
    }

    fn force_kill(&self) -> Result<()> {
        self.signal(libc::SIGKILL)?;
        // Reap so the pid does not linger as a zombie.
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = child.wait() {
            hlog_warn!("Failed to reap pid {}: {}", self.pid, e);
        }
        Ok(())
    }

    fn sample(&self) -> Option<ResourceSample> {
        let memory_mb = read_rss_mb(self.pid)?;
        let cpu_percent = self.cpu_percent().unwrap_or(0.0);
        Some(ResourceSample {
            cpu_percent,
            memory_mb,
        })
    }
}

fn clock_ticks_per_sec() -> f64 {
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 {
        hz as f64
    } else {
        100.0
    }
}

/// utime + stime from /proc/<pid>/stat.
fn read_cpu_ticks(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_cpu_ticks(&stat)
}

fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    // The command name may contain spaces; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // rest starts at field 3 (state); utime and stime are fields 14 and 15.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn read_rss_mb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    parse_rss_mb(&status)
}

fn parse_rss_mb(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}
