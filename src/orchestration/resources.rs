//! Host resource gate for admission.

use crate::config::ResourceConfig;
use crate::{hlog_trace, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Pressure level reported by the gate and by worker health.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum GateLevel {
    #[default]
    Ok,
    Warning,
    Critical,
}

impl std::fmt::Display for GateLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GateLevel::Ok => "ok",
            GateLevel::Warning => "warning",
            GateLevel::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// One host measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HostSample {
    /// 1-minute load average per CPU.
    pub load_per_cpu: f64,
    pub memory_used_percent: f64,
    pub disk_used_percent: f64,
}

pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> Result<HostSample>;
}

/// Reads load and memory from /proc and disk usage via statvfs.
#[derive(Debug, Clone)]
pub struct ProcProbe {
    disk_path: PathBuf,
}

impl ProcProbe {
    pub fn new(disk_path: PathBuf) -> Self {
        Self { disk_path }
    }
}

impl ResourceProbe for ProcProbe {
    fn sample(&self) -> Result<HostSample> {
        let loadavg = std::fs::read_to_string("/proc/loadavg")?;
        let meminfo = std::fs::read_to_string("/proc/meminfo")?;
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        Ok(HostSample {
            load_per_cpu: parse_load(&loadavg).unwrap_or(0.0) / cpus,
            memory_used_percent: parse_memory_percent(&meminfo).unwrap_or(0.0),
            disk_used_percent: disk_used_percent(&self.disk_path)?,
        })
    }
}

fn parse_load(loadavg: &str) -> Option<f64> {
    loadavg.split_whitespace().next()?.parse().ok()
}

fn parse_memory_percent(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some((total - available) / total * 100.0)
}

fn disk_used_percent(path: &std::path::Path) -> Result<f64> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| crate::Error::Validation(e.to_string()))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let total = stat.f_blocks as f64;
    if total <= 0.0 {
        return Ok(0.0);
    }
    let free = stat.f_bavail as f64;
    Ok((total - free) / total * 100.0)
}

/// A probe whose reading is set by hand.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    sample: Arc<Mutex<HostSample>>,
}

impl StaticProbe {
    pub fn new(sample: HostSample) -> Self {
        Self {
            sample: Arc::new(Mutex::new(sample)),
        }
    }

    pub fn set(&self, sample: HostSample) {
        *self.sample.lock().unwrap_or_else(|e| e.into_inner()) = sample;
    }
}

impl ResourceProbe for StaticProbe {
    fn sample(&self) -> Result<HostSample> {
        Ok(*self.sample.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReading {
    pub level: GateLevel,
    pub sample: HostSample,
    /// Human-readable reasons for a non-ok level.
    pub reasons: Vec<String>,
}

/// Compares host samples against the configured thresholds.
pub struct ResourceGate {
    thresholds: ResourceConfig,
    probe: Arc<dyn ResourceProbe>,
}

impl ResourceGate {
    pub fn new(thresholds: ResourceConfig, probe: Arc<dyn ResourceProbe>) -> Self {
        Self { thresholds, probe }
    }

    /// Sample the host. A probe failure reads as `warning`.
    pub fn check(&self) -> GateReading {
        match self.probe.sample() {
            Ok(sample) => {
                hlog_trace!(
                    "host sample: load/cpu={:.2} mem={:.1}% disk={:.1}%",
                    sample.load_per_cpu,
                    sample.memory_used_percent,
                    sample.disk_used_percent
                );
                self.evaluate(sample)
            }
            Err(e) => GateReading {
                level: GateLevel::Warning,
                sample: HostSample::default(),
                reasons: vec![format!("resource probe failed: {}", e)],
            },
        }
    }

    pub fn evaluate(&self, sample: HostSample) -> GateReading {
        let t = &self.thresholds;
        let checks = [
            ("load", sample.load_per_cpu, t.load_warning, t.load_critical),
            (
                "memory",
                sample.memory_used_percent,
                t.memory_warning_percent,
                t.memory_critical_percent,
            ),
            (
                "disk",
                sample.disk_used_percent,
                t.disk_warning_percent,
                t.disk_critical_percent,
            ),
        ];

        let mut level = GateLevel::Ok;
        let mut reasons = Vec::new();
        for (name, value, warning, critical) in checks {
            let this = if value >= critical {
                GateLevel::Critical
            } else if value >= warning {
                GateLevel::Warning
            } else {
                continue;
            };
            reasons.push(format!("{} {:.2} is {}", name, value, this));
            level = level.max(this);
        }
        GateReading {
            level,
            sample,
            reasons,
        }
    }
}
