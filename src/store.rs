//! Durable state.
//!
//! The whole orchestration state is one JSON document. Saves keep the
//! previous file as `.json.bak` and replace the current one by rename, so a
//! crash mid-write never leaves a torn file behind.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{DependencyEdge, Message, Task, Worker, Workspace};
use crate::util::blocking;
use crate::{hlog_debug, Error, Result};

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
    pub edges: Vec<DependencyEdge>,
    pub workers: Vec<Worker>,
    pub workspaces: Vec<Workspace>,
    pub messages: Vec<Message>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            tasks: Vec::new(),
            edges: Vec::new(),
            workers: Vec::new(),
            workspaces: Vec::new(),
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `None` when nothing has been saved yet.
    pub async fn load(&self) -> Result<Option<PersistedState>> {
        let path = self.path.clone();
        blocking(move || load_sync(&path)).await
    }

    pub async fn save(&self, state: &PersistedState) -> Result<()> {
        let contents = serde_json::to_string_pretty(state)?;
        let path = self.path.clone();
        hlog_debug!(
            "Saving state: {} tasks, {} workers, {} messages",
            state.tasks.len(),
            state.workers.len(),
            state.messages.len()
        );
        blocking(move || write_atomic(&path, &contents)).await
    }
}

fn load_sync(path: &Path) -> Result<Option<PersistedState>> {
    if !path.exists() {
        hlog_debug!("State file not found: {}", path.display());
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    let state: PersistedState = serde_json::from_str(&contents)?;
    if state.version > STATE_VERSION {
        return Err(Error::Validation(format!(
            "State file version {} is newer than supported version {}",
            state.version, STATE_VERSION
        )));
    }
    hlog_debug!(
        "State loaded: {} tasks, {} edges",
        state.tasks.len(),
        state.edges.len()
    );
    Ok(Some(state))
}

/// Write `contents` to `path` via a temp file and rename, backing up any
/// existing file first.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        fs::copy(path, path.with_extension("json.bak"))?;
    }
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}
