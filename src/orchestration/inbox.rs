//! File-based message exchange with external worker processes.
//!
//! Workers drop JSON files into `<dir>/in/`: either a message for the router
//! or an acknowledgement of a message they received. Messages addressed to a
//! worker role are written to `<dir>/out/<role>/<message-id>.json` each time
//! the router hands them out, so redelivery rewrites the same file.

use crate::core::{Endpoint, MessageId, MessageKind, WorkerRole};
use crate::orchestration::router::MessageRouter;
use crate::util::blocking;
use crate::{hlog_debug, hlog_warn, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;

/// Messages handed to one role per delivery pass.
const DELIVERY_BATCH: usize = 16;

/// One file in the inbound directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum InboxEntry {
    Message {
        sender: Endpoint,
        recipient: Endpoint,
        kind: MessageKind,
        #[serde(default)]
        payload: serde_json::Value,
        #[serde(default)]
        ttl_secs: Option<u64>,
    },
    Ack {
        id: MessageId,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub accepted: Vec<MessageId>,
    pub acknowledged: usize,
    /// Files that could not be parsed or applied; renamed to `*.rejected`.
    pub rejected: usize,
}

#[derive(Debug, Clone)]
pub struct Inbox {
    dir: PathBuf,
}

impl Inbox {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn inbound_dir(&self) -> PathBuf {
        self.dir.join("in")
    }

    pub fn outbound_dir(&self, role: WorkerRole) -> PathBuf {
        self.dir.join("out").join(role.as_str())
    }

    /// Move every inbound file into the router.
    pub async fn drain(&self, router: &RwLock<MessageRouter>, now: DateTime<Utc>) -> Result<DrainReport> {
        let inbound = self.inbound_dir();
        let (entries, mut rejected) = blocking(move || read_inbound(&inbound)).await?;

        let mut report = DrainReport::default();
        let mut done = Vec::new();
        {
            let mut router = router.write().await;
            for (path, entry) in entries {
                let applied = match entry {
                    InboxEntry::Message {
                        sender,
                        recipient,
                        kind,
                        payload,
                        ttl_secs,
                    } => {
                        let sent = match ttl_secs {
                            Some(secs) => router.send_with_ttl(
                                sender,
                                recipient,
                                kind,
                                payload,
                                Some(Duration::from_secs(secs)),
                                now,
                            ),
                            None => router.send(sender, recipient, kind, payload, now),
                        };
                        sent.map(|id| report.accepted.push(id))
                    }
                    InboxEntry::Ack { id } => router
                        .acknowledge(id, now)
                        .map(|()| report.acknowledged += 1),
                };
                match applied {
                    Ok(()) => done.push((path, true)),
                    Err(e) => {
                        hlog_warn!("Rejected inbox file {}: {}", path.display(), e);
                        done.push((path, false));
                    }
                }
            }
        }

        rejected += blocking(move || {
            let mut rejected = 0;
            for (path, ok) in done {
                if ok {
                    fs::remove_file(&path)?;
                } else {
                    fs::rename(&path, path.with_extension("rejected"))?;
                    rejected += 1;
                }
            }
            Ok(rejected)
        })
        .await?;
        report.rejected = rejected;

        if !report.accepted.is_empty() || report.acknowledged > 0 {
            hlog_debug!(
                "Inbox: {} message(s), {} ack(s), {} rejected",
                report.accepted.len(),
                report.acknowledged,
                report.rejected
            );
        }
        Ok(report)
    }

    /// Write deliverable messages for each role to its outbound directory.
    /// Returns the number of files written.
    pub async fn deliver(
        &self,
        router: &RwLock<MessageRouter>,
        roles: &[WorkerRole],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut batches = Vec::new();
        {
            let mut router = router.write().await;
            for role in roles {
                let messages = router.poll(Endpoint::Worker(*role), DELIVERY_BATCH, now);
                if !messages.is_empty() {
                    batches.push((self.outbound_dir(*role), messages));
                }
            }
        }
        if batches.is_empty() {
            return Ok(0);
        }
        blocking(move || {
            let mut written = 0;
            for (dir, messages) in batches {
                fs::create_dir_all(&dir)?;
                for message in messages {
                    let path = dir.join(format!("{}.json", message.id.0));
                    fs::write(path, serde_json::to_string_pretty(&message)?)?;
                    written += 1;
                }
            }
            Ok(written)
        })
        .await
    }
}

/// Parsed entries in file-name order, plus the count of unparseable files
/// (already renamed aside).
fn read_inbound(dir: &Path) -> Result<(Vec<(PathBuf, InboxEntry)>, usize)> {
    if !dir.exists() {
        return Ok((Vec::new(), 0));
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut entries = Vec::new();
    let mut rejected = 0;
    for path in paths {
        let parsed = fs::read_to_string(&path)
            .map_err(crate::Error::from)
            .and_then(|s| serde_json::from_str::<InboxEntry>(&s).map_err(Into::into));
        match parsed {
            Ok(entry) => entries.push((path, entry)),
            Err(e) => {
                hlog_warn!("Unreadable inbox file {}: {}", path.display(), e);
                fs::rename(&path, path.with_extension("rejected"))?;
                rejected += 1;
            }
        }
    }
    Ok((entries, rejected))
}
