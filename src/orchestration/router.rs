//! At-least-once message delivery between components.
//!
//! Messages are queued per recipient and handed out by `poll`. A polled
//! message becomes invisible until its next slot in the retry schedule; if
//! it is not acknowledged by then it is handed out again. Once every slot
//! is used up the message fails and the sender gets an error report naming
//! it. Messages may carry a TTL; expired messages are never delivered.

use crate::config::RouterConfig;
use crate::core::{Endpoint, ErrorReport, Message, MessageId, MessageKind, MessageStatus};
use crate::util::add_duration;
use crate::{hlog_debug, hlog_trace, hlog_warn, Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub expired: Vec<MessageId>,
    pub failed: Vec<MessageId>,
    /// Error reports sent for failed messages.
    pub reported: Vec<MessageId>,
    pub purged: usize,
}

pub struct MessageRouter {
    config: RouterConfig,
    messages: HashMap<MessageId, Message>,
}

impl MessageRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            messages: HashMap::new(),
        }
    }

    /// Queue a message using the default TTL, if any.
    pub fn send(
        &mut self,
        sender: Endpoint,
        recipient: Endpoint,
        kind: MessageKind,
        payload: impl Serialize,
        now: DateTime<Utc>,
    ) -> Result<MessageId> {
        let ttl = self.config.default_ttl();
        self.send_with_ttl(sender, recipient, kind, payload, ttl, now)
    }

    pub fn send_with_ttl(
        &mut self,
        sender: Endpoint,
        recipient: Endpoint,
        kind: MessageKind,
        payload: impl Serialize,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<MessageId> {
        let message = Message {
            id: MessageId::new(),
            sender,
            recipient,
            kind,
            payload: serde_json::to_value(payload)?,
            status: MessageStatus::Pending,
            attempts: 0,
            created_at: now,
            visible_at: now,
            delivered_at: None,
            expires_at: ttl.map(|ttl| add_duration(now, ttl)),
            closed_at: None,
        };
        Ok(self.enqueue(message))
    }

    /// Queue a message built elsewhere (e.g. read from a worker's outbox).
    ///
    /// Delivery state is reset; the id is kept so duplicates collapse.
    pub fn accept(&mut self, mut message: Message, now: DateTime<Utc>) -> MessageId {
        if self.messages.contains_key(&message.id) {
            hlog_debug!("Duplicate message {} ignored", message.id);
            return message.id;
        }
        message.status = MessageStatus::Pending;
        message.attempts = 0;
        message.visible_at = now;
        message.delivered_at = None;
        message.closed_at = None;
        if message.expires_at.is_none() {
            message.expires_at = self.config.default_ttl().map(|ttl| add_duration(now, ttl));
        }
        self.enqueue(message)
    }

    fn enqueue(&mut self, message: Message) -> MessageId {
        let id = message.id;
        hlog_debug!(
            "Message {} {:?}: {} -> {}",
            id,
            message.kind,
            message.sender,
            message.recipient
        );
        self.messages.insert(id, message);
        id
    }

    /// Hand out up to `limit` deliverable messages for `recipient`, oldest
    /// first. Each returned message counts one delivery attempt and stays
    /// hidden until the next slot of the retry schedule.
    pub fn poll(&mut self, recipient: Endpoint, limit: usize, now: DateTime<Utc>) -> Vec<Message> {
        let max_attempts = self.config.max_attempts();
        let mut due: Vec<&mut Message> = self
            .messages
            .values_mut()
            .filter(|m| {
                m.recipient == recipient
                    && m.status == MessageStatus::Pending
                    && m.visible_at <= now
                    && m.attempts < max_attempts
                    && m.expires_at.map_or(true, |at| at > now)
            })
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let schedule = self.config.retry_schedule();
        let last = schedule.last().copied().unwrap_or(Duration::ZERO);
        let polled: Vec<Message> = due
            .into_iter()
            .take(limit)
            .map(|m| {
                m.attempts += 1;
                let wait = schedule.get(m.attempts as usize).copied().unwrap_or(last);
                m.visible_at = add_duration(now, wait);
                m.clone()
            })
            .collect();
        hlog_trace!("poll {}: {} message(s)", recipient, polled.len());
        polled
    }

    /// Confirm delivery. Acknowledging twice is harmless; acknowledging a
    /// failed or expired message is an error.
    pub fn acknowledge(&mut self, id: MessageId, now: DateTime<Utc>) -> Result<()> {
        let message = self
            .messages
            .get_mut(&id)
            .ok_or(Error::MessageNotFound(id))?;
        match message.status {
            MessageStatus::Pending => {
                message.status = MessageStatus::Delivered;
                message.delivered_at = Some(now);
                message.closed_at = Some(now);
                Ok(())
            }
            MessageStatus::Delivered => Ok(()),
            other => Err(Error::InvalidTransition {
                entity: format!("message {}", id),
                from: other.to_string(),
                to: MessageStatus::Delivered.to_string(),
            }),
        }
    }

    /// Expire, fail and purge messages.
    ///
    /// A message fails once its last attempt's acknowledgement window has
    /// passed; the sender then receives an `Error` report naming it. Reports
    /// about undeliverable reports are not generated.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> SweepOutcome {
        let max_attempts = self.config.max_attempts();
        let retention = self.config.retention();
        let mut outcome = SweepOutcome::default();
        let mut reports = Vec::new();

        for message in self.messages.values_mut() {
            if message.status != MessageStatus::Pending {
                continue;
            }
            if message.expires_at.is_some_and(|at| at <= now) {
                hlog_warn!("Message {} to {} expired", message.id, message.recipient);
                message.status = MessageStatus::Expired;
                message.closed_at = Some(now);
                outcome.expired.push(message.id);
                continue;
            }
            if message.attempts >= max_attempts && message.visible_at <= now {
                hlog_warn!(
                    "Message {} to {} failed after {} attempts",
                    message.id,
                    message.recipient,
                    message.attempts
                );
                message.status = MessageStatus::Failed;
                message.closed_at = Some(now);
                outcome.failed.push(message.id);
                if !is_undelivered_report(message) {
                    reports.push((message.recipient, message.sender, message.id, message.attempts));
                }
            }
        }

        for (from, to, id, attempts) in reports {
            let report = ErrorReport {
                task_id: None,
                worker_id: None,
                error: Error::DeliveryTimeout { id, attempts }.to_string(),
                undelivered: Some(id),
            };
            match self.send(from, to, MessageKind::Error, &report, now) {
                Ok(report_id) => outcome.reported.push(report_id),
                Err(e) => hlog_warn!("Could not report undelivered message {}: {}", id, e),
            }
        }

        let before = self.messages.len();
        self.messages.retain(|_, m| {
            !(m.status.is_terminal()
                && m.closed_at.is_some_and(|at| add_duration(at, retention) <= now))
        });
        outcome.purged = before - self.messages.len();
        outcome.expired.sort();
        outcome.failed.sort();
        outcome
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.get(&id)
    }

    /// Pending messages, optionally for one recipient.
    pub fn pending_count(&self, recipient: Option<Endpoint>) -> usize {
        self.messages
            .values()
            .filter(|m| m.status == MessageStatus::Pending)
            .filter(|m| recipient.map_or(true, |r| m.recipient == r))
            .count()
    }

    pub fn count_by_status(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for m in self.messages.values() {
            *counts.entry(m.status.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// All retained messages, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        let mut all: Vec<Message> = self.messages.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn restore(&mut self, messages: Vec<Message>) {
        self.messages = messages.into_iter().map(|m| (m.id, m)).collect();
    }
}

fn is_undelivered_report(message: &Message) -> bool {
    message.kind == MessageKind::Error
        && message
            .payload_as::<ErrorReport>()
            .is_ok_and(|r| r.undelivered.is_some())
}
