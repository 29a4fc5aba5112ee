//! Outbox message records and their lifecycle.
//!
//! A message is inserted once by the enqueue side and afterwards only touched
//! by the claim engine and the delivery worker. Its status is never stored
//! directly; it is derived from the record's fields:
//!
//! 1. Messages start `Pending` (no `sent_at`, no live claim)
//! 2. A worker claims it, making it `Claimed` until the claim is resolved or
//!    goes stale
//! 3. A successful send makes it `Sent`, permanently
//! 4. A failed send returns it to `Pending` with one more failed attempt, or
//!    makes it `Failed` once the attempt ceiling is reached

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_email::Email;
use sqlx::prelude::FromRow;

use crate::error::Error;

pub type MessageId = i64;

/// Derived state of a message for a given attempt ceiling and stale cutoff.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting to be claimed, possibly after earlier failed attempts
    Pending,
    /// Held by a worker whose claim has not gone stale
    Claimed,
    /// Delivered to the transport
    Sent,
    /// Reached the attempt ceiling without being delivered
    Failed,
}

/// A single outbox record.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Assigned by the store on insert
    pub id: MessageId,
    /// Validated delivery address
    pub recipient: String,
    pub subject: String,
    pub body: String,

    /// Enqueue time, unix millis
    pub created_at: i64,
    /// First successful delivery, unix millis
    pub sent_at: Option<i64>,
    /// Number of failed delivery attempts so far
    pub failed_attempts: u32,

    /// Worker currently holding the claim
    pub locked_by: Option<String>,
    /// When the current claim was taken, unix millis
    pub locked_at: Option<i64>,
}

impl Message {
    pub fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }

    pub fn is_locked_by(&self, worker_id: &str) -> bool {
        self.locked_by.as_deref() == Some(worker_id)
    }

    /// The `(locked_by, locked_at)` stamp of the current claim, if any.
    pub fn lock(&self) -> Option<(&str, i64)> {
        Some((self.locked_by.as_deref()?, self.locked_at?))
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.sent_at.and_then(from_millis)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        from_millis(self.created_at)
    }

    /// `stale_before` is the cutoff in unix millis: claims taken earlier than
    /// this are treated as abandoned.
    pub fn status(&self, max_attempts: u32, stale_before: i64) -> MessageStatus {
        if self.is_sent() {
            return MessageStatus::Sent;
        }
        if self.failed_attempts >= max_attempts {
            return MessageStatus::Failed;
        }
        match (&self.locked_by, self.locked_at) {
            (Some(_), Some(locked_at)) if locked_at >= stale_before => MessageStatus::Claimed,
            _ => MessageStatus::Pending,
        }
    }
}

/// Payload for inserting a message. The recipient is validated on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    recipient: String,
    subject: String,
    body: String,
}

impl NewMessage {
    pub fn new(
        recipient: impl AsRef<str>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Self, Error> {
        let recipient = recipient.as_ref().trim();
        let email =
            Email::from_str(recipient).map_err(|_| Error::invalid_recipient(recipient))?;

        Ok(Self {
            recipient: email.to_string(),
            subject: subject.into(),
            body: body.into(),
        })
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

/// Current time as unix millis, the representation used by the store.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
