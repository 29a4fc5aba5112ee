//! Durable queue store.
//!
//! The delivery core never talks to a database directly. It relies on the
//! [`Store`] capability: filtered reads plus single-record atomic updates, one
//! of which is conditional on the record still being eligible. Any backend
//! with an atomic single-row conditional write can implement it.

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    message::{Message, MessageId, NewMessage},
};

pub mod memory;
pub mod sqlite;

/// The claim eligibility predicate, evaluated by the store.
///
/// A record is eligible when it has not been sent, has failed fewer than
/// `max_attempts` times, and either carries no claim or carries one taken
/// before `stale_before`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eligibility {
    pub max_attempts: u32,
    /// Cutoff in unix millis; claims taken strictly before it are abandoned.
    pub stale_before: i64,
}

impl Eligibility {
    pub fn at(now: i64, max_attempts: u32, stale_lock_threshold: Duration) -> Self {
        let threshold = i64::try_from(stale_lock_threshold.as_millis()).unwrap_or(i64::MAX);
        Self {
            max_attempts,
            stale_before: now.saturating_sub(threshold),
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        message.sent_at.is_none()
            && message.failed_attempts < self.max_attempts
            && match (&message.locked_by, message.locked_at) {
                (None, _) => true,
                (Some(_), Some(locked_at)) => locked_at < self.stale_before,
                (Some(_), None) => true,
            }
    }
}

/// Filter for operator-facing reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFilter {
    pub recipient: Option<String>,
    /// `Some(true)` only sent records, `Some(false)` only unsent ones.
    pub sent: Option<bool>,
    pub limit: Option<u32>,
}

impl MessageFilter {
    pub fn recipient(recipient: impl Into<String>) -> Self {
        Self {
            recipient: Some(recipient.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.recipient
            .as_deref()
            .map_or(true, |r| message.recipient == r)
            && self.sent.map_or(true, |sent| message.is_sent() == sent)
    }
}

/// Counts of records by derived status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub claimed: u64,
    pub sent: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.sent + self.failed
    }
}

/// Storage capability consumed by the mailer, claim engine and worker.
pub trait Store: Send + Sync + 'static {
    /// Inserts a new, unclaimed record and returns its id.
    fn insert<'a>(&'a self, message: &'a NewMessage) -> BoxFuture<'a, Result<MessageId, Error>>;

    fn get(&self, id: MessageId) -> BoxFuture<'_, Result<Option<Message>, Error>>;

    /// Records matching `filter`, oldest first.
    fn find<'a>(&'a self, filter: &'a MessageFilter)
        -> BoxFuture<'a, Result<Vec<Message>, Error>>;

    /// Up to `limit` records satisfying `eligibility`, oldest first. The result
    /// is only a candidate list; ownership is decided by [`Store::try_claim`].
    fn find_eligible(
        &self,
        eligibility: Eligibility,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Message>, Error>>;

    /// Atomically sets `locked_by`/`locked_at` on record `id`, but only if it
    /// still satisfies `eligibility` at the moment of the write. Returns the
    /// claimed record, or `None` when the update matched nothing.
    fn try_claim<'a>(
        &'a self,
        id: MessageId,
        eligibility: Eligibility,
        worker_id: &'a str,
        now: i64,
    ) -> BoxFuture<'a, Result<Option<Message>, Error>>;

    /// Sets `sent_at` (unless already set) and clears the claim. Returns the
    /// number of matched records.
    fn mark_sent(&self, id: MessageId, now: i64) -> BoxFuture<'_, Result<u64, Error>>;

    /// Increments `failed_attempts` and clears the claim, but only while the
    /// record is unsent and still carries the `worker_id`/`locked_at` stamp
    /// the caller wrote when claiming it. Returns the new attempt count, or
    /// `None` when nothing matched, including when the claim was taken over.
    fn record_failure<'a>(
        &'a self,
        id: MessageId,
        worker_id: &'a str,
        locked_at: i64,
    ) -> BoxFuture<'a, Result<Option<u32>, Error>>;

    fn stats(&self, eligibility: Eligibility) -> BoxFuture<'_, Result<QueueStats, Error>>;
}

impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    fn insert<'a>(&'a self, message: &'a NewMessage) -> BoxFuture<'a, Result<MessageId, Error>> {
        (**self).insert(message)
    }

    fn get(&self, id: MessageId) -> BoxFuture<'_, Result<Option<Message>, Error>> {
        (**self).get(id)
    }

    fn find<'a>(
        &'a self,
        filter: &'a MessageFilter,
    ) -> BoxFuture<'a, Result<Vec<Message>, Error>> {
        (**self).find(filter)
    }

    fn find_eligible(
        &self,
        eligibility: Eligibility,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Message>, Error>> {
        (**self).find_eligible(eligibility, limit)
    }

    fn try_claim<'a>(
        &'a self,
        id: MessageId,
        eligibility: Eligibility,
        worker_id: &'a str,
        now: i64,
    ) -> BoxFuture<'a, Result<Option<Message>, Error>> {
        (**self).try_claim(id, eligibility, worker_id, now)
    }

    fn mark_sent(&self, id: MessageId, now: i64) -> BoxFuture<'_, Result<u64, Error>> {
        (**self).mark_sent(id, now)
    }

    fn record_failure<'a>(
        &'a self,
        id: MessageId,
        worker_id: &'a str,
        locked_at: i64,
    ) -> BoxFuture<'a, Result<Option<u32>, Error>> {
        (**self).record_failure(id, worker_id, locked_at)
    }

    fn stats(&self, eligibility: Eligibility) -> BoxFuture<'_, Result<QueueStats, Error>> {
        (**self).stats(eligibility)
    }
}
