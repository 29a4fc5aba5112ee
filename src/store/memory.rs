//! In-memory implementation of the [`Store`] capability.
//!
//! Holds every record behind a single mutex; each trait call takes the lock
//! once, which makes every operation, including the conditional claim,
//! atomic. Primarily used for tests and single-process embedding.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use futures_util::future::{self, BoxFuture};

use crate::{
    error::Error,
    message::{now_millis, Message, MessageId, NewMessage},
};

use super::{Eligibility, MessageFilter, QueueStats, Store};

#[derive(Default)]
struct Inner {
    next_id: MessageId,
    messages: BTreeMap<MessageId, Message>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, Error> {
        self.inner
            .lock()
            .map_err(|_| Error::internal(eyre::eyre!("memory store mutex poisoned")))
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> Result<T, Error> {
        let mut inner = self.lock()?;
        Ok(f(&mut inner))
    }

    /// Replaces a stored record wholesale. Lets tests put records into states
    /// that are awkward to reach through the normal operations.
    pub fn put(&self, message: Message) -> Result<(), Error> {
        self.with(|inner| {
            inner.next_id = inner.next_id.max(message.id);
            inner.messages.insert(message.id, message);
        })
    }
}

impl Store for MemoryStore {
    fn insert<'a>(&'a self, message: &'a NewMessage) -> BoxFuture<'a, Result<MessageId, Error>> {
        let result = self.with(|inner| {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.messages.insert(
                id,
                Message {
                    id,
                    recipient: message.recipient().to_owned(),
                    subject: message.subject().to_owned(),
                    body: message.body().to_owned(),
                    created_at: now_millis(),
                    sent_at: None,
                    failed_attempts: 0,
                    locked_by: None,
                    locked_at: None,
                },
            );
            id
        });
        Box::pin(future::ready(result))
    }

    fn get(&self, id: MessageId) -> BoxFuture<'_, Result<Option<Message>, Error>> {
        let result = self.with(|inner| inner.messages.get(&id).cloned());
        Box::pin(future::ready(result))
    }

    fn find<'a>(
        &'a self,
        filter: &'a MessageFilter,
    ) -> BoxFuture<'a, Result<Vec<Message>, Error>> {
        let result = self.with(|inner| {
            let matching = inner.messages.values().filter(|m| filter.matches(m)).cloned();
            match filter.limit {
                Some(limit) => matching.take(limit as usize).collect(),
                None => matching.collect(),
            }
        });
        Box::pin(future::ready(result))
    }

    fn find_eligible(
        &self,
        eligibility: Eligibility,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Message>, Error>> {
        let result = self.with(|inner| {
            inner
                .messages
                .values()
                .filter(|m| eligibility.matches(m))
                .take(limit)
                .cloned()
                .collect()
        });
        Box::pin(future::ready(result))
    }

    fn try_claim<'a>(
        &'a self,
        id: MessageId,
        eligibility: Eligibility,
        worker_id: &'a str,
        now: i64,
    ) -> BoxFuture<'a, Result<Option<Message>, Error>> {
        let result = self.with(|inner| match inner.messages.get_mut(&id) {
            Some(message) if eligibility.matches(message) => {
                message.locked_by = Some(worker_id.to_owned());
                message.locked_at = Some(now);
                Some(message.clone())
            }
            _ => None,
        });
        Box::pin(future::ready(result))
    }

    fn mark_sent(&self, id: MessageId, now: i64) -> BoxFuture<'_, Result<u64, Error>> {
        let result = self.with(|inner| match inner.messages.get_mut(&id) {
            Some(message) => {
                message.sent_at.get_or_insert(now);
                message.locked_by = None;
                message.locked_at = None;
                1
            }
            None => 0,
        });
        Box::pin(future::ready(result))
    }

    fn record_failure<'a>(
        &'a self,
        id: MessageId,
        worker_id: &'a str,
        locked_at: i64,
    ) -> BoxFuture<'a, Result<Option<u32>, Error>> {
        let result = self.with(|inner| match inner.messages.get_mut(&id) {
            Some(message)
                if message.sent_at.is_none() && message.lock() == Some((worker_id, locked_at)) =>
            {
                message.failed_attempts += 1;
                message.locked_by = None;
                message.locked_at = None;
                Some(message.failed_attempts)
            }
            _ => None,
        });
        Box::pin(future::ready(result))
    }

    fn stats(&self, eligibility: Eligibility) -> BoxFuture<'_, Result<QueueStats, Error>> {
        use crate::message::MessageStatus;

        let result = self.with(|inner| {
            let mut stats = QueueStats::default();
            for message in inner.messages.values() {
                match message.status(eligibility.max_attempts, eligibility.stale_before) {
                    MessageStatus::Pending => stats.pending += 1,
                    MessageStatus::Claimed => stats.claimed += 1,
                    MessageStatus::Sent => stats.sent += 1,
                    MessageStatus::Failed => stats.failed += 1,
                }
            }
            stats
        });
        Box::pin(future::ready(result))
    }
}
