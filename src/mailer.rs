//! Enqueue side of the outbox.
//!
//! Producers never deliver anything themselves: they validate the recipient
//! and insert a plain, unclaimed record. Delivery happens later on whichever
//! worker claims it.

use std::time::Duration;

use tracing::{debug, instrument};

use crate::{
    error::Error,
    message::{now_millis, Message, MessageId, NewMessage},
    store::{Eligibility, MessageFilter, QueueStats, Store},
    worker::DeliveryConfig,
};

#[derive(Clone)]
pub struct Mailer<S> {
    store: S,
    max_attempts: u32,
    stale_lock_threshold: Duration,
}

impl<S: Store> Mailer<S> {
    pub fn new(store: S, config: &DeliveryConfig) -> Self {
        Self {
            store,
            max_attempts: config.max_attempts,
            stale_lock_threshold: config.stale_lock_threshold,
        }
    }

    /// Validates `recipient` and queues a message for delivery.
    #[instrument(skip(self, subject, body))]
    pub async fn enqueue(
        &self,
        recipient: &str,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<MessageId, Error> {
        let message = NewMessage::new(recipient, subject, body)?;
        self.enqueue_message(&message).await
    }

    pub async fn enqueue_message(&self, message: &NewMessage) -> Result<MessageId, Error> {
        let id = self.store.insert(message).await?;
        debug!(message_id = id, recipient = message.recipient(), "message queued");
        Ok(id)
    }

    pub async fn get(&self, id: MessageId) -> Result<Message, Error> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::message_not_found(id))
    }

    pub async fn find(&self, filter: &MessageFilter) -> Result<Vec<Message>, Error> {
        self.store.find(filter).await
    }

    /// Messages that reached the attempt ceiling and will never be retried.
    pub async fn failed(&self) -> Result<Vec<Message>, Error> {
        let unsent = self
            .store
            .find(&MessageFilter {
                sent: Some(false),
                ..Default::default()
            })
            .await?;

        Ok(unsent
            .into_iter()
            .filter(|m| m.failed_attempts >= self.max_attempts)
            .collect())
    }

    pub async fn stats(&self) -> Result<QueueStats, Error> {
        self.store
            .stats(Eligibility::at(
                now_millis(),
                self.max_attempts,
                self.stale_lock_threshold,
            ))
            .await
    }
}
