//! Delivery worker.
//!
//! One cycle claims a batch, hands every claimed record to the transport and
//! writes the outcome back. Per-record failures are converted into
//! bookkeeping and never abort the rest of the batch; only a claim that took
//! nothing because the store is unavailable fails the cycle as a whole.

use std::time::Duration;

use futures_util::{stream, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    claim::ClaimEngine,
    error::{with_timeout, Error},
    message::{now_millis, Message, MessageId},
    store::Store,
    transport::{Envelope, Transport},
};

/// Tuning for the delivery worker. Passed in explicitly; there is no global
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Maximum records claimed per cycle
    pub batch_size: usize,
    /// Failed attempts after which a record is given up on
    pub max_attempts: u32,
    /// Age after which another worker's claim is presumed abandoned
    pub stale_lock_threshold: Duration,
    /// Bound on a single transport send
    pub send_timeout: Duration,
    /// Bound on a single store operation
    pub store_timeout: Duration,
    /// Sends dispatched in parallel within one batch
    pub concurrency: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_attempts: 3,
            stale_lock_threshold: Duration::from_secs(300),
            send_timeout: Duration::from_secs(30),
            store_timeout: Duration::from_secs(5),
            concurrency: 8,
        }
    }
}

impl DeliveryConfig {
    /// Worst-case time a record stays claimed by one cycle before its outcome
    /// is written back: the claims still to be taken after it, then every
    /// round of parallel sends, each followed by a write-back.
    pub fn max_hold(&self) -> Duration {
        let claims_after = u32::try_from(self.batch_size.saturating_sub(1)).unwrap_or(u32::MAX);
        let rounds = u32::try_from(self.batch_size.div_ceil(self.concurrency.max(1)))
            .unwrap_or(u32::MAX);

        self.store_timeout
            .saturating_mul(claims_after)
            .saturating_add(
                self.send_timeout
                    .saturating_add(self.store_timeout)
                    .saturating_mul(rounds),
            )
    }
}

/// What happened to one claimed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    /// Send failed; the record is back in the pool.
    Retrying { attempts: u32 },
    /// Send failed and the attempt ceiling was reached.
    Exhausted { attempts: u32 },
    /// The outcome could not be written back. The claim will go stale and
    /// the record will be picked up again.
    Unrecorded,
}

/// Result of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub sent: usize,
    pub failed: usize,
    /// Records that reached the attempt ceiling during this cycle.
    pub exhausted: Vec<MessageId>,
}

impl CycleReport {
    /// `(success_count, failure_count)`
    pub fn counts(&self) -> (usize, usize) {
        (self.sent, self.failed)
    }

    /// Number of records this cycle claimed.
    pub fn claimed(&self) -> usize {
        self.sent + self.failed
    }

    pub fn is_empty(&self) -> bool {
        self.claimed() == 0
    }

    fn record(&mut self, id: MessageId, outcome: Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::Exhausted { .. } => {
                self.failed += 1;
                self.exhausted.push(id);
            }
            Outcome::Retrying { .. } | Outcome::Unrecorded => self.failed += 1,
        }
    }
}

/// Runs claim, send and write-back cycles against one store and transport.
pub struct Deliverer<S, T> {
    claims: ClaimEngine<S>,
    transport: T,
    config: DeliveryConfig,
}

#[bon::bon]
impl<S: Store, T: Transport> Deliverer<S, T> {
    #[builder]
    pub fn new(store: S, transport: T, #[builder(default)] config: DeliveryConfig) -> Self {
        Self {
            claims: ClaimEngine::new(store, config.max_attempts)
                .with_store_timeout(config.store_timeout),
            transport,
            config,
        }
    }
}

impl<S: Store, T: Transport> Deliverer<S, T> {
    pub fn store(&self) -> &S {
        self.claims.store()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Runs one claim, send, write-back cycle on behalf of `worker_id`.
    ///
    /// A cycle that claims nothing returns an empty report. An error means the
    /// claim itself failed before taking any record; nothing was sent in that
    /// case.
    #[instrument(skip(self), fields(sent = tracing::field::Empty, failed = tracing::field::Empty))]
    pub async fn run_cycle(&self, worker_id: &str) -> Result<CycleReport, Error> {
        let claimed = self
            .claims
            .claim_batch(
                worker_id,
                self.config.batch_size,
                self.config.stale_lock_threshold,
            )
            .await?;

        if claimed.is_empty() {
            return Ok(CycleReport::default());
        }

        debug!(claimed = claimed.len(), "delivering batch");

        let outcomes: Vec<(MessageId, Outcome)> = stream::iter(claimed)
            .map(|message| self.deliver(message))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = CycleReport::default();
        for (id, outcome) in outcomes {
            report.record(id, outcome);
        }

        let span = tracing::Span::current();
        span.record("sent", report.sent);
        span.record("failed", report.failed);

        if !report.exhausted.is_empty() {
            warn!(exhausted = ?report.exhausted, "messages reached the attempt ceiling");
        }

        Ok(report)
    }

    async fn deliver(&self, message: Message) -> (MessageId, Outcome) {
        let envelope = Envelope::from(&message);

        let sent = with_timeout(
            "send",
            self.config.send_timeout,
            self.transport.send(&envelope),
        )
        .await;

        let outcome = match sent {
            Ok(()) => self.record_sent(message.id).await,
            Err(e) => {
                info!(
                    message_id = message.id,
                    recipient = %message.recipient,
                    error = %e,
                    "delivery attempt failed"
                );
                self.record_failed(&message).await
            }
        };

        (message.id, outcome)
    }

    async fn record_sent(&self, id: MessageId) -> Outcome {
        match with_timeout(
            "mark sent",
            self.config.store_timeout,
            self.store().mark_sent(id, now_millis()),
        )
        .await
        {
            Ok(0) => {
                warn!(message_id = id, "sent message vanished before write-back");
                Outcome::Unrecorded
            }
            Ok(_) => Outcome::Sent,
            Err(e) => {
                error!(message_id = id, error = %e, "failed to record delivery");
                Outcome::Unrecorded
            }
        }
    }

    async fn record_failed(&self, message: &Message) -> Outcome {
        let Some((worker_id, locked_at)) = message.lock() else {
            error!(message_id = message.id, "claimed message carries no claim stamp");
            return Outcome::Unrecorded;
        };

        match with_timeout(
            "record failure",
            self.config.store_timeout,
            self.store().record_failure(message.id, worker_id, locked_at),
        )
        .await
        {
            Ok(Some(attempts)) if attempts >= self.config.max_attempts => {
                warn!(
                    message_id = message.id,
                    recipient = %message.recipient,
                    attempts,
                    "giving up on message"
                );
                Outcome::Exhausted { attempts }
            }
            Ok(Some(attempts)) => Outcome::Retrying { attempts },
            Ok(None) => {
                warn!(
                    message_id = message.id,
                    worker_id,
                    "claim no longer held at failure write-back"
                );
                Outcome::Unrecorded
            }
            Err(e) => {
                error!(message_id = message.id, error = %e, "failed to record failed attempt");
                Outcome::Unrecorded
            }
        }
    }
}
