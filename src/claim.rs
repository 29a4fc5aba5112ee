//! Claim engine.
//!
//! Transfers ownership of a bounded batch of eligible records to one worker.
//! The initial scan is only a candidate list: each candidate is then claimed
//! with a conditional update that re-checks eligibility, and only the records
//! whose update actually matched are returned. Losing a race to another
//! worker shows up as a zero-match update and is skipped silently.

use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::{
    error::{with_timeout, Error},
    message::{now_millis, Message},
    store::{Eligibility, Store},
};

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Hands out exclusive, time-limited ownership of eligible records to workers.
pub struct ClaimEngine<S> {
    store: S,
    max_attempts: u32,
    store_timeout: Duration,
}

impl<S: Store> ClaimEngine<S> {
    pub fn new(store: S, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Bounds every individual store call made while claiming.
    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Claims up to `batch_size` records for `worker_id`. The returned records
    /// are the authoritative set this worker now owns.
    ///
    /// Each record is stamped with the time of its own claim. If a store call
    /// fails after some records were already claimed, those are returned
    /// rather than abandoned; the error is only surfaced when nothing was
    /// claimed.
    pub async fn claim_batch(
        &self,
        worker_id: &str,
        batch_size: usize,
        stale_lock_threshold: Duration,
    ) -> Result<Vec<Message>, Error> {
        self.claim_with(worker_id, batch_size, stale_lock_threshold, now_millis)
            .await
    }

    /// [`ClaimEngine::claim_batch`] with a fixed clock reading, in unix
    /// millis.
    pub async fn claim_batch_at(
        &self,
        worker_id: &str,
        batch_size: usize,
        stale_lock_threshold: Duration,
        now: i64,
    ) -> Result<Vec<Message>, Error> {
        self.claim_with(worker_id, batch_size, stale_lock_threshold, move || now)
            .await
    }

    #[instrument(
        name = "claim_batch",
        skip(self, stale_lock_threshold, clock),
        fields(claimed = tracing::field::Empty)
    )]
    async fn claim_with(
        &self,
        worker_id: &str,
        batch_size: usize,
        stale_lock_threshold: Duration,
        clock: impl Fn() -> i64,
    ) -> Result<Vec<Message>, Error> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let eligibility = Eligibility::at(clock(), self.max_attempts, stale_lock_threshold);
        let candidates = with_timeout(
            "find eligible",
            self.store_timeout,
            self.store.find_eligible(eligibility, batch_size),
        )
        .await?;

        let mut claimed = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let now = clock();
            let eligibility = Eligibility::at(now, self.max_attempts, stale_lock_threshold);

            let attempt = with_timeout(
                "claim",
                self.store_timeout,
                self.store.try_claim(candidate.id, eligibility, worker_id, now),
            )
            .await;

            match attempt {
                Ok(Some(message)) => {
                    if let Some(previous) = candidate.locked_by.as_deref() {
                        debug!(
                            message_id = message.id,
                            previous_owner = previous,
                            "took over stale claim"
                        );
                    }
                    claimed.push(message);
                }
                Ok(None) => {
                    debug!(message_id = candidate.id, "lost claim race");
                }
                Err(e) if claimed.is_empty() => return Err(e),
                Err(e) => {
                    warn!(
                        message_id = candidate.id,
                        kept = claimed.len(),
                        error = %e,
                        "claim interrupted, keeping partial batch"
                    );
                    break;
                }
            }
        }

        tracing::Span::current().record("claimed", claimed.len());

        Ok(claimed)
    }
}
