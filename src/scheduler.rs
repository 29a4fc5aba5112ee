//! Scheduler loop.
//!
//! Every process runs its own loop; nothing elects a single active poller.
//! Two loops pointed at the same store are kept apart solely by the
//! conditional claim.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

use crate::{
    error::Error,
    store::Store,
    transport::Transport,
    worker::Deliverer,
};

/// Totals accumulated over a scheduler's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub sent: u64,
    pub failed: u64,
    pub exhausted: u64,
    /// Cycles that failed outright, usually because the store was unreachable.
    pub errors: u64,
}

pub struct Scheduler<S, T> {
    deliverer: Arc<Deliverer<S, T>>,
    worker_id: String,
    poll_interval: Duration,
}

impl<S: Store, T: Transport> Scheduler<S, T> {
    pub fn new(
        deliverer: Arc<Deliverer<S, T>>,
        worker_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            deliverer,
            worker_id: worker_id.into(),
            poll_interval,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Spawns the loop onto the tokio runtime and returns immediately.
    pub fn start(self) -> SchedulerHandle {
        self.start_with_token(CancellationToken::new())
    }

    /// Like [`Scheduler::start`], stopping when `token` (or a parent of it) is
    /// cancelled.
    pub fn start_with_token(self, token: CancellationToken) -> SchedulerHandle {
        let span = tracing::info_span!("scheduler", worker_id = %self.worker_id);
        let task = tokio::spawn(self.run(token.clone()).instrument(span));

        SchedulerHandle { token, task }
    }

    async fn run(self, token: CancellationToken) -> SchedulerStats {
        info!(
            interval = ?self.poll_interval,
            batch_size = self.deliverer.config().batch_size,
            dry_run = self.deliverer.transport().is_dry_run(),
            "scheduler started"
        );

        let mut stats = SchedulerStats::default();

        loop {
            if token.is_cancelled() {
                break;
            }

            // The cycle is not raced against cancellation: claims already
            // taken are always resolved before the loop exits.
            stats.cycles += 1;
            match self.deliverer.run_cycle(&self.worker_id).await {
                Ok(report) => {
                    stats.sent += report.sent as u64;
                    stats.failed += report.failed as u64;
                    stats.exhausted += report.exhausted.len() as u64;

                    if !report.is_empty() {
                        info!(
                            sent = report.sent,
                            failed = report.failed,
                            "delivery cycle finished"
                        );
                    }
                }
                Err(e) => {
                    stats.errors += 1;
                    error!(
                        error = %e,
                        store = e.is_store(),
                        "delivery cycle failed, retrying next interval"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = token.cancelled() => break,
            }
        }

        info!(cycles = stats.cycles, sent = stats.sent, "scheduler stopped");

        stats
    }
}

pub struct SchedulerHandle {
    token: CancellationToken,
    task: JoinHandle<SchedulerStats>,
}

impl SchedulerHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the loop to stop and waits for the in-flight cycle to finish.
    pub async fn stop(self) -> Result<SchedulerStats, Error> {
        self.token.cancel();
        self.task.await.map_err(Error::internal)
    }
}
