//! SQLite-backed implementation of the [`Store`] capability.
//!
//! Every mutation is a single `UPDATE` statement, so each one is atomic on its
//! own and no explicit transaction is needed. The claim re-checks the
//! eligibility predicate in its `WHERE` clause; two workers racing for the
//! same row therefore produce exactly one matching update.

use std::time::Duration;

use futures_util::{future::BoxFuture, FutureExt};
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    QueryBuilder, Sqlite, SqlitePool,
};
use tracing::debug;

use crate::{
    error::Error,
    message::{now_millis, Message, MessageId, NewMessage},
};

use super::{Eligibility, MessageFilter, QueueStats, Store};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `path` and runs migrations.
    /// With no path, a private in-memory database is used.
    pub async fn connect(path: Option<&str>) -> Result<Self, Error> {
        let pool = match path {
            Some(path) => {
                let opts = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .locking_mode(SqliteLockingMode::Normal)
                    .busy_timeout(BUSY_TIMEOUT)
                    .optimize_on_close(true, None)
                    .auto_vacuum(SqliteAutoVacuum::Full);

                SqlitePoolOptions::new().connect_with(opts).await?
            }
            None => {
                // Every in-memory connection is its own database, so the pool
                // must hold exactly one and never recycle it.
                let opts = SqliteConnectOptions::new().in_memory(true);

                SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(opts)
                    .await?
            }
        };

        Self::with_pool(pool).await
    }

    pub async fn in_memory() -> Result<Self, Error> {
        Self::connect(None).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, Error> {
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<MessageId, Error> {
        let id = sqlx::query_scalar(
            "INSERT INTO messages (recipient, subject, body, created_at) VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(message.recipient())
        .bind(message.subject())
        .bind(message.body())
        .bind(now_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, Error> {
        Ok(sqlx::query_as("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>, Error> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM messages WHERE 1 = 1");

        if let Some(recipient) = &filter.recipient {
            query.push(" AND recipient = ").push_bind(recipient.clone());
        }

        match filter.sent {
            Some(true) => {
                query.push(" AND sent_at IS NOT NULL");
            }
            Some(false) => {
                query.push(" AND sent_at IS NULL");
            }
            None => {}
        }

        query.push(" ORDER BY created_at ASC, id ASC");

        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(i64::from(limit));
        }

        Ok(query.build_query_as().fetch_all(&self.pool).await?)
    }

    async fn find_eligible_messages(
        &self,
        eligibility: Eligibility,
        limit: usize,
    ) -> Result<Vec<Message>, Error> {
        Ok(sqlx::query_as(
            "
            SELECT * FROM messages
            WHERE sent_at IS NULL
              AND failed_attempts < $1
              AND (locked_by IS NULL OR locked_at IS NULL OR locked_at < $2)
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            ",
        )
        .bind(eligibility.max_attempts)
        .bind(eligibility.stale_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn claim_message(
        &self,
        id: MessageId,
        eligibility: Eligibility,
        worker_id: &str,
        now: i64,
    ) -> Result<Option<Message>, Error> {
        let claimed: Option<Message> = sqlx::query_as(
            "
            UPDATE messages
            SET locked_by = $1, locked_at = $2
            WHERE id = $3
              AND sent_at IS NULL
              AND failed_attempts < $4
              AND (locked_by IS NULL OR locked_at IS NULL OR locked_at < $5)
            RETURNING *
            ",
        )
        .bind(worker_id)
        .bind(now)
        .bind(id)
        .bind(eligibility.max_attempts)
        .bind(eligibility.stale_before)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            debug!(message_id = id, worker_id, "claim matched no rows");
        }

        Ok(claimed)
    }

    async fn mark_message_sent(&self, id: MessageId, now: i64) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE messages SET sent_at = COALESCE(sent_at, $1), locked_by = NULL, locked_at = NULL WHERE id = $2",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn record_message_failure(
        &self,
        id: MessageId,
        worker_id: &str,
        locked_at: i64,
    ) -> Result<Option<u32>, Error> {
        let attempts = sqlx::query_scalar(
            "
            UPDATE messages
            SET failed_attempts = failed_attempts + 1, locked_by = NULL, locked_at = NULL
            WHERE id = $1
              AND sent_at IS NULL
              AND locked_by = $2
              AND locked_at = $3
            RETURNING failed_attempts
            ",
        )
        .bind(id)
        .bind(worker_id)
        .bind(locked_at)
        .fetch_optional(&self.pool)
        .await?;

        if attempts.is_none() {
            debug!(message_id = id, worker_id, "failure write-back matched no rows");
        }

        Ok(attempts)
    }

    async fn queue_stats(&self, eligibility: Eligibility) -> Result<QueueStats, Error> {
        let (total, sent, failed, claimed): (i64, i64, i64, i64) = sqlx::query_as(
            "
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN sent_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN sent_at IS NULL AND failed_attempts >= $1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE
                    WHEN sent_at IS NULL
                     AND failed_attempts < $1
                     AND locked_by IS NOT NULL
                     AND locked_at >= $2
                    THEN 1 ELSE 0 END), 0)
            FROM messages
            ",
        )
        .bind(eligibility.max_attempts)
        .bind(eligibility.stale_before)
        .fetch_one(&self.pool)
        .await?;

        let count = |n: i64| u64::try_from(n).unwrap_or(0);

        Ok(QueueStats {
            pending: count(total - sent - failed - claimed),
            claimed: count(claimed),
            sent: count(sent),
            failed: count(failed),
        })
    }
}

impl Store for SqliteStore {
    fn insert<'a>(&'a self, message: &'a NewMessage) -> BoxFuture<'a, Result<MessageId, Error>> {
        self.insert_message(message).boxed()
    }

    fn get(&self, id: MessageId) -> BoxFuture<'_, Result<Option<Message>, Error>> {
        self.get_message(id).boxed()
    }

    fn find<'a>(
        &'a self,
        filter: &'a MessageFilter,
    ) -> BoxFuture<'a, Result<Vec<Message>, Error>> {
        self.find_messages(filter).boxed()
    }

    fn find_eligible(
        &self,
        eligibility: Eligibility,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Message>, Error>> {
        self.find_eligible_messages(eligibility, limit).boxed()
    }

    fn try_claim<'a>(
        &'a self,
        id: MessageId,
        eligibility: Eligibility,
        worker_id: &'a str,
        now: i64,
    ) -> BoxFuture<'a, Result<Option<Message>, Error>> {
        self.claim_message(id, eligibility, worker_id, now).boxed()
    }

    fn mark_sent(&self, id: MessageId, now: i64) -> BoxFuture<'_, Result<u64, Error>> {
        self.mark_message_sent(id, now).boxed()
    }

    fn record_failure<'a>(
        &'a self,
        id: MessageId,
        worker_id: &'a str,
        locked_at: i64,
    ) -> BoxFuture<'a, Result<Option<u32>, Error>> {
        self.record_message_failure(id, worker_id, locked_at).boxed()
    }

    fn stats(&self, eligibility: Eligibility) -> BoxFuture<'_, Result<QueueStats, Error>> {
        self.queue_stats(eligibility).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> SqliteStore {
        SqliteStore::in_memory().await.unwrap()
    }

    fn new_message(to: &str) -> NewMessage {
        NewMessage::new(to, "Confirm your address", "Click the link").unwrap()
    }

    /// Claims `id` for a throwaway worker and records a failed attempt.
    async fn fail_once(store: &SqliteStore, id: MessageId) -> Option<u32> {
        let now = now_millis();
        let claimed = store
            .try_claim(id, Eligibility::at(now, u32::MAX, Duration::ZERO), "w", now)
            .await
            .unwrap()?;
        store
            .record_failure(id, "w", claimed.locked_at.unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = setup().await;

        let id = store.insert(&new_message("a@example.com")).await.unwrap();
        let msg = store.get(id).await.unwrap().unwrap();

        assert_eq!(msg.id, id);
        assert_eq!(msg.recipient, "a@example.com");
        assert_eq!(msg.subject, "Confirm your address");
        assert_eq!(msg.failed_attempts, 0);
        assert!(msg.sent_at.is_none());
        assert!(msg.locked_by.is_none());
        assert!(store.get(id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_try_claim_is_conditional() {
        let store = setup().await;
        let id = store.insert(&new_message("a@example.com")).await.unwrap();
        let now = now_millis();
        let eligibility = Eligibility::at(now, 3, Duration::from_secs(60));

        let claimed = store
            .try_claim(id, eligibility, "worker-a", now)
            .await
            .unwrap()
            .unwrap();
        assert!(claimed.is_locked_by("worker-a"));
        assert_eq!(claimed.locked_at, Some(now));

        // Second claim against a fresh lock matches nothing.
        let second = store.try_claim(id, eligibility, "worker-b", now).await.unwrap();
        assert!(second.is_none());

        let msg = store.get(id).await.unwrap().unwrap();
        assert!(msg.is_locked_by("worker-a"));
    }

    #[tokio::test]
    async fn test_try_claim_takes_over_stale_lock() {
        let store = setup().await;
        let id = store.insert(&new_message("a@example.com")).await.unwrap();
        let threshold = Duration::from_secs(60);

        let then = 1_000_000;
        store
            .try_claim(id, Eligibility::at(then, 3, threshold), "crashed", then)
            .await
            .unwrap()
            .unwrap();

        let later = then + 61_000;
        let claimed = store
            .try_claim(id, Eligibility::at(later, 3, threshold), "rescuer", later)
            .await
            .unwrap()
            .unwrap();
        assert!(claimed.is_locked_by("rescuer"));
    }

    #[tokio::test]
    async fn test_mark_sent_keeps_first_timestamp() {
        let store = setup().await;
        let id = store.insert(&new_message("a@example.com")).await.unwrap();

        assert_eq!(store.mark_sent(id, 10).await.unwrap(), 1);
        assert_eq!(store.mark_sent(id, 20).await.unwrap(), 1);

        let msg = store.get(id).await.unwrap().unwrap();
        assert_eq!(msg.sent_at, Some(10));
        assert!(msg.locked_by.is_none());
        assert!(msg.locked_at.is_none());
    }

    #[tokio::test]
    async fn test_record_failure_increments() {
        let store = setup().await;
        let id = store.insert(&new_message("a@example.com")).await.unwrap();

        assert_eq!(fail_once(&store, id).await, Some(1));
        assert_eq!(fail_once(&store, id).await, Some(2));
        assert_eq!(store.record_failure(id + 1, "w", 0).await.unwrap(), None);

        let msg = store.get(id).await.unwrap().unwrap();
        assert!(msg.locked_by.is_none());
        assert!(msg.locked_at.is_none());

        store.mark_sent(id, 5).await.unwrap();
        assert_eq!(fail_once(&store, id).await, None);
        assert_eq!(store.get(id).await.unwrap().unwrap().failed_attempts, 2);
    }

    #[tokio::test]
    async fn test_record_failure_requires_claim() {
        let store = setup().await;
        let id = store.insert(&new_message("a@example.com")).await.unwrap();
        let now = now_millis();

        // Never claimed.
        assert_eq!(store.record_failure(id, "w", now).await.unwrap(), None);

        store
            .try_claim(id, Eligibility::at(now, 3, Duration::from_secs(60)), "w", now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.record_failure(id, "other", now).await.unwrap(), None);
        assert_eq!(store.record_failure(id, "w", now - 1).await.unwrap(), None);
        assert_eq!(store.record_failure(id, "w", now).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_late_failure_after_takeover() {
        let store = setup().await;
        let id = store.insert(&new_message("a@example.com")).await.unwrap();
        let threshold = Duration::from_secs(60);

        let t0 = 1_000_000;
        store
            .try_claim(id, Eligibility::at(t0, 3, threshold), "a", t0)
            .await
            .unwrap()
            .unwrap();

        let t1 = t0 + 61_000;
        store
            .try_claim(id, Eligibility::at(t1, 3, threshold), "b", t1)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.record_failure(id, "a", t0).await.unwrap(), None);

        let msg = store.get(id).await.unwrap().unwrap();
        assert!(msg.is_locked_by("b"));
        assert_eq!(msg.locked_at, Some(t1));
        assert_eq!(msg.failed_attempts, 0);

        let t2 = t1 + 1;
        let third = store
            .try_claim(id, Eligibility::at(t2, 3, threshold), "c", t2)
            .await
            .unwrap();
        assert!(third.is_none());
    }

    #[tokio::test]
    async fn test_late_success_after_takeover() {
        let store = setup().await;
        let id = store.insert(&new_message("a@example.com")).await.unwrap();
        let threshold = Duration::from_secs(60);

        let t0 = 1_000_000;
        store
            .try_claim(id, Eligibility::at(t0, 3, threshold), "a", t0)
            .await
            .unwrap()
            .unwrap();
        let t1 = t0 + 61_000;
        store
            .try_claim(id, Eligibility::at(t1, 3, threshold), "b", t1)
            .await
            .unwrap()
            .unwrap();

        // The original owner's send went through after all.
        assert_eq!(store.mark_sent(id, t1 + 5).await.unwrap(), 1);

        // The new owner's outcome cannot undo or restamp the delivery.
        assert_eq!(store.record_failure(id, "b", t1).await.unwrap(), None);
        assert_eq!(store.mark_sent(id, t1 + 9).await.unwrap(), 1);

        let msg = store.get(id).await.unwrap().unwrap();
        assert_eq!(msg.sent_at, Some(t1 + 5));
        assert_eq!(msg.failed_attempts, 0);

        let later = t1 + 10 * 61_000;
        let reclaim = store
            .try_claim(id, Eligibility::at(later, 3, threshold), "c", later)
            .await
            .unwrap();
        assert!(reclaim.is_none());
    }

    #[tokio::test]
    async fn test_find_eligible_respects_predicate() {
        let store = setup().await;
        let sent = store.insert(&new_message("a@example.com")).await.unwrap();
        let exhausted = store.insert(&new_message("b@example.com")).await.unwrap();
        let open = store.insert(&new_message("c@example.com")).await.unwrap();

        store.mark_sent(sent, 1).await.unwrap();
        fail_once(&store, exhausted).await.unwrap();

        let eligibility = Eligibility::at(now_millis(), 1, Duration::from_secs(60));
        let ids: Vec<_> = store
            .find_eligible(eligibility, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();

        assert_eq!(ids, vec![open]);
    }

    #[tokio::test]
    async fn test_find_and_stats() {
        let store = setup().await;
        let a = store.insert(&new_message("a@example.com")).await.unwrap();
        store.insert(&new_message("a@example.com")).await.unwrap();
        store.insert(&new_message("b@example.com")).await.unwrap();
        store.mark_sent(a, 1).await.unwrap();

        let to_a = store
            .find(&MessageFilter::recipient("a@example.com"))
            .await
            .unwrap();
        assert_eq!(to_a.len(), 2);

        let unsent = store
            .find(&MessageFilter {
                sent: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(unsent.len(), 2);

        let limited = store
            .find(&MessageFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, a);

        let stats = store
            .stats(Eligibility::at(now_millis(), 3, Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(
            stats,
            QueueStats {
                pending: 2,
                claimed: 0,
                sent: 1,
                failed: 0,
            }
        );
    }
}
