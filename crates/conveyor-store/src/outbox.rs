use crate::workqueue::{self, WorkTable};
use anyhow::Context;
use chrono::{DateTime, Utc};
use conveyor_core::{Error, Result, StoreOptions, WorkStatus};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

/// A new message to enqueue.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub topic: String,
    pub payload: String,
    pub correlation_id: Option<String>,
    pub due_time_utc: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            correlation_id: None,
            due_time_utc: None,
        }
    }
}

/// Identifiers of a freshly enqueued message: the work-item row id plus the
/// stable `message_id` that anchors joins and receive-side dedup.
#[derive(Debug, Clone, Copy)]
pub struct Enqueued {
    pub id: Uuid,
    pub message_id: Uuid,
}

/// A full outbox row.
///
/// `message_id` is distinct from the work-item `id`: it is generated once at
/// enqueue, survives retries, and anchors joins and receive-side dedup.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub topic: String,
    pub payload: String,
    pub correlation_id: Option<String>,
    pub message_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub due_time_utc: Option<DateTime<Utc>>,
    pub status: i16,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<Uuid>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub is_processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
}

impl OutboxMessage {
    pub fn work_status(&self) -> Option<WorkStatus> {
        WorkStatus::from_i16(self.status)
    }
}

/// Transactional outbox over one database.
///
/// The store-level owner token is generated at construction and identifies
/// this store instance for `mark_dispatched` / `reschedule` / `fail_message`;
/// dispatchers that rotate tokens per run pass their own token to the
/// batch-level protocol methods instead.
#[derive(Debug, Clone)]
pub struct OutboxStore {
    pool: PgPool,
    table: WorkTable,
    owner_token: Uuid,
    lease_duration: Duration,
}

impl OutboxStore {
    pub fn new(pool: PgPool, options: &StoreOptions) -> Self {
        Self {
            pool,
            table: WorkTable::outbox(&options.schema_name, &options.table_name),
            owner_token: Uuid::new_v4(),
            lease_duration: options.lease_duration,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn owner_token(&self) -> Uuid {
        self.owner_token
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Enqueue in a private transaction.
    pub async fn enqueue(&self, message: NewMessage) -> Result<Enqueued> {
        let mut tx = self.pool.begin().await.context("begin enqueue tx")?;
        let enqueued = self.enqueue_in(&mut tx, message).await?;
        tx.commit().await.context("commit enqueue tx")?;
        Ok(enqueued)
    }

    /// Enqueue inside a caller-supplied transaction so the message commits or
    /// rolls back with the caller's own writes.
    pub async fn enqueue_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: NewMessage,
    ) -> Result<Enqueued> {
        if message.topic.trim().is_empty() {
            return Err(Error::invalid_argument("topic must not be empty"));
        }

        let id = Uuid::new_v4();
        let message_id = Uuid::new_v4();
        let sql = format!(
            r#"
            INSERT INTO {q} (
              id, topic, payload, correlation_id, message_id,
              created_at, due_time_utc, status, retry_count, is_processed
            ) VALUES ($1, $2, $3, $4, $5, now(), $6, $7, 0, FALSE)
            "#,
            q = self.table.qualified()
        );

        sqlx::query(&sql)
            .bind(id)
            .bind(&message.topic)
            .bind(&message.payload)
            .bind(&message.correlation_id)
            .bind(message_id)
            .bind(message.due_time_utc)
            .bind(WorkStatus::Ready.as_i16())
            .execute(&mut **tx)
            .await
            .with_context(|| format!("enqueue topic={}", message.topic))?;

        Ok(Enqueued { id, message_id })
    }

    /// Claim a batch of due rows for `owner` and return them in full.
    ///
    /// The ownership transition happens in a single statement; the follow-up
    /// read only sees rows this owner already holds.
    pub async fn claim(
        &self,
        owner: Uuid,
        lease: Duration,
        batch_size: i64,
    ) -> Result<Vec<OutboxMessage>> {
        let ids = workqueue::claim(&self.pool, &self.table, owner, lease, batch_size).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT id, topic, payload, correlation_id, message_id,
                   created_at, due_time_utc, status, locked_until, owner_token,
                   retry_count, last_error, is_processed, processed_at, processed_by
            FROM {q}
            WHERE id = ANY($1)
              AND owner_token = $2
            ORDER BY created_at
            "#,
            q = self.table.qualified()
        );

        let rows = sqlx::query_as::<_, OutboxMessage>(&sql)
            .bind(&ids)
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .context("fetch claimed outbox rows")?;

        Ok(rows)
    }

    pub async fn ack(&self, owner: Uuid, ids: &[Uuid]) -> Result<u64> {
        workqueue::ack(&self.pool, &self.table, owner, ids).await
    }

    pub async fn abandon(
        &self,
        owner: Uuid,
        ids: &[Uuid],
        last_error: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<u64> {
        workqueue::abandon(&self.pool, &self.table, owner, ids, last_error, delay).await
    }

    pub async fn fail(&self, owner: Uuid, ids: &[Uuid], last_error: &str) -> Result<u64> {
        workqueue::fail(&self.pool, &self.table, owner, ids, last_error).await
    }

    pub async fn reap_expired(&self) -> Result<u64> {
        workqueue::reap_expired(&self.pool, &self.table).await
    }

    /// Ack wrapper for a single row under the store-level owner token.
    pub async fn mark_dispatched(&self, id: Uuid) -> Result<u64> {
        self.ack(self.owner_token, &[id]).await
    }

    /// Abandon wrapper with an explicit, non-negative delay.
    pub async fn reschedule(
        &self,
        id: Uuid,
        delay: chrono::Duration,
        last_error: &str,
    ) -> Result<u64> {
        let delay = delay
            .to_std()
            .map_err(|_| Error::invalid_argument("reschedule delay must be non-negative"))?;
        self.abandon(self.owner_token, &[id], Some(last_error), Some(delay))
            .await
    }

    /// Mark a single row terminally failed under the store-level owner token.
    pub async fn fail_message(&self, id: Uuid, last_error: &str) -> Result<u64> {
        self.fail(self.owner_token, &[id], last_error).await
    }

    pub async fn get(&self, id: Uuid) -> Result<OutboxMessage> {
        let sql = format!(
            r#"
            SELECT id, topic, payload, correlation_id, message_id,
                   created_at, due_time_utc, status, locked_until, owner_token,
                   retry_count, last_error, is_processed, processed_at, processed_by
            FROM {q}
            WHERE id = $1
            "#,
            q = self.table.qualified()
        );

        sqlx::query_as::<_, OutboxMessage>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get outbox row")?
            .ok_or_else(|| Error::not_found(format!("outbox message {id}")))
    }

    pub async fn pending_count(&self) -> Result<i64> {
        workqueue::count_in_status(&self.pool, &self.table, WorkStatus::Ready).await
    }

    pub async fn in_flight_count(&self) -> Result<i64> {
        workqueue::count_in_status(&self.pool, &self.table, WorkStatus::InProgress).await
    }

    /// Operator reset: move failed rows back to `Ready` so they dispatch
    /// again. Retry counts are preserved deliberately; the operator is
    /// overriding the attempt budget, not restarting it.
    pub async fn reset_failed(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            r#"
            UPDATE {q}
            SET status = $1,
                owner_token = NULL,
                locked_until = NULL,
                is_processed = FALSE,
                processed_by = NULL
            WHERE id = ANY($2)
              AND status = $3
            "#,
            q = self.table.qualified()
        );

        let done = sqlx::query(&sql)
            .bind(WorkStatus::Ready.as_i16())
            .bind(ids)
            .bind(WorkStatus::Failed.as_i16())
            .execute(&self.pool)
            .await
            .context("reset failed outbox rows")?;

        Ok(done.rows_affected())
    }
}
