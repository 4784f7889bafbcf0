use anyhow::Context;
use chrono::{DateTime, Utc};
use conveyor_core::{Error, InboxStatus, Result, StoreOptions};
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

/// A full inbox row, keyed by `(message_id, source)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InboxMessage {
    pub message_id: String,
    pub source: String,
    pub hash: Option<Vec<u8>>,
    pub first_seen_utc: DateTime<Utc>,
    pub last_seen_utc: DateTime<Utc>,
    pub processed_utc: Option<DateTime<Utc>>,
    pub due_time_utc: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub status: String,
    pub last_error: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<Uuid>,
    pub topic: Option<String>,
    pub payload: Option<String>,
}

impl InboxMessage {
    pub fn inbox_status(&self) -> Option<InboxStatus> {
        InboxStatus::parse(&self.status)
    }
}

/// Receive-side deduplication plus the work-queue protocol over the inbox
/// status vocabulary: claim moves `Seen → Processing`, ack to `Done`,
/// abandon back to `Seen`, fail to `Dead`.
#[derive(Debug, Clone)]
pub struct InboxStore {
    pool: PgPool,
    schema: String,
}

impl InboxStore {
    pub fn new(pool: PgPool, options: &StoreOptions) -> Self {
        Self {
            pool,
            schema: options.schema_name.clone(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn qualified(&self) -> String {
        format!(r#""{}"."inbox""#, self.schema)
    }

    /// Insert-or-bump for a receipt of `(message_id, source)`.
    ///
    /// First receipt inserts the row as `Seen` with `attempts = 1` and
    /// returns `false`. Every later receipt atomically increments `attempts`
    /// and refreshes `last_seen_utc` via the conflict clause, so under
    /// concurrent duplicate receipt exactly one row exists and `attempts`
    /// equals the number of calls. Returns `true` iff the row is already
    /// `Done`.
    pub async fn already_processed(
        &self,
        message_id: &str,
        source: &str,
        hash: Option<&[u8]>,
    ) -> Result<bool> {
        self.record(message_id, source, hash, None, None).await
    }

    /// `already_processed` plus the message body, stored on first receipt so
    /// the inbox dispatcher can claim and route the row by topic.
    pub async fn record(
        &self,
        message_id: &str,
        source: &str,
        hash: Option<&[u8]>,
        topic: Option<&str>,
        payload: Option<&str>,
    ) -> Result<bool> {
        if message_id.trim().is_empty() {
            return Err(Error::invalid_argument("message id must not be empty"));
        }
        if source.trim().is_empty() {
            return Err(Error::invalid_argument("source must not be empty"));
        }

        let sql = format!(
            r#"
            INSERT INTO {q} AS i (
              message_id, source, hash, first_seen_utc, last_seen_utc,
              attempts, status, topic, payload
            ) VALUES ($1, $2, $3, now(), now(), 1, $4, $5, $6)
            ON CONFLICT (message_id, source) DO UPDATE SET
              attempts = i.attempts + 1,
              last_seen_utc = now(),
              topic = COALESCE(i.topic, EXCLUDED.topic),
              payload = COALESCE(i.payload, EXCLUDED.payload)
            RETURNING (xmax = 0) AS inserted, status
            "#,
            q = self.qualified()
        );

        let row = sqlx::query(&sql)
            .bind(message_id)
            .bind(source)
            .bind(hash)
            .bind(InboxStatus::Seen.as_str())
            .bind(topic)
            .bind(payload)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("record inbox receipt message_id={message_id}"))?;

        let inserted: bool = row.try_get("inserted").context("inserted")?;
        let status: String = row.try_get("status").context("status")?;

        Ok(!inserted && status == InboxStatus::Done.as_str())
    }

    pub async fn mark_processing(&self, message_id: &str, source: &str) -> Result<u64> {
        self.set_status(message_id, source, InboxStatus::Processing, None)
            .await
    }

    pub async fn mark_processed(&self, message_id: &str, source: &str) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE {q}
            SET status = $3,
                processed_utc = now(),
                owner_token = NULL,
                locked_until = NULL
            WHERE message_id = $1
              AND source = $2
            "#,
            q = self.qualified()
        );

        let done = sqlx::query(&sql)
            .bind(message_id)
            .bind(source)
            .bind(InboxStatus::Done.as_str())
            .execute(&self.pool)
            .await
            .context("mark inbox processed")?;

        Ok(done.rows_affected())
    }

    pub async fn mark_dead(
        &self,
        message_id: &str,
        source: &str,
        last_error: Option<&str>,
    ) -> Result<u64> {
        self.set_status(message_id, source, InboxStatus::Dead, last_error)
            .await
    }

    async fn set_status(
        &self,
        message_id: &str,
        source: &str,
        status: InboxStatus,
        last_error: Option<&str>,
    ) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE {q}
            SET status = $3,
                last_error = COALESCE($4, last_error)
            WHERE message_id = $1
              AND source = $2
            "#,
            q = self.qualified()
        );

        let done = sqlx::query(&sql)
            .bind(message_id)
            .bind(source)
            .bind(status.as_str())
            .bind(last_error)
            .execute(&self.pool)
            .await
            .context("set inbox status")?;

        Ok(done.rows_affected())
    }

    /// Claim due `Seen` rows for `owner`, moving them to `Processing`.
    pub async fn claim(
        &self,
        owner: Uuid,
        lease: Duration,
        batch_size: i64,
    ) -> Result<Vec<InboxMessage>> {
        if batch_size <= 0 {
            return Err(Error::invalid_argument(format!(
                "batch size must be positive, got {batch_size}"
            )));
        }

        let sql = format!(
            r#"
            WITH picked AS (
              SELECT message_id, source
              FROM {q}
              WHERE status = $1
                AND (due_time_utc IS NULL OR due_time_utc <= now())
              ORDER BY first_seen_utc
              LIMIT $2
              FOR UPDATE SKIP LOCKED
            )
            UPDATE {q} AS m
            SET status = $3,
                owner_token = $4,
                locked_until = now() + make_interval(secs => $5)
            FROM picked
            WHERE m.message_id = picked.message_id
              AND m.source = picked.source
            RETURNING m.message_id, m.source, m.hash, m.first_seen_utc, m.last_seen_utc,
                      m.processed_utc, m.due_time_utc, m.attempts, m.status, m.last_error,
                      m.locked_until, m.owner_token, m.topic, m.payload
            "#,
            q = self.qualified()
        );

        let rows = sqlx::query_as::<_, InboxMessage>(&sql)
            .bind(InboxStatus::Seen.as_str())
            .bind(batch_size)
            .bind(InboxStatus::Processing.as_str())
            .bind(owner)
            .bind(lease.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .context("claim inbox rows")?;

        Ok(rows)
    }

    /// Ack claimed rows to `Done` (sets `processed_utc`).
    pub async fn ack(&self, owner: Uuid, keys: &[(String, String)]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let (message_ids, sources) = split_keys(keys);
        let sql = format!(
            r#"
            UPDATE {q}
            SET status = $1,
                processed_utc = now(),
                owner_token = NULL,
                locked_until = NULL
            WHERE (message_id, source) IN (
              SELECT * FROM unnest($2::text[], $3::text[])
            )
              AND status = $4
              AND owner_token = $5
            "#,
            q = self.qualified()
        );

        let done = sqlx::query(&sql)
            .bind(InboxStatus::Done.as_str())
            .bind(&message_ids)
            .bind(&sources)
            .bind(InboxStatus::Processing.as_str())
            .bind(owner)
            .execute(&self.pool)
            .await
            .context("ack inbox rows")?;

        Ok(done.rows_affected())
    }

    /// Abandon claimed rows back to `Seen`, bumping `attempts` and optionally
    /// delaying the next claim.
    pub async fn abandon(
        &self,
        owner: Uuid,
        keys: &[(String, String)],
        last_error: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let (message_ids, sources) = split_keys(keys);
        let sql = format!(
            r#"
            UPDATE {q}
            SET status = $1,
                owner_token = NULL,
                locked_until = NULL,
                attempts = attempts + 1,
                last_error = COALESCE($6, last_error),
                due_time_utc = CASE
                  WHEN $7::double precision IS NULL THEN due_time_utc
                  ELSE now() + make_interval(secs => $7)
                END
            WHERE (message_id, source) IN (
              SELECT * FROM unnest($2::text[], $3::text[])
            )
              AND status = $4
              AND owner_token = $5
            "#,
            q = self.qualified()
        );

        let done = sqlx::query(&sql)
            .bind(InboxStatus::Seen.as_str())
            .bind(&message_ids)
            .bind(&sources)
            .bind(InboxStatus::Processing.as_str())
            .bind(owner)
            .bind(last_error)
            .bind(delay.map(|d| d.as_secs_f64()))
            .execute(&self.pool)
            .await
            .context("abandon inbox rows")?;

        Ok(done.rows_affected())
    }

    /// Fail claimed rows to terminal `Dead`.
    pub async fn fail(
        &self,
        owner: Uuid,
        keys: &[(String, String)],
        last_error: &str,
    ) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let (message_ids, sources) = split_keys(keys);
        let sql = format!(
            r#"
            UPDATE {q}
            SET status = $1,
                owner_token = NULL,
                locked_until = NULL,
                last_error = $6
            WHERE (message_id, source) IN (
              SELECT * FROM unnest($2::text[], $3::text[])
            )
              AND status = $4
              AND owner_token = $5
            "#,
            q = self.qualified()
        );

        let done = sqlx::query(&sql)
            .bind(InboxStatus::Dead.as_str())
            .bind(&message_ids)
            .bind(&sources)
            .bind(InboxStatus::Processing.as_str())
            .bind(owner)
            .bind(last_error)
            .execute(&self.pool)
            .await
            .context("fail inbox rows")?;

        Ok(done.rows_affected())
    }

    /// Reset `Processing` rows whose lease expired back to `Seen`.
    pub async fn reap_expired(&self) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE {q}
            SET status = $1,
                owner_token = NULL,
                locked_until = NULL
            WHERE status = $2
              AND locked_until < now()
            "#,
            q = self.qualified()
        );

        let done = sqlx::query(&sql)
            .bind(InboxStatus::Seen.as_str())
            .bind(InboxStatus::Processing.as_str())
            .execute(&self.pool)
            .await
            .context("reap expired inbox rows")?;

        Ok(done.rows_affected())
    }

    pub async fn get(&self, message_id: &str, source: &str) -> Result<InboxMessage> {
        let sql = format!(
            r#"
            SELECT message_id, source, hash, first_seen_utc, last_seen_utc,
                   processed_utc, due_time_utc, attempts, status, last_error,
                   locked_until, owner_token, topic, payload
            FROM {q}
            WHERE message_id = $1
              AND source = $2
            "#,
            q = self.qualified()
        );

        sqlx::query_as::<_, InboxMessage>(&sql)
            .bind(message_id)
            .bind(source)
            .fetch_optional(&self.pool)
            .await
            .context("get inbox row")?
            .ok_or_else(|| Error::not_found(format!("inbox message ({message_id}, {source})")))
    }

    /// Operator reset: move dead rows back to `Seen`.
    pub async fn reset_dead(&self, keys: &[(String, String)]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let (message_ids, sources) = split_keys(keys);
        let sql = format!(
            r#"
            UPDATE {q}
            SET status = $1,
                owner_token = NULL,
                locked_until = NULL
            WHERE (message_id, source) IN (
              SELECT * FROM unnest($2::text[], $3::text[])
            )
              AND status = $4
            "#,
            q = self.qualified()
        );

        let done = sqlx::query(&sql)
            .bind(InboxStatus::Seen.as_str())
            .bind(&message_ids)
            .bind(&sources)
            .bind(InboxStatus::Dead.as_str())
            .execute(&self.pool)
            .await
            .context("reset dead inbox rows")?;

        Ok(done.rows_affected())
    }

    pub async fn pending_count(&self) -> Result<i64> {
        let sql = format!(
            r#"SELECT count(*) FROM {q} WHERE status = $1"#,
            q = self.qualified()
        );
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .bind(InboxStatus::Seen.as_str())
            .fetch_one(&self.pool)
            .await
            .context("count pending inbox rows")?;
        Ok(count)
    }
}

fn split_keys(keys: &[(String, String)]) -> (Vec<String>, Vec<String>) {
    let message_ids = keys.iter().map(|(m, _)| m.clone()).collect();
    let sources = keys.iter().map(|(_, s)| s.clone()).collect();
    (message_ids, sources)
}
