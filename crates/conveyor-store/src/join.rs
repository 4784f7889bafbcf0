use anyhow::Context;
use chrono::{DateTime, Utc};
use conveyor_core::{Error, Result};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum JoinStatus {
    Pending = 0,
    Completed = 1,
    Failed = 2,
}

impl JoinStatus {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Pending),
            1 => Some(Self::Completed),
            2 => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Join {
    pub join_id: Uuid,
    pub tenant_id: String,
    pub expected_steps: i32,
    pub completed_steps: i32,
    pub failed_steps: i32,
    pub status: i16,
    pub created_utc: DateTime<Utc>,
    pub last_updated_utc: DateTime<Utc>,
    pub metadata: Option<Value>,
}

impl Join {
    pub fn join_status(&self) -> Option<JoinStatus> {
        JoinStatus::from_i16(self.status)
    }

    pub fn all_steps_reported(&self) -> bool {
        self.completed_steps + self.failed_steps >= self.expected_steps
    }
}

/// Fan-in tracking: an expected-step counter plus a member table keyed by
/// `(join_id, outbox_message_id)`.
///
/// Step reports are idempotent: a member transitions at most once from
/// neither-set to exactly one of completed/failed, and replaying a reported
/// member returns the join unchanged.
#[derive(Debug, Clone)]
pub struct JoinStore {
    pool: PgPool,
    schema: String,
}

impl JoinStore {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn joins_table(&self) -> String {
        format!(r#""{}"."outbox_join""#, self.schema)
    }

    fn members_table(&self) -> String {
        format!(r#""{}"."outbox_join_member""#, self.schema)
    }

    pub async fn create_join(
        &self,
        tenant_id: &str,
        expected_steps: i32,
        metadata: Option<Value>,
    ) -> Result<Join> {
        if expected_steps <= 0 {
            return Err(Error::invalid_argument(
                "expected steps must be greater than zero",
            ));
        }

        let sql = format!(
            r#"
            INSERT INTO {joins} (
              join_id, tenant_id, expected_steps, completed_steps, failed_steps,
              status, created_utc, last_updated_utc, metadata
            ) VALUES ($1, $2, $3, 0, 0, $4, now(), now(), $5)
            RETURNING join_id, tenant_id, expected_steps, completed_steps, failed_steps,
                      status, created_utc, last_updated_utc, metadata
            "#,
            joins = self.joins_table()
        );

        let join = sqlx::query_as::<_, Join>(&sql)
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(expected_steps)
            .bind(JoinStatus::Pending.as_i16())
            .bind(metadata)
            .fetch_one(&self.pool)
            .await
            .context("create join")?;

        Ok(join)
    }

    /// Idempotent: re-attaching an already attached message is a no-op.
    pub async fn attach_message(&self, join_id: Uuid, outbox_message_id: Uuid) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {members} (join_id, outbox_message_id)
            VALUES ($1, $2)
            ON CONFLICT (join_id, outbox_message_id) DO NOTHING
            "#,
            members = self.members_table()
        );

        sqlx::query(&sql)
            .bind(join_id)
            .bind(outbox_message_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("attach message to join {join_id}"))?;

        Ok(())
    }

    pub async fn increment_completed(
        &self,
        join_id: Uuid,
        outbox_message_id: Uuid,
    ) -> Result<Join> {
        self.report_step(join_id, outbox_message_id, StepKind::Completed)
            .await
    }

    pub async fn increment_failed(&self, join_id: Uuid, outbox_message_id: Uuid) -> Result<Join> {
        self.report_step(join_id, outbox_message_id, StepKind::Failed)
            .await
    }

    async fn report_step(
        &self,
        join_id: Uuid,
        outbox_message_id: Uuid,
        kind: StepKind,
    ) -> Result<Join> {
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| format!("begin step tx join={join_id}"))?;

        let join = self.lock_join(&mut tx, join_id).await?;

        let sql = format!(
            r#"
            SELECT completed_at, failed_at
            FROM {members}
            WHERE join_id = $1 AND outbox_message_id = $2
            FOR UPDATE
            "#,
            members = self.members_table()
        );
        let member = sqlx::query(&sql)
            .bind(join_id)
            .bind(outbox_message_id)
            .fetch_optional(&mut *tx)
            .await
            .context("lock join member")?;

        // Preconditions: the member must exist and be unreported, and the
        // join must still have step budget. Otherwise return the current
        // state unchanged.
        let reportable = match &member {
            Some(row) => {
                let completed_at: Option<DateTime<Utc>> =
                    row.try_get("completed_at").context("completed_at")?;
                let failed_at: Option<DateTime<Utc>> =
                    row.try_get("failed_at").context("failed_at")?;
                completed_at.is_none()
                    && failed_at.is_none()
                    && join.completed_steps + join.failed_steps < join.expected_steps
            }
            None => false,
        };

        if !reportable {
            tx.commit().await.context("commit no-op step")?;
            return Ok(join);
        }

        let stamp_column = match kind {
            StepKind::Completed => "completed_at",
            StepKind::Failed => "failed_at",
        };
        let sql = format!(
            r#"
            UPDATE {members}
            SET {stamp_column} = now()
            WHERE join_id = $1 AND outbox_message_id = $2
            "#,
            members = self.members_table()
        );
        sqlx::query(&sql)
            .bind(join_id)
            .bind(outbox_message_id)
            .execute(&mut *tx)
            .await
            .context("stamp join member")?;

        let counter = match kind {
            StepKind::Completed => "completed_steps",
            StepKind::Failed => "failed_steps",
        };
        let sql = format!(
            r#"
            UPDATE {joins}
            SET {counter} = {counter} + 1,
                last_updated_utc = now()
            WHERE join_id = $1
            RETURNING join_id, tenant_id, expected_steps, completed_steps, failed_steps,
                      status, created_utc, last_updated_utc, metadata
            "#,
            joins = self.joins_table()
        );
        let join = sqlx::query_as::<_, Join>(&sql)
            .bind(join_id)
            .fetch_one(&mut *tx)
            .await
            .context("bump join counter")?;

        tx.commit()
            .await
            .with_context(|| format!("commit step join={join_id}"))?;

        Ok(join)
    }

    async fn lock_join(&self, tx: &mut Transaction<'_, Postgres>, join_id: Uuid) -> Result<Join> {
        let sql = format!(
            r#"
            SELECT join_id, tenant_id, expected_steps, completed_steps, failed_steps,
                   status, created_utc, last_updated_utc, metadata
            FROM {joins}
            WHERE join_id = $1
            FOR UPDATE
            "#,
            joins = self.joins_table()
        );

        sqlx::query_as::<_, Join>(&sql)
            .bind(join_id)
            .fetch_optional(&mut **tx)
            .await
            .context("lock join row")?
            .ok_or_else(|| Error::not_found(format!("join {join_id}")))
    }

    /// Missing joins log a warning and are otherwise a no-op.
    pub async fn update_status(&self, join_id: Uuid, status: JoinStatus) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE {joins}
            SET status = $2, last_updated_utc = now()
            WHERE join_id = $1
            "#,
            joins = self.joins_table()
        );

        let done = sqlx::query(&sql)
            .bind(join_id)
            .bind(status.as_i16())
            .execute(&self.pool)
            .await
            .context("update join status")?;

        if done.rows_affected() == 0 {
            tracing::warn!(
                event = "conveyor.join.update_status.missing",
                join_id = %join_id,
                "update_status on a missing join; ignoring"
            );
        }

        Ok(())
    }

    pub async fn get_join(&self, join_id: Uuid) -> Result<Join> {
        let sql = format!(
            r#"
            SELECT join_id, tenant_id, expected_steps, completed_steps, failed_steps,
                   status, created_utc, last_updated_utc, metadata
            FROM {joins}
            WHERE join_id = $1
            "#,
            joins = self.joins_table()
        );

        sqlx::query_as::<_, Join>(&sql)
            .bind(join_id)
            .fetch_optional(&self.pool)
            .await
            .context("get join")?
            .ok_or_else(|| Error::not_found(format!("join {join_id}")))
    }

    pub async fn get_join_messages(&self, join_id: Uuid) -> Result<Vec<Uuid>> {
        let sql = format!(
            r#"
            SELECT outbox_message_id
            FROM {members}
            WHERE join_id = $1
            ORDER BY outbox_message_id
            "#,
            members = self.members_table()
        );

        let ids = sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(join_id)
            .fetch_all(&self.pool)
            .await
            .context("list join messages")?;

        Ok(ids)
    }
}

#[derive(Debug, Clone, Copy)]
enum StepKind {
    Completed,
    Failed,
}
