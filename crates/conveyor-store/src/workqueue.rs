use anyhow::Context;
use conveyor_core::{Error, Result, WorkStatus};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

/// Descriptor for a uuid-keyed work-queue table.
///
/// The outbox, timers, and job-runs tables differ only in which columns hold
/// the status code, the due time, and the creation order; the protocol SQL is
/// shared. Identifier fields come from validated `StoreOptions` names.
#[derive(Debug, Clone)]
pub struct WorkTable {
    pub schema: String,
    pub table: String,
    pub status_column: &'static str,
    pub due_column: &'static str,
    pub created_column: &'static str,
    /// Outbox rows additionally carry `is_processed` / `processed_at` /
    /// `processed_by`, stamped on ack and fail.
    pub has_processed_marker: bool,
}

impl WorkTable {
    pub fn outbox(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            status_column: "status",
            due_column: "due_time_utc",
            created_column: "created_at",
            has_processed_marker: true,
        }
    }

    pub fn timers(schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: "timers".to_string(),
            status_column: "status_code",
            due_column: "due_time",
            created_column: "created_at",
            has_processed_marker: false,
        }
    }

    pub fn job_runs(schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: "job_runs".to_string(),
            status_column: "status_code",
            due_column: "scheduled_time",
            created_column: "scheduled_time",
            has_processed_marker: false,
        }
    }

    pub fn qualified(&self) -> String {
        format!(r#""{}"."{}""#, self.schema, self.table)
    }
}

/// Claim up to `batch_size` due `Ready` rows for `owner`, in creation order.
///
/// A single CTE + UPDATE with `FOR UPDATE SKIP LOCKED`, so concurrent
/// claimers with distinct owner tokens receive disjoint sets and no other
/// claimer can observe a picked row as `Ready` mid-transition.
pub async fn claim(
    pool: &PgPool,
    table: &WorkTable,
    owner: Uuid,
    lease: Duration,
    batch_size: i64,
) -> Result<Vec<Uuid>> {
    if batch_size <= 0 {
        return Err(Error::invalid_argument(format!(
            "batch size must be positive, got {batch_size}"
        )));
    }

    let q = table.qualified();
    let status = table.status_column;
    let due = table.due_column;
    let created = table.created_column;
    let sql = format!(
        r#"
        WITH picked AS (
          SELECT id
          FROM {q}
          WHERE {status} = $1
            AND ({due} IS NULL OR {due} <= now())
          ORDER BY {created}
          LIMIT $2
          FOR UPDATE SKIP LOCKED
        )
        UPDATE {q} AS w
        SET {status} = $3,
            owner_token = $4,
            locked_until = now() + make_interval(secs => $5)
        FROM picked
        WHERE w.id = picked.id
        RETURNING w.id
        "#
    );

    let ids = sqlx::query_scalar::<_, Uuid>(&sql)
        .bind(WorkStatus::Ready.as_i16())
        .bind(batch_size)
        .bind(WorkStatus::InProgress.as_i16())
        .bind(owner)
        .bind(lease.as_secs_f64())
        .fetch_all(pool)
        .await
        .with_context(|| format!("claim from {q}"))?;

    Ok(ids)
}

/// Move owned `InProgress` rows to `Done` and clear the lease.
///
/// Rows owned by a different token or already terminal are silently left
/// untouched; repeating an ack is a no-op. Returns the number of rows
/// transitioned.
pub async fn ack(pool: &PgPool, table: &WorkTable, owner: Uuid, ids: &[Uuid]) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let q = table.qualified();
    let status = table.status_column;
    let marker = if table.has_processed_marker {
        ",\n            is_processed = TRUE,\n            processed_at = now(),\n            processed_by = $5"
    } else {
        ""
    };
    let sql = format!(
        r#"
        UPDATE {q}
        SET {status} = $1,
            owner_token = NULL,
            locked_until = NULL{marker}
        WHERE id = ANY($2)
          AND {status} = $3
          AND owner_token = $4
        "#
    );

    let mut query = sqlx::query(&sql)
        .bind(WorkStatus::Done.as_i16())
        .bind(ids)
        .bind(WorkStatus::InProgress.as_i16())
        .bind(owner);
    if table.has_processed_marker {
        query = query.bind(owner.to_string());
    }

    let done = query
        .execute(pool)
        .await
        .with_context(|| format!("ack on {q}"))?;

    Ok(done.rows_affected())
}

/// Return owned rows to `Ready`, bumping `retry_count` and optionally
/// recording the error and a due-time delay.
pub async fn abandon(
    pool: &PgPool,
    table: &WorkTable,
    owner: Uuid,
    ids: &[Uuid],
    last_error: Option<&str>,
    delay: Option<Duration>,
) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let q = table.qualified();
    let status = table.status_column;
    let due = table.due_column;
    let sql = format!(
        r#"
        UPDATE {q}
        SET {status} = $1,
            owner_token = NULL,
            locked_until = NULL,
            retry_count = retry_count + 1,
            last_error = COALESCE($4, last_error),
            {due} = CASE
              WHEN $5::double precision IS NULL THEN {due}
              ELSE now() + make_interval(secs => $5)
            END
        WHERE id = ANY($2)
          AND {status} = $3
          AND owner_token = $6
        "#
    );

    let done = sqlx::query(&sql)
        .bind(WorkStatus::Ready.as_i16())
        .bind(ids)
        .bind(WorkStatus::InProgress.as_i16())
        .bind(last_error)
        .bind(delay.map(|d| d.as_secs_f64()))
        .bind(owner)
        .execute(pool)
        .await
        .with_context(|| format!("abandon on {q}"))?;

    Ok(done.rows_affected())
}

/// Move owned rows to terminal `Failed` with the given error text.
pub async fn fail(
    pool: &PgPool,
    table: &WorkTable,
    owner: Uuid,
    ids: &[Uuid],
    last_error: &str,
) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let q = table.qualified();
    let status = table.status_column;
    let marker = if table.has_processed_marker {
        ",\n            processed_by = 'FAILED'"
    } else {
        ""
    };
    let sql = format!(
        r#"
        UPDATE {q}
        SET {status} = $1,
            owner_token = NULL,
            locked_until = NULL,
            last_error = $4{marker}
        WHERE id = ANY($2)
          AND {status} = $3
          AND owner_token = $5
        "#
    );

    let done = sqlx::query(&sql)
        .bind(WorkStatus::Failed.as_i16())
        .bind(ids)
        .bind(WorkStatus::InProgress.as_i16())
        .bind(last_error)
        .bind(owner)
        .execute(pool)
        .await
        .with_context(|| format!("fail on {q}"))?;

    Ok(done.rows_affected())
}

/// Reset every `InProgress` row whose lease has expired back to `Ready`.
///
/// No ownership check: safe to run from any process. Returns the count
/// reaped.
pub async fn reap_expired(pool: &PgPool, table: &WorkTable) -> Result<u64> {
    let q = table.qualified();
    let status = table.status_column;
    let sql = format!(
        r#"
        UPDATE {q}
        SET {status} = $1,
            owner_token = NULL,
            locked_until = NULL
        WHERE {status} = $2
          AND locked_until < now()
        "#
    );

    let done = sqlx::query(&sql)
        .bind(WorkStatus::Ready.as_i16())
        .bind(WorkStatus::InProgress.as_i16())
        .execute(pool)
        .await
        .with_context(|| format!("reap expired on {q}"))?;

    Ok(done.rows_affected())
}

/// Count rows currently in the given status.
pub async fn count_in_status(
    pool: &PgPool,
    table: &WorkTable,
    status: WorkStatus,
) -> Result<i64> {
    let q = table.qualified();
    let status_col = table.status_column;
    let sql = format!(r#"SELECT count(*) FROM {q} WHERE {status_col} = $1"#);

    let count = sqlx::query_scalar::<_, i64>(&sql)
        .bind(status.as_i16())
        .fetch_one(pool)
        .await
        .with_context(|| format!("count on {q}"))?;

    Ok(count)
}
