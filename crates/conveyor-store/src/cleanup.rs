use anyhow::Context;
use conveyor_core::{InboxStatus, Result, StoreOptions, WorkStatus};
use sqlx::PgPool;

/// Rows removed by one purge pass, per table family.
///
/// Lease rows are deliberately never purged: deleting one would restart the
/// resource's fencing sequence, and the sequence must strictly increase for
/// the lifetime of the resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct PurgeCounts {
    pub outbox: u64,
    pub inbox: u64,
    pub timers: u64,
    pub job_runs: u64,
}

impl PurgeCounts {
    pub fn total(&self) -> u64 {
        self.outbox + self.inbox + self.timers + self.job_runs
    }
}

/// Delete terminal rows older than the store's retention window.
///
/// Consumes the read-only `StoreOptions` capability bundle (connection,
/// schema, table) rather than reaching into any store's internals; the
/// caller supplies the pool it already holds for the store.
pub async fn purge_terminal_rows(pool: &PgPool, options: &StoreOptions) -> Result<PurgeCounts> {
    let retention_secs = options.retention_period.as_secs_f64();
    let schema = &options.schema_name;
    let mut counts = PurgeCounts::default();

    let sql = format!(
        r#"
        DELETE FROM "{schema}"."{table}"
        WHERE status = ANY($1)
          AND created_at < now() - make_interval(secs => $2)
        "#,
        table = options.table_name
    );
    counts.outbox = sqlx::query(&sql)
        .bind(terminal_work_codes())
        .bind(retention_secs)
        .execute(pool)
        .await
        .context("purge outbox rows")?
        .rows_affected();

    let sql = format!(
        r#"
        DELETE FROM "{schema}"."inbox"
        WHERE status = ANY($1)
          AND last_seen_utc < now() - make_interval(secs => $2)
        "#
    );
    counts.inbox = sqlx::query(&sql)
        .bind(vec![
            InboxStatus::Done.as_str().to_string(),
            InboxStatus::Dead.as_str().to_string(),
        ])
        .bind(retention_secs)
        .execute(pool)
        .await
        .context("purge inbox rows")?
        .rows_affected();

    let sql = format!(
        r#"
        DELETE FROM "{schema}"."timers"
        WHERE status_code = ANY($1)
          AND created_at < now() - make_interval(secs => $2)
        "#
    );
    counts.timers = sqlx::query(&sql)
        .bind(terminal_work_codes())
        .bind(retention_secs)
        .execute(pool)
        .await
        .context("purge timer rows")?
        .rows_affected();

    let sql = format!(
        r#"
        DELETE FROM "{schema}"."job_runs"
        WHERE status_code = ANY($1)
          AND scheduled_time < now() - make_interval(secs => $2)
        "#
    );
    counts.job_runs = sqlx::query(&sql)
        .bind(terminal_work_codes())
        .bind(retention_secs)
        .execute(pool)
        .await
        .context("purge job run rows")?
        .rows_affected();

    Ok(counts)
}

fn terminal_work_codes() -> Vec<i16> {
    vec![WorkStatus::Done.as_i16(), WorkStatus::Failed.as_i16()]
}
