use crate::workqueue::{self, WorkTable};
use anyhow::Context;
use chrono::{DateTime, Utc};
use conveyor_core::{Clock, Error, Result, WorkStatus};
use cron::Schedule;
use sqlx::{PgPool, Row};
use std::{str::FromStr, sync::Arc, time::Duration};
use uuid::Uuid;

const LABEL_SCHEDULED: &str = "Scheduled";
const LABEL_RUNNING: &str = "Running";
const LABEL_SUCCEEDED: &str = "Succeeded";
const LABEL_COMPLETED: &str = "Completed";
const LABEL_FAILED: &str = "Failed";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub job_name: String,
    pub cron_schedule: String,
    pub topic: String,
    pub payload: Option<String>,
    pub is_enabled: bool,
    pub next_due_time: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
}

/// A claimed job-run joined with its parent job's routing fields.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRunWork {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    pub topic: String,
    pub payload: Option<String>,
    pub retry_count: i32,
    pub scheduled_time: DateTime<Utc>,
}

/// A claimed one-shot timer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TimerMessage {
    pub id: Uuid,
    pub due_time: DateTime<Utc>,
    pub topic: String,
    pub payload: String,
    pub correlation_id: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Cron jobs, job-runs, one-shot timers, and the materializer state row.
///
/// Job-runs and timers participate in the generic work-queue protocol; the
/// human-readable `status` label column is maintained at the scheduler level
/// on claim/completion and is informational only.
#[derive(Clone)]
pub struct SchedulerStore {
    pool: PgPool,
    schema: String,
    clock: Arc<dyn Clock>,
    job_runs: WorkTable,
    timers: WorkTable,
}

impl SchedulerStore {
    pub fn new(pool: PgPool, schema: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
            clock,
            job_runs: WorkTable::job_runs(schema),
            timers: WorkTable::timers(schema),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn jobs_table(&self) -> String {
        format!(r#""{}"."jobs""#, self.schema)
    }

    fn job_runs_table(&self) -> String {
        self.job_runs.qualified()
    }

    fn timers_table(&self) -> String {
        self.timers.qualified()
    }

    fn state_table(&self) -> String {
        format!(r#""{}"."scheduler_state""#, self.schema)
    }

    /// Upsert a job by its unique name. The next due time is recomputed from
    /// the (validated) cron expression.
    pub async fn create_or_update_job(
        &self,
        name: &str,
        topic: &str,
        cron_schedule: &str,
        payload: Option<&str>,
    ) -> Result<Uuid> {
        if name.trim().is_empty() {
            return Err(Error::invalid_argument("job name must not be empty"));
        }
        if topic.trim().is_empty() {
            return Err(Error::invalid_argument("job topic must not be empty"));
        }
        let schedule = parse_cron(cron_schedule)?;
        let next_due = schedule.after(&self.clock.now()).next();

        let sql = format!(
            r#"
            INSERT INTO {jobs} (id, job_name, cron_schedule, topic, payload, is_enabled, next_due_time)
            VALUES ($1, $2, $3, $4, $5, TRUE, $6)
            ON CONFLICT (job_name) DO UPDATE SET
              cron_schedule = EXCLUDED.cron_schedule,
              topic = EXCLUDED.topic,
              payload = EXCLUDED.payload,
              next_due_time = EXCLUDED.next_due_time
            RETURNING id
            "#,
            jobs = self.jobs_table()
        );

        let id = sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(Uuid::new_v4())
            .bind(name)
            .bind(cron_schedule)
            .bind(topic)
            .bind(payload)
            .bind(next_due)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("upsert job {name}"))?;

        Ok(id)
    }

    pub async fn delete_job(&self, name: &str) -> Result<u64> {
        let sql = format!(
            r#"DELETE FROM {jobs} WHERE job_name = $1"#,
            jobs = self.jobs_table()
        );
        let done = sqlx::query(&sql)
            .bind(name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete job {name}"))?;
        Ok(done.rows_affected())
    }

    pub async fn set_job_enabled(&self, name: &str, enabled: bool) -> Result<u64> {
        let sql = format!(
            r#"UPDATE {jobs} SET is_enabled = $2 WHERE job_name = $1"#,
            jobs = self.jobs_table()
        );
        let done = sqlx::query(&sql)
            .bind(name)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .with_context(|| format!("set job {name} enabled={enabled}"))?;
        Ok(done.rows_affected())
    }

    pub async fn get_job(&self, name: &str) -> Result<Job> {
        let sql = format!(
            r#"
            SELECT id, job_name, cron_schedule, topic, payload, is_enabled,
                   next_due_time, last_run_time, last_run_status
            FROM {jobs}
            WHERE job_name = $1
            "#,
            jobs = self.jobs_table()
        );
        sqlx::query_as::<_, Job>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("get job")?
            .ok_or_else(|| Error::not_found(format!("job {name}")))
    }

    /// Insert an immediate run for the named job, bypassing the cron cadence.
    pub async fn trigger_job(&self, name: &str) -> Result<Uuid> {
        let job = self.get_job(name).await?;
        let scheduled_time = self.clock.now();
        let run_id = Uuid::new_v4();

        let sql = format!(
            r#"
            INSERT INTO {runs} (id, job_id, scheduled_time, status_code, status, retry_count)
            VALUES ($1, $2, $3, $4, $5, 0)
            ON CONFLICT (job_id, scheduled_time) DO NOTHING
            RETURNING id
            "#,
            runs = self.job_runs_table()
        );

        let inserted = sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(run_id)
            .bind(job.id)
            .bind(scheduled_time)
            .bind(WorkStatus::Ready.as_i16())
            .bind(LABEL_SCHEDULED)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("trigger job {name}"))?;

        match inserted {
            Some(id) => Ok(id),
            // A concurrent trigger landed on the same microsecond; reuse it.
            None => {
                let sql = format!(
                    r#"SELECT id FROM {runs} WHERE job_id = $1 AND scheduled_time = $2"#,
                    runs = self.job_runs_table()
                );
                let id = sqlx::query_scalar::<_, Uuid>(&sql)
                    .bind(job.id)
                    .bind(scheduled_time)
                    .fetch_one(&self.pool)
                    .await
                    .context("fetch existing triggered run")?;
                Ok(id)
            }
        }
    }

    /// Insert a one-shot timer; returns its identifier.
    pub async fn schedule_timer(
        &self,
        topic: &str,
        payload: &str,
        due_time: DateTime<Utc>,
        correlation_id: Option<&str>,
    ) -> Result<Uuid> {
        if topic.trim().is_empty() {
            return Err(Error::invalid_argument("timer topic must not be empty"));
        }

        let id = Uuid::new_v4();
        let sql = format!(
            r#"
            INSERT INTO {timers} (
              id, due_time, payload, topic, correlation_id,
              status_code, status, retry_count, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 0, now())
            "#,
            timers = self.timers_table()
        );

        sqlx::query(&sql)
            .bind(id)
            .bind(due_time)
            .bind(payload)
            .bind(topic)
            .bind(correlation_id)
            .bind(WorkStatus::Ready.as_i16())
            .bind(LABEL_SCHEDULED)
            .execute(&self.pool)
            .await
            .with_context(|| format!("schedule timer topic={topic}"))?;

        Ok(id)
    }

    /// Bump the materializer fencing token. Called once per materialization
    /// pass, under the scheduler lease.
    pub async fn bump_fencing_token(&self) -> Result<i64> {
        let sql = format!(
            r#"
            UPDATE {state}
            SET current_fencing_token = current_fencing_token + 1,
                last_run_at = now()
            WHERE id = 1
            RETURNING current_fencing_token
            "#,
            state = self.state_table()
        );

        let token = sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&self.pool)
            .await
            .context("bump scheduler fencing token")?;
        Ok(token)
    }

    /// Materialize every enabled job whose `next_due_time` has passed (or is
    /// unset) into a job-run, and advance `next_due_time` to the next cron
    /// occurrence strictly after now.
    ///
    /// One transaction per job: either the run row was inserted and the
    /// cursor advanced, or neither. The `(job_id, scheduled_time)` unique
    /// constraint suppresses duplicate runs across crashed materializers.
    pub async fn materialize_due_jobs(&self) -> Result<u32> {
        let now = self.clock.now();
        let sql = format!(
            r#"
            SELECT id FROM {jobs}
            WHERE is_enabled = TRUE
              AND (next_due_time IS NULL OR next_due_time <= $1)
            ORDER BY job_name
            "#,
            jobs = self.jobs_table()
        );
        let due_ids = sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .context("select due jobs")?;

        let mut materialized = 0u32;
        for job_id in due_ids {
            if self.materialize_job(job_id, now).await? {
                materialized += 1;
            }
        }
        Ok(materialized)
    }

    async fn materialize_job(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| format!("begin materialize tx job_id={job_id}"))?;

        let sql = format!(
            r#"
            SELECT cron_schedule, next_due_time, is_enabled
            FROM {jobs}
            WHERE id = $1
            FOR UPDATE
            "#,
            jobs = self.jobs_table()
        );
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .context("lock job row")?;

        let Some(row) = row else {
            tx.commit().await.context("commit materialize (gone)")?;
            return Ok(false);
        };

        let cron_schedule: String = row.try_get("cron_schedule").context("cron_schedule")?;
        let next_due_time: Option<DateTime<Utc>> =
            row.try_get("next_due_time").context("next_due_time")?;
        let is_enabled: bool = row.try_get("is_enabled").context("is_enabled")?;

        // Re-check under the row lock; a concurrent materializer may have
        // advanced the cursor already.
        if !is_enabled || next_due_time.is_some_and(|t| t > now) {
            tx.commit().await.context("commit materialize (not due)")?;
            return Ok(false);
        }

        let scheduled_time = next_due_time.unwrap_or(now);
        let schedule = parse_cron(&cron_schedule)?;
        let next = schedule.after(&now).next();

        let sql = format!(
            r#"
            INSERT INTO {runs} (id, job_id, scheduled_time, status_code, status, retry_count)
            VALUES ($1, $2, $3, $4, $5, 0)
            ON CONFLICT (job_id, scheduled_time) DO NOTHING
            "#,
            runs = self.job_runs_table()
        );
        let inserted = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(job_id)
            .bind(scheduled_time)
            .bind(WorkStatus::Ready.as_i16())
            .bind(LABEL_SCHEDULED)
            .execute(&mut *tx)
            .await
            .context("insert job run")?;

        let sql = format!(
            r#"UPDATE {jobs} SET next_due_time = $2 WHERE id = $1"#,
            jobs = self.jobs_table()
        );
        sqlx::query(&sql)
            .bind(job_id)
            .bind(next)
            .execute(&mut *tx)
            .await
            .context("advance job next_due_time")?;

        tx.commit()
            .await
            .with_context(|| format!("commit materialize job_id={job_id}"))?;

        Ok(inserted.rows_affected() == 1)
    }

    /// Claim due job-runs, stamping `start_time` and returning them joined
    /// with the parent job's topic/payload.
    pub async fn claim_due_job_runs(
        &self,
        owner: Uuid,
        lease: Duration,
        batch_size: i64,
    ) -> Result<Vec<JobRunWork>> {
        let ids = workqueue::claim(&self.pool, &self.job_runs, owner, lease, batch_size).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            UPDATE {runs}
            SET start_time = COALESCE(start_time, now()),
                status = $3
            WHERE id = ANY($1)
              AND owner_token = $2
            "#,
            runs = self.job_runs_table()
        );
        sqlx::query(&sql)
            .bind(&ids)
            .bind(owner)
            .bind(LABEL_RUNNING)
            .execute(&self.pool)
            .await
            .context("stamp job run start")?;

        let sql = format!(
            r#"
            SELECT r.id AS run_id, r.job_id, j.job_name, j.topic, j.payload,
                   r.retry_count, r.scheduled_time
            FROM {runs} r
            JOIN {jobs} j ON j.id = r.job_id
            WHERE r.id = ANY($1)
              AND r.owner_token = $2
            ORDER BY r.scheduled_time
            "#,
            runs = self.job_runs_table(),
            jobs = self.jobs_table()
        );
        let rows = sqlx::query_as::<_, JobRunWork>(&sql)
            .bind(&ids)
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .context("fetch claimed job runs")?;

        Ok(rows)
    }

    /// Ack a job-run and reflect the result onto the parent job.
    pub async fn complete_job_run(
        &self,
        owner: Uuid,
        run_id: Uuid,
        output: Option<&str>,
    ) -> Result<u64> {
        let done = workqueue::ack(&self.pool, &self.job_runs, owner, &[run_id]).await?;
        if done == 0 {
            return Ok(0);
        }

        let sql = format!(
            r#"
            UPDATE {runs}
            SET end_time = now(), output = $2, status = $3
            WHERE id = $1
            "#,
            runs = self.job_runs_table()
        );
        sqlx::query(&sql)
            .bind(run_id)
            .bind(output)
            .bind(LABEL_SUCCEEDED)
            .execute(&self.pool)
            .await
            .context("finalize job run")?;

        self.reflect_run_onto_job(run_id, LABEL_SUCCEEDED).await?;
        Ok(done)
    }

    pub async fn retry_job_run(
        &self,
        owner: Uuid,
        run_id: Uuid,
        delay: Duration,
        last_error: &str,
    ) -> Result<u64> {
        workqueue::abandon(
            &self.pool,
            &self.job_runs,
            owner,
            &[run_id],
            Some(last_error),
            Some(delay),
        )
        .await
    }

    pub async fn fail_job_run(&self, owner: Uuid, run_id: Uuid, last_error: &str) -> Result<u64> {
        let done = workqueue::fail(&self.pool, &self.job_runs, owner, &[run_id], last_error).await?;
        if done == 0 {
            return Ok(0);
        }

        let sql = format!(
            r#"UPDATE {runs} SET end_time = now(), status = $2 WHERE id = $1"#,
            runs = self.job_runs_table()
        );
        sqlx::query(&sql)
            .bind(run_id)
            .bind(LABEL_FAILED)
            .execute(&self.pool)
            .await
            .context("finalize failed job run")?;

        self.reflect_run_onto_job(run_id, LABEL_FAILED).await?;
        Ok(done)
    }

    async fn reflect_run_onto_job(&self, run_id: Uuid, status: &str) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE {jobs}
            SET last_run_time = now(), last_run_status = $2
            WHERE id = (SELECT job_id FROM {runs} WHERE id = $1)
            "#,
            jobs = self.jobs_table(),
            runs = self.job_runs_table()
        );
        sqlx::query(&sql)
            .bind(run_id)
            .bind(status)
            .execute(&self.pool)
            .await
            .context("reflect run onto job")?;
        Ok(())
    }

    pub async fn claim_due_timers(
        &self,
        owner: Uuid,
        lease: Duration,
        batch_size: i64,
    ) -> Result<Vec<TimerMessage>> {
        let ids = workqueue::claim(&self.pool, &self.timers, owner, lease, batch_size).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT id, due_time, topic, payload, correlation_id, retry_count, created_at
            FROM {timers}
            WHERE id = ANY($1)
              AND owner_token = $2
            ORDER BY due_time
            "#,
            timers = self.timers_table()
        );
        let rows = sqlx::query_as::<_, TimerMessage>(&sql)
            .bind(&ids)
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .context("fetch claimed timers")?;

        Ok(rows)
    }

    pub async fn complete_timer(&self, owner: Uuid, id: Uuid) -> Result<u64> {
        let done = workqueue::ack(&self.pool, &self.timers, owner, &[id]).await?;
        if done == 0 {
            return Ok(0);
        }

        let sql = format!(
            r#"UPDATE {timers} SET processed_at = now(), status = $2 WHERE id = $1"#,
            timers = self.timers_table()
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(LABEL_COMPLETED)
            .execute(&self.pool)
            .await
            .context("finalize timer")?;
        Ok(done)
    }

    pub async fn retry_timer(
        &self,
        owner: Uuid,
        id: Uuid,
        delay: Duration,
        last_error: &str,
    ) -> Result<u64> {
        workqueue::abandon(
            &self.pool,
            &self.timers,
            owner,
            &[id],
            Some(last_error),
            Some(delay),
        )
        .await
    }

    pub async fn fail_timer(&self, owner: Uuid, id: Uuid, last_error: &str) -> Result<u64> {
        let done = workqueue::fail(&self.pool, &self.timers, owner, &[id], last_error).await?;
        if done == 0 {
            return Ok(0);
        }

        let sql = format!(
            r#"UPDATE {timers} SET status = $2 WHERE id = $1"#,
            timers = self.timers_table()
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(LABEL_FAILED)
            .execute(&self.pool)
            .await
            .context("finalize failed timer")?;
        Ok(done)
    }

    pub async fn reap_expired(&self) -> Result<u64> {
        let runs = workqueue::reap_expired(&self.pool, &self.job_runs).await?;
        let timers = workqueue::reap_expired(&self.pool, &self.timers).await?;
        Ok(runs + timers)
    }
}

fn parse_cron(expression: &str) -> Result<Schedule> {
    Schedule::from_str(expression).map_err(|err| {
        Error::invalid_argument(format!("invalid cron expression '{expression}': {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cron_advances_strictly_after_now() {
        let schedule = parse_cron("0 */5 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let next = schedule.after(&now).next().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 10, 5, 0).unwrap());

        // `after` is exclusive: a boundary instant yields the next slot, so a
        // materialized run never reschedules itself for the same time.
        let boundary = Utc.with_ymd_and_hms(2025, 3, 1, 10, 5, 0).unwrap();
        let next = schedule.after(&boundary).next().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 10, 10, 0).unwrap());
    }

    #[test]
    fn invalid_cron_is_invalid_argument() {
        let err = parse_cron("not a cron").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
