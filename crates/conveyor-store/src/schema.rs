use anyhow::Context;
use conveyor_core::{Result, StoreOptions};
use sqlx::PgPool;

/// Idempotent DDL for every Conveyor table and index in the configured
/// schema.
///
/// Each statement is `IF NOT EXISTS`, so re-running against a deployed
/// database is a no-op; there is deliberately no migration engine. Schema and
/// table identifiers come from validated `StoreOptions` names.
pub async fn ensure_schema(pool: &PgPool, options: &StoreOptions) -> Result<()> {
    options.validate()?;

    for statement in schema_statements(options) {
        sqlx::query(&statement)
            .execute(pool)
            .await
            .with_context(|| format!("ensure schema statement: {}", first_line(&statement)))?;
    }

    tracing::debug!(
        event = "conveyor.schema.ensured",
        schema = %options.schema_name,
        outbox_table = %options.table_name,
        "schema ensured"
    );

    Ok(())
}

fn schema_statements(options: &StoreOptions) -> Vec<String> {
    let s = &options.schema_name;
    let outbox = &options.table_name;

    vec![
        format!(r#"CREATE SCHEMA IF NOT EXISTS "{s}""#),
        // Outbox: the transactional enqueue target and primary work queue.
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{s}"."{outbox}" (
              id uuid PRIMARY KEY,
              topic text NOT NULL,
              payload text NOT NULL,
              correlation_id text,
              message_id uuid NOT NULL,
              created_at timestamptz NOT NULL DEFAULT now(),
              due_time_utc timestamptz,
              status smallint NOT NULL DEFAULT 0,
              locked_until timestamptz,
              owner_token uuid,
              retry_count integer NOT NULL DEFAULT 0,
              last_error text,
              is_processed boolean NOT NULL DEFAULT FALSE,
              processed_at timestamptz,
              processed_by text
            )
            "#
        ),
        format!(
            r#"
            CREATE INDEX IF NOT EXISTS "{outbox}_ready_idx"
            ON "{s}"."{outbox}" (status, due_time_utc)
            WHERE status = 0
            "#
        ),
        format!(
            r#"
            CREATE INDEX IF NOT EXISTS "{outbox}_reap_idx"
            ON "{s}"."{outbox}" (locked_until)
            WHERE status = 1
            "#
        ),
        // Inbox: receive-side dedup keyed by (message_id, source).
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{s}"."inbox" (
              message_id varchar(200) NOT NULL,
              source varchar(200) NOT NULL,
              hash bytea,
              first_seen_utc timestamptz NOT NULL DEFAULT now(),
              last_seen_utc timestamptz NOT NULL DEFAULT now(),
              processed_utc timestamptz,
              due_time_utc timestamptz,
              attempts integer NOT NULL DEFAULT 0,
              status varchar(20) NOT NULL DEFAULT 'Seen',
              last_error text,
              locked_until timestamptz,
              owner_token uuid,
              topic text,
              payload text,
              PRIMARY KEY (message_id, source)
            )
            "#
        ),
        format!(
            r#"
            CREATE INDEX IF NOT EXISTS "inbox_ready_idx"
            ON "{s}"."inbox" (status, due_time_utc)
            WHERE status = 'Seen'
            "#
        ),
        // Scheduler: jobs, job-runs, timers, and the materializer state row.
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{s}"."jobs" (
              id uuid PRIMARY KEY,
              job_name varchar(200) NOT NULL UNIQUE,
              cron_schedule varchar(100) NOT NULL,
              topic text NOT NULL,
              payload text,
              is_enabled boolean NOT NULL DEFAULT TRUE,
              next_due_time timestamptz,
              last_run_time timestamptz,
              last_run_status varchar(20)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{s}"."job_runs" (
              id uuid PRIMARY KEY,
              job_id uuid NOT NULL REFERENCES "{s}"."jobs" (id) ON DELETE CASCADE,
              scheduled_time timestamptz NOT NULL,
              status_code smallint NOT NULL DEFAULT 0,
              locked_until timestamptz,
              owner_token uuid,
              status varchar(20) NOT NULL DEFAULT 'Scheduled',
              retry_count integer NOT NULL DEFAULT 0,
              start_time timestamptz,
              end_time timestamptz,
              output text,
              last_error text,
              UNIQUE (job_id, scheduled_time)
            )
            "#
        ),
        format!(
            r#"
            CREATE INDEX IF NOT EXISTS "job_runs_ready_idx"
            ON "{s}"."job_runs" (status_code, scheduled_time)
            WHERE status_code = 0
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{s}"."timers" (
              id uuid PRIMARY KEY,
              due_time timestamptz NOT NULL,
              payload text NOT NULL,
              topic text NOT NULL,
              correlation_id text,
              status_code smallint NOT NULL DEFAULT 0,
              locked_until timestamptz,
              owner_token uuid,
              status varchar(20) NOT NULL DEFAULT 'Scheduled',
              retry_count integer NOT NULL DEFAULT 0,
              created_at timestamptz NOT NULL DEFAULT now(),
              processed_at timestamptz,
              last_error text
            )
            "#
        ),
        format!(
            r#"
            CREATE INDEX IF NOT EXISTS "timers_ready_idx"
            ON "{s}"."timers" (status_code, due_time)
            WHERE status_code = 0
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{s}"."scheduler_state" (
              id smallint PRIMARY KEY,
              current_fencing_token bigint NOT NULL DEFAULT 0,
              last_run_at timestamptz
            )
            "#
        ),
        format!(
            r#"
            INSERT INTO "{s}"."scheduler_state" (id, current_fencing_token)
            VALUES (1, 0)
            ON CONFLICT (id) DO NOTHING
            "#
        ),
        // Distributed lease with per-resource fencing tokens.
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{s}"."lease" (
              resource_name text PRIMARY KEY,
              owner_token uuid NOT NULL,
              lease_until_utc timestamptz NOT NULL,
              fencing_token bigint NOT NULL,
              context_json jsonb
            )
            "#
        ),
        // Fan-out cadence policies and per-slice cursors.
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{s}"."fanout_policy" (
              topic text NOT NULL,
              work_key text NOT NULL,
              every_seconds integer NOT NULL,
              jitter_seconds integer NOT NULL DEFAULT 0,
              PRIMARY KEY (topic, work_key)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{s}"."fanout_cursor" (
              topic text NOT NULL,
              work_key text NOT NULL,
              shard_key text NOT NULL,
              last_due_at_utc timestamptz,
              last_completed_at_utc timestamptz,
              status varchar(20) NOT NULL DEFAULT 'InFlight',
              PRIMARY KEY (topic, work_key, shard_key)
            )
            "#
        ),
        // Join store for fan-in.
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{s}"."outbox_join" (
              join_id uuid PRIMARY KEY,
              tenant_id text NOT NULL,
              expected_steps integer NOT NULL,
              completed_steps integer NOT NULL DEFAULT 0,
              failed_steps integer NOT NULL DEFAULT 0,
              status smallint NOT NULL DEFAULT 0,
              created_utc timestamptz NOT NULL DEFAULT now(),
              last_updated_utc timestamptz NOT NULL DEFAULT now(),
              metadata jsonb,
              CHECK (completed_steps + failed_steps <= expected_steps)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{s}"."outbox_join_member" (
              join_id uuid NOT NULL REFERENCES "{s}"."outbox_join" (join_id) ON DELETE CASCADE,
              outbox_message_id uuid NOT NULL,
              completed_at timestamptz,
              failed_at timestamptz,
              PRIMARY KEY (join_id, outbox_message_id)
            )
            "#
        ),
    ]
}

fn first_line(statement: &str) -> &str {
    statement.trim().lines().next().unwrap_or_default()
}
