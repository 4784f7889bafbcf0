use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use conveyor_core::{Clock, Error, Result};
use rand::Rng;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use uuid::Uuid;

pub const CURSOR_IN_FLIGHT: &str = "InFlight";
pub const CURSOR_COMPLETED: &str = "Completed";

/// Cadence for a `(topic, work_key)` pair: emit each shard's slice every
/// `every_seconds`, smeared by up to `jitter_seconds` either way.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FanoutPolicy {
    pub topic: String,
    pub work_key: String,
    pub every_seconds: i32,
    pub jitter_seconds: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FanoutCursor {
    pub topic: String,
    pub work_key: String,
    pub shard_key: String,
    pub last_due_at_utc: Option<DateTime<Utc>>,
    pub last_completed_at_utc: Option<DateTime<Utc>>,
    pub status: String,
}

/// One unit of fan-out work: a shard that is due under its policy cadence.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FanoutSlice {
    pub topic: String,
    pub work_key: String,
    pub shard_key: String,
    pub correlation_id: Option<String>,
}

/// Enumerates the shard keys (tenants, databases, partitions) a topic fans
/// out over. The multi-store providers adapt to this via their store
/// identifiers.
#[async_trait]
pub trait ShardSource: Send + Sync {
    async fn shard_keys(&self) -> anyhow::Result<Vec<String>>;
}

#[async_trait]
impl ShardSource for Vec<String> {
    async fn shard_keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.clone())
    }
}

/// Fan-out policies and per-slice cursors.
#[derive(Debug, Clone)]
pub struct FanoutStore {
    pool: PgPool,
    schema: String,
}

impl FanoutStore {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn policy_table(&self) -> String {
        format!(r#""{}"."fanout_policy""#, self.schema)
    }

    fn cursor_table(&self) -> String {
        format!(r#""{}"."fanout_cursor""#, self.schema)
    }

    pub async fn upsert_policy(
        &self,
        topic: &str,
        work_key: &str,
        every_seconds: i32,
        jitter_seconds: i32,
    ) -> Result<()> {
        if every_seconds <= 0 {
            return Err(Error::invalid_argument(
                "fanout cadence must be greater than zero",
            ));
        }
        if jitter_seconds < 0 {
            return Err(Error::invalid_argument("fanout jitter must be non-negative"));
        }

        let sql = format!(
            r#"
            INSERT INTO {policies} (topic, work_key, every_seconds, jitter_seconds)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (topic, work_key) DO UPDATE SET
              every_seconds = EXCLUDED.every_seconds,
              jitter_seconds = EXCLUDED.jitter_seconds
            "#,
            policies = self.policy_table()
        );

        sqlx::query(&sql)
            .bind(topic)
            .bind(work_key)
            .bind(every_seconds)
            .bind(jitter_seconds)
            .execute(&self.pool)
            .await
            .with_context(|| format!("upsert fanout policy topic={topic}"))?;

        Ok(())
    }

    pub async fn get_policy(&self, topic: &str, work_key: &str) -> Result<Option<FanoutPolicy>> {
        let sql = format!(
            r#"
            SELECT topic, work_key, every_seconds, jitter_seconds
            FROM {policies}
            WHERE topic = $1 AND work_key = $2
            "#,
            policies = self.policy_table()
        );
        let row = sqlx::query_as::<_, FanoutPolicy>(&sql)
            .bind(topic)
            .bind(work_key)
            .fetch_optional(&self.pool)
            .await
            .context("get fanout policy")?;
        Ok(row)
    }

    pub async fn list_policies(&self, topic: &str) -> Result<Vec<FanoutPolicy>> {
        let sql = format!(
            r#"
            SELECT topic, work_key, every_seconds, jitter_seconds
            FROM {policies}
            WHERE topic = $1
            ORDER BY work_key
            "#,
            policies = self.policy_table()
        );
        let rows = sqlx::query_as::<_, FanoutPolicy>(&sql)
            .bind(topic)
            .fetch_all(&self.pool)
            .await
            .context("list fanout policies")?;
        Ok(rows)
    }

    pub async fn get_cursor(
        &self,
        topic: &str,
        work_key: &str,
        shard_key: &str,
    ) -> Result<Option<FanoutCursor>> {
        let sql = format!(
            r#"
            SELECT topic, work_key, shard_key, last_due_at_utc, last_completed_at_utc, status
            FROM {cursors}
            WHERE topic = $1 AND work_key = $2 AND shard_key = $3
            "#,
            cursors = self.cursor_table()
        );
        let row = sqlx::query_as::<_, FanoutCursor>(&sql)
            .bind(topic)
            .bind(work_key)
            .bind(shard_key)
            .fetch_optional(&self.pool)
            .await
            .context("get fanout cursor")?;
        Ok(row)
    }

    /// Stamp a slice as emitted inside the caller's transaction, so cursor
    /// progression commits (or rolls back) together with the outbox enqueue.
    pub async fn mark_due_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        slice: &FanoutSlice,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {cursors} (topic, work_key, shard_key, last_due_at_utc, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (topic, work_key, shard_key) DO UPDATE SET
              last_due_at_utc = EXCLUDED.last_due_at_utc,
              status = EXCLUDED.status
            "#,
            cursors = self.cursor_table()
        );

        sqlx::query(&sql)
            .bind(&slice.topic)
            .bind(&slice.work_key)
            .bind(&slice.shard_key)
            .bind(now)
            .bind(CURSOR_IN_FLIGHT)
            .execute(&mut **tx)
            .await
            .with_context(|| format!("mark fanout slice due shard={}", slice.shard_key))?;

        Ok(())
    }

    /// Completion path: a join-wait or explicit slice-done message reports the
    /// slice finished, re-arming the cadence from now.
    pub async fn mark_completed(
        &self,
        topic: &str,
        work_key: &str,
        shard_key: &str,
    ) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE {cursors}
            SET last_completed_at_utc = now(),
                status = $4
            WHERE topic = $1 AND work_key = $2 AND shard_key = $3
            "#,
            cursors = self.cursor_table()
        );

        let done = sqlx::query(&sql)
            .bind(topic)
            .bind(work_key)
            .bind(shard_key)
            .bind(CURSOR_COMPLETED)
            .execute(&self.pool)
            .await
            .context("mark fanout slice completed")?;

        Ok(done.rows_affected())
    }
}

/// Computes the set of due slices for a topic from its policies, cursors, and
/// shard enumeration.
#[derive(Clone)]
pub struct FanoutPlanner {
    store: FanoutStore,
    shards: Arc<dyn ShardSource>,
    clock: Arc<dyn Clock>,
}

impl FanoutPlanner {
    pub fn new(store: FanoutStore, shards: Arc<dyn ShardSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            shards,
            clock,
        }
    }

    pub fn store(&self) -> &FanoutStore {
        &self.store
    }

    /// Yield one slice per shard whose cursor is due under the policy
    /// cadence: absent cursors are due immediately; otherwise the slice is
    /// due once `max(last_due, last_completed) + every ± rand(jitter)` has
    /// passed.
    pub async fn due_slices(
        &self,
        topic: &str,
        work_key: Option<&str>,
    ) -> Result<Vec<FanoutSlice>> {
        let policies = match work_key {
            Some(key) => self
                .store
                .get_policy(topic, key)
                .await?
                .into_iter()
                .collect(),
            None => self.store.list_policies(topic).await?,
        };
        if policies.is_empty() {
            return Ok(Vec::new());
        }

        let shard_keys = self
            .shards
            .shard_keys()
            .await
            .context("enumerate fanout shards")?;
        let now = self.clock.now();

        let mut slices = Vec::new();
        for policy in &policies {
            for shard_key in &shard_keys {
                let cursor = self
                    .store
                    .get_cursor(topic, &policy.work_key, shard_key)
                    .await?;
                if cursor_is_due(cursor.as_ref(), policy, now) {
                    slices.push(FanoutSlice {
                        topic: topic.to_string(),
                        work_key: policy.work_key.clone(),
                        shard_key: shard_key.clone(),
                        correlation_id: Some(Uuid::new_v4().to_string()),
                    });
                }
            }
        }

        Ok(slices)
    }
}

fn cursor_is_due(cursor: Option<&FanoutCursor>, policy: &FanoutPolicy, now: DateTime<Utc>) -> bool {
    let Some(cursor) = cursor else {
        return true;
    };

    let anchor = match (cursor.last_due_at_utc, cursor.last_completed_at_utc) {
        (Some(due), Some(completed)) => due.max(completed),
        (Some(due), None) => due,
        (None, Some(completed)) => completed,
        (None, None) => return true,
    };

    let jitter_seconds = if policy.jitter_seconds > 0 {
        rand::thread_rng().gen_range(-policy.jitter_seconds..=policy.jitter_seconds)
    } else {
        0
    };
    // An in-flight slice never benefits from negative jitter; it waits the
    // full cadence before re-emission.
    let jitter_seconds = if cursor.status == CURSOR_IN_FLIGHT {
        jitter_seconds.max(0)
    } else {
        jitter_seconds
    };

    let next_due =
        anchor + ChronoDuration::seconds((policy.every_seconds + jitter_seconds).max(0) as i64);
    now >= next_due
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy(every: i32, jitter: i32) -> FanoutPolicy {
        FanoutPolicy {
            topic: "billing".to_string(),
            work_key: "sync".to_string(),
            every_seconds: every,
            jitter_seconds: jitter,
        }
    }

    fn cursor(
        last_due: Option<DateTime<Utc>>,
        last_completed: Option<DateTime<Utc>>,
        status: &str,
    ) -> FanoutCursor {
        FanoutCursor {
            topic: "billing".to_string(),
            work_key: "sync".to_string(),
            shard_key: "tenant-1".to_string(),
            last_due_at_utc: last_due,
            last_completed_at_utc: last_completed,
            status: status.to_string(),
        }
    }

    #[test]
    fn missing_cursor_is_due() {
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        assert!(cursor_is_due(None, &policy(60, 0), now));
    }

    #[test]
    fn in_flight_slice_waits_full_cadence() {
        let t0 = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        let c = cursor(Some(t0), None, CURSOR_IN_FLIGHT);

        let before = t0 + ChronoDuration::seconds(30);
        assert!(!cursor_is_due(Some(&c), &policy(60, 0), before));

        let after = t0 + ChronoDuration::seconds(61);
        assert!(cursor_is_due(Some(&c), &policy(60, 0), after));
    }

    #[test]
    fn completion_re_anchors_the_cadence() {
        let due = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        let completed = due + ChronoDuration::seconds(45);
        let c = cursor(Some(due), Some(completed), CURSOR_COMPLETED);

        // 70s after the emission but only 25s after completion: not due.
        let now = due + ChronoDuration::seconds(70);
        assert!(!cursor_is_due(Some(&c), &policy(60, 0), now));

        let now = completed + ChronoDuration::seconds(60);
        assert!(cursor_is_due(Some(&c), &policy(60, 0), now));
    }
}
