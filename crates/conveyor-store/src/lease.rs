use anyhow::Context;
use chrono::{DateTime, Utc};
use conveyor_core::{Error, Result};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

/// A held lease. The fencing token strictly increases per resource across
/// acquisitions, so downstream writers can reject stale holders.
#[derive(Debug, Clone)]
pub struct Lease {
    pub resource_name: String,
    pub owner_token: Uuid,
    pub lease_until_utc: DateTime<Utc>,
    pub fencing_token: i64,
}

#[derive(Debug, Clone)]
pub struct RenewOutcome {
    pub renewed: bool,
    pub server_now: DateTime<Utc>,
    pub lease_until_utc: Option<DateTime<Utc>>,
}

/// Fencing-token lease engine over a single `lease` table.
///
/// Acquisition is one upsert statement: the conflict clause takes over an
/// expired lease or re-enters one held by the same owner, bumping the
/// fencing token either way; a live lease held by someone else produces no
/// row. Release expires the row in place rather than deleting it so the
/// fencing sequence survives re-acquisition.
#[derive(Debug, Clone)]
pub struct LeaseStore {
    pool: PgPool,
    schema: String,
}

impl LeaseStore {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
        }
    }

    fn qualified(&self) -> String {
        format!(r#""{}"."lease""#, self.schema)
    }

    pub async fn acquire(
        &self,
        resource: &str,
        duration: Duration,
        owner_token: Option<Uuid>,
        context_json: Option<Value>,
    ) -> Result<Option<Lease>> {
        if resource.trim().is_empty() {
            return Err(Error::invalid_argument("lease resource must not be empty"));
        }

        let owner = owner_token.unwrap_or_else(Uuid::new_v4);
        let sql = format!(
            r#"
            INSERT INTO {q} AS l (resource_name, owner_token, lease_until_utc, fencing_token, context_json)
            VALUES ($1, $2, now() + make_interval(secs => $3), 1, $4)
            ON CONFLICT (resource_name) DO UPDATE SET
              owner_token = EXCLUDED.owner_token,
              lease_until_utc = EXCLUDED.lease_until_utc,
              fencing_token = l.fencing_token + 1,
              context_json = COALESCE(EXCLUDED.context_json, l.context_json)
            WHERE l.lease_until_utc <= now()
               OR l.owner_token = EXCLUDED.owner_token
            RETURNING lease_until_utc, fencing_token
            "#,
            q = self.qualified()
        );

        let row = sqlx::query(&sql)
            .bind(resource)
            .bind(owner)
            .bind(duration.as_secs_f64())
            .bind(context_json)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("acquire lease resource={resource}"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Lease {
            resource_name: resource.to_string(),
            owner_token: owner,
            lease_until_utc: row.try_get("lease_until_utc").context("lease_until_utc")?,
            fencing_token: row.try_get("fencing_token").context("fencing_token")?,
        }))
    }

    /// Renew succeeds only while the lease is live and owned by `owner`; an
    /// expired lease fails renewal even for its previous owner.
    pub async fn renew(
        &self,
        resource: &str,
        owner: Uuid,
        duration: Duration,
    ) -> Result<RenewOutcome> {
        let sql = format!(
            r#"
            UPDATE {q}
            SET lease_until_utc = now() + make_interval(secs => $3)
            WHERE resource_name = $1
              AND owner_token = $2
              AND lease_until_utc > now()
            RETURNING now() AS server_now, lease_until_utc
            "#,
            q = self.qualified()
        );

        let row = sqlx::query(&sql)
            .bind(resource)
            .bind(owner)
            .bind(duration.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("renew lease resource={resource}"))?;

        if let Some(row) = row {
            return Ok(RenewOutcome {
                renewed: true,
                server_now: row.try_get("server_now").context("server_now")?,
                lease_until_utc: Some(row.try_get("lease_until_utc").context("lease_until_utc")?),
            });
        }

        let server_now: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&self.pool)
            .await
            .context("fetch server time")?;

        Ok(RenewOutcome {
            renewed: false,
            server_now,
            lease_until_utc: None,
        })
    }

    /// Best-effort release: expire the lease in place so peers observe it
    /// immediately. Owner mismatch leaves the row untouched.
    pub async fn release(&self, resource: &str, owner: Uuid) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE {q}
            SET lease_until_utc = now()
            WHERE resource_name = $1
              AND owner_token = $2
              AND lease_until_utc > now()
            "#,
            q = self.qualified()
        );

        sqlx::query(&sql)
            .bind(resource)
            .bind(owner)
            .execute(&self.pool)
            .await
            .with_context(|| format!("release lease resource={resource}"))?;

        Ok(())
    }

    pub async fn get(&self, resource: &str) -> Result<Option<Lease>> {
        let sql = format!(
            r#"
            SELECT resource_name, owner_token, lease_until_utc, fencing_token
            FROM {q}
            WHERE resource_name = $1
            "#,
            q = self.qualified()
        );

        let row = sqlx::query(&sql)
            .bind(resource)
            .fetch_optional(&self.pool)
            .await
            .context("get lease row")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Lease {
            resource_name: row.try_get("resource_name").context("resource_name")?,
            owner_token: row.try_get("owner_token").context("owner_token")?,
            lease_until_utc: row.try_get("lease_until_utc").context("lease_until_utc")?,
            fencing_token: row.try_get("fencing_token").context("fencing_token")?,
        }))
    }
}
