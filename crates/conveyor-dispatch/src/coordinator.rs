use anyhow::Context;
use conveyor_core::{Clock, Result};
use conveyor_store::{
    lease::LeaseStore, FanoutPlanner, FanoutSlice, JoinStore, NewMessage, OutboxStore,
};
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

const MAX_FANOUT_LEASE: Duration = Duration::from_secs(5 * 60);

/// Cadence-driven fan-out under a singleton per-topic lease.
///
/// Each run asks the planner for due slices and, per slice, enqueues one
/// outbox message and advances the slice cursor in the same transaction.
/// The lease (duration = the shortest policy cadence, capped) is left to
/// expire rather than released, so a crashed coordinator cannot cause a
/// burst of duplicate emissions inside one cadence window.
pub struct FanoutCoordinator {
    planner: FanoutPlanner,
    lease: LeaseStore,
    outbox: OutboxStore,
    clock: Arc<dyn Clock>,
    joins: Option<JoinTracking>,
}

struct JoinTracking {
    store: JoinStore,
    tenant_id: String,
}

impl FanoutCoordinator {
    pub fn new(
        planner: FanoutPlanner,
        lease: LeaseStore,
        outbox: OutboxStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            planner,
            lease,
            outbox,
            clock,
            joins: None,
        }
    }

    /// Track each run's emissions as a join so a join-wait can fan the batch
    /// back in.
    pub fn with_join_tracking(mut self, store: JoinStore, tenant_id: impl Into<String>) -> Self {
        self.joins = Some(JoinTracking {
            store,
            tenant_id: tenant_id.into(),
        });
        self
    }

    /// Run one fan-out pass for `topic`. Returns the number of slices
    /// emitted; zero when the topic lease is already held elsewhere or
    /// nothing is due.
    pub async fn run(&self, topic: &str, work_key: Option<&str>) -> Result<usize> {
        let policies = match work_key {
            Some(key) => self
                .planner
                .store()
                .get_policy(topic, key)
                .await?
                .into_iter()
                .collect::<Vec<_>>(),
            None => self.planner.store().list_policies(topic).await?,
        };
        if policies.is_empty() {
            return Ok(0);
        }

        let cadence_secs = policies
            .iter()
            .map(|p| p.every_seconds.max(1) as u64)
            .min()
            .unwrap_or(60);
        let lease_duration = Duration::from_secs(cadence_secs).min(MAX_FANOUT_LEASE);

        let resource = format!("fanout:{topic}");
        let Some(_lease) = self
            .lease
            .acquire(&resource, lease_duration, None, None)
            .await?
        else {
            tracing::debug!(
                event = "conveyor.fanout.lease_held",
                topic,
                "fanout lease held elsewhere; skipping run"
            );
            return Ok(0);
        };

        let slices = self.planner.due_slices(topic, work_key).await?;
        if slices.is_empty() {
            return Ok(0);
        }

        let join = match &self.joins {
            Some(tracking) => Some(
                tracking
                    .store
                    .create_join(&tracking.tenant_id, slices.len() as i32, None)
                    .await?,
            ),
            None => None,
        };

        let mut emitted = 0usize;
        for slice in &slices {
            let message_id = self.emit_slice(slice).await?;
            if let (Some(join), Some(tracking)) = (&join, &self.joins) {
                tracking
                    .store
                    .attach_message(join.join_id, message_id)
                    .await?;
            }
            emitted += 1;
        }

        tracing::info!(
            event = "conveyor.fanout.emitted",
            topic,
            slices = emitted,
            "fanout pass complete"
        );

        Ok(emitted)
    }

    /// Outbox enqueue and cursor progression commit together.
    async fn emit_slice(&self, slice: &FanoutSlice) -> Result<Uuid> {
        let payload = serde_json::to_string(slice).context("encode fanout slice")?;
        let message = NewMessage {
            topic: slice.topic.clone(),
            payload,
            correlation_id: slice.correlation_id.clone(),
            due_time_utc: None,
        };

        let mut tx = self
            .outbox
            .pool()
            .begin()
            .await
            .context("begin fanout slice tx")?;

        let enqueued = self.outbox.enqueue_in(&mut tx, message).await?;
        self.planner
            .store()
            .mark_due_in(&mut tx, slice, self.clock.now())
            .await?;

        tx.commit()
            .await
            .with_context(|| format!("commit fanout slice shard={}", slice.shard_key))?;

        Ok(enqueued.message_id)
    }
}
