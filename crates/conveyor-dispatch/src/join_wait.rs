use async_trait::async_trait;
use conveyor_core::{Delivery, Handler, Outcome};
use conveyor_store::{FanoutSlice, FanoutStore, JoinStatus, JoinStore, NewMessage, OutboxStore};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload of a join-wait message: which join to watch and what to do once
/// every step has reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinWaitPayload {
    pub join_id: Uuid,
    #[serde(default)]
    pub fail_if_any_step_failed: bool,
    #[serde(default)]
    pub on_complete_topic: Option<String>,
    #[serde(default)]
    pub on_complete_payload: Option<String>,
    #[serde(default)]
    pub on_fail_topic: Option<String>,
    #[serde(default)]
    pub on_fail_payload: Option<String>,
}

/// Fan-in gate: consumes a join-wait message and resolves it once the join's
/// steps have all reported.
///
/// "Not ready" is the tagged `Retry` outcome rather than an error, so the
/// dispatcher reschedules the row without treating the common path as a
/// failure.
pub struct JoinWaitHandler {
    topic: String,
    joins: JoinStore,
    outbox: OutboxStore,
}

impl JoinWaitHandler {
    pub const DEFAULT_TOPIC: &'static str = "join.wait";

    pub fn new(joins: JoinStore, outbox: OutboxStore) -> Self {
        Self::with_topic(Self::DEFAULT_TOPIC, joins, outbox)
    }

    pub fn with_topic(topic: impl Into<String>, joins: JoinStore, outbox: OutboxStore) -> Self {
        Self {
            topic: topic.into(),
            joins,
            outbox,
        }
    }
}

#[async_trait]
impl Handler for JoinWaitHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<Outcome> {
        let payload: JoinWaitPayload =
            serde_json::from_str(&delivery.payload).map_err(|err| {
                anyhow::anyhow!("invalid join-wait payload: {err}")
            })?;

        let join = self.joins.get_join(payload.join_id).await?;
        if !join.all_steps_reported() {
            return Ok(Outcome::Retry {
                reason: format!(
                    "join {} not ready: {}/{} steps reported",
                    join.join_id,
                    join.completed_steps + join.failed_steps,
                    join.expected_steps
                ),
                delay: None,
            });
        }

        if payload.fail_if_any_step_failed && join.failed_steps > 0 {
            self.joins
                .update_status(join.join_id, JoinStatus::Failed)
                .await?;
            if let Some(topic) = &payload.on_fail_topic {
                self.outbox
                    .enqueue(NewMessage {
                        topic: topic.clone(),
                        payload: payload.on_fail_payload.clone().unwrap_or_default(),
                        correlation_id: Some(join.join_id.to_string()),
                        due_time_utc: None,
                    })
                    .await?;
            }
            tracing::info!(
                event = "conveyor.join_wait.failed",
                join_id = %join.join_id,
                failed_steps = join.failed_steps,
                "join resolved as failed"
            );
            return Ok(Outcome::Done);
        }

        self.joins
            .update_status(join.join_id, JoinStatus::Completed)
            .await?;
        if let Some(topic) = &payload.on_complete_topic {
            self.outbox
                .enqueue(NewMessage {
                    topic: topic.clone(),
                    payload: payload.on_complete_payload.clone().unwrap_or_default(),
                    correlation_id: Some(join.join_id.to_string()),
                    due_time_utc: None,
                })
                .await?;
        }
        tracing::info!(
            event = "conveyor.join_wait.completed",
            join_id = %join.join_id,
            completed_steps = join.completed_steps,
            "join resolved as completed"
        );
        Ok(Outcome::Done)
    }
}

/// Completion side of the fan-out loop: consumes explicit slice-done
/// messages and re-arms the slice cursor.
pub struct SliceCompletionHandler {
    topic: String,
    fanout: FanoutStore,
}

impl SliceCompletionHandler {
    pub const DEFAULT_TOPIC: &'static str = "fanout.slice_done";

    pub fn new(fanout: FanoutStore) -> Self {
        Self::with_topic(Self::DEFAULT_TOPIC, fanout)
    }

    pub fn with_topic(topic: impl Into<String>, fanout: FanoutStore) -> Self {
        Self {
            topic: topic.into(),
            fanout,
        }
    }
}

#[async_trait]
impl Handler for SliceCompletionHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<Outcome> {
        let slice: FanoutSlice = serde_json::from_str(&delivery.payload)
            .map_err(|err| anyhow::anyhow!("invalid slice-done payload: {err}"))?;

        self.fanout
            .mark_completed(&slice.topic, &slice.work_key, &slice.shard_key)
            .await?;

        Ok(Outcome::Done)
    }
}
