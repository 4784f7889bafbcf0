use async_trait::async_trait;
use conveyor_core::{Delivery, Handler, Outcome};

/// Smoke-test handler: logs the delivery and acks.
pub struct LoggingHandler {
    topic: String,
}

impl LoggingHandler {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl Handler for LoggingHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<Outcome> {
        tracing::info!(
            event = "harness.handler.logged",
            topic = %delivery.topic,
            message_id = %delivery.message_id,
            attempt = delivery.attempt,
            payload = %delivery.payload,
            "message received"
        );
        Ok(Outcome::Done)
    }
}
