use crate::error::{Error, Result};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};

/// The view of a claimed message a handler receives.
///
/// `attempt` is 1-based: the first run of a message is attempt 1. For outbox
/// messages it is `retry_count + 1`; for inbox messages it is the receive
/// counter.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub topic: String,
    pub payload: String,
    pub correlation_id: Option<String>,
    pub attempt: u32,
}

/// What a handler decided about a delivery.
///
/// `Retry` is the non-exceptional "not yet" path (for example a join that has
/// not collected all of its steps); the dispatcher reschedules the row with
/// the given delay, falling back to its backoff policy when `delay` is
/// `None`. Returning `Err` from a handler is also retried, with backoff,
/// until attempts are exhausted.
#[derive(Debug, Clone)]
pub enum Outcome {
    Done,
    Retry {
        reason: String,
        delay: Option<Duration>,
    },
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// The topic this handler consumes. Matching is case-insensitive.
    fn topic(&self) -> &str;

    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<Outcome>;
}

/// Flat topic → handler map with case-folded lookup.
///
/// Handlers are leaves; the registry owns them behind `Arc` so dispatchers
/// can share one registry across stores.
#[derive(Default)]
pub struct HandlerRegistry {
    by_topic: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) -> Result<()> {
        let key = handler.topic().to_lowercase();
        if key.is_empty() {
            return Err(Error::invalid_argument("handler topic must not be empty"));
        }
        if self.by_topic.contains_key(&key) {
            return Err(Error::config(format!(
                "handler already registered for topic '{}'",
                handler.topic()
            )));
        }
        self.by_topic.insert(key, handler);
        Ok(())
    }

    pub fn resolve(&self, topic: &str) -> Option<Arc<dyn Handler>> {
        self.by_topic.get(&topic.to_lowercase()).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_topic.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        topic: String,
    }

    #[async_trait]
    impl Handler for Echo {
        fn topic(&self) -> &str {
            &self.topic
        }

        async fn handle(&self, _delivery: &Delivery) -> anyhow::Result<Outcome> {
            Ok(Outcome::Done)
        }
    }

    #[test]
    fn resolve_is_case_insensitive() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(Arc::new(Echo {
                topic: "Billing.Invoice".to_string(),
            }))
            .unwrap();

        assert!(registry.resolve("billing.invoice").is_some());
        assert!(registry.resolve("BILLING.INVOICE").is_some());
        assert!(registry.resolve("billing.other").is_none());
    }

    #[test]
    fn duplicate_topic_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(Arc::new(Echo {
                topic: "t".to_string(),
            }))
            .unwrap();

        let err = registry
            .register(Arc::new(Echo {
                topic: "T".to_string(),
            }))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_topic_is_rejected() {
        let mut registry = HandlerRegistry::new();
        let err = registry
            .register(Arc::new(Echo {
                topic: String::new(),
            }))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
