use crate::{
    provider::{StoreHandle, StoreProvider},
    strategy::{SelectionStrategy, StoreSelector},
};
use conveyor_core::{
    BackoffPolicy, Delivery, Error, ExponentialBackoff, HandlerRegistry, Outcome, Result,
};
use conveyor_store::InboxMessage;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use uuid::Uuid;

pub use crate::outbox_dispatcher::DispatcherOptions;

/// Multi-store inbox dispatcher.
///
/// Mirrors the outbox dispatcher over the inbox status vocabulary: ack moves
/// a row to `Done`, a retryable failure abandons it back to `Seen` with
/// backoff, and exhaustion (measured against the inbox `attempts` receive
/// counter) or a missing handler moves it to `Dead`.
pub struct InboxDispatcher {
    provider: Arc<dyn StoreProvider>,
    registry: Arc<HandlerRegistry>,
    selector: StoreSelector,
    backoff: Arc<dyn BackoffPolicy>,
    options: DispatcherOptions,
}

impl InboxDispatcher {
    pub fn new(
        provider: Arc<dyn StoreProvider>,
        registry: Arc<HandlerRegistry>,
        strategy: SelectionStrategy,
        options: DispatcherOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            provider,
            registry,
            selector: StoreSelector::new(strategy),
            backoff: Arc::new(ExponentialBackoff::default()),
            options,
        })
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn run_once(&self, batch_size: i64) -> Result<usize> {
        if batch_size <= 0 {
            return Err(Error::invalid_argument(format!(
                "batch size must be positive, got {batch_size}"
            )));
        }

        let stores = self.provider.stores().await;
        if stores.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = stores.iter().map(|s| s.key().to_string()).collect();

        for index in self.selector.visit_order(&keys) {
            let handle = &stores[index];

            let routing_lease = if self.options.lease_routing {
                let resource = format!("dispatch:inbox:{}", handle.key());
                match handle
                    .lease()
                    .acquire(&resource, self.options.claim_lease, None, None)
                    .await?
                {
                    Some(lease) => Some(lease),
                    None => {
                        self.selector.note_result(&keys, index, false);
                        continue;
                    }
                }
            } else {
                None
            };

            let owner = Uuid::new_v4();
            let claimed = handle
                .inbox()
                .claim(owner, self.options.claim_lease, batch_size)
                .await?;

            if claimed.is_empty() {
                self.selector.note_result(&keys, index, false);
                if let Some(lease) = routing_lease {
                    let _ = handle
                        .lease()
                        .release(&lease.resource_name, lease.owner_token)
                        .await;
                }
                continue;
            }
            self.selector.note_result(&keys, index, true);

            let mut processed = 0usize;
            for message in claimed {
                self.dispatch_one(handle, owner, message).await;
                processed += 1;
            }

            if let Some(lease) = routing_lease {
                let _ = handle
                    .lease()
                    .release(&lease.resource_name, lease.owner_token)
                    .await;
            }

            return Ok(processed);
        }

        Ok(0)
    }

    async fn dispatch_one(&self, handle: &StoreHandle, owner: Uuid, message: InboxMessage) {
        let inbox = handle.inbox();
        let key = (message.message_id.clone(), message.source.clone());
        let keys = std::slice::from_ref(&key);
        let attempt = message.attempts.max(1) as u32;

        let handler = message
            .topic
            .as_deref()
            .and_then(|topic| self.registry.resolve(topic));

        let Some(handler) = handler else {
            let error = match message.topic.as_deref() {
                Some(topic) => format!("No handler registered for topic '{topic}'"),
                None => "Inbox row has no topic to route by".to_string(),
            };
            tracing::warn!(
                event = "conveyor.dispatch.inbox.no_handler",
                store = %handle.key(),
                message_id = %message.message_id,
                source = %message.source,
                "no handler; moving row to dead"
            );
            if let Err(err) = inbox.fail(owner, keys, &error).await {
                tracing::warn!(
                    event = "conveyor.dispatch.inbox.fail_error",
                    store = %handle.key(),
                    error = %err,
                    "failed to mark row dead"
                );
            }
            return;
        };

        let delivery = Delivery {
            message_id: message.message_id.clone(),
            topic: message.topic.clone().unwrap_or_default(),
            payload: message.payload.clone().unwrap_or_default(),
            correlation_id: None,
            attempt,
        };

        let step = match handler.handle(&delivery).await {
            Ok(Outcome::Done) => inbox.ack(owner, keys).await.map(|_| "done"),
            Ok(Outcome::Retry { reason, delay }) => {
                self.retry_or_dead(handle, owner, keys, attempt, &reason, delay)
                    .await
            }
            Err(err) => {
                let reason = format!("{err:#}");
                self.retry_or_dead(handle, owner, keys, attempt, &reason, None)
                    .await
            }
        };

        match step {
            Ok(label) => {
                tracing::debug!(
                    event = "conveyor.dispatch.inbox.processed",
                    store = %handle.key(),
                    message_id = %message.message_id,
                    source = %message.source,
                    attempt,
                    outcome = label,
                    "message processed"
                );
            }
            Err(err) => {
                tracing::warn!(
                    event = "conveyor.dispatch.inbox.transition_error",
                    store = %handle.key(),
                    message_id = %message.message_id,
                    error = %err,
                    "state transition failed; row will be reaped after its lease expires"
                );
            }
        }
    }

    async fn retry_or_dead(
        &self,
        handle: &StoreHandle,
        owner: Uuid,
        keys: &[(String, String)],
        attempt: u32,
        reason: &str,
        delay: Option<Duration>,
    ) -> Result<&'static str> {
        let inbox = handle.inbox();
        if attempt >= self.options.max_attempts {
            tracing::warn!(
                event = "conveyor.dispatch.inbox.dead",
                store = %handle.key(),
                attempt,
                error = %reason,
                "attempts exhausted; moving row to dead"
            );
            inbox.fail(owner, keys, reason).await?;
            return Ok("dead");
        }

        let delay = delay.unwrap_or_else(|| self.backoff.delay_for_attempt(attempt));
        inbox
            .abandon(owner, keys, Some(reason), Some(delay))
            .await?;
        Ok("rescheduled")
    }

    pub async fn reap_all(&self) -> Result<u64> {
        let mut reaped = 0u64;
        for handle in self.provider.stores().await {
            reaped += handle.inbox().reap_expired().await?;
        }
        Ok(reaped)
    }

    pub async fn run(&self, batch_size: i64, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let processed = match self.run_once(batch_size).await {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(
                        event = "conveyor.dispatch.inbox.iteration_error",
                        error = %err,
                        "dispatch iteration failed"
                    );
                    0
                }
            };

            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.idle_sleep) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}
