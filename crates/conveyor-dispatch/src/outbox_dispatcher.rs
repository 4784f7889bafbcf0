use crate::{
    provider::{StoreHandle, StoreProvider},
    strategy::{SelectionStrategy, StoreSelector},
};
use conveyor_core::{
    BackoffPolicy, Delivery, Error, ExponentialBackoff, HandlerRegistry, Outcome, Result,
};
use conveyor_store::OutboxMessage;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::watch, time::Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Attempt budget per message: the run at attempt `max_attempts` is the
    /// last one; its failure is terminal. Zero is rejected at construction.
    pub max_attempts: u32,
    /// Row lease taken at claim time.
    pub claim_lease: Duration,
    /// When set, a per-store singleton lease gates dispatch so at most one
    /// dispatcher works a given store at a time.
    pub lease_routing: bool,
    /// Sleep between `run` iterations that found no work.
    pub idle_sleep: Duration,
    /// How often the `run` loop reaps expired row leases.
    pub reap_interval: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            claim_lease: Duration::from_secs(5 * 60),
            lease_routing: false,
            idle_sleep: Duration::from_secs(1),
            reap_interval: Duration::from_secs(30),
        }
    }
}

impl DispatcherOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config(
                "max attempts must be at least 1; zero would never dispatch",
            ));
        }
        if self.claim_lease.is_zero() {
            return Err(Error::config("claim lease must be greater than zero"));
        }
        Ok(())
    }
}

/// Multi-store outbox dispatcher.
///
/// Each `run_once` claims a batch from one store (chosen by the selection
/// strategy) under a freshly generated owner token, resolves each row's
/// topic to a handler, and acks / reschedules / fails per the outcome. A
/// fresh owner token per invocation means a stalled previous run can never
/// act on rows claimed by this one.
pub struct OutboxDispatcher {
    provider: Arc<dyn StoreProvider>,
    registry: Arc<HandlerRegistry>,
    selector: StoreSelector,
    backoff: Arc<dyn BackoffPolicy>,
    options: DispatcherOptions,
    last_reap: Mutex<Option<Instant>>,
}

impl OutboxDispatcher {
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
            last_reap: Mutex::new(None),
        })
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Claim and process up to `batch_size` rows from the first store (in
    /// strategy order) that yields work. Returns the number processed.
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
                let resource = format!("dispatch:outbox:{}", handle.key());
                match handle
                    .lease()
                    .acquire(&resource, self.options.claim_lease, None, None)
                    .await?
                {
                    Some(lease) => Some(lease),
                    None => {
                        // Another dispatcher owns this store right now.
                        self.selector.note_result(&keys, index, false);
                        continue;
                    }
                }
            } else {
                None
            };

            let owner = Uuid::new_v4();
            let claimed = handle
                .outbox()
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

    /// Per-row errors are terminal-state decisions, not loop failures: store
    /// write errors here are logged and the row is left to the reaper.
    async fn dispatch_one(&self, handle: &StoreHandle, owner: Uuid, message: OutboxMessage) {
        let outbox = handle.outbox();
        let attempt = (message.retry_count.max(0) as u32) + 1;

        let Some(handler) = self.registry.resolve(&message.topic) else {
            let error = format!("No handler registered for topic '{}'", message.topic);
            tracing::warn!(
                event = "conveyor.dispatch.outbox.no_handler",
                store = %handle.key(),
                topic = %message.topic,
                message_id = %message.message_id,
                "no handler; failing row"
            );
            if let Err(err) = outbox.fail(owner, &[message.id], &error).await {
                tracing::warn!(
                    event = "conveyor.dispatch.outbox.fail_error",
                    store = %handle.key(),
                    error = %err,
                    "failed to mark row failed"
                );
            }
            return;
        };

        let delivery = Delivery {
            message_id: message.message_id.to_string(),
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            correlation_id: message.correlation_id.clone(),
            attempt,
        };

        let step = match handler.handle(&delivery).await {
            Ok(Outcome::Done) => outbox.ack(owner, &[message.id]).await.map(|_| "done"),
            Ok(Outcome::Retry { reason, delay }) => {
                self.retry_or_fail(handle, owner, &message, attempt, &reason, delay)
                    .await
            }
            Err(err) => {
                let reason = format!("{err:#}");
                self.retry_or_fail(handle, owner, &message, attempt, &reason, None)
                    .await
            }
        };

        match step {
            Ok(label) => {
                tracing::debug!(
                    event = "conveyor.dispatch.outbox.processed",
                    store = %handle.key(),
                    topic = %message.topic,
                    message_id = %message.message_id,
                    attempt,
                    outcome = label,
                    "message processed"
                );
            }
            Err(err) => {
                tracing::warn!(
                    event = "conveyor.dispatch.outbox.transition_error",
                    store = %handle.key(),
                    message_id = %message.message_id,
                    error = %err,
                    "state transition failed; row will be reaped after its lease expires"
                );
            }
        }
    }

    async fn retry_or_fail(
        &self,
        handle: &StoreHandle,
        owner: Uuid,
        message: &OutboxMessage,
        attempt: u32,
        reason: &str,
        delay: Option<Duration>,
    ) -> Result<&'static str> {
        let outbox = handle.outbox();
        if attempt >= self.options.max_attempts {
            tracing::warn!(
                event = "conveyor.dispatch.outbox.failed",
                store = %handle.key(),
                topic = %message.topic,
                message_id = %message.message_id,
                attempt,
                error = %reason,
                "attempts exhausted; failing row"
            );
            outbox.fail(owner, &[message.id], reason).await?;
            return Ok("failed");
        }

        let delay = delay.unwrap_or_else(|| self.backoff.delay_for_attempt(attempt));
        outbox
            .abandon(owner, &[message.id], Some(reason), Some(delay))
            .await?;
        Ok("rescheduled")
    }

    /// Reap expired row leases on every store. Safe from any process.
    pub async fn reap_all(&self) -> Result<u64> {
        let mut reaped = 0u64;
        for handle in self.provider.stores().await {
            reaped += handle.outbox().reap_expired().await?;
        }
        Ok(reaped)
    }

    /// Drive `run_once` until the shutdown channel flips, sleeping between
    /// empty iterations and reaping on the configured interval. Iteration
    /// errors are logged and do not stop the loop.
    pub async fn run(&self, batch_size: i64, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            self.maybe_reap().await;

            let processed = match self.run_once(batch_size).await {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(
                        event = "conveyor.dispatch.outbox.iteration_error",
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

    async fn maybe_reap(&self) {
        let due = {
            let last = self.last_reap.lock().expect("reap state poisoned");
            match *last {
                Some(at) => at.elapsed() >= self.options.reap_interval,
                None => true,
            }
        };
        if !due {
            return;
        }

        match self.reap_all().await {
            Ok(reaped) if reaped > 0 => {
                tracing::info!(
                    event = "conveyor.dispatch.outbox.reaped",
                    reaped,
                    "reset expired row leases"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    event = "conveyor.dispatch.outbox.reap_error",
                    error = %err,
                    "reap failed"
                );
            }
        }

        let mut last = self.last_reap.lock().expect("reap state poisoned");
        *last = Some(Instant::now());
    }
}
