use crate::provider::StoreProvider;
use conveyor_core::Result;
use conveyor_store::cleanup::purge_terminal_rows;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::watch, time::Instant};

/// Retention-based deletion of terminal rows across every provided store.
///
/// Each store runs on its own `cleanup_interval` (tracked against a
/// monotonic clock); the service polls well under the smallest interval so
/// a store is never late by more than one poll.
pub struct CleanupService {
    provider: Arc<dyn StoreProvider>,
    poll_interval: Duration,
    last_run: Mutex<HashMap<String, Instant>>,
}

impl CleanupService {
    pub fn new(provider: Arc<dyn StoreProvider>) -> Self {
        Self {
            provider,
            poll_interval: Duration::from_secs(60),
            last_run: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Purge every cleanup-enabled store regardless of interval gating.
    /// Returns total rows deleted.
    pub async fn run_once(&self) -> Result<u64> {
        let mut total = 0u64;
        for handle in self.provider.stores().await {
            if !handle.options().enable_automatic_cleanup {
                continue;
            }
            let counts = purge_terminal_rows(handle.pool(), handle.options()).await?;
            if counts.total() > 0 {
                tracing::info!(
                    event = "conveyor.cleanup.purged",
                    store = %handle.key(),
                    outbox = counts.outbox,
                    inbox = counts.inbox,
                    timers = counts.timers,
                    job_runs = counts.job_runs,
                    "purged terminal rows"
                );
            }
            total += counts.total();
        }
        Ok(total)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            for handle in self.provider.stores().await {
                if !handle.options().enable_automatic_cleanup {
                    continue;
                }

                let due = {
                    let last_run = self.last_run.lock().expect("cleanup state poisoned");
                    match last_run.get(handle.key()) {
                        Some(at) => at.elapsed() >= handle.options().cleanup_interval,
                        None => true,
                    }
                };
                if !due {
                    continue;
                }

                match purge_terminal_rows(handle.pool(), handle.options()).await {
                    Ok(counts) => {
                        if counts.total() > 0 {
                            tracing::info!(
                                event = "conveyor.cleanup.purged",
                                store = %handle.key(),
                                total = counts.total(),
                                "purged terminal rows"
                            );
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            event = "conveyor.cleanup.purge_error",
                            store = %handle.key(),
                            error = %err,
                            "cleanup pass failed"
                        );
                    }
                }

                let mut last_run = self.last_run.lock().expect("cleanup state poisoned");
                last_run.insert(handle.key().to_string(), Instant::now());
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}
