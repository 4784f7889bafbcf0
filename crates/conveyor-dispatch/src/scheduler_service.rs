use crate::outbox_dispatcher::DispatcherOptions;
use conveyor_core::{
    BackoffPolicy, Delivery, Error, ExponentialBackoff, HandlerRegistry, Outcome, Result,
};
use conveyor_store::{lease::LeaseStore, JobRunWork, SchedulerStore, TimerMessage};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use uuid::Uuid;

const MATERIALIZE_LEASE_RESOURCE: &str = "scheduler:materialize";

/// Cron materialization plus timer and job-run dispatch for one database.
///
/// Materialization runs under a singleton lease so exactly one materializer
/// per database advances job cursors at a time; timers and job-runs then
/// flow through the shared work-queue protocol like any other work.
pub struct SchedulerService {
    store: SchedulerStore,
    lease: LeaseStore,
    registry: Arc<HandlerRegistry>,
    backoff: Arc<dyn BackoffPolicy>,
    options: DispatcherOptions,
    materialize_lease: Duration,
}

impl SchedulerService {
    pub fn new(
        store: SchedulerStore,
        lease: LeaseStore,
        registry: Arc<HandlerRegistry>,
        options: DispatcherOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            store,
            lease,
            registry,
            backoff: Arc::new(ExponentialBackoff::default()),
            options,
            materialize_lease: Duration::from_secs(60),
        })
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &SchedulerStore {
        &self.store
    }

    /// One materialization pass under the scheduler lease. Returns the
    /// number of job-runs created; zero when another materializer holds the
    /// lease.
    pub async fn materialize_once(&self) -> Result<u32> {
        let Some(lease) = self
            .lease
            .acquire(MATERIALIZE_LEASE_RESOURCE, self.materialize_lease, None, None)
            .await?
        else {
            return Ok(0);
        };

        let result = async {
            self.store.bump_fencing_token().await?;
            self.store.materialize_due_jobs().await
        }
        .await;

        let _ = self
            .lease
            .release(&lease.resource_name, lease.owner_token)
            .await;

        result
    }

    /// Claim and dispatch due job-runs. Each run resolves its parent job's
    /// topic to a handler.
    pub async fn run_job_runs_once(&self, batch_size: i64) -> Result<usize> {
        let owner = Uuid::new_v4();
        let runs = self
            .store
            .claim_due_job_runs(owner, self.options.claim_lease, batch_size)
            .await?;

        let mut processed = 0usize;
        for run in runs {
            self.dispatch_job_run(owner, run).await;
            processed += 1;
        }
        Ok(processed)
    }

    async fn dispatch_job_run(&self, owner: Uuid, run: JobRunWork) {
        let attempt = (run.retry_count.max(0) as u32) + 1;

        let Some(handler) = self.registry.resolve(&run.topic) else {
            let error = format!("No handler registered for topic '{}'", run.topic);
            tracing::warn!(
                event = "conveyor.scheduler.job_run.no_handler",
                job = %run.job_name,
                topic = %run.topic,
                "no handler; failing job run"
            );
            if let Err(err) = self.store.fail_job_run(owner, run.run_id, &error).await {
                tracing::warn!(
                    event = "conveyor.scheduler.job_run.fail_error",
                    error = %err,
                    "failed to mark job run failed"
                );
            }
            return;
        };

        let delivery = Delivery {
            message_id: run.run_id.to_string(),
            topic: run.topic.clone(),
            payload: run.payload.clone().unwrap_or_default(),
            correlation_id: Some(run.job_name.clone()),
            attempt,
        };

        let step = match handler.handle(&delivery).await {
            Ok(Outcome::Done) => self
                .store
                .complete_job_run(owner, run.run_id, None)
                .await
                .map(|_| "done"),
            Ok(Outcome::Retry { reason, delay }) => {
                self.retry_or_fail_run(owner, &run, attempt, &reason, delay)
                    .await
            }
            Err(err) => {
                let reason = format!("{err:#}");
                self.retry_or_fail_run(owner, &run, attempt, &reason, None)
                    .await
            }
        };

        if let Err(err) = step {
            tracing::warn!(
                event = "conveyor.scheduler.job_run.transition_error",
                job = %run.job_name,
                error = %err,
                "state transition failed; run will be reaped after its lease expires"
            );
        }
    }

    async fn retry_or_fail_run(
        &self,
        owner: Uuid,
        run: &JobRunWork,
        attempt: u32,
        reason: &str,
        delay: Option<Duration>,
    ) -> Result<&'static str> {
        if attempt >= self.options.max_attempts {
            tracing::warn!(
                event = "conveyor.scheduler.job_run.failed",
                job = %run.job_name,
                attempt,
                error = %reason,
                "attempts exhausted; failing job run"
            );
            self.store.fail_job_run(owner, run.run_id, reason).await?;
            return Ok("failed");
        }

        let delay = delay.unwrap_or_else(|| self.backoff.delay_for_attempt(attempt));
        self.store
            .retry_job_run(owner, run.run_id, delay, reason)
            .await?;
        Ok("rescheduled")
    }

    /// Claim and dispatch due one-shot timers.
    pub async fn run_timers_once(&self, batch_size: i64) -> Result<usize> {
        let owner = Uuid::new_v4();
        let timers = self
            .store
            .claim_due_timers(owner, self.options.claim_lease, batch_size)
            .await?;

        let mut processed = 0usize;
        for timer in timers {
            self.dispatch_timer(owner, timer).await;
            processed += 1;
        }
        Ok(processed)
    }

    async fn dispatch_timer(&self, owner: Uuid, timer: TimerMessage) {
        let attempt = (timer.retry_count.max(0) as u32) + 1;

        let Some(handler) = self.registry.resolve(&timer.topic) else {
            let error = format!("No handler registered for topic '{}'", timer.topic);
            tracing::warn!(
                event = "conveyor.scheduler.timer.no_handler",
                topic = %timer.topic,
                timer_id = %timer.id,
                "no handler; failing timer"
            );
            if let Err(err) = self.store.fail_timer(owner, timer.id, &error).await {
                tracing::warn!(
                    event = "conveyor.scheduler.timer.fail_error",
                    error = %err,
                    "failed to mark timer failed"
                );
            }
            return;
        };

        let delivery = Delivery {
            message_id: timer.id.to_string(),
            topic: timer.topic.clone(),
            payload: timer.payload.clone(),
            correlation_id: timer.correlation_id.clone(),
            attempt,
        };

        let step = match handler.handle(&delivery).await {
            Ok(Outcome::Done) => self
                .store
                .complete_timer(owner, timer.id)
                .await
                .map(|_| "done"),
            Ok(Outcome::Retry { reason, delay }) => {
                self.retry_or_fail_timer(owner, &timer, attempt, &reason, delay)
                    .await
            }
            Err(err) => {
                let reason = format!("{err:#}");
                self.retry_or_fail_timer(owner, &timer, attempt, &reason, None)
                    .await
            }
        };

        if let Err(err) = step {
            tracing::warn!(
                event = "conveyor.scheduler.timer.transition_error",
                timer_id = %timer.id,
                error = %err,
                "state transition failed; timer will be reaped after its lease expires"
            );
        }
    }

    async fn retry_or_fail_timer(
        &self,
        owner: Uuid,
        timer: &TimerMessage,
        attempt: u32,
        reason: &str,
        delay: Option<Duration>,
    ) -> Result<&'static str> {
        if attempt >= self.options.max_attempts {
            tracing::warn!(
                event = "conveyor.scheduler.timer.failed",
                timer_id = %timer.id,
                attempt,
                error = %reason,
                "attempts exhausted; failing timer"
            );
            self.store.fail_timer(owner, timer.id, reason).await?;
            return Ok("failed");
        }

        let delay = delay.unwrap_or_else(|| self.backoff.delay_for_attempt(attempt));
        self.store
            .retry_timer(owner, timer.id, delay, reason)
            .await?;
        Ok("rescheduled")
    }

    /// Materialize, dispatch, and reap until shutdown. Iteration errors are
    /// logged and do not stop the loop.
    pub async fn run(&self, batch_size: i64, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let mut worked = 0usize;
            match self.materialize_once().await {
                Ok(n) => worked += n as usize,
                Err(err) => log_iteration_error("materialize", &err),
            }
            match self.run_job_runs_once(batch_size).await {
                Ok(n) => worked += n,
                Err(err) => log_iteration_error("job_runs", &err),
            }
            match self.run_timers_once(batch_size).await {
                Ok(n) => worked += n,
                Err(err) => log_iteration_error("timers", &err),
            }
            if let Err(err) = self.store.reap_expired().await {
                log_iteration_error("reap", &err);
            }

            if worked == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.idle_sleep) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

fn log_iteration_error(stage: &str, err: &Error) {
    tracing::warn!(
        event = "conveyor.scheduler.iteration_error",
        stage,
        error = %err,
        "scheduler iteration stage failed"
    );
}
