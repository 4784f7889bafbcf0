use conveyor_core::{Error, Result};
use conveyor_store::lease::LeaseStore;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use uuid::Uuid;

pub const DEFAULT_RENEW_PERCENT: f64 = 0.6;

#[derive(Debug)]
struct RunnerState {
    next_renew_at: Instant,
    is_lost: bool,
}

/// Holds a lease and auto-renews it until released or lost.
///
/// Renewal is scheduled off `tokio::time::Instant` relative to the moment of
/// acquisition (and each successful renewal), so wall-clock jumps or pauses
/// never over- or under-renew. A failed renewal marks the runner lost, fires
/// its watch channel, and rejects further renewals; dependent loops watch
/// `lost_signal` and terminate.
pub struct LeaseRunner {
    store: LeaseStore,
    resource: String,
    owner: Uuid,
    duration: Duration,
    renew_interval: Duration,
    fencing_token: i64,
    state: Arc<Mutex<RunnerState>>,
    lost_tx: watch::Sender<bool>,
    lost_rx: watch::Receiver<bool>,
    renew_task: Option<JoinHandle<()>>,
}

impl LeaseRunner {
    /// Try to acquire `resource`; `None` when someone else holds it.
    pub async fn acquire(
        store: LeaseStore,
        resource: impl Into<String>,
        duration: Duration,
        renew_percent: f64,
    ) -> Result<Option<Self>> {
        let resource = resource.into();
        let Some(lease) = store.acquire(&resource, duration, None, None).await? else {
            return Ok(None);
        };

        let renew_interval = duration.mul_f64(renew_percent.clamp(0.05, 0.95));
        let state = Arc::new(Mutex::new(RunnerState {
            next_renew_at: Instant::now() + renew_interval,
            is_lost: false,
        }));
        let (lost_tx, lost_rx) = watch::channel(false);

        let renew_task = tokio::spawn(renew_loop(
            store.clone(),
            resource.clone(),
            lease.owner_token,
            duration,
            renew_interval,
            state.clone(),
            lost_tx.clone(),
        ));

        Ok(Some(Self {
            store,
            resource,
            owner: lease.owner_token,
            duration,
            renew_interval,
            fencing_token: lease.fencing_token,
            state,
            lost_tx,
            lost_rx,
            renew_task: Some(renew_task),
        }))
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn owner_token(&self) -> Uuid {
        self.owner
    }

    pub fn fencing_token(&self) -> i64 {
        self.fencing_token
    }

    pub fn is_lost(&self) -> bool {
        self.state.lock().expect("runner state poisoned").is_lost
    }

    pub fn ensure_held(&self) -> Result<()> {
        if self.is_lost() {
            return Err(Error::LeaseLost {
                resource: self.resource.clone(),
            });
        }
        Ok(())
    }

    /// Fires once when the lease is lost.
    pub fn lost_signal(&self) -> watch::Receiver<bool> {
        self.lost_rx.clone()
    }

    /// Renew out of band. An invocation arriving before the scheduled
    /// renewal extends the lease but does not advance the renewal schedule,
    /// so immediate duplicates collapse into the normal cadence.
    pub async fn renew_now(&self) -> Result<()> {
        self.ensure_held()?;

        let outcome = self
            .store
            .renew(&self.resource, self.owner, self.duration)
            .await?;

        let mut state = self.state.lock().expect("runner state poisoned");
        if !outcome.renewed {
            mark_lost(&mut state, &self.lost_tx, &self.resource);
            return Err(Error::LeaseLost {
                resource: self.resource.clone(),
            });
        }

        let now = Instant::now();
        if now >= state.next_renew_at {
            state.next_renew_at = now + self.renew_interval;
        }
        Ok(())
    }

    /// Stop renewing and expire the lease in place so peers observe it
    /// immediately.
    pub async fn release(mut self) -> Result<()> {
        if let Some(task) = self.renew_task.take() {
            task.abort();
        }
        if !self.is_lost() {
            self.store.release(&self.resource, self.owner).await?;
        }
        Ok(())
    }
}

impl Drop for LeaseRunner {
    fn drop(&mut self) {
        if let Some(task) = self.renew_task.take() {
            task.abort();
        }
    }
}

fn mark_lost(state: &mut RunnerState, lost_tx: &watch::Sender<bool>, resource: &str) {
    if !state.is_lost {
        state.is_lost = true;
        let _ = lost_tx.send(true);
        tracing::warn!(
            event = "conveyor.lease_runner.lost",
            resource = %resource,
            "lease lost; rejecting further renewals"
        );
    }
}

async fn renew_loop(
    store: LeaseStore,
    resource: String,
    owner: Uuid,
    duration: Duration,
    renew_interval: Duration,
    state: Arc<Mutex<RunnerState>>,
    lost_tx: watch::Sender<bool>,
) {
    loop {
        let deadline = {
            let state = state.lock().expect("runner state poisoned");
            if state.is_lost {
                return;
            }
            state.next_renew_at
        };
        tokio::time::sleep_until(deadline).await;

        match store.renew(&resource, owner, duration).await {
            Ok(outcome) if outcome.renewed => {
                let mut state = state.lock().expect("runner state poisoned");
                state.next_renew_at = Instant::now() + renew_interval;
            }
            Ok(_) => {
                let mut state = state.lock().expect("runner state poisoned");
                mark_lost(&mut state, &lost_tx, &resource);
                return;
            }
            Err(err) => {
                // A renewal the database never confirmed cannot be assumed
                // held; treat it as lost rather than risk split ownership.
                tracing::warn!(
                    event = "conveyor.lease_runner.renew_error",
                    resource = %resource,
                    error = %err,
                    "renewal errored"
                );
                let mut state = state.lock().expect("runner state poisoned");
                mark_lost(&mut state, &lost_tx, &resource);
                return;
            }
        }
    }
}
