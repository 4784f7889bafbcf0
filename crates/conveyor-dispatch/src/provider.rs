use anyhow::Context;
use async_trait::async_trait;
use conveyor_core::{Result, StoreOptions};
use conveyor_store::{
    lease::LeaseStore, schema::ensure_schema, InboxStore, OutboxStore, ShardSource,
};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;

/// Everything a dispatcher needs for one database: the pool, the store
/// facades, and the read-only options bundle (which the cleanup service
/// consumes instead of reaching into store internals).
pub struct StoreHandle {
    key: String,
    options: StoreOptions,
    pool: PgPool,
    outbox: OutboxStore,
    inbox: InboxStore,
    lease: LeaseStore,
}

impl StoreHandle {
    pub async fn connect(key: impl Into<String>, options: StoreOptions) -> Result<Arc<Self>> {
        options.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&options.connection_string)
            .await
            .context("connect store database")?;
        Ok(Self::from_pool(key, options, pool))
    }

    pub fn from_pool(key: impl Into<String>, options: StoreOptions, pool: PgPool) -> Arc<Self> {
        let outbox = OutboxStore::new(pool.clone(), &options);
        let inbox = InboxStore::new(pool.clone(), &options);
        let lease = LeaseStore::new(pool.clone(), &options.schema_name);
        Arc::new(Self {
            key: key.into(),
            options,
            pool,
            outbox,
            inbox,
            lease,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn outbox(&self) -> &OutboxStore {
        &self.outbox
    }

    pub fn inbox(&self) -> &InboxStore {
        &self.inbox
    }

    pub fn lease(&self) -> &LeaseStore {
        &self.lease
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        ensure_schema(&self.pool, &self.options).await
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("key", &self.key)
            .field("schema", &self.options.schema_name)
            .field("table", &self.options.table_name)
            .finish()
    }
}

/// Source of per-database stores for the multi-store dispatchers.
///
/// `stores` returns the currently-live snapshot, ordered by key so selection
/// strategies see a stable rotation.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    async fn stores(&self) -> Vec<Arc<StoreHandle>>;

    async fn store_by_key(&self, key: &str) -> Option<Arc<StoreHandle>> {
        self.stores().await.into_iter().find(|s| s.key() == key)
    }
}

/// A provider doubles as a fan-out shard source: one shard per store key.
pub struct ProviderShardSource {
    provider: Arc<dyn StoreProvider>,
}

impl ProviderShardSource {
    pub fn new(provider: Arc<dyn StoreProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ShardSource for ProviderShardSource {
    async fn shard_keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .provider
            .stores()
            .await
            .iter()
            .map(|s| s.key().to_string())
            .collect())
    }
}

/// Static provider built from a configured list of databases at startup.
pub struct ConfiguredStoreProvider {
    handles: Vec<Arc<StoreHandle>>,
}

impl ConfiguredStoreProvider {
    pub async fn connect(entries: Vec<(String, StoreOptions)>) -> Result<Self> {
        let mut handles = Vec::with_capacity(entries.len());
        for (key, options) in entries {
            handles.push(StoreHandle::connect(key, options).await?);
        }
        handles.sort_by(|a, b| a.key().cmp(b.key()));
        Ok(Self { handles })
    }

    pub fn from_handles(mut handles: Vec<Arc<StoreHandle>>) -> Self {
        handles.sort_by(|a, b| a.key().cmp(b.key()));
        Self { handles }
    }

    /// Ensure schemas sequentially, logging-and-continuing on failure so one
    /// bad tenant cannot block startup; the store stays registered and will
    /// surface the problem on first use.
    pub async fn initialize(&self) -> Result<()> {
        for handle in &self.handles {
            if !handle.options().enable_schema_deployment {
                continue;
            }
            if let Err(err) = handle.ensure_schema().await {
                tracing::error!(
                    event = "conveyor.provider.configured.deploy_failed",
                    store = %handle.key(),
                    error = %err,
                    "schema deployment failed; keeping store"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StoreProvider for ConfiguredStoreProvider {
    async fn stores(&self) -> Vec<Arc<StoreHandle>> {
        self.handles.clone()
    }
}

/// Discovery source for the dynamic provider: returns the full desired set
/// of `(key, options)` pairs on each call.
#[async_trait]
pub trait StoreDiscovery: Send + Sync {
    async fn discover(&self) -> anyhow::Result<Vec<(String, StoreOptions)>>;
}

struct DynamicState {
    handles: HashMap<String, Arc<StoreHandle>>,
    last_refresh: Option<Instant>,
}

/// Provider that reconciles against a discovery source on a refresh
/// interval: new identifiers gain stores, changed options replace stores,
/// vanished identifiers are dropped.
///
/// The snapshot mutex is held only around in-memory reads and the final
/// swap; connection and schema deployment happen outside any lock, and a
/// tokio mutex serializes concurrent refreshes.
pub struct DynamicStoreProvider {
    discovery: Arc<dyn StoreDiscovery>,
    refresh_interval: Duration,
    state: Mutex<DynamicState>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl DynamicStoreProvider {
    pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

    pub fn new(discovery: Arc<dyn StoreDiscovery>, refresh_interval: Duration) -> Self {
        Self {
            discovery,
            refresh_interval,
            state: Mutex::new(DynamicState {
                handles: HashMap::new(),
                last_refresh: None,
            }),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn snapshot(&self) -> Vec<Arc<StoreHandle>> {
        let state = self.state.lock().expect("provider state poisoned");
        let mut handles: Vec<_> = state.handles.values().cloned().collect();
        handles.sort_by(|a, b| a.key().cmp(b.key()));
        handles
    }

    fn is_stale(&self) -> bool {
        let state = self.state.lock().expect("provider state poisoned");
        match state.last_refresh {
            Some(at) => at.elapsed() >= self.refresh_interval,
            None => true,
        }
    }

    /// Force a reconcile against the discovery source.
    pub async fn refresh(&self) -> Result<()> {
        let _gate = self.refresh_gate.lock().await;

        let discovered = self
            .discovery
            .discover()
            .await
            .context("discover stores")?;

        let current: HashMap<String, Arc<StoreHandle>> = {
            let state = self.state.lock().expect("provider state poisoned");
            state.handles.clone()
        };

        let mut next: HashMap<String, Arc<StoreHandle>> = HashMap::new();
        for (key, options) in discovered {
            if let Err(err) = options.validate() {
                tracing::error!(
                    event = "conveyor.provider.dynamic.invalid_options",
                    store = %key,
                    error = %err,
                    "discovered store has invalid options; skipping"
                );
                continue;
            }

            let reusable = current
                .get(&key)
                .filter(|handle| handle.options() == &options)
                .cloned();
            if let Some(handle) = reusable {
                next.insert(key, handle);
                continue;
            }

            // New or changed entry: connect and deploy outside the lock,
            // log-and-continue on deployment failure.
            match StoreHandle::connect(key.clone(), options).await {
                Ok(handle) => {
                    if handle.options().enable_schema_deployment {
                        if let Err(err) = handle.ensure_schema().await {
                            tracing::error!(
                                event = "conveyor.provider.dynamic.deploy_failed",
                                store = %key,
                                error = %err,
                                "schema deployment failed; keeping store"
                            );
                        }
                    }
                    next.insert(key, handle);
                }
                Err(err) => {
                    tracing::error!(
                        event = "conveyor.provider.dynamic.connect_failed",
                        store = %key,
                        error = %err,
                        "store connect failed; dropping from this refresh"
                    );
                }
            }
        }

        let removed: Vec<String> = current
            .keys()
            .filter(|key| !next.contains_key(*key))
            .cloned()
            .collect();
        for key in &removed {
            tracing::info!(
                event = "conveyor.provider.dynamic.removed",
                store = %key,
                "store no longer discovered; removing"
            );
        }

        let mut state = self.state.lock().expect("provider state poisoned");
        state.handles = next;
        state.last_refresh = Some(Instant::now());
        Ok(())
    }
}

#[async_trait]
impl StoreProvider for DynamicStoreProvider {
    async fn stores(&self) -> Vec<Arc<StoreHandle>> {
        if self.is_stale() {
            if let Err(err) = self.refresh().await {
                tracing::warn!(
                    event = "conveyor.provider.dynamic.refresh_failed",
                    error = %err,
                    "refresh failed; serving last snapshot"
                );
            }
        }
        self.snapshot()
    }
}
