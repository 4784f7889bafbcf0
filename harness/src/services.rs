use crate::{config::HarnessConfig, handlers::LoggingHandler};
use anyhow::Context;
use conveyor_core::{HandlerRegistry, SystemClock};
use conveyor_dispatch::{
    CleanupService, ConfiguredStoreProvider, FanoutCoordinator, InboxDispatcher,
    JoinWaitHandler, OutboxDispatcher, ProviderShardSource, SchedulerService,
    SliceCompletionHandler, StoreHandle, StoreProvider,
};
use conveyor_store::{
    FanoutPlanner, FanoutStore, JoinStore, NewMessage, SchedulerStore,
};
use std::sync::Arc;
use tokio::sync::watch;

async fn connect_provider(cfg: &HarnessConfig) -> anyhow::Result<Arc<ConfiguredStoreProvider>> {
    let entries = cfg.store_entries()?;
    let provider = ConfiguredStoreProvider::connect(entries)
        .await
        .context("connect stores")?;
    provider.initialize().await.context("initialize stores")?;
    Ok(Arc::new(provider))
}

async fn primary_store(provider: &Arc<ConfiguredStoreProvider>) -> anyhow::Result<Arc<StoreHandle>> {
    provider
        .stores()
        .await
        .into_iter()
        .next()
        .context("no stores configured")
}

fn build_registry(
    cfg: &HarnessConfig,
    primary: &Arc<StoreHandle>,
) -> anyhow::Result<Arc<HandlerRegistry>> {
    let mut registry = HandlerRegistry::new();
    for topic in cfg.log_topic_list() {
        registry.register(Arc::new(LoggingHandler::new(topic)))?;
    }

    let joins = JoinStore::new(primary.pool().clone(), &cfg.schema_name);
    registry.register(Arc::new(JoinWaitHandler::new(
        joins,
        primary.outbox().clone(),
    )))?;

    let fanout = FanoutStore::new(primary.pool().clone(), &cfg.schema_name);
    registry.register(Arc::new(SliceCompletionHandler::new(fanout)))?;

    Ok(Arc::new(registry))
}

pub async fn ensure_schema(cfg: &HarnessConfig) -> anyhow::Result<()> {
    for (key, options) in cfg.store_entries()? {
        let handle = StoreHandle::connect(key.clone(), options).await?;
        handle.ensure_schema().await?;
        tracing::info!(event = "harness.schema.ensured", store = %key, "schema ensured");
    }
    Ok(())
}

pub async fn run_outbox_dispatcher(cfg: &HarnessConfig) -> anyhow::Result<()> {
    let provider = connect_provider(cfg).await?;
    let primary = primary_store(&provider).await?;
    let registry = build_registry(cfg, &primary)?;

    let dispatcher = OutboxDispatcher::new(
        provider.clone(),
        registry,
        cfg.selection_strategy()?,
        cfg.dispatcher_options(),
    )?;

    tracing::info!(
        event = "harness.outbox_dispatcher.started",
        batch_size = cfg.batch_size,
        strategy = %cfg.strategy,
        "outbox dispatcher started"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(event = "harness.outbox_dispatcher.shutdown", "shutting down");
            let _ = shutdown_tx.send(true);
        }
        _ = dispatcher.run(cfg.batch_size, shutdown_rx.clone()) => {}
    }
    Ok(())
}

pub async fn run_inbox_dispatcher(cfg: &HarnessConfig) -> anyhow::Result<()> {
    let provider = connect_provider(cfg).await?;
    let primary = primary_store(&provider).await?;
    let registry = build_registry(cfg, &primary)?;

    let dispatcher = InboxDispatcher::new(
        provider.clone(),
        registry,
        cfg.selection_strategy()?,
        cfg.dispatcher_options(),
    )?;

    tracing::info!(
        event = "harness.inbox_dispatcher.started",
        batch_size = cfg.batch_size,
        "inbox dispatcher started"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(event = "harness.inbox_dispatcher.shutdown", "shutting down");
            let _ = shutdown_tx.send(true);
        }
        _ = dispatcher.run(cfg.batch_size, shutdown_rx.clone()) => {}
    }
    Ok(())
}

pub async fn run_scheduler(cfg: &HarnessConfig) -> anyhow::Result<()> {
    let provider = connect_provider(cfg).await?;
    let primary = primary_store(&provider).await?;
    let registry = build_registry(cfg, &primary)?;

    let store = SchedulerStore::new(
        primary.pool().clone(),
        &cfg.schema_name,
        Arc::new(SystemClock),
    );
    let service = SchedulerService::new(
        store,
        primary.lease().clone(),
        registry,
        cfg.dispatcher_options(),
    )?;

    tracing::info!(event = "harness.scheduler.started", "scheduler started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(event = "harness.scheduler.shutdown", "shutting down");
            let _ = shutdown_tx.send(true);
        }
        _ = service.run(cfg.batch_size, shutdown_rx.clone()) => {}
    }
    Ok(())
}

/// One fan-out pass for a topic; prints the number of emitted slices.
pub async fn run_fanout(
    cfg: &HarnessConfig,
    topic: &str,
    work_key: Option<&str>,
) -> anyhow::Result<()> {
    let provider = connect_provider(cfg).await?;
    let primary = primary_store(&provider).await?;

    let fanout = FanoutStore::new(primary.pool().clone(), &cfg.schema_name);
    let provider_dyn: Arc<dyn StoreProvider> = provider.clone();
    let shards = Arc::new(ProviderShardSource::new(provider_dyn));
    let planner = FanoutPlanner::new(fanout, shards, Arc::new(SystemClock));
    let coordinator = FanoutCoordinator::new(
        planner,
        primary.lease().clone(),
        primary.outbox().clone(),
        Arc::new(SystemClock),
    );

    let emitted = coordinator.run(topic, work_key).await?;
    println!("{}", serde_json::json!({ "topic": topic, "emitted": emitted }));
    Ok(())
}

pub async fn run_cleanup(cfg: &HarnessConfig) -> anyhow::Result<()> {
    let provider = connect_provider(cfg).await?;
    let provider_dyn: Arc<dyn StoreProvider> = provider.clone();
    let service = CleanupService::new(provider_dyn);

    tracing::info!(event = "harness.cleanup.started", "cleanup service started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(event = "harness.cleanup.shutdown", "shutting down");
            let _ = shutdown_tx.send(true);
        }
        _ = service.run(shutdown_rx.clone()) => {}
    }
    Ok(())
}

pub async fn print_status(cfg: &HarnessConfig) -> anyhow::Result<()> {
    let provider = connect_provider(cfg).await?;

    let mut out = Vec::new();
    for handle in provider.stores().await {
        out.push(serde_json::json!({
            "store": handle.key(),
            "outbox_pending": handle.outbox().pending_count().await?,
            "outbox_in_flight": handle.outbox().in_flight_count().await?,
            "inbox_pending": handle.inbox().pending_count().await?,
        }));
    }
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

pub async fn enqueue(cfg: &HarnessConfig, topic: &str, payload: &str) -> anyhow::Result<()> {
    let provider = connect_provider(cfg).await?;
    let primary = primary_store(&provider).await?;

    let enqueued = primary
        .outbox()
        .enqueue(NewMessage::new(topic, payload))
        .await?;
    println!(
        "{}",
        serde_json::json!({ "id": enqueued.id, "message_id": enqueued.message_id })
    );
    Ok(())
}
