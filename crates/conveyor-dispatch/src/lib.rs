//! Multi-store orchestration for the Conveyor messaging core.
//!
//! Store providers own the lifecycle of per-database stores; dispatchers
//! claim and route work across them under round-robin or drain-first
//! selection, optionally gated by per-store leases. The scheduler service
//! materializes cron jobs and drives timers and job-runs through the same
//! work-queue protocol; the fan-out coordinator emits per-slice outbox
//! messages under a singleton lease; the join-wait handler closes the
//! fan-in loop.

pub mod cleanup_service;
pub mod coordinator;
pub mod inbox_dispatcher;
pub mod join_wait;
pub mod lease_runner;
pub mod outbox_dispatcher;
pub mod provider;
pub mod scheduler_service;
pub mod strategy;

pub use cleanup_service::CleanupService;
pub use coordinator::FanoutCoordinator;
pub use inbox_dispatcher::InboxDispatcher;
pub use join_wait::{JoinWaitHandler, JoinWaitPayload, SliceCompletionHandler};
pub use lease_runner::LeaseRunner;
pub use outbox_dispatcher::{DispatcherOptions, OutboxDispatcher};
pub use provider::{
    ConfiguredStoreProvider, DynamicStoreProvider, ProviderShardSource, StoreDiscovery,
    StoreHandle, StoreProvider,
};
pub use scheduler_service::SchedulerService;
pub use strategy::{SelectionStrategy, StoreSelector};
