//! PostgreSQL stores for the Conveyor messaging core.
//!
//! Every work-bearing table (outbox, timers, job-runs) shares the
//! claim/ack/abandon/fail/reap protocol in [`workqueue`]; the inbox applies
//! the same protocol over its `(message_id, source)` composite key. The
//! remaining modules cover leases, the scheduler, fan-out policies and
//! cursors, the join store, retention cleanup, and the idempotent schema
//! ensure.
//!
//! All statements are runtime-bound; schema and table names come from
//! validated [`conveyor_core::StoreOptions`] identifiers and are interpolated
//! as quoted identifiers.

pub mod cleanup;
pub mod fanout;
pub mod inbox;
pub mod join;
pub mod lease;
pub mod outbox;
pub mod schema;
pub mod scheduler;
pub mod workqueue;

pub use fanout::{FanoutCursor, FanoutPlanner, FanoutPolicy, FanoutSlice, FanoutStore, ShardSource};
pub use inbox::{InboxMessage, InboxStore};
pub use join::{Join, JoinStatus, JoinStore};
pub use lease::{Lease, LeaseStore, RenewOutcome};
pub use outbox::{Enqueued, NewMessage, OutboxMessage, OutboxStore};
pub use scheduler::{Job, JobRunWork, SchedulerStore, TimerMessage};
pub use workqueue::WorkTable;
