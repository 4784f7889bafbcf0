//! Shared contracts for the Conveyor messaging core.
//!
//! This crate defines the cross-crate vocabulary used by the stores and
//! dispatchers: the error taxonomy, work-item status codes, the handler
//! contract and its registry, backoff policies, the clock abstraction, and
//! per-store configuration options.
//!
//! # API notes
//! `conveyor-core` is an internal crate (`publish = false`). Its public API
//! uses a few third-party types (`uuid::Uuid`, `chrono::DateTime<Utc>`,
//! `serde_json::Value`) as part of the Conveyor contract.

pub mod backoff;
pub mod clock;
pub mod error;
pub mod handler;
pub mod options;
pub mod status;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use handler::{Delivery, Handler, HandlerRegistry, Outcome};
pub use options::StoreOptions;
pub use status::{InboxStatus, WorkStatus};
