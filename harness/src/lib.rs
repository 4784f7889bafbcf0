//! Conveyor operational harness.
//!
//! Wires the store and dispatch crates into runnable services (schema
//! ensure, dispatchers, scheduler, fan-out, cleanup) and hosts the
//! end-to-end integration suite in `tests/invariants.rs`.

pub mod config;
pub mod handlers;
pub mod services;
