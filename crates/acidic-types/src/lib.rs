//! Shared data model for acidic workflow runs.
//!
//! This crate contains the persisted shapes the engine reads back after
//! arbitrary downtime: idempotency keys, serialized job envelopes, the
//! frozen workflow graph, run records, and the storage/queue error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror, indexmap.

pub mod config;
pub mod error;
pub mod job;
pub mod run;
pub mod workflow;
