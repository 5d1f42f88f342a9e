//! Observability setup for acidic jobs.
//!
//! Workflow code only emits `tracing` events and spans (`acidic.process`
//! per execution, `acidic.step` per action). This crate installs the
//! subscriber that renders them.

pub mod tracing_setup;

pub use tracing_setup::{init_from_config, init_tracing, shutdown_tracing};
