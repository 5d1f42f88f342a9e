//! Business logic and port definitions for acidic workflows.
//!
//! This crate defines the "ports" (repository, queue, hashing traits) that
//! the infrastructure layer implements, plus the workflow engine itself. It
//! depends only on `acidic-types` -- never on `acidic-infra` or any
//! database/IO crate.

pub mod hash;
pub mod idempotency;
pub mod job;
pub mod queue;
pub mod repository;
pub mod workflow;
