//! Repository trait definitions for run persistence.
//!
//! The infrastructure layer (acidic-infra) implements these traits with
//! SQLite; `memory` provides an in-process implementation for tests and
//! single-process embedding.

pub mod memory;
pub mod run;
