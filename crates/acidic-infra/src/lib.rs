//! Infrastructure layer for acidic jobs.
//!
//! Contains implementations of the ports defined in `acidic-core`: the
//! SQLite run store, SHA-256 content hashing for argument-derived
//! idempotency keys, and the `acidic.toml` configuration loader.

pub mod config;
pub mod crypto;
pub mod sqlite;
