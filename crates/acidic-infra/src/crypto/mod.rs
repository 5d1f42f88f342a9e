//! Cryptographic operations for acidic jobs.
//!
//! - `hash`: SHA-256 content hashing for argument-derived idempotency keys

pub mod hash;
