//! Idempotency key derivation.
//!
//! Each job class picks one strategy at registration time. Derivation is a
//! pure function of the job descriptor: the same inputs produce a
//! byte-identical key across calls, retries, and process restarts.
//!
//! # Argument hashing
//!
//! `IdempotencyStrategy::Arguments` hashes a canonical JSON rendering of
//! `[job_class, arguments]`. Canonical means object keys are sorted at every
//! depth and no insignificant whitespace is emitted, so two argument lists
//! that differ only in map key order produce the same key. Array order is
//! positional and therefore significant.

use std::fmt::Write as _;
use std::sync::Arc;

use acidic_types::job::IdempotencyKey;
use serde_json::Value;

use crate::hash::ContentHasher;

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// How a job class derives its idempotency key.
#[derive(Debug, Clone, Copy, Default)]
pub enum IdempotencyStrategy {
    /// The queue-level runtime identifier.
    #[default]
    JobId,
    /// A caller-declared logical identifier (`JobDescriptor::identifier`).
    /// Falls back to the job id when the job declares none.
    Identifier,
    /// Hash of the job class and canonicalized arguments.
    Arguments,
    /// Job-supplied derivation.
    Custom(fn(&JobDescriptor) -> String),
}

/// The inputs key derivation may look at.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    pub job_class: String,
    pub job_id: String,
    pub identifier: Option<String>,
    pub arguments: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Derives idempotency keys from job descriptors.
pub struct IdempotencyKeyGenerator {
    hasher: Arc<dyn ContentHasher>,
}

impl IdempotencyKeyGenerator {
    pub fn new(hasher: Arc<dyn ContentHasher>) -> Self {
        Self { hasher }
    }

    /// Derive the key for `job` under `strategy`.
    ///
    /// Never fails: no registered strategy means `JobId`.
    pub fn derive(&self, job: &JobDescriptor, strategy: Option<IdempotencyStrategy>) -> IdempotencyKey {
        match strategy.unwrap_or_default() {
            IdempotencyStrategy::JobId => IdempotencyKey::new(job.job_id.as_str()),
            IdempotencyStrategy::Identifier => match &job.identifier {
                Some(identifier) => IdempotencyKey::new(identifier.as_str()),
                None => {
                    tracing::debug!(
                        job_class = job.job_class.as_str(),
                        "no logical identifier declared, keying by job id"
                    );
                    IdempotencyKey::new(job.job_id.as_str())
                }
            },
            IdempotencyStrategy::Arguments => {
                let content = canonical_json(&Value::Array(vec![
                    Value::String(job.job_class.clone()),
                    Value::Array(job.arguments.clone()),
                ]));
                IdempotencyKey::new(self.hasher.compute_hash(&content))
            }
            IdempotencyStrategy::Custom(derive) => IdempotencyKey::new(derive(job)),
        }
    }
}

// ---------------------------------------------------------------------------
// Canonical JSON
// ---------------------------------------------------------------------------

/// Render `value` as compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        // Null, Bool and Number have a single compact rendering.
        other => {
            let _ = write!(out, "{other}");
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // Serializing a &str cannot fail.
    let _ = write!(out, "{}", Value::String(s.to_string()));
}
