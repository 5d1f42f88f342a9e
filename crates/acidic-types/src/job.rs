//! Job identity types: idempotency keys and the serialized job envelope.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// IdempotencyKey
// ---------------------------------------------------------------------------

/// Opaque string identifying one logical workflow instance.
///
/// Two invocations carrying the same key attach to the same run record,
/// which is what makes redundant deliveries idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for IdempotencyKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// SerializedJob
// ---------------------------------------------------------------------------

/// Opaque, reconstructible payload for one job invocation.
///
/// Stored on the run record so the job can be handed back to the queue
/// (reenqueue after an awaited job finishes) without the original process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedJob {
    /// Registered job class name.
    pub job_class: String,
    /// Queue-level runtime identifier.
    pub job_id: String,
    /// Positional job arguments.
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl SerializedJob {
    pub fn new(job_class: impl Into<String>, job_id: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            job_class: job_class.into(),
            job_id: job_id.into(),
            arguments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_idempotency_key_serializes_as_plain_string() {
        let key = IdempotencyKey::new("job-123");
        assert_eq!(serde_json::to_value(&key).unwrap(), json!("job-123"));
        assert_eq!(key.to_string(), "job-123");
    }

    #[test]
    fn test_serialized_job_defaults_arguments() {
        let job: SerializedJob =
            serde_json::from_value(json!({"job_class": "ChargeJob", "job_id": "abc"})).unwrap();
        assert!(job.arguments.is_empty());
        assert_eq!(job.job_class, "ChargeJob");
    }
}
