//! Run record: the persisted, authoritative state of one workflow instance.
//!
//! A run record is both the durable cursor ("how far did this workflow get")
//! and the mutual-exclusion lock (`locked_at`). The in-memory job is
//! disposable and rebuilt from `serialized_job`; only these fields survive
//! a crash.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::job::{IdempotencyKey, SerializedJob};
use crate::workflow::{RecoveryPoint, WorkflowGraph};

// ---------------------------------------------------------------------------
// RunRecord
// ---------------------------------------------------------------------------

/// Persisted state of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// UUIDv7 primary key; the durable location awaited jobs point back to.
    pub id: Uuid,
    /// Unique per logical invocation.
    pub idempotency_key: IdempotencyKey,
    pub job_class: String,
    /// Payload sufficient to hand the job back to the queue.
    pub serialized_job: SerializedJob,
    /// Frozen graph snapshot. `None` only for a staged placeholder that the
    /// awaited job has not adopted yet.
    pub workflow: Option<WorkflowGraph>,
    /// Current cursor. `None` only for a staged placeholder.
    pub recovery_point: Option<RecoveryPoint>,
    /// Non-null while a worker owns execution. The exact timestamp doubles
    /// as the owner token: lock-guarded writes compare against it.
    pub locked_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// When a staged run was handed to the queue. Set at most once.
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
    /// Declared persisted variables and their last-known values.
    #[serde(default)]
    pub attr_accessors: BTreeMap<String, Value>,
    /// Last captured step failure.
    pub error_object: Option<StoredError>,
    /// Created ahead of being handed to the queue.
    pub staged: bool,
    /// The run suspended waiting on this one, if any.
    pub awaited_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn is_finished(&self) -> bool {
        self.recovery_point
            .as_ref()
            .is_some_and(RecoveryPoint::is_finished)
    }

    /// Whether the lock is held and younger than `timeout`.
    pub fn is_locked(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.locked_at.is_some_and(|at| now - at < timeout)
    }

    /// Whether the stored lock is exactly `lock` (`None`: unlocked).
    pub fn holds_lock(&self, lock: Option<&DateTime<Utc>>) -> bool {
        self.locked_at.as_ref() == lock
    }
}

// ---------------------------------------------------------------------------
// NewRun
// ---------------------------------------------------------------------------

/// Input to the race-safe find-or-create.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub idempotency_key: IdempotencyKey,
    pub job_class: String,
    pub serialized_job: SerializedJob,
    pub workflow: Option<WorkflowGraph>,
    /// Initial accessor values; merged only for names not yet persisted.
    pub attr_accessors: BTreeMap<String, Value>,
    pub staged: bool,
    pub awaited_by: Option<Uuid>,
}

impl NewRun {
    /// Materialize a fresh record with a new id.
    pub fn into_record(self, now: DateTime<Utc>) -> RunRecord {
        let recovery_point = self
            .workflow
            .as_ref()
            .map(WorkflowGraph::initial_recovery_point);

        RunRecord {
            id: Uuid::now_v7(),
            idempotency_key: self.idempotency_key,
            job_class: self.job_class,
            serialized_job: self.serialized_job,
            workflow: self.workflow,
            recovery_point,
            locked_at: None,
            last_run_at: None,
            enqueued_at: None,
            attr_accessors: self.attr_accessors,
            error_object: None,
            staged: self.staged,
            awaited_by: self.awaited_by,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of `create_or_attach`.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// The record as it stands after the transaction.
    pub run: RunRecord,
    /// Whether this call inserted the record.
    pub created: bool,
    /// Whether this call now owns the lock.
    pub lock_acquired: bool,
}

// ---------------------------------------------------------------------------
// StoredError
// ---------------------------------------------------------------------------

/// A captured step failure, kept on the run as a durable diagnostic trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredError {
    /// Step whose action raised, if the failure came from a step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// Top-level error message.
    pub message: String,
    /// Source chain, outermost first (excluding `message`).
    #[serde(default)]
    pub chain: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepSpec;
    use indexmap::IndexMap;
    use serde_json::json;

    fn new_run(workflow: Option<WorkflowGraph>) -> NewRun {
        NewRun {
            idempotency_key: IdempotencyKey::new("k-1"),
            job_class: "ChargeJob".to_string(),
            serialized_job: SerializedJob::new("ChargeJob", "k-1", vec![json!(1)]),
            workflow,
            attr_accessors: BTreeMap::from([("total".to_string(), json!(0))]),
            staged: false,
            awaited_by: None,
        }
    }

    #[test]
    fn test_into_record_starts_at_entry() {
        let mut steps = IndexMap::new();
        steps.insert(
            "charge".to_string(),
            StepSpec {
                action: "charge".to_string(),
                awaits: vec![],
                for_each: None,
                next: RecoveryPoint::Finished,
            },
        );
        let record = new_run(Some(WorkflowGraph::from_steps(steps))).into_record(Utc::now());
        assert_eq!(record.recovery_point, Some(RecoveryPoint::step("charge")));
        assert!(!record.is_finished());
        assert_eq!(record.attr_accessors["total"], json!(0));
        assert!(record.locked_at.is_none());
    }

    #[test]
    fn test_staged_placeholder_has_no_cursor() {
        let mut run = new_run(None);
        run.staged = true;
        let record = run.into_record(Utc::now());
        assert!(record.workflow.is_none());
        assert!(record.recovery_point.is_none());
        assert!(!record.is_finished());
    }

    #[test]
    fn test_lock_expires_after_timeout() {
        let now = Utc::now();
        let mut record = new_run(None).into_record(now);
        assert!(!record.is_locked(now, Duration::seconds(90)));

        record.locked_at = Some(now - Duration::seconds(10));
        assert!(record.is_locked(now, Duration::seconds(90)));

        record.locked_at = Some(now - Duration::seconds(120));
        assert!(!record.is_locked(now, Duration::seconds(90)));
    }

    #[test]
    fn test_holds_lock_compares_owner_token() {
        let now = Utc::now();
        let mut record = new_run(None).into_record(now);
        assert!(record.holds_lock(None));
        assert!(record.enqueued_at.is_none());

        let mine = now - Duration::seconds(200);
        let theirs = now;
        record.locked_at = Some(theirs);
        assert!(record.holds_lock(Some(&theirs)));
        assert!(!record.holds_lock(Some(&mine)));
        assert!(!record.holds_lock(None));
    }
}
