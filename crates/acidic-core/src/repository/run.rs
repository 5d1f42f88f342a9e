//! Run repository trait definition.
//!
//! Defines the storage interface for run records: race-safe find-or-create
//! with lock acquisition, forward-only cursor advancement, eager accessor
//! writes, error capture, and completion. Writes made on behalf of a lock
//! holder compare the stored `locked_at` against the holder's token, so a
//! worker whose lock was taken over cannot touch the new owner's run.

use std::future::Future;
use std::pin::Pin;

use acidic_types::error::RepositoryError;
use acidic_types::job::IdempotencyKey;
use acidic_types::run::{Attachment, NewRun, RunRecord, StoredError};
use acidic_types::workflow::RecoveryPoint;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Repository trait for run records.
///
/// Every method is its own durable point: implementations must not buffer
/// writes behind the caller's back, since a crash can land between any two
/// calls.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    /// Find-or-create the run for `new.idempotency_key` in one transaction.
    ///
    /// Exactly one record exists per key even under concurrent duplicate
    /// calls: the loser of an insert race re-reads the winner's record.
    /// The attach step is applied with [`apply_attachment`].
    fn create_or_attach(
        &self,
        new: NewRun,
        acquire_lock: bool,
        lock_timeout: Duration,
    ) -> impl Future<Output = Result<Attachment, RepositoryError>> + Send;

    /// Look up a run by its idempotency key.
    fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> impl Future<Output = Result<Option<RunRecord>, RepositoryError>> + Send;

    /// Look up a run by its id.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Option<RunRecord>, RepositoryError>> + Send;

    /// Move the cursor from `from` to `to` on behalf of the holder of `lock`.
    ///
    /// Fails with `Conflict` if the persisted cursor is no longer `from` or
    /// the lock is no longer `lock` (another worker took the run over).
    fn advance_recovery_point(
        &self,
        run_id: &Uuid,
        lock: &DateTime<Utc>,
        from: &RecoveryPoint,
        to: &RecoveryPoint,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Durably write one persisted accessor value.
    fn record_accessor(
        &self,
        run_id: &Uuid,
        name: &str,
        value: &Value,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Capture the last failure on the run. `Conflict` unless `lock` is
    /// still held.
    fn store_error(
        &self,
        run_id: &Uuid,
        lock: &DateTime<Utc>,
        error: &StoredError,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Clear `locked_at` if it is still `lock`; `Conflict` otherwise.
    fn release_lock(
        &self,
        run_id: &Uuid,
        lock: &DateTime<Utc>,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Set the cursor to `FINISHED` and clear the lock.
    ///
    /// `lock` is the lock the caller holds, `None` for a run finished
    /// without one. `Conflict` when the stored lock differs.
    fn finish(
        &self,
        run_id: &Uuid,
        lock: Option<&DateTime<Utc>>,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Record that a staged run was handed to the queue. Keeps the first
    /// timestamp when called again.
    fn mark_enqueued(&self, run_id: &Uuid) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Staged runs whose `awaited_by` points at `run_id`, oldest first.
    fn list_awaiting(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<RunRecord>, RepositoryError>> + Send;
}

// ---------------------------------------------------------------------------
// Attach semantics shared by all backends
// ---------------------------------------------------------------------------

/// Apply the attach half of find-or-create to an existing record.
///
/// - adopts `new.workflow` when the record is a staged placeholder without one
/// - merges initial accessor values for names not yet persisted
/// - bumps `last_run_at` for executing (non-staged) attaches
/// - takes the lock when asked, the run is not finished, and the current
///   lock is absent or older than `lock_timeout`
///
/// Returns whether the lock was acquired.
pub fn apply_attachment(
    run: &mut RunRecord,
    new: &NewRun,
    acquire_lock: bool,
    lock_timeout: Duration,
    now: DateTime<Utc>,
) -> bool {
    let mut changed = false;

    if run.workflow.is_none() {
        if let Some(graph) = &new.workflow {
            run.recovery_point = Some(graph.initial_recovery_point());
            run.workflow = Some(graph.clone());
            changed = true;
        }
    }

    for (name, value) in &new.attr_accessors {
        if !run.attr_accessors.contains_key(name) {
            run.attr_accessors.insert(name.clone(), value.clone());
            changed = true;
        }
    }

    if !new.staged {
        run.last_run_at = Some(now);
    }

    let acquired = acquire_lock
        && run.recovery_point.is_some()
        && !run.is_finished()
        && !run.is_locked(now, lock_timeout);

    if acquired {
        if let Some(stale) = run.locked_at {
            tracing::warn!(
                run_id = %run.id,
                key = %run.idempotency_key,
                locked_at = %stale,
                "taking over stale run lock"
            );
        }
        run.locked_at = Some(now);
        changed = true;
    }

    if changed {
        run.updated_at = now;
    }

    acquired
}

// ---------------------------------------------------------------------------
// Object-safe accessor sink
// ---------------------------------------------------------------------------

/// Object-safe slice of [`RunRepository`] used by step contexts.
///
/// `RunRepository` uses RPITIT and cannot be a trait object; step actions
/// are plain function pointers that must not be generic over the backend,
/// so they see the store through this boxed-future trait instead. A blanket
/// implementation covers every `RunRepository`.
pub trait AccessorSink: Send + Sync {
    fn record_accessor_boxed<'a>(
        &'a self,
        run_id: Uuid,
        name: &'a str,
        value: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>>;
}

impl<T: RunRepository> AccessorSink for T {
    fn record_accessor_boxed<'a>(
        &'a self,
        run_id: Uuid,
        name: &'a str,
        value: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>> {
        Box::pin(async move { self.record_accessor(&run_id, name, value).await })
    }
}
