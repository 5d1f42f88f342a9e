//! The step state machine.
//!
//! States are the step names of the run's persisted graph plus `FINISHED`.
//! The processor starts at the persisted cursor and loops:
//!
//! 1. resolve the cursor against the persisted graph
//! 2. for an awaiting step, stage the awaited jobs and suspend unless every
//!    one of them has already finished
//! 3. run the step's action
//! 4. advance the cursor to the step's successor
//!
//! A failure is stored on the run and the lock released, leaving the cursor
//! where it was so the next delivery retries the same step. If storing the
//! failure itself fails, the lock is left in place.
//!
//! Every write that moves the run is guarded by the `locked_at` value this
//! execution acquired. When another worker has taken the lock over, the
//! write is rejected and execution stops with `LockLost`, leaving the run
//! untouched for its new owner.

use std::collections::HashSet;
use std::sync::Arc;

use acidic_types::error::RepositoryError;
use acidic_types::run::{RunRecord, StoredError};
use acidic_types::workflow::{RecoveryPoint, WorkflowGraph};
use chrono::{DateTime, Utc};
use tracing::{Instrument, info_span};

use super::context::StepContext;
use super::error::AcidicError;
use super::staging::StagingGateway;
use crate::job::ActionTable;
use crate::queue::JobQueue;
use crate::repository::run::{AccessorSink, RunRepository};

/// How one execution of a workflow ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// This execution walked the run to `FINISHED`.
    Finished,
    /// The run was already finished; no step ran.
    AlreadyFinished,
    /// The run is waiting on awaited jobs at `step`.
    Suspended { step: String, pending: usize },
}

enum StepResult {
    Advanced,
    Suspended { pending: usize },
}

/// Walks one locked run through its persisted graph.
pub struct Processor<'a, R, Q> {
    repo: &'a Arc<R>,
    gateway: StagingGateway<'a, R, Q>,
}

impl<'a, R, Q> Processor<'a, R, Q>
where
    R: RunRepository + 'static,
    Q: JobQueue,
{
    pub fn new(repo: &'a Arc<R>, gateway: StagingGateway<'a, R, Q>) -> Self {
        Self { repo, gateway }
    }

    /// Execute `run` from its current cursor.
    ///
    /// The caller must hold the run's lock. On return the lock has been
    /// released, except after a failure that could not be stored or once
    /// another worker has taken the lock over.
    pub async fn process<J>(
        &self,
        mut run: RunRecord,
        job: &mut J,
        actions: &ActionTable<J>,
    ) -> Result<Outcome, AcidicError> {
        let Some(lock) = run.locked_at else {
            return Err(AcidicError::LockLost {
                key: run.idempotency_key.clone(),
            });
        };
        let graph = match run.workflow.clone() {
            Some(graph) => graph,
            None => {
                let err = AcidicError::UnknownRecoveryPoint(cursor_name(&run));
                return Err(self.fail(&run, &lock, None, err).await);
            }
        };
        if run.recovery_point.is_none() {
            run.recovery_point = Some(graph.initial_recovery_point());
        }

        let mut visited = HashSet::new();
        loop {
            let step = match &run.recovery_point {
                Some(RecoveryPoint::Step(step)) => step.clone(),
                _ => break,
            };
            if !visited.insert(step.clone()) {
                let err = AcidicError::CyclicWorkflow { step: step.clone() };
                return Err(self.fail(&run, &lock, Some(step.as_str()), err).await);
            }

            match self.run_step(&mut run, &lock, &graph, &step, job, actions).await {
                Ok(StepResult::Advanced) => {}
                Ok(StepResult::Suspended { pending }) => {
                    self.repo
                        .release_lock(&run.id, &lock)
                        .await
                        .map_err(|err| lock_error(&run, err))?;
                    tracing::info!(run_id = %run.id, key = %run.idempotency_key, step = step.as_str(), pending, "run suspended on awaited jobs");
                    return Ok(Outcome::Suspended { step, pending });
                }
                Err(err) => return Err(self.fail(&run, &lock, Some(step.as_str()), err).await),
            }
        }

        self.repo
            .finish(&run.id, Some(&lock))
            .await
            .map_err(|err| lock_error(&run, err))?;
        run.recovery_point = Some(RecoveryPoint::Finished);
        run.locked_at = None;
        tracing::info!(run_id = %run.id, key = %run.idempotency_key, "run finished");

        if let Err(err) = self.gateway.signal_awaiting(&run).await {
            tracing::warn!(run_id = %run.id, error = %err, "could not signal awaiting run");
            return Err(err);
        }
        Ok(Outcome::Finished)
    }

    async fn run_step<J>(
        &self,
        run: &mut RunRecord,
        lock: &DateTime<Utc>,
        graph: &WorkflowGraph,
        step: &str,
        job: &mut J,
        actions: &ActionTable<J>,
    ) -> Result<StepResult, AcidicError> {
        let spec = graph
            .get(step)
            .ok_or_else(|| AcidicError::UnknownRecoveryPoint(step.to_string()))?;

        if spec.delegates() {
            let children = self.gateway.dispatch(run, step, spec).await?;
            let pending = children.iter().filter(|child| !child.is_finished()).count();
            if pending > 0 {
                return Ok(StepResult::Suspended { pending });
            }
        }

        if let Some(action) = actions.resolve(step, spec)? {
            let sink: Arc<dyn AccessorSink> = self.repo.clone();
            let mut ctx = StepContext::new(run.id, step, sink, std::mem::take(&mut run.attr_accessors));
            let result = action(job, &mut ctx)
                .instrument(info_span!("acidic.step", acidic.step = step))
                .await;
            run.attr_accessors = ctx.into_accessors();
            result.map_err(|source| AcidicError::StepFailed {
                step: step.to_string(),
                source,
            })?;
        }

        let from = RecoveryPoint::step(step);
        self.repo
            .advance_recovery_point(&run.id, lock, &from, &spec.next)
            .await
            .map_err(|err| lock_error(run, err))?;
        run.recovery_point = Some(spec.next.clone());
        tracing::debug!(run_id = %run.id, step, next = %spec.next, "step completed");
        Ok(StepResult::Advanced)
    }

    /// Capture `err` on the run and release the lock, returning `err`.
    ///
    /// Once the lock has been taken over nothing is written.
    async fn fail(
        &self,
        run: &RunRecord,
        lock: &DateTime<Utc>,
        step: Option<&str>,
        err: AcidicError,
    ) -> AcidicError {
        if matches!(err, AcidicError::LockLost { .. }) {
            tracing::warn!(run_id = %run.id, key = %run.idempotency_key, step, "run lock taken over by another worker");
            return err;
        }
        let stored = stored_error(step, &err);
        match self.repo.store_error(&run.id, lock, &stored).await {
            Ok(()) => {
                if let Err(release) = self.repo.release_lock(&run.id, lock).await {
                    tracing::warn!(run_id = %run.id, error = %release, "could not release run lock");
                }
                tracing::warn!(
                    run_id = %run.id,
                    key = %run.idempotency_key,
                    step,
                    error = %stored.message,
                    "step failed, run left at its recovery point"
                );
            }
            Err(RepositoryError::Conflict(_)) => {
                tracing::warn!(
                    run_id = %run.id,
                    key = %run.idempotency_key,
                    step,
                    original = %stored.message,
                    "run lock taken over by another worker, failure not stored"
                );
            }
            Err(store) => {
                tracing::error!(
                    run_id = %run.id,
                    key = %run.idempotency_key,
                    step,
                    error = %store,
                    original = %stored.message,
                    "could not store step failure, run stays locked"
                );
            }
        }
        err
    }
}

/// A rejected lock-guarded write means the lock changed hands.
fn lock_error(run: &RunRecord, err: RepositoryError) -> AcidicError {
    match err {
        RepositoryError::Conflict(_) => AcidicError::LockLost {
            key: run.idempotency_key.clone(),
        },
        other => other.into(),
    }
}

fn cursor_name(run: &RunRecord) -> String {
    run.recovery_point
        .as_ref()
        .map(|point| point.as_str().to_string())
        .unwrap_or_default()
}

/// Flatten an engine error into its durable form.
///
/// A step failure is stored as the action's own error, not the wrapper.
pub fn stored_error(step: Option<&str>, err: &AcidicError) -> StoredError {
    let (message, chain) = match err {
        AcidicError::StepFailed { source, .. } => (
            source.to_string(),
            source.chain().skip(1).map(|cause| cause.to_string()).collect(),
        ),
        other => {
            let mut chain = Vec::new();
            let mut cause = std::error::Error::source(other);
            while let Some(inner) = cause {
                chain.push(inner.to_string());
                cause = inner.source();
            }
            (other.to_string(), chain)
        }
    };
    StoredError {
        step: step.map(str::to_string),
        message,
        chain,
        occurred_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_error_unwraps_step_failure() {
        let source = anyhow::anyhow!("gateway timeout").context("charging card");
        let err = AcidicError::StepFailed {
            step: "charge".to_string(),
            source,
        };
        let stored = stored_error(Some("charge"), &err);
        assert_eq!(stored.step.as_deref(), Some("charge"));
        assert_eq!(stored.message, "charging card");
        assert_eq!(stored.chain, vec!["gateway timeout".to_string()]);
    }

    #[test]
    fn test_stored_error_keeps_engine_error_chain() {
        let err = AcidicError::from(RepositoryError::Query("disk I/O error".to_string()));
        let stored = stored_error(None, &err);
        assert_eq!(stored.message, "repository error: query error: disk I/O error");
        assert_eq!(stored.chain, vec!["query error: disk I/O error".to_string()]);
        assert!(stored.step.is_none());
    }

    #[test]
    fn test_rejected_guarded_write_means_lock_lost() {
        let run = acidic_types::run::NewRun {
            idempotency_key: acidic_types::job::IdempotencyKey::new("order-9"),
            job_class: "OrderJob".to_string(),
            serialized_job: acidic_types::job::SerializedJob::new("OrderJob", "j-1", vec![]),
            workflow: None,
            attr_accessors: Default::default(),
            staged: false,
            awaited_by: None,
        }
        .into_record(Utc::now());

        let err = lock_error(&run, RepositoryError::Conflict("run lock is held".to_string()));
        assert!(matches!(err, AcidicError::LockLost { ref key } if key.as_str() == "order-9"));
        let err = lock_error(&run, RepositoryError::Connection);
        assert!(matches!(err, AcidicError::Repository(RepositoryError::Connection)));
    }
}
