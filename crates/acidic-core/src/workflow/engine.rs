//! The `Acidic` engine: job registration, key derivation, and the per-job
//! `Execution` that defines and runs a workflow.

use std::collections::BTreeMap;
use std::sync::Arc;

use acidic_types::config::AcidicConfig;
use acidic_types::job::IdempotencyKey;
use acidic_types::run::NewRun;
use acidic_types::workflow::RecoveryPoint;
use tracing::Instrument;

use super::builder::WorkflowBuilder;
use super::context::Persisting;
use super::error::AcidicError;
use super::processor::{Outcome, Processor};
use super::staging::{StagedJobId, StagingGateway};
use crate::hash::ContentHasher;
use crate::idempotency::IdempotencyKeyGenerator;
use crate::job::{AcidicJob, JobRegistry};
use crate::queue::JobQueue;
use crate::repository::run::RunRepository;

/// Workflow engine bound to one run store and one queue backend.
pub struct Acidic<R, Q> {
    repo: Arc<R>,
    queue: Arc<Q>,
    registry: JobRegistry,
    keys: IdempotencyKeyGenerator,
    config: AcidicConfig,
}

impl<R, Q> Acidic<R, Q>
where
    R: RunRepository + 'static,
    Q: JobQueue,
{
    pub fn new(repo: Arc<R>, queue: Arc<Q>, hasher: Arc<dyn ContentHasher>, config: AcidicConfig) -> Self {
        Self {
            repo,
            queue,
            registry: JobRegistry::new(),
            keys: IdempotencyKeyGenerator::new(hasher),
            config,
        }
    }

    /// Make job class `J` known to this engine.
    ///
    /// Fails with `UnknownJobAdapter` when `J` is written for a different
    /// queue backend than the one this engine dispatches to.
    pub fn register<J: AcidicJob>(&mut self) -> Result<(), AcidicError> {
        let adapter = self.queue.adapter_name();
        if let Some(expected) = J::queue_adapter() {
            if expected != adapter {
                return Err(AcidicError::UnknownJobAdapter {
                    job_class: J::job_class().to_string(),
                    adapter: adapter.to_string(),
                });
            }
        }
        self.registry.register::<J>();
        tracing::debug!(job_class = J::job_class(), adapter, "job class registered");
        Ok(())
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    pub fn config(&self) -> &AcidicConfig {
        &self.config
    }

    /// Idempotency key for one invocation of `job`.
    ///
    /// A staged job always uses the key it was staged under, whatever its
    /// class strategy says, so it attaches to its placeholder run.
    pub fn idempotency_key<J: AcidicJob>(&self, job: &J) -> Result<IdempotencyKey, AcidicError> {
        if let Some(staged) = StagedJobId::decode(job.job_id())? {
            return Ok(staged.key);
        }
        Ok(self.keys.derive(&job.descriptor(), J::idempotency_strategy()))
    }

    /// Start one execution of `job`.
    pub fn execution<'e, J: AcidicJob>(&'e self, job: &'e mut J) -> Execution<'e, R, Q, J> {
        Execution {
            engine: self,
            job,
            defined: false,
        }
    }

    /// Executor hook run after a job's primary action.
    ///
    /// For a staged job without a workflow of its own, marks its run
    /// finished and signals the awaiting run. Workflow jobs signal from the
    /// processor, and ordinary jobs have nothing to do.
    pub async fn after_perform<J: AcidicJob>(&self, job: &J) -> Result<(), AcidicError> {
        let Some(staged) = StagedJobId::decode(job.job_id())? else {
            return Ok(());
        };

        let attachment = self
            .repo
            .create_or_attach(
                NewRun {
                    idempotency_key: staged.key,
                    job_class: J::job_class().to_string(),
                    serialized_job: job.serialize(),
                    workflow: None,
                    attr_accessors: BTreeMap::new(),
                    staged: false,
                    awaited_by: Some(staged.awaiting),
                },
                false,
                self.config.lock_timeout(),
            )
            .await?;
        let mut run = attachment.run;
        if run.workflow.is_some() {
            return Ok(());
        }

        if !run.is_finished() {
            self.repo.finish(&run.id, run.locked_at.as_ref()).await?;
            run.recovery_point = Some(RecoveryPoint::Finished);
            tracing::info!(run_id = %run.id, key = %run.idempotency_key, "awaited job finished");
        }
        self.gateway().signal_awaiting(&run).await?;
        Ok(())
    }

    fn gateway(&self) -> StagingGateway<'_, R, Q> {
        StagingGateway::new(
            self.repo.as_ref(),
            self.queue.as_ref(),
            &self.registry,
            self.config.lock_timeout(),
        )
    }
}

/// One execution of one job.
pub struct Execution<'e, R, Q, J> {
    engine: &'e Acidic<R, Q>,
    job: &'e mut J,
    defined: bool,
}

impl<R, Q, J> Execution<'_, R, Q, J>
where
    R: RunRepository + 'static,
    Q: JobQueue,
    J: AcidicJob,
{
    /// Define the job's workflow and run it from its persisted cursor.
    ///
    /// The workflow may be defined once per execution. Definition errors are
    /// raised before the run record is touched. When another worker holds a
    /// fresh lock on the run, returns `RunLocked` without running anything.
    pub async fn with_workflow<F>(&mut self, persisting: Persisting, block: Option<F>) -> Result<Outcome, AcidicError>
    where
        F: FnOnce(&mut WorkflowBuilder),
    {
        if self.defined {
            return Err(AcidicError::RedefiningWorkflow);
        }
        self.defined = true;

        let block = block.ok_or(AcidicError::MissingWorkflowBlock)?;
        let engine = self.engine;
        if !engine.registry.contains(J::job_class()) {
            return Err(AcidicError::UnknownJobAdapter {
                job_class: J::job_class().to_string(),
                adapter: engine.queue.adapter_name().to_string(),
            });
        }

        let actions = J::actions();
        let mut builder = WorkflowBuilder::new();
        block(&mut builder);
        let graph = builder.compile(&actions)?;
        for (_, spec) in graph.iter() {
            if let Some(accessor) = &spec.for_each {
                if !persisting.contains(accessor) {
                    return Err(AcidicError::UndeclaredAccessor(accessor.clone()));
                }
            }
        }

        let key = engine.idempotency_key(&*self.job)?;
        let awaited_by = StagedJobId::decode(self.job.job_id())?.map(|staged| staged.awaiting);
        let attachment = engine
            .repo
            .create_or_attach(
                NewRun {
                    idempotency_key: key.clone(),
                    job_class: J::job_class().to_string(),
                    serialized_job: self.job.serialize(),
                    workflow: Some(graph),
                    attr_accessors: persisting.into_values(),
                    staged: false,
                    awaited_by,
                },
                true,
                engine.config.lock_timeout(),
            )
            .await?;
        let run = attachment.run;

        if run.is_finished() {
            tracing::info!(run_id = %run.id, key = %key, "run already finished");
            engine.gateway().signal_awaiting(&run).await?;
            return Ok(Outcome::AlreadyFinished);
        }
        if !attachment.lock_acquired {
            tracing::info!(run_id = %run.id, key = %key, "run locked by another worker");
            return Err(AcidicError::RunLocked { key });
        }

        tracing::info!(
            run_id = %run.id,
            key = %key,
            created = attachment.created,
            recovery_point = %run.recovery_point.as_ref().map(|p| p.as_str()).unwrap_or_default(),
            "run started"
        );
        let span = tracing::info_span!(
            "acidic.process",
            acidic.job_class = J::job_class(),
            acidic.run_id = %run.id,
            acidic.key = %key,
        );
        Processor::new(&engine.repo, engine.gateway())
            .process(run, &mut *self.job, &actions)
            .instrument(span)
            .await
    }
}
