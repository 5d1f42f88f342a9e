//! Staged runs and the await/continuation protocol.
//!
//! An awaiting step creates one staged run per awaited job before handing
//! the job to the queue. The staged job's runtime identifier is a
//! [`StagedJobId`]: a versioned tag, the child's idempotency key, and a
//! locator for the awaiting run, so the child can find its parent again
//! without any coordination service.
//!
//! Wire form: `STG1.<base64url(key)>.<base64url("gid://acidic/Run/<uuid>")>`
//! (unpadded). Ids that do not start with `STG<digits>.` are ordinary job ids,
//! so a runtime id such as `STG1234` is never mistaken for a staged one.
//!
//! Fan-in is a state barrier: every resumption of the awaiting run
//! re-reads its children and only moves past the step once all of them are
//! finished. Signals may therefore arrive any number of times.

use std::collections::BTreeMap;

use acidic_types::job::{IdempotencyKey, SerializedJob};
use acidic_types::run::{NewRun, RunRecord};
use acidic_types::workflow::StepSpec;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::error::AcidicError;
use crate::job::JobRegistry;
use crate::queue::JobQueue;
use crate::repository::run::RunRepository;

const STAGED_TAG: &str = "STG";
const STAGED_VERSION: &str = "1";
const RUN_LOCATOR_PREFIX: &str = "gid://acidic/Run/";

// ---------------------------------------------------------------------------
// StagedJobId
// ---------------------------------------------------------------------------

/// Decoded runtime identifier of a staged job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedJobId {
    /// Idempotency key of the staged run.
    pub key: IdempotencyKey,
    /// The run waiting on it.
    pub awaiting: Uuid,
}

impl StagedJobId {
    pub fn encode(&self) -> String {
        let locator = format!("{RUN_LOCATOR_PREFIX}{}", self.awaiting);
        format!(
            "{STAGED_TAG}{STAGED_VERSION}.{}.{}",
            URL_SAFE_NO_PAD.encode(self.key.as_str()),
            URL_SAFE_NO_PAD.encode(locator)
        )
    }

    /// Decode `job_id`.
    ///
    /// `Ok(None)` for ordinary job ids. An id that claims the staged tag but
    /// does not decode is an error rather than a silent miss.
    pub fn decode(job_id: &str) -> Result<Option<Self>, AcidicError> {
        let Some(rest) = job_id.strip_prefix(STAGED_TAG) else {
            return Ok(None);
        };
        let Some((version, body)) = rest.split_once('.') else {
            return Ok(None);
        };
        if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(None);
        }

        let invalid = || AcidicError::InvalidStagedJobId(job_id.to_string());
        if version != STAGED_VERSION {
            return Err(invalid());
        }
        let mut parts = body.split('.');
        let (Some(key), Some(locator), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };

        let key = decode_part(key).ok_or_else(invalid)?;
        let locator = decode_part(locator).ok_or_else(invalid)?;
        let awaiting = locator
            .strip_prefix(RUN_LOCATOR_PREFIX)
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(invalid)?;

        Ok(Some(Self {
            key: IdempotencyKey::new(key),
            awaiting,
        }))
    }
}

fn decode_part(part: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(part).ok()?;
    String::from_utf8(bytes).ok()
}

/// Idempotency key of one awaited child of `parent`.
///
/// Stable across re-dispatches, which is what makes re-entering an
/// awaiting step attach to the same children instead of creating new ones.
pub fn child_key(parent: &IdempotencyKey, step: &str, element: usize, await_index: usize) -> IdempotencyKey {
    IdempotencyKey::new(format!("{parent}:{step}:{element}:{await_index}"))
}

// ---------------------------------------------------------------------------
// StagingGateway
// ---------------------------------------------------------------------------

/// Creates staged runs for awaited jobs and reenqueues awaiting runs.
pub struct StagingGateway<'a, R, Q> {
    repo: &'a R,
    queue: &'a Q,
    registry: &'a JobRegistry,
    lock_timeout: Duration,
}

impl<'a, R: RunRepository, Q: JobQueue> StagingGateway<'a, R, Q> {
    pub fn new(repo: &'a R, queue: &'a Q, registry: &'a JobRegistry, lock_timeout: Duration) -> Self {
        Self {
            repo,
            queue,
            registry,
            lock_timeout,
        }
    }

    /// Stage and enqueue the awaited jobs of `step` for `parent`.
    ///
    /// Children already staged by an earlier pass are reused. A child is
    /// handed to the queue until its `enqueued_at` marker is set, which only
    /// happens after the queue accepted it: a crash between staging and
    /// enqueue cannot strand a child, and a redelivered parent does not
    /// enqueue it twice. Returns the children as they stand after staging.
    pub async fn dispatch(
        &self,
        parent: &RunRecord,
        step: &str,
        spec: &StepSpec,
    ) -> Result<Vec<RunRecord>, AcidicError> {
        let elements = fan_out_elements(parent, step, spec)?;
        let mut children = Vec::new();

        for (element_index, element) in elements.iter().enumerate() {
            for (await_index, awaited) in spec.awaits.iter().enumerate() {
                let Some(awaited) = awaited else {
                    continue;
                };

                let key = child_key(&parent.idempotency_key, step, element_index, await_index);
                let staged_id = StagedJobId {
                    key: key.clone(),
                    awaiting: parent.id,
                };
                let mut arguments = awaited.arguments.clone();
                if let Some(element) = element {
                    arguments.push(element.clone());
                }
                let payload = SerializedJob::new(awaited.job_class.as_str(), staged_id.encode(), arguments);
                self.registry.check_instantiable(&payload)?;

                let attachment = self
                    .repo
                    .create_or_attach(
                        NewRun {
                            idempotency_key: key,
                            job_class: awaited.job_class.clone(),
                            serialized_job: payload,
                            workflow: None,
                            attr_accessors: BTreeMap::new(),
                            staged: true,
                            awaited_by: Some(parent.id),
                        },
                        false,
                        self.lock_timeout,
                    )
                    .await?;
                let mut child = attachment.run;

                if !child.is_finished() && child.enqueued_at.is_none() {
                    self.queue.enqueue(child.serialized_job.clone()).await?;
                    self.repo.mark_enqueued(&child.id).await?;
                    child.enqueued_at = Some(Utc::now());
                    tracing::debug!(
                        run_id = %parent.id,
                        child_id = %child.id,
                        key = %child.idempotency_key,
                        step,
                        adapter = self.queue.adapter_name(),
                        "awaited job enqueued"
                    );
                }
                children.push(child);
            }
        }

        Ok(children)
    }

    /// Reenqueue the run waiting on `finished`, if any.
    ///
    /// Returns whether a job was handed to the queue. A missing or already
    /// finished parent is not an error: there is nothing left to resume.
    pub async fn signal_awaiting(&self, finished: &RunRecord) -> Result<bool, AcidicError> {
        let parent_id = match StagedJobId::decode(&finished.serialized_job.job_id)? {
            Some(staged) => Some(staged.awaiting),
            None => finished.awaited_by,
        };
        let Some(parent_id) = parent_id else {
            return Ok(false);
        };

        let Some(parent) = self.repo.get_run(&parent_id).await? else {
            tracing::warn!(
                run_id = %finished.id,
                awaiting = %parent_id,
                "awaiting run no longer exists"
            );
            return Ok(false);
        };
        if parent.is_finished() {
            tracing::debug!(run_id = %finished.id, awaiting = %parent_id, "awaiting run already finished");
            return Ok(false);
        }

        self.queue.enqueue(parent.serialized_job.clone()).await?;
        tracing::info!(
            run_id = %finished.id,
            awaiting = %parent_id,
            key = %parent.idempotency_key,
            "awaiting run reenqueued"
        );
        Ok(true)
    }
}

/// Elements to dispatch awaited jobs for: one pass without an element for a
/// plain awaiting step, one per collection entry for a fan-out.
fn fan_out_elements(parent: &RunRecord, step: &str, spec: &StepSpec) -> Result<Vec<Option<Value>>, AcidicError> {
    let Some(accessor) = &spec.for_each else {
        return Ok(vec![None]);
    };
    match parent.attr_accessors.get(accessor) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.iter().cloned().map(Some).collect()),
        Some(_) => Err(AcidicError::InvalidFanOutCollection {
            step: step.to_string(),
            accessor: accessor.clone(),
        }),
    }
}
