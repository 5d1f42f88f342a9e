//! The job contract and the registration-time action table.
//!
//! A job made acidic implements [`AcidicJob`]: it can serialize itself back
//! into a [`SerializedJob`], be rebuilt from one, and expose its step actions
//! through an [`ActionTable`] keyed by action name. The table is validated
//! when the workflow compiles, so an unknown or parameterized action is
//! caught before any step runs.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use acidic_types::job::SerializedJob;
use acidic_types::workflow::StepSpec;
use serde_json::Value;

use crate::idempotency::{IdempotencyStrategy, JobDescriptor};
use crate::workflow::context::StepContext;
use crate::workflow::error::AcidicError;

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Boxed future returned by a step action.
pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// A zero-argument step action. State flows through the [`StepContext`].
pub type ActionFn<J> = for<'a> fn(&'a mut J, &'a mut StepContext) -> ActionFuture<'a>;

/// An action that needs call arguments. These can be registered (so a
/// workflow naming one gets a precise error) but never run as a step.
pub type ParamActionFn<J> =
    for<'a> fn(&'a mut J, &'a mut StepContext, Vec<Value>) -> ActionFuture<'a>;

/// A registered action handle.
pub enum ActionHandle<J> {
    Nullary(ActionFn<J>),
    Parameterized {
        params: Vec<&'static str>,
        handler: ParamActionFn<J>,
    },
}

impl<J> ActionHandle<J> {
    /// Number of call arguments the action expects.
    pub fn arity(&self) -> usize {
        match self {
            Self::Nullary(_) => 0,
            Self::Parameterized { params, .. } => params.len(),
        }
    }
}

/// Action name -> handle, built once per job class.
pub struct ActionTable<J> {
    actions: HashMap<String, ActionHandle<J>>,
}

impl<J> Default for ActionTable<J> {
    fn default() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }
}

impl<J> ActionTable<J> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a zero-argument action.
    pub fn action(mut self, name: &str, handler: ActionFn<J>) -> Self {
        self.actions
            .insert(name.to_string(), ActionHandle::Nullary(handler));
        self
    }

    /// Register an action that expects named call arguments.
    pub fn action_with_params(
        mut self,
        name: &str,
        params: &[&'static str],
        handler: ParamActionFn<J>,
    ) -> Self {
        self.actions.insert(
            name.to_string(),
            ActionHandle::Parameterized {
                params: params.to_vec(),
                handler,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&ActionHandle<J>> {
        self.actions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Resolve the action a step should run.
    ///
    /// `Ok(None)` means the step has no local action and only delegates to
    /// awaited jobs. Used both when compiling and when executing a persisted
    /// graph, since the job's code may have changed in between.
    pub fn resolve(&self, step: &str, spec: &StepSpec) -> Result<Option<ActionFn<J>>, AcidicError> {
        match self.actions.get(&spec.action) {
            Some(ActionHandle::Nullary(handler)) => Ok(Some(*handler)),
            Some(handle) => Err(AcidicError::TooManyParametersForStepMethod {
                step: step.to_string(),
                action: spec.action.clone(),
                count: handle.arity(),
            }),
            None if spec.delegates() => Ok(None),
            None => Err(AcidicError::UndefinedStepMethod {
                step: step.to_string(),
                action: spec.action.clone(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Job contract
// ---------------------------------------------------------------------------

/// A background job that runs as a durable workflow or as an awaited job.
pub trait AcidicJob: Send + Sized + 'static {
    /// Registered class name; stable across deploys.
    fn job_class() -> &'static str;

    /// Queue-level runtime identifier of this invocation.
    fn job_id(&self) -> &str;

    /// Positional arguments the job was enqueued with.
    fn arguments(&self) -> Vec<Value>;

    /// The job's step actions.
    fn actions() -> ActionTable<Self>;

    /// Rebuild the job from its serialized payload.
    fn from_serialized(job: &SerializedJob) -> anyhow::Result<Self>;

    /// Queue backend this job class is written for. `None` runs on any.
    fn queue_adapter() -> Option<&'static str> {
        None
    }

    /// Key derivation strategy. `None` keys by job id.
    fn idempotency_strategy() -> Option<IdempotencyStrategy> {
        None
    }

    /// Logical identifier for `IdempotencyStrategy::Identifier`.
    fn identifier(&self) -> Option<String> {
        None
    }

    fn serialize(&self) -> SerializedJob {
        SerializedJob::new(Self::job_class(), self.job_id(), self.arguments())
    }

    fn descriptor(&self) -> JobDescriptor {
        JobDescriptor {
            job_class: Self::job_class().to_string(),
            job_id: self.job_id().to_string(),
            identifier: self.identifier(),
            arguments: self.arguments(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type InstantiateProbe = fn(&SerializedJob) -> anyhow::Result<()>;

fn instantiate<J: AcidicJob>(job: &SerializedJob) -> anyhow::Result<()> {
    J::from_serialized(job).map(drop)
}

/// Job classes known to one engine.
#[derive(Default)]
pub struct JobRegistry {
    classes: HashMap<String, InstantiateProbe>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<J: AcidicJob>(&mut self) {
        self.classes
            .insert(J::job_class().to_string(), instantiate::<J>);
    }

    pub fn contains(&self, job_class: &str) -> bool {
        self.classes.contains_key(job_class)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Check that `job` names a registered class and can be instantiated
    /// from its payload.
    pub fn check_instantiable(&self, job: &SerializedJob) -> Result<(), AcidicError> {
        let Some(instantiate) = self.classes.get(&job.job_class) else {
            return Err(AcidicError::UnknownAwaitedJob(job.job_class.clone()));
        };
        instantiate(job).map_err(|e| {
            tracing::debug!(
                job_class = job.job_class.as_str(),
                error = %e,
                "awaited job payload does not instantiate"
            );
            AcidicError::UnknownAwaitedJob(job.job_class.clone())
        })
    }
}
