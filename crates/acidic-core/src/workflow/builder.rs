//! Step declarations and the workflow graph compiler.
//!
//! Steps are declared in order on a [`WorkflowBuilder`]; compiling chains
//! them into a [`WorkflowGraph`] whose last step points at `FINISHED`. The
//! compiled graph is what gets frozen into the run record.

use acidic_types::workflow::{AwaitSpec, RecoveryPoint, StepSpec, WorkflowGraph};
use indexmap::IndexMap;

use super::error::AcidicError;
use crate::job::ActionTable;

/// One declared step. The action defaults to the step name.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDeclaration {
    name: String,
    action: Option<String>,
    awaits: Vec<Option<AwaitSpec>>,
    for_each: Option<String>,
}

impl StepDeclaration {
    fn new(name: String) -> Self {
        Self {
            name,
            action: None,
            awaits: Vec::new(),
            for_each: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `action` instead of the action named like the step.
    pub fn action(&mut self, action: impl Into<String>) -> &mut Self {
        self.action = Some(action.into());
        self
    }

    /// Replace the awaited job list. `None` entries are skipped at run time.
    pub fn awaits(&mut self, jobs: Vec<Option<AwaitSpec>>) -> &mut Self {
        self.awaits = jobs;
        self
    }

    /// Append one awaited job.
    pub fn await_job(&mut self, job: AwaitSpec) -> &mut Self {
        self.awaits.push(Some(job));
        self
    }

    /// Dispatch the awaited jobs once per element of the persisted
    /// collection `accessor`.
    pub fn for_each(&mut self, accessor: impl Into<String>) -> &mut Self {
        self.for_each = Some(accessor.into());
        self
    }
}

/// Ordered step declarations for one workflow.
#[derive(Debug, Clone, Default)]
pub struct WorkflowBuilder {
    steps: Vec<StepDeclaration>,
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the next step.
    pub fn step(&mut self, name: impl Into<String>) -> &mut StepDeclaration {
        self.steps.push(StepDeclaration::new(name.into()));
        let last = self.steps.len() - 1;
        &mut self.steps[last]
    }

    pub fn steps(&self) -> &[StepDeclaration] {
        &self.steps
    }

    /// Compile the declared steps against the job's action table.
    pub fn compile<J>(&self, actions: &ActionTable<J>) -> Result<WorkflowGraph, AcidicError> {
        if self.steps.is_empty() {
            return Err(AcidicError::NoDefinedSteps);
        }

        let mut graph = IndexMap::with_capacity(self.steps.len());
        for (i, decl) in self.steps.iter().enumerate() {
            if graph.contains_key(&decl.name) {
                return Err(AcidicError::DuplicateStepName(decl.name.clone()));
            }
            if decl.for_each.is_some() && !decl.awaits.iter().any(Option::is_some) {
                return Err(AcidicError::ForEachWithoutAwaits {
                    step: decl.name.clone(),
                });
            }

            let next = match self.steps.get(i + 1) {
                Some(following) => RecoveryPoint::step(following.name.as_str()),
                None => RecoveryPoint::Finished,
            };
            let spec = StepSpec {
                action: decl.action.clone().unwrap_or_else(|| decl.name.clone()),
                awaits: decl.awaits.clone(),
                for_each: decl.for_each.clone(),
                next,
            };
            actions.resolve(&decl.name, &spec)?;
            graph.insert(decl.name.clone(), spec);
        }

        Ok(WorkflowGraph::from_steps(graph))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ActionFuture, ActionTable};
    use crate::workflow::context::StepContext;
    use serde_json::Value;

    struct Job;

    fn noop<'a>(_job: &'a mut Job, _ctx: &'a mut StepContext) -> ActionFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn takes_args<'a>(_job: &'a mut Job, _ctx: &'a mut StepContext, _args: Vec<Value>) -> ActionFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn table() -> ActionTable<Job> {
        ActionTable::new()
            .action("reserve", noop)
            .action("charge", noop)
            .action("ship", noop)
            .action_with_params("refund", &["amount", "reason"], takes_args)
    }

    #[test]
    fn test_compile_chains_steps_in_order() {
        let mut builder = WorkflowBuilder::new();
        builder.step("reserve");
        builder.step("charge");
        builder.step("ship");

        let graph = builder.compile(&table()).unwrap();
        assert_eq!(graph.entry(), Some("reserve"));
        assert_eq!(graph.get("reserve").unwrap().next, RecoveryPoint::step("charge"));
        assert_eq!(graph.get("charge").unwrap().next, RecoveryPoint::step("ship"));
        assert_eq!(graph.get("ship").unwrap().next, RecoveryPoint::Finished);
        let names: Vec<&str> = graph.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["reserve", "charge", "ship"]);
    }

    #[test]
    fn test_compile_rejects_empty_workflow() {
        let err = WorkflowBuilder::new().compile(&table()).unwrap_err();
        assert!(matches!(err, AcidicError::NoDefinedSteps));
    }

    #[test]
    fn test_compile_rejects_undefined_action() {
        let mut builder = WorkflowBuilder::new();
        builder.step("reserve");
        builder.step("teleport");
        let err = builder.compile(&table()).unwrap_err();
        assert!(matches!(
            err,
            AcidicError::UndefinedStepMethod { ref step, .. } if step == "teleport"
        ));
    }

    #[test]
    fn test_compile_rejects_parameterized_action() {
        let mut builder = WorkflowBuilder::new();
        builder.step("undo").action("refund");
        let err = builder.compile(&table()).unwrap_err();
        assert!(matches!(
            err,
            AcidicError::TooManyParametersForStepMethod { count: 2, .. }
        ));
    }

    #[test]
    fn test_delegating_step_needs_no_action() {
        let mut builder = WorkflowBuilder::new();
        builder.step("notify").await_job(AwaitSpec::new("EmailJob"));
        builder.step("maybe").awaits(vec![None]);
        builder.step("ship");

        let graph = builder.compile(&table()).unwrap();
        assert!(graph.get("notify").unwrap().has_awaits());
        assert!(!graph.get("maybe").unwrap().has_awaits());
    }

    #[test]
    fn test_compile_rejects_duplicates_and_empty_fan_out() {
        let mut builder = WorkflowBuilder::new();
        builder.step("charge");
        builder.step("charge");
        assert!(matches!(
            builder.compile(&table()).unwrap_err(),
            AcidicError::DuplicateStepName(name) if name == "charge"
        ));

        let mut builder = WorkflowBuilder::new();
        builder.step("ship").for_each("parcels");
        assert!(matches!(
            builder.compile(&table()).unwrap_err(),
            AcidicError::ForEachWithoutAwaits { .. }
        ));
    }
}
