//! Workflow graph types.
//!
//! The graph is compiled once from a job's declared steps and then frozen
//! into the run record. Its JSON shape is a mapping keyed by step name:
//!
//! ```json
//! {
//!   "charge": {"action": "charge", "awaits": [], "for_each": null, "next": "ship"},
//!   "ship":   {"action": "ship",   "awaits": [], "for_each": null, "next": "FINISHED"}
//! }
//! ```
//!
//! That shape must round-trip through storage unchanged, because it is read
//! back to resume execution after the job's declaration in code has moved on.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal sentinel for `next` pointers and recovery points.
pub const FINISHED: &str = "FINISHED";

// ---------------------------------------------------------------------------
// RecoveryPoint
// ---------------------------------------------------------------------------

/// Durable cursor: the next step to execute, or the terminal marker.
///
/// Persisted as a bare string; `"FINISHED"` is the terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RecoveryPoint {
    Step(String),
    Finished,
}

impl RecoveryPoint {
    pub fn step(name: impl Into<String>) -> Self {
        Self::Step(name.into())
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Step(name) => name,
            Self::Finished => FINISHED,
        }
    }
}

impl From<String> for RecoveryPoint {
    fn from(value: String) -> Self {
        if value == FINISHED {
            Self::Finished
        } else {
            Self::Step(value)
        }
    }
}

impl From<&str> for RecoveryPoint {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<RecoveryPoint> for String {
    fn from(value: RecoveryPoint) -> Self {
        match value {
            RecoveryPoint::Step(name) => name,
            RecoveryPoint::Finished => FINISHED.to_string(),
        }
    }
}

impl fmt::Display for RecoveryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AwaitSpec
// ---------------------------------------------------------------------------

/// A job another step dispatches and waits on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwaitSpec {
    /// Registered job class to instantiate.
    pub job_class: String,
    /// Arguments the awaited job is constructed with. For `for_each` steps
    /// the current collection element is appended as a final argument.
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl AwaitSpec {
    pub fn new(job_class: impl Into<String>) -> Self {
        Self {
            job_class: job_class.into(),
            arguments: Vec::new(),
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<Value>) -> Self {
        self.arguments = arguments;
        self
    }
}

// ---------------------------------------------------------------------------
// StepSpec
// ---------------------------------------------------------------------------

/// One compiled node of the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Name of the action invoked on the job.
    pub action: String,
    /// Jobs to dispatch and wait on. `null` entries are declared-but-absent
    /// awaits and are skipped at execution time.
    #[serde(default)]
    pub awaits: Vec<Option<AwaitSpec>>,
    /// Persisted accessor naming the collection to fan out over.
    #[serde(default)]
    pub for_each: Option<String>,
    /// Successor step, or `FINISHED`.
    pub next: RecoveryPoint,
}

impl StepSpec {
    /// Whether this step dispatches at least one awaited job per pass.
    pub fn has_awaits(&self) -> bool {
        self.awaits.iter().any(Option::is_some)
    }

    /// Whether this step declared awaits or a fan-out, so its local
    /// action is optional. A declared `[null]` await list counts.
    pub fn delegates(&self) -> bool {
        !self.awaits.is_empty() || self.for_each.is_some()
    }
}

// ---------------------------------------------------------------------------
// WorkflowGraph
// ---------------------------------------------------------------------------

/// Step name -> compiled step, in declaration order.
///
/// The first entry is the single entry point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowGraph {
    steps: IndexMap<String, StepSpec>,
}

impl WorkflowGraph {
    pub fn from_steps(steps: IndexMap<String, StepSpec>) -> Self {
        Self { steps }
    }

    /// The first declared step.
    pub fn entry(&self) -> Option<&str> {
        self.steps.keys().next().map(String::as_str)
    }

    /// Recovery point a fresh run starts from.
    pub fn initial_recovery_point(&self) -> RecoveryPoint {
        match self.entry() {
            Some(name) => RecoveryPoint::step(name),
            None => RecoveryPoint::Finished,
        }
    }

    pub fn get(&self, name: &str) -> Option<&StepSpec> {
        self.steps.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StepSpec)> {
        self.steps.iter().map(|(name, spec)| (name.as_str(), spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_step_graph() -> WorkflowGraph {
        let mut steps = IndexMap::new();
        steps.insert(
            "charge".to_string(),
            StepSpec {
                action: "charge".to_string(),
                awaits: vec![],
                for_each: None,
                next: RecoveryPoint::step("ship"),
            },
        );
        steps.insert(
            "ship".to_string(),
            StepSpec {
                action: "ship".to_string(),
                awaits: vec![None, Some(AwaitSpec::new("LabelJob").with_arguments(vec![json!(7)]))],
                for_each: None,
                next: RecoveryPoint::Finished,
            },
        );
        WorkflowGraph::from_steps(steps)
    }

    #[test]
    fn test_recovery_point_string_form() {
        assert_eq!(serde_json::to_value(RecoveryPoint::Finished).unwrap(), json!("FINISHED"));
        let point: RecoveryPoint = serde_json::from_value(json!("charge")).unwrap();
        assert_eq!(point, RecoveryPoint::step("charge"));
        let point: RecoveryPoint = serde_json::from_value(json!("FINISHED")).unwrap();
        assert!(point.is_finished());
    }

    #[test]
    fn test_graph_persisted_layout() {
        let value = serde_json::to_value(two_step_graph()).unwrap();
        assert_eq!(
            value,
            json!({
                "charge": {"action": "charge", "awaits": [], "for_each": null, "next": "ship"},
                "ship": {
                    "action": "ship",
                    "awaits": [null, {"job_class": "LabelJob", "arguments": [7]}],
                    "for_each": null,
                    "next": "FINISHED"
                }
            })
        );
    }

    #[test]
    fn test_graph_keeps_declaration_order_through_json() {
        let text = serde_json::to_string(&two_step_graph()).unwrap();
        let back: WorkflowGraph = serde_json::from_str(&text).unwrap();
        assert_eq!(back.entry(), Some("charge"));
        assert_eq!(back, two_step_graph());
    }

    #[test]
    fn test_nil_awaits_do_not_count() {
        let graph = two_step_graph();
        let ship = graph.get("ship").unwrap();
        assert!(ship.has_awaits());

        let only_nil = StepSpec {
            action: "noop".to_string(),
            awaits: vec![None],
            for_each: None,
            next: RecoveryPoint::Finished,
        };
        assert!(!only_nil.has_awaits());
        assert!(only_nil.delegates());
    }

    #[test]
    fn test_empty_graph_starts_finished() {
        assert!(WorkflowGraph::default().initial_recovery_point().is_finished());
    }
}
