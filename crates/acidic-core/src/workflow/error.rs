//! Workflow engine error type.

use acidic_types::error::{QueueError, RepositoryError};
use acidic_types::job::IdempotencyKey;
use thiserror::Error;

/// Errors raised while defining, attaching to, or executing a workflow.
///
/// Definition errors surface before any step runs. Execution errors are
/// captured on the run record before they reach the caller.
#[derive(Debug, Error)]
pub enum AcidicError {
    #[error("job class '{job_class}' is not backed by the '{adapter}' queue adapter")]
    UnknownJobAdapter { job_class: String, adapter: String },

    #[error("workflow is already defined for this job execution")]
    RedefiningWorkflow,

    #[error("workflow defines no steps")]
    NoDefinedSteps,

    #[error("workflow defined without a step block")]
    MissingWorkflowBlock,

    #[error("step '{step}' names undefined action '{action}'")]
    UndefinedStepMethod { step: String, action: String },

    #[error("action '{action}' of step '{step}' expects {count} parameter(s), step actions take none")]
    TooManyParametersForStepMethod {
        step: String,
        action: String,
        count: usize,
    },

    #[error("awaited job class '{0}' is not a known job")]
    UnknownAwaitedJob(String),

    #[error("recovery point '{0}' is not a step of the persisted workflow")]
    UnknownRecoveryPoint(String),

    #[error("value for accessor '{name}' cannot be serialized")]
    UnserializableValue {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("accessor '{name}' does not hold the requested type")]
    InvalidAccessorValue {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("step '{0}' is declared more than once")]
    DuplicateStepName(String),

    #[error("persisted workflow revisits step '{step}'")]
    CyclicWorkflow { step: String },

    #[error("step '{step}' fans out but awaits no job")]
    ForEachWithoutAwaits { step: String },

    #[error("step '{step}' fans out over accessor '{accessor}', which is not a list")]
    InvalidFanOutCollection { step: String, accessor: String },

    #[error("accessor '{0}' is not declared as persisted")]
    UndeclaredAccessor(String),

    #[error("malformed staged job id '{0}'")]
    InvalidStagedJobId(String),

    #[error("run '{key}' is locked by another worker")]
    RunLocked { key: IdempotencyKey },

    /// The lock expired and another worker took the run over mid-execution.
    #[error("run '{key}' lock was taken over by another worker")]
    LockLost { key: IdempotencyKey },

    #[error("step '{step}' failed")]
    StepFailed {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl AcidicError {
    /// Whether another delivery of the same job may succeed.
    ///
    /// Everything else is a definition or configuration error that will
    /// fail the same way on every attempt, or a lost lock whose run is now
    /// driven by the delivery that took it over.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StepFailed { .. } | Self::RunLocked { .. } | Self::Repository(_) | Self::Queue(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_step_failure_keeps_original_source() {
        let err = AcidicError::StepFailed {
            step: "charge".to_string(),
            source: anyhow::anyhow!("card declined"),
        };
        assert_eq!(err.to_string(), "step 'charge' failed");
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("card declined"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_definition_errors_are_not_retryable() {
        assert!(!AcidicError::NoDefinedSteps.is_retryable());
        assert!(!AcidicError::UnknownRecoveryPoint("x".to_string()).is_retryable());
        assert!(
            AcidicError::RunLocked {
                key: IdempotencyKey::new("k")
            }
            .is_retryable()
        );
        assert!(AcidicError::from(RepositoryError::Connection).is_retryable());
    }

    #[test]
    fn test_lost_lock_is_not_retried() {
        let err = AcidicError::LockLost {
            key: IdempotencyKey::new("order-7"),
        };
        assert_eq!(err.to_string(), "run 'order-7' lock was taken over by another worker");
        assert!(!err.is_retryable());
    }
}
