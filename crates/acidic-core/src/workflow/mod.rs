//! Durable workflow execution.
//!
//! - `builder`: step declarations and the graph compiler
//! - `context`: persisted accessors as seen by step actions
//! - `processor`: the step state machine
//! - `staging`: staged runs and the await/continuation protocol
//! - `engine`: the `Acidic` entry point tying them together

pub mod builder;
pub mod context;
pub mod engine;
pub mod error;
pub mod processor;
pub mod staging;

pub use builder::{StepDeclaration, WorkflowBuilder};
pub use context::{Persisting, StepContext};
pub use engine::{Acidic, Execution};
pub use error::AcidicError;
pub use processor::{Outcome, Processor};
pub use staging::{StagedJobId, StagingGateway};
