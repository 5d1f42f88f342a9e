//! Persisted accessors.
//!
//! A workflow declares the names it persists, with initial values, through
//! [`Persisting`]. Step actions read and write them through the
//! [`StepContext`] bound to the current run. Every write goes straight to
//! the run store before the action continues, so a crash right after an
//! action returns cannot lose what it produced.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use super::error::AcidicError;
use crate::repository::run::AccessorSink;

/// Declared persisted accessors and their initial values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Persisting {
    values: BTreeMap<String, Value>,
}

impl Persisting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `name` with an initial value.
    ///
    /// Initial values only apply to a fresh run; a resumed run keeps what
    /// it already persisted.
    pub fn with<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Result<Self, AcidicError> {
        let value = serde_json::to_value(value).map_err(|source| AcidicError::UnserializableValue {
            name: name.to_string(),
            source,
        })?;
        self.values.insert(name.to_string(), value);
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn into_values(self) -> BTreeMap<String, Value> {
        self.values
    }
}

/// The run-bound view a step action works through.
pub struct StepContext {
    run_id: Uuid,
    step: String,
    sink: Arc<dyn AccessorSink>,
    accessors: BTreeMap<String, Value>,
}

impl StepContext {
    pub fn new(
        run_id: Uuid,
        step: impl Into<String>,
        sink: Arc<dyn AccessorSink>,
        accessors: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            run_id,
            step: step.into(),
            sink,
            accessors,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Name of the executing step.
    pub fn step(&self) -> &str {
        &self.step
    }

    /// Raw persisted value of `name`.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.accessors.get(name)
    }

    /// Typed persisted value of `name`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, AcidicError> {
        let value = self
            .accessors
            .get(name)
            .ok_or_else(|| AcidicError::UndeclaredAccessor(name.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|source| AcidicError::InvalidAccessorValue {
            name: name.to_string(),
            source,
        })
    }

    /// Write `name` through to the run store, then update the local view.
    pub async fn set<T: Serialize + Sync + ?Sized>(&mut self, name: &str, value: &T) -> Result<(), AcidicError> {
        if !self.accessors.contains_key(name) {
            return Err(AcidicError::UndeclaredAccessor(name.to_string()));
        }
        let value = serde_json::to_value(value).map_err(|source| AcidicError::UnserializableValue {
            name: name.to_string(),
            source,
        })?;

        self.sink
            .record_accessor_boxed(self.run_id, name, &value)
            .await?;
        tracing::debug!(run_id = %self.run_id, step = self.step.as_str(), accessor = name, "accessor persisted");

        self.accessors.insert(name.to_string(), value);
        Ok(())
    }

    pub fn accessors(&self) -> &BTreeMap<String, Value> {
        &self.accessors
    }

    pub fn into_accessors(self) -> BTreeMap<String, Value> {
        self.accessors
    }
}
