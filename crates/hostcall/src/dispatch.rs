//! Operation table: request name → handler.
//!
//! Built once at startup and read-only afterwards. Lookups are exact string
//! matches. A miss is not an error for the channel: the caller gets the
//! sentinel result and the session carries on.

use std::collections::HashMap;
use std::fmt;

use crate::bridge::protocol::{BAD_API_SENTINEL, Response};

/// Handler for one named operation.
pub type Operation = Box<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("operation '{name}' registered more than once")]
    Duplicate { name: String },

    #[error("operation names must not be empty")]
    EmptyName,
}

#[derive(Default)]
pub struct OperationTableBuilder {
    ops: HashMap<String, Operation>,
    error: Option<RegistryError>,
}

impl OperationTableBuilder {
    pub fn register<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        let name = name.into();
        if self.error.is_some() {
            return self;
        }
        if name.is_empty() {
            self.error = Some(RegistryError::EmptyName);
        } else if self.ops.contains_key(&name) {
            self.error = Some(RegistryError::Duplicate { name });
        } else {
            self.ops.insert(name, Box::new(handler));
        }
        self
    }

    /// Finish the table. Reports the first registration problem, if any.
    pub fn build(self) -> Result<OperationTable, RegistryError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        Ok(OperationTable { ops: self.ops })
    }
}

pub struct OperationTable {
    ops: HashMap<String, Operation>,
}

impl OperationTable {
    pub fn builder() -> OperationTableBuilder {
        OperationTableBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ops.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn dispatch(&self, name: &str, argument: &str) -> Response {
        let Some(op) = self.ops.get(name) else {
            tracing::debug!(name, "Unknown operation requested");
            return Response::UnknownOperation;
        };

        let result = op(argument);
        if result == BAD_API_SENTINEL {
            tracing::warn!(
                name,
                "Operation returned the reserved sentinel; caller will see it as unknown"
            );
        }
        tracing::trace!(name, result_len = result.len(), "Dispatched operation");
        Response::Value(result)
    }
}

impl fmt::Debug for OperationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTable")
            .field("ops", &self.names())
            .finish()
    }
}
