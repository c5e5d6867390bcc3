//! Result accumulator passed up the orchestration tree

use serde::{Deserialize, Serialize};

use crate::error::FenceError;

/// Preview payload returned instead of mutating a resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintOut {
    pub ips: String,
    pub subnet_ids: String,
}

/// Errors, warnings and information gathered by one operation and its children.
/// `success` holds exactly when `errors` is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultObject {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub information: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invocation_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operation_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PrintOut>,
}

impl ResultObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Result tagged with the function name and a fresh invocation id
    pub fn for_operation(function: &str, operation_id: &str) -> Self {
        Self {
            function_ids: vec![function.to_string()],
            invocation_ids: vec![uuid::Uuid::new_v4().to_string()],
            operation_ids: vec![operation_id.to_string()],
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.information.push(message.into());
    }

    /// Record a failure with the operation and resource it belongs to
    pub fn fail(&mut self, context: &str, err: &FenceError) {
        self.errors.push(format!("{context}: {}", err.user_message()));
    }

    /// Concatenate every list of `other` into `self`
    pub fn merge(&mut self, other: ResultObject) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.information.extend(other.information);
        self.function_ids.extend(other.function_ids);
        self.invocation_ids.extend(other.invocation_ids);
        self.operation_ids.extend(other.operation_ids);
        if self.data.is_none() {
            self.data = other.data;
        }
    }

    /// Rewrite errors as warnings so a secondary failure cannot fail the caller
    pub fn downgrade_errors(mut self, subject: &str) -> Self {
        let errors = std::mem::take(&mut self.errors);
        self.warnings
            .extend(errors.into_iter().map(|e| format!("{subject}: {e}")));
        self
    }
}
