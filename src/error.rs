//! Shared error taxonomy.
//!
//! Every module defines its own `thiserror` error enum scoped to its own
//! failure modes, but they all map onto the same taxonomy so the scheduler
//! can apply retry/cancellation policy uniformly regardless of which
//! component raised the error.

use serde::{Deserialize, Serialize};

/// The error taxonomy kinds a terminal submission or task error is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidWorkflow,
    InvalidInput,
    NotFound,
    Conflict,
    ExpressionError,
    ExecutorTransport,
    ToolFailure,
    OutputCollection,
    CancellationRequested,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidWorkflow => "invalid_workflow",
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::ExpressionError => "expression_error",
            Self::ExecutorTransport => "executor_transport",
            Self::ToolFailure => "tool_failure",
            Self::OutputCollection => "output_collection",
            Self::CancellationRequested => "cancellation_requested",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Implemented by every module-level error enum so the scheduler can read
/// a uniform `(kind, retryable)` pair off of any error without matching on
/// its concrete type.
pub trait ClassifiedError: std::error::Error {
    fn kind(&self) -> ErrorKind;
    fn retryable(&self) -> bool;
}

/// A summary of a terminal task/submission failure, carried in state and
/// surfaced to API consumers. Never constructed for non-terminal failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub kind: ErrorKind,
    pub message: String,
    pub field: Option<String>,
    pub retryable: bool,
}

impl ErrorSummary {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: None,
            retryable: false,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn from_classified(err: &impl ClassifiedError) -> Self {
        Self::new(err.kind(), err.to_string()).retryable(err.retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::ToolFailure.to_string(), "tool_failure");
        assert_eq!(ErrorKind::InvalidWorkflow.to_string(), "invalid_workflow");
    }

    #[test]
    fn error_summary_builder() {
        let summary = ErrorSummary::new(ErrorKind::InvalidInput, "missing required input")
            .with_field("message")
            .retryable(false);
        assert_eq!(summary.field.as_deref(), Some("message"));
        assert!(!summary.retryable);
    }
}
