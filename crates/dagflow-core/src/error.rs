use thiserror::Error;

/// Top-level error type for the dagflow-core library.
///
/// Variants line up with the error taxonomy: parse/validation errors are
/// fatal and pre-execution, the rest are per-node and captured into a
/// node's `Failed` output rather than propagated to the caller.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Document is malformed (fatal, pre-execution).
    #[error("parse error: {0}")]
    Parse(String),

    /// Reference, cycle, shape, or type validation error (fatal, pre-execution).
    #[error("validation error: {0}")]
    Validation(String),

    /// Render-time template failure against a live environment.
    #[error("template error in node '{node}': {message}")]
    Template { node: String, message: String },

    /// Kind-specific handler error (transport, HTTP status, filesystem, script).
    #[error("{kind} error in node '{node}': {message}")]
    Handler {
        node: String,
        kind: String,
        message: String,
    },

    /// A handler returned a value that cannot be represented as JSON.
    #[error("serialization error in node '{node}': {message}")]
    Serialization { node: String, message: String },

    /// The execution was cancelled.
    #[error("execution cancelled")]
    Cancelled,

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkflowError {
    pub fn handler(
        node: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Handler {
            node: node.into(),
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn template(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Template {
            node: node.into(),
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = WorkflowError::Validation("missing field".into());
        assert_eq!(err.to_string(), "validation error: missing field");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let wf_err: WorkflowError = io_err.into();
        assert!(matches!(wf_err, WorkflowError::Io(_)));
    }

    #[test]
    fn handler_error_includes_node_and_kind() {
        let err = WorkflowError::handler("fetch", "http", "connection refused");
        assert_eq!(
            err.to_string(),
            "http error in node 'fetch': connection refused"
        );
    }
}
