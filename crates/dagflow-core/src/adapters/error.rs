use thiserror::Error;

/// Errors an external adapter (LLM, HTTP, filesystem, script) can raise.
/// Handlers translate these into `WorkflowError::Handler`.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {seconds}s")]
    TimedOut { seconds: u64 },

    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("output did not match the declared schema: {0}")]
    SchemaMismatch(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("value is not JSON-serializable: {0}")]
    NotSerializable(String),

    #[error("operation cancelled")]
    Cancelled,
}
