/// Typed error taxonomy for orchestrator operations.
/// Classifies errors by how callers should react: surface as-is, retry with
/// a bounded budget, or convert into a synthesized terminal event.
#[derive(Clone, Debug, thiserror::Error)]
pub enum OrchestratorError {
    // Surfaced to the caller, never retried
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Dispatch failures. The run is marked failed with the error captured
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    // Retried against a fixed budget, then skipped and logged
    #[error("retryable fetch error: {0}")]
    RetryableFetch(String),

    // Converted into a synthesized terminal event, never surfaced raw
    #[error("timeout after {minutes} minutes")]
    Timeout { minutes: u64 },

    // Plumbing failures (storage, serialization) with no caller-facing category
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableFetch(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidState(_) => "invalid_state",
            Self::InvalidInput(_) => "invalid_input",
            Self::UpstreamFailure(_) => "upstream_failure",
            Self::RetryableFetch(_) => "retryable_fetch",
            Self::Timeout { .. } => "timeout",
            Self::Internal(_) => "internal",
        }
    }
}
