use thiserror::Error;

/// Failure of a single upstream call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("request timed out after {0}ms")]
    Timeout(u64),
}

impl FetchError {
    /// Only transient failures and timeouts are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::Timeout(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            FetchError::Unauthenticated(_) => "unauthenticated",
            FetchError::Forbidden(_) => "forbidden",
            FetchError::NotFound(_) => "not_found",
            FetchError::Transient(_) => "transient",
            FetchError::Timeout(_) => "timeout",
        }
    }
}
