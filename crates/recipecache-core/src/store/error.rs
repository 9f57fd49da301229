use thiserror::Error;

/// Failure reported by a remote store adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid record: {0}")]
    Invalid(String),

    #[error("Resource not found: {0}")]
    NotFound(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl StoreError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Classify an HTTP-style status code returned by a file API.
    pub fn from_status(status: u16, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status {
            401 | 403 => StoreError::Unauthorized,
            404 => StoreError::NotFound(truncated),
            408 => StoreError::Timeout,
            409 | 412 => StoreError::Conflict(truncated),
            422 => StoreError::Invalid(truncated),
            429 => StoreError::RateLimited,
            500..=599 => StoreError::ServerError(truncated),
            _ => StoreError::Invalid(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Whether a sync attempt failing with this error should be retried.
    /// Transient transport and server failures are; rejections of the
    /// request itself are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Network(_)
                | StoreError::Timeout
                | StoreError::ServerError(_)
                | StoreError::RateLimited
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
