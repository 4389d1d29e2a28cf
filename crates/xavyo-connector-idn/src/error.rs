//! Error types for the IdentityNow connector.

use thiserror::Error;

/// Result type alias using `IdnError`.
pub type IdnResult<T> = Result<T, IdnError>;

/// Errors that can occur when interacting with IdentityNow.
#[derive(Debug, Error)]
pub enum IdnError {
    /// Configuration validation error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// API credential could not be obtained. Fatal for the run.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The upstream rejected the credential presented for an operation.
    #[error("Authorization failed for {operation} (HTTP {status})")]
    Authorization { operation: String, status: u16 },

    /// Upstream answered with a non-success status.
    #[error("IdentityNow API error {status} after {attempts} attempt(s): {message}")]
    Api {
        status: u16,
        message: String,
        attempts: u32,
    },

    /// The request never produced a response.
    #[error("Network error after {attempts} attempt(s): {message}")]
    Network {
        message: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    /// Requested account or entitlement does not exist.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Request rejected before reaching the upstream.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Upstream payload did not have the expected shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// One or more records failed during a bulk operation.
    #[error("{failed} of {total} record(s) failed")]
    PartialRun { failed: usize, total: usize },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

impl IdnError {
    /// Returns true for rate limiting, upstream 5xx and network failures.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            IdnError::Api { status, .. } => *status == 429 || *status >= 500,
            IdnError::Network { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            _ => false,
        }
    }

    /// Returns true when the error means the target object is absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            IdnError::NotFound(_) | IdnError::Api { status: 404, .. }
        )
    }

    /// Number of attempts made before the error surfaced, if it came from the transport.
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        match self {
            IdnError::Api { attempts, .. } | IdnError::Network { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}
