//! Custom error types for reviewharvest.
//!
//! Every fallible operation in the library returns `Result<T, HarvestError>`.
//! The variants double as the crawl's failure taxonomy: the HTTP client uses
//! [`HarvestError::is_transient`] to decide what to retry and the orchestrator
//! uses [`HarvestError::is_fatal_for_year`] to decide what halts a year.

use thiserror::Error;

/// Main error type for reviewharvest operations.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Low-level HTTP failure reported by reqwest that is not a timeout or connect error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Timeout, dropped connection or 5xx response; retried with backoff
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// HTTP 429 from the record API
    #[error("Rate limited, retry after {0}s")]
    RateLimited(u64),

    /// Invitation, forum or endpoint does not exist for this API generation
    #[error("Not found: {0}")]
    NotFound(String),

    /// Non-retryable HTTP status
    #[error("API error: {code} - {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Response excerpt
        message: String,
    },

    /// Raw payload did not have the expected shape
    #[error("Schema anomaly in {note_id}: {message}")]
    SchemaAnomaly {
        /// Note the anomaly was found in
        note_id: String,
        /// What was unexpected
        message: String,
    },

    /// Same paper_id observed twice with differing content
    #[error("Duplicate paper_id {paper_id} in year {year}: {detail}")]
    DuplicateKey {
        paper_id: String,
        year: i32,
        detail: String,
    },

    /// Pagination did not terminate within the configured page bound
    #[error("Pagination bound of {max_pages} pages exceeded for {invitation}")]
    PaginationBoundExceeded { invitation: String, max_pages: usize },

    /// No candidate query answered with data and at least one failed outright,
    /// so the year cannot be declared empty under this API generation
    #[error("Submissions for {year} unavailable under API {version}: {detail}")]
    ProbeFailed {
        year: i32,
        version: String,
        detail: String,
    },

    /// Operator interrupt observed before the operation completed
    #[error("Cancelled")]
    Cancelled,

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Response or file content could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration or credential error
    #[error("Config error: {0}")]
    Config(String),
}

impl HarvestError {
    /// Whether the HTTP client may retry the request that produced this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientNetwork(_) | Self::RateLimited(_) => true,
            Self::Network(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Errors that halt the affected year instead of just one invitation or submission.
    pub fn is_fatal_for_year(&self) -> bool {
        matches!(
            self,
            Self::DuplicateKey { .. } | Self::PaginationBoundExceeded { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type alias using `HarvestError`
pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(HarvestError::TransientNetwork("HTTP 503".into()).is_transient());
        assert!(HarvestError::RateLimited(5).is_transient());
        assert!(!HarvestError::NotFound("x".into()).is_transient());
        assert!(!HarvestError::Api {
            code: 400,
            message: "bad".into()
        }
        .is_transient());
    }

    #[test]
    fn test_fatal_for_year() {
        let dup = HarvestError::DuplicateKey {
            paper_id: "abc".into(),
            year: 2020,
            detail: "content differs".into(),
        };
        assert!(dup.is_fatal_for_year());
        assert!(HarvestError::PaginationBoundExceeded {
            invitation: "ICLR.cc/2020/Conference/-/Blind_Submission".into(),
            max_pages: 3
        }
        .is_fatal_for_year());
        assert!(!HarvestError::TransientNetwork("timeout".into()).is_fatal_for_year());
    }
}
