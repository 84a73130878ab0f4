//! Error types for ga-report-core

use thiserror::Error;

/// Main error type for the ga-report-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV writing error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A single provider call failed
    #[error("provider error ({status}): {message}")]
    Provider {
        /// HTTP status, or 0 when no response was received
        status: u16,
        message: String,
        /// Whether retrying the same call may succeed
        transient: bool,
    },

    /// Retry budget exhausted against the provider
    #[error("provider unavailable after {attempts} attempt(s): {message}")]
    ProviderUnavailable { attempts: usize, message: String },

    /// Bad month string or a month in the future
    #[error("invalid period: {0}")]
    InvalidPeriod(String),

    /// URL with no matching catalog entity
    #[error("no catalog entity for url: {0}")]
    EntityNotFound(String),

    /// Missing or invalid token configuration
    #[error("authentication not configured: {0}")]
    AuthNotConfigured(String),

    /// The store connection lock was poisoned by a panicking writer
    #[error("stat store lock poisoned")]
    StorePoisoned,
}

impl Error {
    /// Whether this error must abort a multi-period batch.
    ///
    /// Anything else is logged and the batch moves on to the next period.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProviderUnavailable { .. }
                | Error::AuthNotConfigured(_)
                | Error::Database(_)
                | Error::StorePoisoned
        )
    }

    /// Whether a provider call that failed with this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Provider { transient: true, .. })
    }
}

/// Result type alias for ga-report-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let unavailable = Error::ProviderUnavailable {
            attempts: 3,
            message: "503".to_string(),
        };
        assert!(unavailable.is_fatal());
        assert!(Error::AuthNotConfigured("no token".to_string()).is_fatal());

        let bad_request = Error::Provider {
            status: 400,
            message: "bad filter".to_string(),
            transient: false,
        };
        assert!(!bad_request.is_fatal());
        assert!(!Error::EntityNotFound("/dataset/x".to_string()).is_fatal());
    }

    #[test]
    fn test_transient_classification() {
        let server = Error::Provider {
            status: 503,
            message: "backend error".to_string(),
            transient: true,
        };
        assert!(server.is_transient());
        assert!(!Error::Config("x".to_string()).is_transient());
    }
}
