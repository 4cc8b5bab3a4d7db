//! Grid-specific error types

use thiserror::Error;

/// Errors that can occur in grid trading operations
#[derive(Error, Debug, Clone)]
pub enum GridError {
    #[error("Invalid grid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Request signing error: {0}")]
    Signing(String),

    /// The exchange declined the request. Never retried.
    #[error("Rejected by exchange: {0}")]
    Rejected(String),

    #[error("Transient exchange error: {0}")]
    Transient(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Operation failed after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    /// Available balance cannot fund even one order at the configured minimum
    #[error("Infeasible order size: {0}")]
    Infeasible(String),

    #[error("Price unavailable: {0}")]
    PriceUnavailable(String),

    #[error("State persistence error: {0}")]
    StatePersistence(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),
}

impl GridError {
    /// Whether the exchange client should retry the failed call
    pub fn is_retryable(&self) -> bool {
        matches!(self, GridError::Transient(_) | GridError::RateLimited(_))
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::StatePersistence(err.to_string())
    }
}

impl From<config::ConfigError> for GridError {
    fn from(err: config::ConfigError) -> Self {
        GridError::InvalidConfig(err.to_string())
    }
}

impl From<reqwest::Error> for GridError {
    fn from(err: reqwest::Error) -> Self {
        GridError::Transient(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GridError::Transient("timeout".into()).is_retryable());
        assert!(GridError::RateLimited("EAPI:Rate limit exceeded".into()).is_retryable());
        assert!(!GridError::Rejected("EOrder:Insufficient funds".into()).is_retryable());
        assert!(!GridError::Authentication("EAPI:Invalid key".into()).is_retryable());
        assert!(!GridError::RetriesExhausted {
            attempts: 3,
            reason: "timeout".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_io_error_maps_to_persistence() {
        let err: GridError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, GridError::StatePersistence(_)));
    }
}
