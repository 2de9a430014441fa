//! WolfLease Error Types

use thiserror::Error;

/// Result type alias for WolfLease operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfLease error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Lock store errors
    #[error("Lock store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Lock record already exists: {0}")]
    AlreadyExists(String),

    #[error("Version conflict on {key}: expected {expected}")]
    Conflict { key: String, expected: String },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_)
                | Error::AlreadyExists(_)
                | Error::Conflict { .. }
                | Error::Network(_)
        )
    }

    /// Check if this error means another participant won the write
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::AlreadyExists(_) | Error::Conflict { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::StoreUnavailable(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_is_retryable() {
        let conflict = Error::Conflict {
            key: "default/web".to_string(),
            expected: "3".to_string(),
        };
        assert!(conflict.is_contention());
        assert!(conflict.is_retryable());

        let exists = Error::AlreadyExists("default/web".to_string());
        assert!(exists.is_contention());

        let unavailable = Error::StoreUnavailable("timeout".to_string());
        assert!(unavailable.is_retryable());
        assert!(!unavailable.is_contention());
    }

    #[test]
    fn test_config_is_fatal() {
        let err = Error::Config("election.name cannot be empty".to_string());
        assert!(!err.is_retryable());
        assert!(!err.is_contention());
    }
}
