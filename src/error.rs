//! WolfCoord Error Types
//!
//! Nothing in here is fatal to the application. Lease denial and slot
//! contention are ordinary outcomes and live in their own result enums;
//! these variants cover authority loss, abandoned work and plumbing failures.

use thiserror::Error;

/// Result type alias for WolfCoord operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfCoord error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Authority errors
    #[error("Lease on {resource_key} expired")]
    Expired { resource_key: String },

    #[error("Stale query ticket for {0}")]
    StaleTicket(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    // Transport errors
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Corrupt message: {0}")]
    CorruptMessage(String),

    #[error("Wire serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Result serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // State errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Lifecycle errors
    #[error("Coordinator has not joined")]
    NotJoined,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if the caller may simply try the same operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StaleTicket(_) | Error::TransportUnavailable(_)
        )
    }

    /// Check if this error means the caller must stop acting under the
    /// authority it believed it had
    pub fn revokes_authority(&self) -> bool {
        matches!(self, Error::Expired { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::StaleTicket("q".into()).is_retryable());
        assert!(Error::TransportUnavailable("down".into()).is_retryable());
        assert!(!Error::QueryFailed("boom".into()).is_retryable());

        let expired = Error::Expired { resource_key: "todos".into() };
        assert!(expired.revokes_authority());
        assert!(!expired.is_retryable());
        assert_eq!(expired.to_string(), "Lease on todos expired");
    }
}
