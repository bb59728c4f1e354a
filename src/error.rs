//! Redlock Error Types

use thiserror::Error;

/// Result type alias for Redlock operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a single acquisition (or extension) round did not produce a lock
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttemptFailure {
    /// Fewer stores than the quorum accepted the operation
    QuorumNotReached { reached: usize, required: usize },
    /// Quorum was reached but elapsed time plus drift consumed the whole TTL
    ValidityExhausted { validity_ms: f64 },
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFailure::QuorumNotReached { reached, required } => {
                write!(f, "quorum not reached: {}/{}", reached, required)
            }
            AttemptFailure::ValidityExhausted { validity_ms } => {
                write!(f, "validity exhausted: {:.1}ms left", validity_ms)
            }
        }
    }
}

/// Redlock error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Lock protocol outcomes
    #[error("Lock on '{resource}' not acquired after {attempts} attempt(s): {reason}")]
    NotAcquired {
        resource: String,
        attempts: u32,
        reason: AttemptFailure,
    },

    #[error("Operation cancelled")]
    Cancelled,

    // Store errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is an ordinary "lock is held elsewhere" outcome
    pub fn is_not_acquired(&self) -> bool {
        matches!(self, Error::NotAcquired { .. })
    }

    /// Check if trying again later can succeed.
    ///
    /// Only [`Error::NotAcquired`] qualifies: store failures never reach
    /// [`crate::LockManager`] callers, and configuration errors repeat.
    pub fn is_retryable(&self) -> bool {
        self.is_not_acquired()
    }

    /// Check if this error came from a single store rather than the protocol
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            Error::Redis(_) | Error::StoreUnavailable(_) | Error::ConnectionTimeout(_)
        )
    }
}
