//! Error types for aitrack-core

use thiserror::Error;

/// Main error type for the aitrack-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Secret missing or unusable; the batch cannot be signed
    #[error("signing error: {0}")]
    Signing(String),

    /// Network unreachable, timeout, or other transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Endpoint answered with a non-2xx status
    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },

    /// The capture pipeline has been shut down
    #[error("capture pipeline is shut down")]
    Closed,
}

impl Error {
    /// Whether a delivery attempt that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Server { .. })
    }
}

/// Terminal outcome of a delivery cycle that did not reach the endpoint
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Connectivity was lost before (or between) attempts
    #[error("offline after {attempts} attempt(s)")]
    Offline { attempts: u32 },

    /// Every allowed attempt failed
    #[error("gave up after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: Error },
}

impl DeliveryError {
    /// Network attempts actually made
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryError::Offline { attempts } | DeliveryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Result type alias for aitrack-core
pub type Result<T> = std::result::Result<T, Error>;
