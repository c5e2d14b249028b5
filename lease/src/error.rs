use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Registration with the lease driver failed")]
    RegisterWithLeaseDriverFailed,

    #[error("Lease driver asked for the registration to be retried")]
    Retry,

    #[error("Operation failed: lease agent is not open")]
    OperationFailed,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation canceled")]
    Canceled,

    #[error("Security settings cannot be upgraded: {reason}")]
    SecurityDowngrade { reason: String },

    #[error("Invalid security settings: {0}")]
    InvalidSecurity(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IPC request failed: {0}")]
    Ipc(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for the outcome callers are expected to re-attempt.
    pub fn is_retry(&self) -> bool {
        matches!(self, Error::Retry)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
