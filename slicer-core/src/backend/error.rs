use std::time::Duration;

use thiserror::Error;

use crate::config::StorageKind;

/// Failures that prevent a session from being opened or a destination
/// from being prepared. These abort the whole job.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("incomplete {storage} credentials, missing: {missing}")]
    InvalidCredentials { storage: StorageKind, missing: String },
    #[error("cannot reach {address}: {message}")]
    Unreachable { address: String, message: String },
    #[error("secure channel setup failed: {0}")]
    Tls(String),
    #[error("login rejected: {0}")]
    Auth(String),
    #[error("invalid endpoint {endpoint}: {message}")]
    InvalidEndpoint { endpoint: String, message: String },
    #[error("cannot prepare remote directory {path}: {message}")]
    Destination { path: String, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Per-file transfer failure, classified by the backend that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("transient transfer failure: {message}")]
    Transient { message: String, retry_after: Duration },
    #[error("permanent transfer failure: {message}")]
    Permanent { message: String },
}

impl TransferError {
    pub fn transient(message: impl Into<String>, retry_after: Duration) -> Self {
        TransferError::Transient {
            message: message.into(),
            retry_after,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        TransferError::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Transient { .. })
    }

    pub fn retry_after(&self) -> Duration {
        match self {
            TransferError::Transient { retry_after, .. } => *retry_after,
            TransferError::Permanent { .. } => Duration::ZERO,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TransferError::Transient { message, .. } | TransferError::Permanent { message } => {
                message
            }
        }
    }
}

pub type ConnectResult<T> = Result<T, ConnectError>;
pub type TransferResult<T> = Result<T, TransferError>;
