// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;
use zbus::fdo;

/// Errors surfaced before a job is started. Job failures travel as
/// result codes in events instead.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid config {path}: {reason}")]
    Config { path: String, reason: String },
}

impl From<ServiceError> for fdo::Error {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidArgument(msg) => fdo::Error::InvalidArgs(msg),
            ServiceError::Config { .. } => fdo::Error::Failed(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
