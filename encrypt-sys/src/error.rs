// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("No key available with this passphrase: {0}")]
    KeyRejected(String),

    #[error("{command} failed (exit code {status}): {diagnostic}")]
    CommandFailed {
        command: String,
        status: i32,
        diagnostic: String,
    },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl From<serde_json::Error> for SysError {
    fn from(err: serde_json::Error) -> Self {
        SysError::Parse(err.to_string())
    }
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
