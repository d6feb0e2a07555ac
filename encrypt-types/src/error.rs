// SPDX-License-Identifier: GPL-3.0-only

//! Job failure kinds and the signed result codes surfaced to callers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every way a job can end other than plain success.
///
/// The numeric value of each kind is stable: clients compare the negated value
/// against the code carried by result signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("operation recorded, reboot required to complete it")]
    RebootRequired,
    #[error("authorization denied or cancelled")]
    UserCancelled,
    #[error("invalid parameters")]
    ParamsInvalid,
    #[error("mount point cannot be encrypted")]
    DisabledMountPoint,
    #[error("device is already encrypted")]
    DeviceEncrypted,
    #[error("device is mounted")]
    DeviceMounted,
    #[error("device has a job in progress")]
    DeviceBusy,
    #[error("volume header carries unexpected reencryption flags")]
    WrongFlags,
    #[error("failed to open or write job file")]
    OpenFileFailed,
    #[error("failed to create detached header")]
    CreateHeader,
    #[error("failed to apply header to device")]
    ApplyHeader,
    #[error("failed to initialize crypt context")]
    InitCrypt,
    #[error("failed to load volume header")]
    LoadCrypt,
    #[error("failed to set data offset")]
    SetOffset,
    #[error("failed to format LUKS2 header")]
    FormatLuks,
    #[error("failed to add keyslot")]
    AddKeyslot,
    #[error("failed to initialize reencryption")]
    InitReencrypt,
    #[error("reencryption failed")]
    ReencryptFailed,
    #[error("failed to activate volume")]
    Active,
    #[error("failed to deactivate volume")]
    Deactivate,
    #[error("failed to back up volume header")]
    BackupHeader,
    #[error("failed to restore header from file")]
    RestoreFromFile,
    #[error("failed to read reencryption flags")]
    GetReencryptFlag,
    #[error("passphrase rejected")]
    WrongPassphrase,
    #[error("filesystem resize failed")]
    ResizeFs,
    #[error("failed to change passphrase")]
    ChangePassphraseFailed,
    #[error("failed to write token")]
    SetTokenFailed,
    #[error("failed to set label")]
    SetLabel,
    #[error("failed to update fstab")]
    OpenFstabFailed,
    #[error("failed to update crypttab")]
    OpenCrypttabFailed,
    #[error("passphrase rollback failed, volume may not open with the previous passphrase")]
    PassphraseRollbackFailed,
    #[error("unknown error")]
    Unknown,
}

/// Coarse grouping of [`ErrorKind`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    DeviceState,
    CryptoOperation,
    Persistence,
    /// Not a failure: the work was recorded for the next boot.
    Deferred,
    Authorization,
}

const ALL_KINDS: [ErrorKind; 32] = [
    ErrorKind::RebootRequired,
    ErrorKind::UserCancelled,
    ErrorKind::ParamsInvalid,
    ErrorKind::DisabledMountPoint,
    ErrorKind::DeviceEncrypted,
    ErrorKind::DeviceMounted,
    ErrorKind::DeviceBusy,
    ErrorKind::WrongFlags,
    ErrorKind::OpenFileFailed,
    ErrorKind::CreateHeader,
    ErrorKind::ApplyHeader,
    ErrorKind::InitCrypt,
    ErrorKind::LoadCrypt,
    ErrorKind::SetOffset,
    ErrorKind::FormatLuks,
    ErrorKind::AddKeyslot,
    ErrorKind::InitReencrypt,
    ErrorKind::ReencryptFailed,
    ErrorKind::Active,
    ErrorKind::Deactivate,
    ErrorKind::BackupHeader,
    ErrorKind::RestoreFromFile,
    ErrorKind::GetReencryptFlag,
    ErrorKind::WrongPassphrase,
    ErrorKind::ResizeFs,
    ErrorKind::ChangePassphraseFailed,
    ErrorKind::SetTokenFailed,
    ErrorKind::SetLabel,
    ErrorKind::OpenFstabFailed,
    ErrorKind::OpenCrypttabFailed,
    ErrorKind::PassphraseRollbackFailed,
    ErrorKind::Unknown,
];

impl ErrorKind {
    /// Stable positive value; result codes carry its negation.
    pub fn value(self) -> i32 {
        match self {
            Self::RebootRequired => 1,
            Self::UserCancelled => 2,
            Self::ParamsInvalid => 3,
            Self::DisabledMountPoint => 4,
            Self::DeviceEncrypted => 5,
            Self::DeviceMounted => 6,
            Self::DeviceBusy => 7,
            Self::WrongFlags => 8,
            Self::OpenFileFailed => 9,
            Self::CreateHeader => 10,
            Self::ApplyHeader => 11,
            Self::InitCrypt => 12,
            Self::LoadCrypt => 13,
            Self::SetOffset => 14,
            Self::FormatLuks => 15,
            Self::AddKeyslot => 16,
            Self::InitReencrypt => 17,
            Self::ReencryptFailed => 18,
            Self::Active => 19,
            Self::Deactivate => 20,
            Self::BackupHeader => 21,
            Self::RestoreFromFile => 22,
            Self::GetReencryptFlag => 23,
            Self::WrongPassphrase => 24,
            Self::ResizeFs => 25,
            Self::ChangePassphraseFailed => 26,
            Self::SetTokenFailed => 27,
            Self::SetLabel => 28,
            Self::OpenFstabFailed => 29,
            Self::OpenCrypttabFailed => 30,
            Self::PassphraseRollbackFailed => 31,
            Self::Unknown => 32,
        }
    }

    pub fn from_value(value: i32) -> Option<Self> {
        ALL_KINDS.into_iter().find(|kind| kind.value() == value)
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            Self::RebootRequired => ErrorCategory::Deferred,
            Self::UserCancelled => ErrorCategory::Authorization,
            Self::ParamsInvalid | Self::DisabledMountPoint => ErrorCategory::Validation,
            Self::DeviceEncrypted
            | Self::DeviceMounted
            | Self::DeviceBusy
            | Self::WrongFlags
            | Self::ResizeFs => ErrorCategory::DeviceState,
            Self::OpenFileFailed
            | Self::CreateHeader
            | Self::OpenFstabFailed
            | Self::OpenCrypttabFailed => ErrorCategory::Persistence,
            Self::ApplyHeader
            | Self::InitCrypt
            | Self::LoadCrypt
            | Self::SetOffset
            | Self::FormatLuks
            | Self::AddKeyslot
            | Self::InitReencrypt
            | Self::ReencryptFailed
            | Self::Active
            | Self::Deactivate
            | Self::BackupHeader
            | Self::RestoreFromFile
            | Self::GetReencryptFlag
            | Self::WrongPassphrase
            | Self::ChangePassphraseFailed
            | Self::SetTokenFailed
            | Self::SetLabel
            | Self::PassphraseRollbackFailed
            | Self::Unknown => ErrorCategory::CryptoOperation,
        }
    }
}

/// Signed result code of a finished job: `0` on success, `-kind.value()` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobResult(i32);

impl JobResult {
    pub const SUCCESS: JobResult = JobResult(0);

    pub fn failed(kind: ErrorKind) -> Self {
        Self(-kind.value())
    }

    pub fn code(self) -> i32 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// The failure kind, `None` for success or an unrecognized code.
    pub fn kind(self) -> Option<ErrorKind> {
        if self.0 < 0 {
            ErrorKind::from_value(-self.0)
        } else {
            None
        }
    }
}

impl From<ErrorKind> for JobResult {
    fn from(kind: ErrorKind) -> Self {
        Self::failed(kind)
    }
}

impl From<Result<(), ErrorKind>> for JobResult {
    fn from(result: Result<(), ErrorKind>) -> Self {
        match result {
            Ok(()) => Self::SUCCESS,
            Err(kind) => Self::failed(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn values_are_unique_and_resolve_back() {
        let values: HashSet<i32> = ALL_KINDS.iter().map(|k| k.value()).collect();
        assert_eq!(values.len(), ALL_KINDS.len());
        for kind in ALL_KINDS {
            assert_eq!(ErrorKind::from_value(kind.value()), Some(kind));
        }
    }

    #[test]
    fn job_result_codes_are_negated_kinds() {
        let result = JobResult::failed(ErrorKind::DeviceEncrypted);
        assert_eq!(result.code(), -5);
        assert_eq!(result.kind(), Some(ErrorKind::DeviceEncrypted));
        assert!(!result.is_success());

        assert!(JobResult::from(Ok(())).is_success());
        assert_eq!(JobResult::SUCCESS.kind(), None);
    }

    #[test]
    fn reboot_required_is_deferred_not_an_error_category() {
        assert_eq!(ErrorKind::RebootRequired.category(), ErrorCategory::Deferred);
        assert_eq!(
            ErrorKind::UserCancelled.category(),
            ErrorCategory::Authorization
        );
        assert_eq!(ErrorKind::WrongFlags.category(), ErrorCategory::DeviceState);
        assert_eq!(
            ErrorKind::OpenCrypttabFailed.category(),
            ErrorCategory::Persistence
        );
    }

    #[test]
    fn result_serializes_as_plain_integer() {
        let json = serde_json::to_string(&JobResult::failed(ErrorKind::RebootRequired))
            .expect("serialize");
        assert_eq!(json, "-1");
    }
}
