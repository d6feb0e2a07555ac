// SPDX-License-Identifier: GPL-3.0-only

//! Requests accepted by the service, as JSON objects with kebab-case keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

const REDACTED: &str = "<redacted>";

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "" } else { REDACTED }
}

/// How the volume key is unlocked at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum KeyMode {
    /// Passphrase only.
    #[default]
    Pin,
    /// Trust module sealed key plus a PIN.
    TpmPin,
    /// Trust module sealed key, no user input.
    Tpm,
}

impl KeyMode {
    /// Name recorded in the persisted job config.
    pub fn as_config_str(self) -> &'static str {
        match self {
            Self::Pin => "pin",
            Self::TpmPin => "tpm-pin",
            Self::Tpm => "tpm",
        }
    }

    pub fn from_config_str(value: &str) -> Option<Self> {
        match value {
            "pin" => Some(Self::Pin),
            "tpm-pin" => Some(Self::TpmPin),
            "tpm" => Some(Self::Tpm),
            _ => None,
        }
    }
}

impl TryFrom<u8> for KeyMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pin),
            1 => Ok(Self::TpmPin),
            2 => Ok(Self::Tpm),
            other => Err(format!("unknown encrypt mode {other}")),
        }
    }
}

impl From<KeyMode> for u8 {
    fn from(mode: KeyMode) -> Self {
        match mode {
            KeyMode::Pin => 0,
            KeyMode::TpmPin => 1,
            KeyMode::Tpm => 2,
        }
    }
}

/// Parameters of `PrepareEncrypt`, also used to feed a waiting resume job.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EncryptRequest {
    pub device: String,
    pub uuid: String,
    /// Cipher algorithm such as `aes` or `sm4`; the mode is always `xts-plain64`.
    pub cipher: String,
    pub passphrase: String,
    #[serde(rename = "encrypt-mode")]
    pub mode: KeyMode,
    pub device_name: String,
    pub mount_point: String,
    /// Record the job and finish it at the next boot.
    pub init_params_only: bool,
    pub recovery_export_path: Option<String>,
    pub tpm_config: Option<String>,
    pub tpm_token: Option<String>,
    /// UUID of the device beneath a stacked mapping, used for crypttab lookup.
    pub backing_dev_uuid: Option<String>,
}

impl EncryptRequest {
    /// Checks that only need the request itself.
    pub fn check_shape(&self) -> Result<(), ErrorKind> {
        if self.device.is_empty() || self.passphrase.is_empty() || self.cipher.is_empty() {
            return Err(ErrorKind::ParamsInvalid);
        }
        Ok(())
    }

    pub fn recovery_dir(&self) -> Option<&str> {
        self.recovery_export_path
            .as_deref()
            .filter(|path| !path.is_empty())
    }

    pub fn tpm_token(&self) -> Option<&str> {
        self.tpm_token.as_deref().filter(|token| !token.is_empty())
    }

    pub fn backing_dev_uuid(&self) -> Option<&str> {
        self.backing_dev_uuid
            .as_deref()
            .filter(|uuid| !uuid.is_empty())
    }
}

impl fmt::Debug for EncryptRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptRequest")
            .field("device", &self.device)
            .field("uuid", &self.uuid)
            .field("cipher", &self.cipher)
            .field("passphrase", &redact(&self.passphrase))
            .field("mode", &self.mode)
            .field("device_name", &self.device_name)
            .field("mount_point", &self.mount_point)
            .field("init_params_only", &self.init_params_only)
            .field("recovery_export_path", &self.recovery_export_path)
            .field("tpm_token", &self.tpm_token.as_deref().map(redact))
            .field("backing_dev_uuid", &self.backing_dev_uuid)
            .finish()
    }
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DecryptRequest {
    pub device: String,
    pub uuid: String,
    pub passphrase: String,
    pub device_name: String,
    pub init_params_only: bool,
}

impl fmt::Debug for DecryptRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptRequest")
            .field("device", &self.device)
            .field("uuid", &self.uuid)
            .field("passphrase", &redact(&self.passphrase))
            .field("device_name", &self.device_name)
            .field("init_params_only", &self.init_params_only)
            .finish()
    }
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ChangePassphraseRequest {
    pub device: String,
    pub device_name: String,
    /// Current passphrase, or the recovery key when `validate_with_rec_key` is set.
    pub old_passphrase: String,
    pub passphrase: String,
    pub tpm_token: Option<String>,
    pub validate_with_rec_key: bool,
}

impl ChangePassphraseRequest {
    pub fn tpm_token(&self) -> Option<&str> {
        self.tpm_token.as_deref().filter(|token| !token.is_empty())
    }
}

impl fmt::Debug for ChangePassphraseRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangePassphraseRequest")
            .field("device", &self.device)
            .field("device_name", &self.device_name)
            .field("old_passphrase", &redact(&self.old_passphrase))
            .field("passphrase", &redact(&self.passphrase))
            .field("tpm_token", &self.tpm_token.as_deref().map(redact))
            .field("validate_with_rec_key", &self.validate_with_rec_key)
            .finish()
    }
}
