// SPDX-License-Identifier: GPL-3.0-only

//! Job records persisted outside the encrypted volume.
//!
//! The files live on the boot partition so the early-boot unlock helpers can read
//! them. Key names are shared with those helpers and must not change.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::params::{EncryptRequest, KeyMode};
use crate::{device_basename, mapper_name};

/// Mode appended to the cipher algorithm of every volume this service creates.
pub const CIPHER_MODE: &str = "xts-plain64";
/// Volume key size in bits.
pub const KEY_SIZE_BITS: u32 = 256;

/// Contents of `encrypt.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EncryptJobConfig {
    /// Mapper name of the opened volume, also the clear device for resume.
    pub volume: String,
    /// `UUID=<uuid>` of the backing device.
    pub device: String,
    pub device_path: String,
    pub device_name: String,
    #[serde(rename = "device-mountpoint")]
    pub mount_point: String,
    /// Full cipher spec, `aes-xts-plain64`.
    pub cipher: String,
    pub key_size: String,
    pub mode: String,
    #[serde(rename = "recoverykey-path")]
    pub recovery_key_path: String,
    pub tpm_config: Map<String, Value>,
}

impl EncryptJobConfig {
    pub fn from_request(req: &EncryptRequest) -> Self {
        let recovery_key_path = req
            .recovery_dir()
            .map(|dir| {
                format!("{dir}/recovery_key_{}.txt", device_basename(&req.device))
                    .replace("//", "/")
            })
            .unwrap_or_default();

        let tpm_config = req
            .tpm_config
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Map<String, Value>>(raw).ok())
            .unwrap_or_default();

        Self {
            volume: mapper_name(&req.device),
            device: format!("UUID={}", req.uuid),
            device_path: req.device.clone(),
            device_name: req.device_name.clone(),
            mount_point: req.mount_point.clone(),
            cipher: format!("{}-{CIPHER_MODE}", req.cipher),
            key_size: KEY_SIZE_BITS.to_string(),
            mode: req.mode.as_config_str().to_string(),
            recovery_key_path,
            tpm_config,
        }
    }

    /// Directory the recovery key file goes to when the job finishes.
    pub fn recovery_dir(&self) -> Option<&str> {
        if self.recovery_key_path.is_empty() {
            return None;
        }
        self.recovery_key_path
            .rsplit_once('/')
            .map(|(dir, _)| if dir.is_empty() { "/" } else { dir })
    }

    pub fn key_mode(&self) -> Option<KeyMode> {
        KeyMode::from_config_str(&self.mode)
    }

    pub fn key_config(&self) -> KeyConfig {
        KeyConfig {
            device: self.device_path.clone(),
            device_name: self.device_name.clone(),
            mode: self.mode.clone(),
            tpm_config: self.tpm_config.clone(),
        }
    }
}

/// What a client needs to know to collect the missing parameters of a
/// pending job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct KeyConfig {
    pub device: String,
    pub device_name: String,
    pub mode: String,
    pub tpm_config: Map<String, Value>,
}

/// Contents of `decrypt.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DecryptJobConfig {
    pub device_path: String,
    /// `UUID=<uuid>` of the device.
    pub device: String,
}

impl DecryptJobConfig {
    pub fn new(device: &str, uuid: &str) -> Self {
        Self {
            device_path: device.to_string(),
            device: format!("UUID={uuid}"),
        }
    }
}
