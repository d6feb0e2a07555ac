// SPDX-License-Identifier: GPL-3.0-only

//! Collaborators the lifecycle engine drives.
//!
//! Production implementations live in [`crate::adapters`]; tests substitute
//! recording fakes.

use std::path::Path;

use async_trait::async_trait;
use encrypt_sys::{CryptTarget, ReencryptArgs, SysError};
use encrypt_types::{EncryptVersion, Requirement};
use enumflags2::BitFlags;

/// Receives `(offset, size)` while a reencryption runs.
pub type ProgressSink<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// The LUKS2 volume library contract.
#[async_trait]
pub trait CryptBackend: Send + Sync {
    /// Writes a fresh header that records the encryption planned by an
    /// initialize-only `params` and installs `passphrase`; returns its keyslot.
    async fn initialize(
        &self,
        target: &CryptTarget,
        params: &ReencryptArgs,
        passphrase: &str,
    ) -> Result<u32, SysError>;

    /// Adds a keyslot for `new`, authorized by `existing`; returns the new slot.
    async fn add_keyslot(
        &self,
        target: &CryptTarget,
        existing: &str,
        new: &str,
    ) -> Result<u32, SysError>;

    /// Replaces the keyslot opened by `old`; returns the slot now holding `new`.
    async fn change_keyslot(
        &self,
        target: &CryptTarget,
        old: &str,
        new: &str,
    ) -> Result<u32, SysError>;

    async fn destroy_keyslot(
        &self,
        target: &CryptTarget,
        slot: u32,
        remaining: &str,
    ) -> Result<(), SysError>;

    /// Persistent requirement flags of the header.
    async fn requirements(&self, target: &CryptTarget) -> Result<BitFlags<Requirement>, SysError>;

    /// Byte offset of the data segment the header describes.
    async fn data_offset(&self, target: &CryptTarget) -> Result<u64, SysError>;

    async fn reencrypt(
        &self,
        target: &CryptTarget,
        params: &ReencryptArgs,
        passphrase: &str,
        progress: ProgressSink<'_>,
    ) -> Result<(), SysError>;

    async fn activate(
        &self,
        target: &CryptTarget,
        name: &str,
        passphrase: &str,
    ) -> Result<(), SysError>;

    async fn deactivate(&self, name: &str) -> Result<(), SysError>;

    async fn backup_header(&self, device: &str, file: &Path) -> Result<(), SysError>;

    async fn restore_header(&self, device: &str, file: &Path) -> Result<(), SysError>;

    /// Token JSON stored under `id`, `None` if the id is free.
    async fn token(&self, device: &str, id: u32) -> Result<Option<String>, SysError>;

    /// Writes `json` under `id`, or under any free id when `None`.
    async fn set_token(&self, device: &str, id: Option<u32>, json: &str) -> Result<(), SysError>;

    async fn set_label(&self, device: &str, label: &str) -> Result<(), SysError>;
}

/// Properties of one block device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockInfo {
    /// Kernel device node, `/dev/sdb1`.
    pub device: String,
    pub uuid: String,
    pub id_type: String,
    pub id_version: String,
    pub mount_points: Vec<String>,
    /// Exposes an encrypted-volume interface.
    pub encrypted: bool,
}

impl BlockInfo {
    pub fn version(&self) -> EncryptVersion {
        EncryptVersion::from_id_fields(&self.id_type, &self.id_version, self.encrypted)
    }

    pub fn is_mounted(&self) -> bool {
        !self.mount_points.is_empty()
    }
}

#[async_trait]
pub trait BlockDevices: Send + Sync {
    async fn list(&self) -> Result<Vec<BlockInfo>, SysError>;

    async fn find(&self, device: &str) -> Result<Option<BlockInfo>, SysError> {
        Ok(self.list().await?.into_iter().find(|b| b.device == device))
    }

    fn is_block_device(&self, device: &str) -> bool;
}

/// Filesystem resize primitives keyed by device path.
#[async_trait]
pub trait FsResizer: Send + Sync {
    async fn shrink(&self, device: &str, reserve_bytes: u64) -> Result<(), SysError>;

    async fn expand(&self, device: &str) -> Result<(), SysError>;

    /// Moves a filesystem found `data_offset` bytes into `device` back to
    /// its start and grows it to fill the device.
    async fn recover(&self, device: &str, data_offset: u64) -> Result<(), SysError>;
}

/// Optional recovery key source. Without one, keys are derived from a
/// random UUID.
#[async_trait]
pub trait RecoveryKeyGenerator: Send + Sync {
    async fn generate(&self) -> Option<String>;
}

/// Length of a generated recovery key.
pub const RECOVERY_KEY_LEN: usize = 24;

pub fn fallback_recovery_key() -> String {
    let mut key = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    key.truncate(RECOVERY_KEY_LEN);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_key_has_fixed_length() {
        let key = fallback_recovery_key();
        assert_eq!(key.len(), RECOVERY_KEY_LEN);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, fallback_recovery_key());
    }

    #[test]
    fn block_info_derives_state() {
        let info = BlockInfo {
            device: "/dev/sdb1".into(),
            id_type: "crypto_LUKS".into(),
            id_version: "2".into(),
            encrypted: true,
            ..Default::default()
        };
        assert_eq!(info.version(), EncryptVersion::Luks2);
        assert!(!info.is_mounted());
    }
}
