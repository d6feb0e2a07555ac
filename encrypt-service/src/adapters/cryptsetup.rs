// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use async_trait::async_trait;
use encrypt_sys::{CryptTarget, Cryptsetup, ReencryptArgs, ReencryptProgress, SysError};
use encrypt_types::Requirement;
use enumflags2::BitFlags;

use crate::backend::{CryptBackend, ProgressSink};

/// [`CryptBackend`] on top of the `cryptsetup` command.
pub struct CryptsetupBackend {
    cli: Cryptsetup,
}

impl CryptsetupBackend {
    pub fn new(cli: Cryptsetup) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl CryptBackend for CryptsetupBackend {
    async fn initialize(
        &self,
        target: &CryptTarget,
        params: &ReencryptArgs,
        passphrase: &str,
    ) -> Result<u32, SysError> {
        self.cli
            .reencrypt(target, params, passphrase.as_bytes(), &|_: ReencryptProgress| {})
            .await?;
        self.cli.unlocked_slot(target, passphrase.as_bytes()).await
    }

    async fn add_keyslot(
        &self,
        target: &CryptTarget,
        existing: &str,
        new: &str,
    ) -> Result<u32, SysError> {
        self.cli
            .add_key(target, existing.as_bytes(), new.as_bytes())
            .await?;
        self.cli.unlocked_slot(target, new.as_bytes()).await
    }

    async fn change_keyslot(
        &self,
        target: &CryptTarget,
        old: &str,
        new: &str,
    ) -> Result<u32, SysError> {
        self.cli
            .change_key(target, old.as_bytes(), new.as_bytes())
            .await?;
        self.cli.unlocked_slot(target, new.as_bytes()).await
    }

    async fn destroy_keyslot(
        &self,
        target: &CryptTarget,
        slot: u32,
        remaining: &str,
    ) -> Result<(), SysError> {
        self.cli.kill_slot(target, slot, remaining.as_bytes()).await
    }

    async fn requirements(&self, target: &CryptTarget) -> Result<BitFlags<Requirement>, SysError> {
        Ok(self.cli.metadata(target).await?.requirements)
    }

    async fn data_offset(&self, target: &CryptTarget) -> Result<u64, SysError> {
        self.cli
            .metadata(target)
            .await?
            .data_offset
            .ok_or_else(|| SysError::Parse(format!("no data segment in header of {}", target.device)))
    }

    async fn reencrypt(
        &self,
        target: &CryptTarget,
        params: &ReencryptArgs,
        passphrase: &str,
        progress: ProgressSink<'_>,
    ) -> Result<(), SysError> {
        let forward = |p: ReencryptProgress| progress(p.offset, p.size);
        self.cli
            .reencrypt(target, params, passphrase.as_bytes(), &forward)
            .await
    }

    async fn activate(
        &self,
        target: &CryptTarget,
        name: &str,
        passphrase: &str,
    ) -> Result<(), SysError> {
        self.cli.open(target, name, passphrase.as_bytes()).await
    }

    async fn deactivate(&self, name: &str) -> Result<(), SysError> {
        self.cli.close(name).await
    }

    async fn backup_header(&self, device: &str, file: &Path) -> Result<(), SysError> {
        self.cli.header_backup(device, file).await
    }

    async fn restore_header(&self, device: &str, file: &Path) -> Result<(), SysError> {
        self.cli.header_restore(device, file).await
    }

    async fn token(&self, device: &str, id: u32) -> Result<Option<String>, SysError> {
        self.cli.token_export(device, id).await
    }

    async fn set_token(&self, device: &str, id: Option<u32>, json: &str) -> Result<(), SysError> {
        self.cli.token_import(device, id, json).await
    }

    async fn set_label(&self, device: &str, label: &str) -> Result<(), SysError> {
        self.cli.set_label(device, label).await
    }
}
