// SPDX-License-Identifier: GPL-3.0-only

//! Volume Header Manager.
//!
//! A new LUKS2 header is built in a scratch file next to the device, then
//! restored onto the device in one step. Any failure between the filesystem
//! shrink and a successful restore grows the filesystem back.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use encrypt_sys::{CryptTarget, HEADER_FILE_SIZE, ScratchHeader, SysError};
use encrypt_types::{EncryptRequest, ErrorKind, device_basename, mapper_name};

use super::{fail, mapper_path, reencrypt};
use crate::context::JobContext;

/// Data segment offset of a converted device, in 512-byte sectors.
pub const DATA_OFFSET_SECTORS: u64 = HEADER_FILE_SIZE / 512;

/// Keyslots installed while formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySlots {
    pub passphrase: u32,
    pub recovery: Option<u32>,
}

/// A formatted header waiting to be spliced onto its device.
#[derive(Debug)]
pub struct PreparedHeader {
    pub file: ScratchHeader,
    pub slots: KeySlots,
}

pub struct HeaderManager<'a> {
    ctx: &'a JobContext,
}

impl<'a> HeaderManager<'a> {
    pub fn new(ctx: &'a JobContext) -> Self {
        Self { ctx }
    }

    /// Allocates the scratch header file for `device`.
    ///
    /// An existing file belongs to a job already in flight and fails the call.
    pub fn prepare_detached_header(&self, device: &str) -> Result<ScratchHeader, ErrorKind> {
        ScratchHeader::allocate(&self.ctx.config.scratch_dir, device).map_err(|e| match e {
            SysError::AlreadyExists(path) => {
                tracing::warn!("{}: header file {} already exists", device, path);
                ErrorKind::OpenFileFailed
            }
            other => fail(ErrorKind::CreateHeader, device)(other),
        })
    }

    /// Full header preparation: allocate, shrink, format and initialize.
    ///
    /// On failure the scratch file is gone and the filesystem is grown back.
    pub async fn create(&self, req: &EncryptRequest) -> Result<PreparedHeader, ErrorKind> {
        let device = req.device.as_str();
        let file = self.prepare_detached_header(device)?;

        tracing::info!("{}: shrinking filesystem by {} bytes", device, HEADER_FILE_SIZE);
        if let Err(e) = self.ctx.resizer.shrink(device, HEADER_FILE_SIZE).await {
            tracing::warn!("{}: shrinking filesystem failed: {}", device, e);
            drop(file);
            self.undo_shrink(device).await;
            return Err(ErrorKind::ResizeFs);
        }

        match self.format_and_initialize(req, file.path()).await {
            Ok(slots) => Ok(PreparedHeader { file, slots }),
            Err(kind) => {
                drop(file);
                self.undo_shrink(device).await;
                Err(kind)
            }
        }
    }

    /// Writes the header at `header` with the pending encryption recorded,
    /// installs the keyslots and grows the filesystem over the mapping.
    pub async fn format_and_initialize(
        &self,
        req: &EncryptRequest,
        header: &Path,
    ) -> Result<KeySlots, ErrorKind> {
        let device = req.device.as_str();
        let target = CryptTarget::detached(device, header);
        let crypt = &self.ctx.crypt;

        let plan = reencrypt::encrypt_initialize(&req.cipher);
        tracing::info!("{}: initializing detached header with {}", device, req.cipher);
        let passphrase = crypt
            .initialize(&target, &plan, &req.passphrase)
            .await
            .map_err(fail(ErrorKind::InitReencrypt, device))?;

        let recovery = match req.recovery_dir() {
            Some(dir) => self.add_recovery_key(&target, dir, &req.passphrase).await,
            None => None,
        };

        // The filesystem must believe it owns the whole data segment before
        // any block is encrypted.
        let name = mapper_name(device);
        crypt
            .activate(&target, &name, &req.passphrase)
            .await
            .map_err(fail(ErrorKind::Active, device))?;
        if let Err(e) = self.ctx.resizer.expand(&mapper_path(&name)).await {
            tracing::warn!("{}: expanding filesystem on {} failed: {}", device, name, e);
        }
        crypt
            .deactivate(&name)
            .await
            .map_err(fail(ErrorKind::Deactivate, device))?;

        Ok(KeySlots {
            passphrase,
            recovery,
        })
    }

    /// Grows the filesystem on `device` back to the full device.
    async fn undo_shrink(&self, device: &str) {
        match self.ctx.resizer.expand(device).await {
            Ok(()) => tracing::info!("{}: filesystem grown back", device),
            Err(e) => tracing::error!("{}: filesystem left shrunk: {}", device, e),
        }
    }

    /// Missing recovery keys are not fatal; the volume stays usable with the
    /// passphrase alone.
    async fn add_recovery_key(
        &self,
        target: &CryptTarget,
        dir: &str,
        passphrase: &str,
    ) -> Option<u32> {
        let key = self.ctx.recovery_key().await;
        if let Err(kind) = export_recovery_key(Path::new(dir), &target.device, &key) {
            tracing::warn!("{}: recovery key not exported ({})", target.device, kind);
            return None;
        }
        match self.ctx.crypt.add_keyslot(target, passphrase, &key).await {
            Ok(slot) => Some(slot),
            Err(e) => {
                tracing::warn!("{}: adding recovery keyslot failed: {}", target.device, e);
                None
            }
        }
    }

    /// Restores the prepared header onto the device. The scratch file is
    /// removed whatever the outcome; on failure the filesystem shrunk by
    /// [`Self::create`] is grown back.
    pub async fn splice_header_onto_device(
        &self,
        device: &str,
        header: ScratchHeader,
    ) -> Result<(), ErrorKind> {
        tracing::info!("{}: restoring header from {}", device, header.path().display());
        let restored = self.ctx.crypt.restore_header(device, header.path()).await;
        drop(header);
        if let Err(e) = restored {
            tracing::warn!("{}: restoring header failed: {}", device, e);
            self.undo_shrink(device).await;
            return Err(ErrorKind::RestoreFromFile);
        }
        Ok(())
    }

    /// Saves the current header of `device` before a destructive run. The
    /// returned guard removes the backup when dropped.
    pub async fn backup_header(&self, device: &str) -> Result<ScratchHeader, ErrorKind> {
        let backup = ScratchHeader::backup_slot(&self.ctx.config.scratch_dir, device)
            .map_err(fail(ErrorKind::BackupHeader, device))?;
        self.ctx
            .crypt
            .backup_header(device, backup.path())
            .await
            .map_err(fail(ErrorKind::BackupHeader, device))?;
        Ok(backup)
    }
}

/// Writes `key` to `<dir>/<devname>_recovery_key.txt`, readable by root only.
pub fn export_recovery_key(dir: &Path, device: &str, key: &str) -> Result<PathBuf, ErrorKind> {
    if !dir.is_dir() {
        tracing::warn!("Recovery key directory {} does not exist", dir.display());
        return Err(ErrorKind::ParamsInvalid);
    }
    let path = dir.join(format!("{}_recovery_key.txt", device_basename(device)));
    let written = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)
        .and_then(|mut file| file.write_all(key.as_bytes()));
    match written {
        Ok(()) => {
            tracing::info!("Recovery key exported to {}", path.display());
            Ok(path)
        }
        Err(e) => {
            tracing::warn!("Cannot write {}: {}", path.display(), e);
            Err(ErrorKind::OpenFileFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn data_offset_matches_header_reservation() {
        assert_eq!(DATA_OFFSET_SECTORS, 65536);
    }

    #[test]
    fn recovery_key_file_is_private() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = export_recovery_key(dir.path(), "/dev/sdb1", "KEY").expect("export");

        assert_eq!(path, dir.path().join("sdb1_recovery_key.txt"));
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "KEY");
        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn recovery_key_needs_existing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            export_recovery_key(&dir.path().join("missing"), "/dev/sdb1", "KEY"),
            Err(ErrorKind::ParamsInvalid)
        );
    }
}
