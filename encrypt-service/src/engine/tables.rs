// SPDX-License-Identifier: GPL-3.0-only

//! Crypttab/Fstab Maintainer.

use std::collections::HashMap;
use std::path::Path;

use encrypt_sys::tables::{self, TableEdit};
use encrypt_types::ErrorKind;

use super::fail;
use crate::backend::BlockInfo;
use crate::context::JobContext;

pub struct TableMaintainer<'a> {
    ctx: &'a JobContext,
}

impl<'a> TableMaintainer<'a> {
    pub fn new(ctx: &'a JobContext) -> Self {
        Self { ctx }
    }

    /// Drops crypttab entries whose source no longer is an encrypted device.
    ///
    /// Entries naming a device that cannot be found by path are kept; a UUID
    /// that resolves to nothing means the volume was decrypted. Returns
    /// whether the file was rewritten.
    pub async fn reconcile(&self) -> Result<bool, ErrorKind> {
        let path = self.ctx.config.crypttab_path.as_path();
        if !path.exists() {
            tracing::debug!("No {}, nothing to reconcile", path.display());
            return Ok(false);
        }
        let contents = tables::read_table(path).map_err(fail(ErrorKind::OpenCrypttabFailed, &path_str(path)))?;

        let blocks = match self.ctx.blocks.list().await {
            Ok(blocks) => blocks,
            Err(e) => {
                tracing::warn!("Cannot enumerate block devices, crypttab left alone: {}", e);
                return Ok(false);
            }
        };
        let index = DeviceIndex::new(&blocks);

        let lines = tables::parse_crypttab(&contents);
        let edit = tables::prune_crypttab(&lines, |target, source| index.is_stale(target, source));
        let written = tables::write_if_changed(path, &edit)
            .map_err(fail(ErrorKind::OpenCrypttabFailed, &path_str(path)))?;
        tracing::info!("Crypttab check finished, updated: {}", written);
        Ok(written)
    }

    /// Marks the crypttab entry of `UUID=<uuid>` for trust module unlock.
    pub fn tag_trust_module_unlock(&self, uuid: &str) -> Result<bool, ErrorKind> {
        let path = self.ctx.config.crypttab_path.as_path();
        self.edit(path, ErrorKind::OpenCrypttabFailed, |contents| {
            tables::tag_tpm_unlock(contents, uuid)
        })
    }

    /// Keeps boot from timing out on the mount of `device` while it is
    /// converted.
    pub fn extend_mount_timeout(&self, device: &str, uuid: &str) -> Result<bool, ErrorKind> {
        let path = self.ctx.config.fstab_path.as_path();
        self.edit(path, ErrorKind::OpenFstabFailed, |contents| {
            tables::extend_mount_timeout(contents, device, uuid)
        })
    }

    fn edit(
        &self,
        path: &Path,
        kind: ErrorKind,
        apply: impl FnOnce(&str) -> TableEdit,
    ) -> Result<bool, ErrorKind> {
        let name = path_str(path);
        let contents = tables::read_table(path).map_err(fail(kind, &name))?;
        let edit = apply(&contents);
        let written = tables::write_if_changed(path, &edit).map_err(fail(kind, &name))?;
        if written {
            tracing::info!("{} updated", name);
        } else {
            tracing::debug!("{} already up to date", name);
        }
        Ok(written)
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

/// Device lookups for one reconciliation pass.
struct DeviceIndex<'b> {
    by_uuid: HashMap<String, &'b str>,
    by_device: HashMap<&'b str, &'b BlockInfo>,
}

impl<'b> DeviceIndex<'b> {
    fn new(blocks: &'b [BlockInfo]) -> Self {
        let mut by_uuid = HashMap::new();
        let mut by_device = HashMap::new();
        for block in blocks {
            if !block.uuid.is_empty() {
                by_uuid.insert(format!("UUID={}", block.uuid), block.device.as_str());
            }
            by_device.insert(block.device.as_str(), block);
        }
        Self { by_uuid, by_device }
    }

    fn is_stale(&self, target: &str, source: &str) -> bool {
        let device = if source.starts_with("UUID=") {
            match self.by_uuid.get(source) {
                Some(device) => *device,
                None => {
                    tracing::info!("{} ({}) not found, volume was probably decrypted", source, target);
                    return true;
                }
            }
        } else {
            source
        };

        match self.by_device.get(device) {
            Some(block) => !block.encrypted,
            None => {
                tracing::debug!("Cannot resolve {} for {}, keeping entry", device, target);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(device: &str, uuid: &str, encrypted: bool) -> BlockInfo {
        BlockInfo {
            device: device.into(),
            uuid: uuid.into(),
            encrypted,
            ..Default::default()
        }
    }

    #[test]
    fn staleness_follows_live_encryption_state() {
        let blocks = vec![
            block("/dev/sdb1", "aaaa", true),
            block("/dev/sdc1", "bbbb", false),
        ];
        let index = DeviceIndex::new(&blocks);

        assert!(!index.is_stale("dm-sdb1", "UUID=aaaa"));
        assert!(index.is_stale("dm-sdc1", "UUID=bbbb"));
        assert!(index.is_stale("dm-gone", "UUID=ffff"));
        assert!(!index.is_stale("dm-sdb1", "/dev/sdb1"));
        assert!(index.is_stale("dm-sdc1", "/dev/sdc1"));
        assert!(!index.is_stale("dm-sdz1", "/dev/sdz1"));
    }
}
