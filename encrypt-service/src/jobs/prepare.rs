// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};

use encrypt_types::{EncryptJobConfig, EncryptRequest, ErrorKind, device_basename};

use crate::backend::BlockInfo;
use crate::context::JobContext;
use crate::engine::{HeaderManager, JobStore, KeySlots, TableMaintainer};

/// How a successful prepare ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prepared {
    /// Parameters recorded; the conversion happens at the next boot.
    Deferred,
    /// Header spliced onto the device; the reencryption can start.
    Ready(KeySlots),
}

/// Cache of the trust module token bound once the reencryption completes.
pub fn token_cache_path(scratch_dir: &Path, device: &str) -> PathBuf {
    scratch_dir.join(format!("{}_tpm_token.json", device_basename(device)))
}

pub async fn run(ctx: &JobContext, req: &EncryptRequest) -> Result<Prepared, ErrorKind> {
    let device = req.device.as_str();
    if ctx.config.is_disabled_mount_point(&req.mount_point) {
        tracing::info!("{}: mounted at {}, encryption disabled", device, req.mount_point);
        return Err(ErrorKind::DisabledMountPoint);
    }

    if req.init_params_only {
        return defer(ctx, req).await;
    }

    validate(ctx, req).await?;

    let headers = HeaderManager::new(ctx);
    let prepared = headers.create(req).await.map_err(|kind| {
        tracing::warn!("{}: header preparation failed ({})", device, kind);
        ErrorKind::CreateHeader
    })?;

    let slots = prepared.slots;
    headers
        .splice_header_onto_device(device, prepared.file)
        .await
        .map_err(|_| ErrorKind::ApplyHeader)?;

    if let Some(token) = req.tpm_token() {
        let cache = token_cache_path(&ctx.config.scratch_dir, device);
        if let Err(e) = std::fs::write(&cache, token) {
            tracing::warn!("{}: cannot cache token in {}: {}", device, cache.display(), e);
        }
    }

    tracing::info!("{}: header applied, passphrase in keyslot {}", device, slots.passphrase);
    Ok(Prepared::Ready(slots))
}

/// Records the request for the next boot and relaxes the mount timeout so
/// boot waits for the conversion.
async fn defer(ctx: &JobContext, req: &EncryptRequest) -> Result<Prepared, ErrorKind> {
    let device = req.device.as_str();
    if device.is_empty() || req.cipher.is_empty() {
        return Err(ErrorKind::ParamsInvalid);
    }
    ensure_not_encrypted(ctx, device).await?;

    JobStore::new(&ctx.config).write_encrypt(&EncryptJobConfig::from_request(req))?;
    TableMaintainer::new(ctx).extend_mount_timeout(device, &req.uuid)?;
    tracing::info!("{}: encryption deferred to next boot", device);
    Ok(Prepared::Deferred)
}

async fn validate(ctx: &JobContext, req: &EncryptRequest) -> Result<(), ErrorKind> {
    let device = req.device.as_str();
    req.check_shape()?;
    if !ctx.blocks.is_block_device(device) {
        tracing::warn!("{} is not a block device", device);
        return Err(ErrorKind::ParamsInvalid);
    }
    if let Some(dir) = req.recovery_dir()
        && !Path::new(dir).exists()
    {
        tracing::warn!("Recovery export path {} does not exist", dir);
        return Err(ErrorKind::ParamsInvalid);
    }

    let Some(info) = ensure_not_encrypted(ctx, device).await? else {
        tracing::warn!("{} is unknown to the block device service", device);
        return Err(ErrorKind::ParamsInvalid);
    };
    if info.is_mounted() {
        tracing::warn!("{} is mounted, cannot encrypt", device);
        return Err(ErrorKind::DeviceMounted);
    }
    Ok(())
}

async fn ensure_not_encrypted(
    ctx: &JobContext,
    device: &str,
) -> Result<Option<BlockInfo>, ErrorKind> {
    let info = ctx.blocks.find(device).await.map_err(|e| {
        tracing::warn!("{}: cannot query block device: {}", device, e);
        ErrorKind::ParamsInvalid
    })?;
    if let Some(block) = &info {
        let version = block.version();
        if version.is_encrypted() {
            tracing::warn!("{} is already encrypted ({:?})", device, version);
            return Err(ErrorKind::DeviceEncrypted);
        }
    }
    Ok(info)
}
