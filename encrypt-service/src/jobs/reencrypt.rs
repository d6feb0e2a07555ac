// SPDX-License-Identifier: GPL-3.0-only

//! One-shot encryption right after a successful prepare.

use encrypt_types::{EncryptRequest, ErrorKind, token};

use super::prepare::token_cache_path;
use crate::context::JobContext;
use crate::engine::{KeySlots, reencrypt, token::set_token};

/// Encrypts the device prepared for `req`, then binds its tokens.
///
/// Token failures are logged only: the volume is already encrypted and
/// unlockable by passphrase.
pub async fn run(ctx: &JobContext, req: &EncryptRequest, slots: KeySlots) -> Result<(), ErrorKind> {
    let device = req.device.as_str();
    reencrypt::resume_reencrypt(ctx, device, &req.device_name, &req.passphrase, None, true).await?;

    let cache = token_cache_path(&ctx.config.scratch_dir, device);
    let cached = std::fs::read_to_string(&cache)
        .ok()
        .or_else(|| req.tpm_token().map(str::to_string));
    if let Some(tpm) = cached.filter(|t| !t.is_empty()) {
        match token::with_keyslot(&tpm, slots.passphrase) {
            Ok(bound) => {
                if let Err(kind) = set_token(ctx, device, &bound).await {
                    tracing::warn!("{}: trust module token not bound ({})", device, kind);
                }
            }
            Err(e) => tracing::warn!("{}: cached token is not valid JSON: {}", device, e),
        }
    }
    if let Err(e) = std::fs::remove_file(&cache)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!("{}: cannot remove {}: {}", device, cache.display(), e);
    }

    if let Some(slot) = slots.recovery
        && let Err(kind) = set_token(ctx, device, &token::recovery_token(slot)).await
    {
        tracing::warn!("{}: recovery token not bound ({})", device, kind);
    }
    Ok(())
}
