// SPDX-License-Identifier: GPL-3.0-only

//! Passphrase rotation with trust module token rebinding.

use encrypt_sys::CryptTarget;
use encrypt_types::{ChangePassphraseRequest, ErrorKind, token};

use crate::context::JobContext;
use crate::engine::{fail, token::set_token};

/// How to take a rotation back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Undo {
    /// The old passphrase slot was replaced; change it back.
    SwapBack,
    /// A slot was added next to the recovery key; destroy it.
    Destroy(u32),
}

pub async fn run(ctx: &JobContext, req: &ChangePassphraseRequest) -> Result<(), ErrorKind> {
    let device = req.device.as_str();
    let target = CryptTarget::device(device);

    let (slot, undo) = if req.validate_with_rec_key {
        let slot = ctx
            .crypt
            .add_keyslot(&target, &req.old_passphrase, &req.passphrase)
            .await
            .map_err(fail(ErrorKind::AddKeyslot, device))?;
        (slot, Undo::Destroy(slot))
    } else {
        let slot = ctx
            .crypt
            .change_keyslot(&target, &req.old_passphrase, &req.passphrase)
            .await
            .map_err(fail(ErrorKind::ChangePassphraseFailed, device))?;
        (slot, Undo::SwapBack)
    };
    tracing::info!("{}: passphrase now in keyslot {}", device, slot);

    let Some(tpm) = req.tpm_token() else {
        return Ok(());
    };
    let result = match token::with_keyslot(tpm, slot) {
        Ok(bound) => set_token(ctx, device, &bound).await,
        Err(e) => {
            tracing::warn!("{}: token is not valid JSON: {}", device, e);
            Err(ErrorKind::SetTokenFailed)
        }
    };
    let Err(kind) = result else {
        return Ok(());
    };

    tracing::warn!("{}: token update failed, rolling back passphrase change", device);
    rollback(ctx, &target, req, undo).await?;
    Err(kind)
}

async fn rollback(
    ctx: &JobContext,
    target: &CryptTarget,
    req: &ChangePassphraseRequest,
    undo: Undo,
) -> Result<(), ErrorKind> {
    let reverted = match undo {
        Undo::SwapBack => ctx
            .crypt
            .change_keyslot(target, &req.passphrase, &req.old_passphrase)
            .await
            .map(|_| ()),
        Undo::Destroy(slot) => {
            ctx.crypt
                .destroy_keyslot(target, slot, &req.old_passphrase)
                .await
        }
    };
    match reverted {
        Ok(()) => {
            tracing::info!("{}: passphrase change rolled back", target.device);
            Ok(())
        }
        Err(e) => {
            tracing::error!(
                "{}: rollback failed, the new passphrase stays installed: {}",
                target.device,
                e
            );
            Err(ErrorKind::PassphraseRollbackFailed)
        }
    }
}
