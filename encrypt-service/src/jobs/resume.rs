// SPDX-License-Identifier: GPL-3.0-only

//! Boot-time resume of a deferred encryption.
//!
//! The early-boot helper has already put an initialized header with an empty
//! passphrase on the device and opened it. This worker waits for a client to
//! supply the real parameters, finishes the encryption, installs the key
//! material and only then removes the job record.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use encrypt_sys::CryptTarget;
use encrypt_types::{
    EncryptEvent, EncryptJobConfig, EncryptRequest, EncryptStatus, ErrorKind, JobResult, token,
};
use tokio::sync::watch;

use crate::context::JobContext;
use crate::engine::header::export_recovery_key;
use crate::engine::{JobStore, TableMaintainer, fail, reencrypt, token::set_token};

/// Passphrase the early-boot helper formats pending volumes with.
const BOOT_PASSPHRASE: &str = "";

pub struct ResumeWorker {
    ctx: Arc<JobContext>,
    job: EncryptJobConfig,
    params: watch::Receiver<Option<EncryptRequest>>,
    waiting: Arc<AtomicBool>,
}

impl ResumeWorker {
    /// `waiting` is raised once the header attests an unfinished online
    /// encryption and cleared when parameters were accepted, so callers
    /// route requests in only while they can be used.
    pub fn new(
        ctx: Arc<JobContext>,
        job: EncryptJobConfig,
        params: watch::Receiver<Option<EncryptRequest>>,
        waiting: Arc<AtomicBool>,
    ) -> Self {
        Self {
            ctx,
            job,
            params,
            waiting,
        }
    }

    /// `None` when there is nothing to resume or the parameter mailbox closed.
    pub async fn run(mut self) -> Option<JobResult> {
        let device = self.job.device_path.clone();
        if device.is_empty() {
            tracing::info!("Pending job names no device");
            return None;
        }

        match reencrypt::current_status(&self.ctx, &device).await {
            Ok(EncryptStatus::OnlineReencryptUnfinished) => {
                tracing::info!("{}: online encryption unfinished, resuming", device);
            }
            Ok(status) => {
                tracing::info!("{}: nothing to resume ({:?})", device, status);
                return None;
            }
            Err(kind) => {
                tracing::warn!("{}: cannot read encryption status ({})", device, kind);
                return None;
            }
        }

        self.waiting.store(true, Ordering::SeqCst);
        let req = self.wait_for_params().await;
        self.waiting.store(false, Ordering::SeqCst);
        let req = req?;
        Some(self.finish(&req).await.into())
    }

    async fn wait_for_params(&mut self) -> Option<EncryptRequest> {
        let retry = self.ctx.config.param_retry();
        loop {
            let ready = self
                .params
                .borrow_and_update()
                .as_ref()
                .filter(|req| req.device == self.job.device_path && !req.passphrase.is_empty())
                .cloned();
            if ready.is_some() {
                return ready;
            }

            self.ctx
                .publish(EncryptEvent::RequestEncryptParams(self.job.key_config()));
            match tokio::time::timeout(retry, self.params.changed()).await {
                Ok(Ok(())) | Err(_) => continue,
                Ok(Err(_)) => {
                    tracing::info!("Parameter mailbox closed, giving up resume");
                    return None;
                }
            }
        }
    }

    /// Every step but the recovery key export stops the sequence on failure,
    /// leaving the job record for the next start.
    async fn finish(&self, req: &EncryptRequest) -> Result<(), ErrorKind> {
        let ctx = self.ctx.as_ref();
        let device = self.job.device_path.as_str();
        let target = CryptTarget::device(device);

        reencrypt::resume_reencrypt(
            ctx,
            device,
            &self.job.device_name,
            BOOT_PASSPHRASE,
            Some(&self.job.volume).filter(|v| !v.is_empty()).map(String::as_str),
            false,
        )
        .await?;

        let slot = ctx
            .crypt
            .change_keyslot(&target, BOOT_PASSPHRASE, &req.passphrase)
            .await
            .map_err(fail(ErrorKind::ChangePassphraseFailed, device))?;
        tracing::info!("{}: passphrase set in keyslot {}", device, slot);

        if let Some(tpm) = req.tpm_token() {
            let bound = token::with_keyslot(tpm, slot).map_err(|e| {
                tracing::warn!("{}: token is not valid JSON: {}", device, e);
                ErrorKind::SetTokenFailed
            })?;
            set_token(ctx, device, &bound).await?;
        }

        if let Some(dir) = req.recovery_dir().or_else(|| self.job.recovery_dir()) {
            let key = ctx.recovery_key().await;
            match export_recovery_key(Path::new(dir), device, &key) {
                Ok(_) => {
                    let recovery_slot = ctx
                        .crypt
                        .add_keyslot(&target, &req.passphrase, &key)
                        .await
                        .map_err(fail(ErrorKind::AddKeyslot, device))?;
                    set_token(ctx, device, &token::recovery_token(recovery_slot)).await?;
                    tracing::info!("{}: recovery key set in keyslot {}", device, recovery_slot);
                }
                Err(kind) => {
                    tracing::warn!("{}: recovery key not exported ({}), skipping it", device, kind);
                }
            }
        }

        if !self.job.device_name.is_empty() {
            ctx.crypt
                .set_label(device, &self.job.device_name)
                .await
                .map_err(fail(ErrorKind::SetLabel, device))?;
        }

        if req.tpm_token().is_some() {
            let uuid = req
                .backing_dev_uuid()
                .or_else(|| self.job.device.strip_prefix("UUID="))
                .unwrap_or_default();
            TableMaintainer::new(ctx).tag_trust_module_unlock(uuid)?;
        }

        JobStore::new(&ctx.config).remove_encrypt()?;
        tracing::info!("{}: encryption completed", device);
        Ok(())
    }
}
