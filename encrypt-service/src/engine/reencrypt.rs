// SPDX-License-Identifier: GPL-3.0-only

//! Reencryption Driver.
//!
//! Three run configurations, one per lifecycle phase. Before resuming, the
//! header's own requirement flags must attest the interrupted phase.

use encrypt_sys::{
    CryptTarget, Direction, ReencryptArgs, ReencryptFlag, ReencryptMode, Resilience, SysError,
};
use encrypt_types::config::{CIPHER_MODE, KEY_SIZE_BITS};
use encrypt_types::{EncryptEvent, EncryptStatus, ErrorKind, ProgressUpdate, Requirement, mapper_name};
use enumflags2::BitFlags;
use tokio::sync::broadcast;

use super::header::{DATA_OFFSET_SECTORS, HeaderManager};
use super::{fail, mapper_path};
use crate::context::JobContext;

const CHECKSUM_HASH: &str = "sha256";

/// Records a pending encryption in a fresh header. Only the first segment
/// is moved; no block is encrypted yet.
pub fn encrypt_initialize(cipher: &str) -> ReencryptArgs {
    ReencryptArgs {
        mode: ReencryptMode::Encrypt,
        direction: Direction::Backward,
        resilience: Resilience::Datashift,
        hash: None,
        data_shift_sectors: DATA_OFFSET_SECTORS,
        flags: ReencryptFlag::InitializeOnly | ReencryptFlag::MoveFirstSegment,
        cipher: Some((format!("{cipher}-{CIPHER_MODE}"), KEY_SIZE_BITS)),
        active_name: None,
    }
}

/// Streams an encrypted volume back to plaintext in place.
pub fn decrypt() -> ReencryptArgs {
    ReencryptArgs {
        mode: ReencryptMode::Decrypt,
        direction: Direction::Backward,
        resilience: Resilience::Checksum,
        hash: Some(CHECKSUM_HASH.into()),
        data_shift_sectors: 0,
        flags: BitFlags::empty(),
        cipher: None,
        active_name: None,
    }
}

/// Continues a run recorded in the header, optionally on an opened mapping.
pub fn resume(active_name: Option<&str>) -> ReencryptArgs {
    ReencryptArgs {
        mode: ReencryptMode::Reencrypt,
        direction: Direction::Forward,
        resilience: Resilience::Checksum,
        hash: Some(CHECKSUM_HASH.into()),
        data_shift_sectors: 0,
        flags: ReencryptFlag::ResumeOnly.into(),
        cipher: None,
        active_name: active_name.map(str::to_string),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Encrypt,
    Decrypt,
}

/// Publishes progress of one device. Every update names its device.
#[derive(Clone)]
pub struct ProgressReporter {
    events: broadcast::Sender<EncryptEvent>,
    kind: ProgressKind,
    device: String,
    device_name: String,
}

impl ProgressReporter {
    pub fn new(ctx: &JobContext, kind: ProgressKind, device: &str, device_name: &str) -> Self {
        Self {
            events: ctx.events.clone(),
            kind,
            device: device.to_string(),
            device_name: device_name.to_string(),
        }
    }

    pub fn report(&self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        let update = ProgressUpdate {
            device: self.device.clone(),
            device_name: self.device_name.clone(),
            fraction: (offset as f64 / size as f64).clamp(0.0, 1.0),
        };
        let event = match self.kind {
            ProgressKind::Encrypt => EncryptEvent::EncryptProgress(update),
            ProgressKind::Decrypt => EncryptEvent::DecryptProgress(update),
        };
        let _ = self.events.send(event);
    }
}

/// Live status of the header on `device`.
pub async fn current_status(ctx: &JobContext, device: &str) -> Result<EncryptStatus, ErrorKind> {
    ctx.crypt
        .requirements(&CryptTarget::device(device))
        .await
        .map(EncryptStatus::from_requirements)
        .map_err(fail(ErrorKind::GetReencryptFlag, device))
}

/// Resumes the online encryption recorded on `device`.
///
/// `active_name` names the mapping to encrypt through when the volume is
/// already open. With `expand_fs` the filesystem is grown over the encrypted
/// volume once the run completes.
pub async fn resume_reencrypt(
    ctx: &JobContext,
    device: &str,
    device_name: &str,
    passphrase: &str,
    active_name: Option<&str>,
    expand_fs: bool,
) -> Result<(), ErrorKind> {
    let target = CryptTarget::device(device);
    let flags = ctx
        .crypt
        .requirements(&target)
        .await
        .map_err(fail(ErrorKind::GetReencryptFlag, device))?;
    if !flags.contains(Requirement::OnlineReencrypt) {
        tracing::warn!("{}: refusing to resume, requirement flags are {:?}", device, flags);
        return Err(ErrorKind::WrongFlags);
    }

    tracing::info!("{}: resuming encryption", device);
    let progress = ProgressReporter::new(ctx, ProgressKind::Encrypt, device, device_name);
    ctx.crypt
        .reencrypt(&target, &resume(active_name), passphrase, &|offset, size| {
            progress.report(offset, size)
        })
        .await
        .map_err(|e| match e {
            SysError::KeyRejected(_) => fail(ErrorKind::InitReencrypt, device)(e),
            other => fail(ErrorKind::ReencryptFailed, device)(other),
        })?;
    tracing::info!("{}: encryption finished", device);

    if !expand_fs {
        return Ok(());
    }
    let name = mapper_name(device);
    ctx.crypt
        .activate(&target, &name, passphrase)
        .await
        .map_err(fail(ErrorKind::Active, device))?;
    if let Err(e) = ctx.resizer.expand(&mapper_path(&name)).await {
        tracing::warn!("{}: expanding filesystem on {} failed: {}", device, name, e);
    }
    ctx.crypt
        .deactivate(&name)
        .await
        .map_err(fail(ErrorKind::Deactivate, device))
}

/// Decrypts `device` in place using a backup of its header, then moves the
/// plaintext filesystem from the old data offset back to the device start.
pub async fn run_decrypt(
    ctx: &JobContext,
    device: &str,
    device_name: &str,
    passphrase: &str,
) -> Result<(), ErrorKind> {
    let backup = HeaderManager::new(ctx).backup_header(device).await?;
    let target = CryptTarget::detached(device, backup.path());

    let flags = ctx
        .crypt
        .requirements(&target)
        .await
        .map_err(fail(ErrorKind::GetReencryptFlag, device))?;
    if flags.intersects(Requirement::OnlineReencrypt | Requirement::OfflineReencrypt) {
        tracing::warn!("{}: still under reencryption, flags {:?}", device, flags);
        return Err(ErrorKind::WrongFlags);
    }
    let data_offset = ctx
        .crypt
        .data_offset(&target)
        .await
        .map_err(fail(ErrorKind::LoadCrypt, device))?;

    tracing::info!("{}: decrypting", device);
    let progress = ProgressReporter::new(ctx, ProgressKind::Decrypt, device, device_name);
    ctx.crypt
        .reencrypt(&target, &decrypt(), passphrase, &|offset, size| {
            progress.report(offset, size)
        })
        .await
        .map_err(|e| match e {
            SysError::KeyRejected(_) => fail(ErrorKind::WrongPassphrase, device)(e),
            other => fail(ErrorKind::ReencryptFailed, device)(other),
        })?;

    ctx.resizer
        .recover(device, data_offset)
        .await
        .map_err(fail(ErrorKind::ResizeFs, device))?;
    tracing::info!("{}: decryption finished", device);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_configurations() {
        let init = encrypt_initialize("aes");
        assert_eq!(init.direction, Direction::Backward);
        assert_eq!(init.resilience, Resilience::Datashift);
        assert_eq!(init.data_shift_sectors, 32 * 1024 * 2);
        assert!(init.flags.contains(ReencryptFlag::InitializeOnly | ReencryptFlag::MoveFirstSegment));
        assert_eq!(init.cipher, Some(("aes-xts-plain64".to_string(), 256)));

        let dec = decrypt();
        assert_eq!(dec.mode, ReencryptMode::Decrypt);
        assert_eq!(dec.resilience, Resilience::Checksum);
        assert_eq!(dec.data_shift_sectors, 0);

        let res = resume(Some("dm-sdb1"));
        assert_eq!(res.direction, Direction::Forward);
        assert_eq!(res.flags, BitFlags::from(ReencryptFlag::ResumeOnly));
        assert_eq!(res.active_name.as_deref(), Some("dm-sdb1"));
    }

    #[test]
    fn phase_configurations_reach_the_command_line() {
        let header = CryptTarget::detached("/dev/sdb1", "/tmp/sdb1_luks2_pre_enc");
        let init = encrypt_initialize("aes");
        assert_eq!(init.cli_layout(), (Direction::Backward, true));
        let args = init.to_cli_args(&header).expect("init").join(" ");
        assert!(args.contains("--encrypt --type luks2 --init-only --resilience datashift"));
        assert!(args.contains("--reduce-device-size 65536s"));

        let moved_forward = ReencryptArgs {
            direction: Direction::Forward,
            flags: ReencryptFlag::InitializeOnly.into(),
            ..encrypt_initialize("aes")
        };
        assert!(moved_forward.to_cli_args(&header).is_err());

        assert_eq!(decrypt().cli_layout(), (Direction::Backward, false));
        assert!(decrypt().to_cli_args(&header).is_ok());
        assert!(resume(None).to_cli_args(&CryptTarget::device("/dev/sdb1")).is_ok());
    }

    #[test]
    fn progress_names_its_device() {
        let (events, mut rx) = broadcast::channel(4);
        let reporter = ProgressReporter {
            events,
            kind: ProgressKind::Decrypt,
            device: "/dev/sdc1".into(),
            device_name: "Backup".into(),
        };
        reporter.report(0, 0);
        reporter.report(1, 4);

        match rx.try_recv().expect("event") {
            EncryptEvent::DecryptProgress(update) => {
                assert_eq!(update.device, "/dev/sdc1");
                assert_eq!(update.fraction, 0.25);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
