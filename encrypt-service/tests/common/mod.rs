// SPDX-License-Identifier: GPL-3.0-only

//! Recording fakes and a harness wiring them into an [`EncryptManager`].

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use encrypt_service::auth::{Action, Authority};
use encrypt_service::backend::{BlockDevices, BlockInfo, CryptBackend, FsResizer, ProgressSink};
use encrypt_service::{EncryptManager, JobContext, JobState, ServiceConfig};
use encrypt_sys::{CryptTarget, HEADER_FILE_SIZE, ReencryptArgs, ReencryptMode, SysError};
use encrypt_types::{EncryptEvent, JobOutcome, Requirement};
use enumflags2::BitFlags;
use tempfile::TempDir;
use tokio::sync::{Notify, broadcast};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Initialize { detached: bool, cipher: String },
    AddKeyslot { existing: String, new: String },
    ChangeKeyslot { old: String, new: String },
    DestroyKeyslot(u32),
    Reencrypt { mode: ReencryptMode, active_name: Option<String> },
    Activate(String),
    Deactivate(String),
    BackupHeader(PathBuf),
    /// Whether the header file still existed when it was restored.
    RestoreHeader { present: bool },
    SetToken(Option<u32>, String),
    SetLabel(String),
}

#[derive(Default)]
pub struct FakeCrypt {
    pub calls: Mutex<Vec<Call>>,
    pub requirements: Mutex<BitFlags<Requirement>>,
    pub tokens: Mutex<HashMap<u32, String>>,
    /// Passphrase held by each keyslot.
    pub keyslots: Mutex<BTreeMap<u32, String>>,
    pub fail_set_token: AtomicBool,
    pub fail_initialize: AtomicBool,
    pub fail_restore: AtomicBool,
    /// Fails runs other than initialization.
    pub fail_reencrypt: AtomicBool,
    pub fail_set_label: AtomicBool,
    /// Number of `change_keyslot` calls that succeed; unlimited when `None`.
    pub change_budget: Mutex<Option<usize>>,
    changes: AtomicUsize,
}

impl FakeCrypt {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_requirements(&self, flags: BitFlags<Requirement>) {
        *self.requirements.lock().unwrap() = flags;
    }

    pub fn seed_keyslot(&self, slot: u32, passphrase: &str) {
        self.keyslots.lock().unwrap().insert(slot, passphrase.into());
    }

    /// Whether some keyslot opens with `passphrase`.
    pub fn unlocks(&self, passphrase: &str) -> bool {
        self.keyslots
            .lock()
            .unwrap()
            .values()
            .any(|held| held == passphrase)
    }

    pub fn reencrypt_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Reencrypt { .. }))
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn slot_of(&self, passphrase: &str) -> Option<u32> {
        self.keyslots
            .lock()
            .unwrap()
            .iter()
            .find(|(_, held)| held.as_str() == passphrase)
            .map(|(slot, _)| *slot)
    }

    /// Stores `passphrase` in the lowest free keyslot.
    fn install(&self, passphrase: &str) -> u32 {
        let mut slots = self.keyslots.lock().unwrap();
        let slot = (0u32..).find(|s| !slots.contains_key(s)).unwrap_or_default();
        slots.insert(slot, passphrase.into());
        slot
    }
}

fn failing(knob: &AtomicBool, what: &str) -> Result<(), SysError> {
    if knob.load(Ordering::SeqCst) {
        return Err(SysError::OperationFailed(format!("{what} failed")));
    }
    Ok(())
}

#[async_trait]
impl CryptBackend for FakeCrypt {
    async fn initialize(
        &self,
        target: &CryptTarget,
        params: &ReencryptArgs,
        passphrase: &str,
    ) -> Result<u32, SysError> {
        params.validate()?;
        self.record(Call::Initialize {
            detached: target.header.is_some(),
            cipher: params.cipher.clone().map(|(c, _)| c).unwrap_or_default(),
        });
        failing(&self.fail_initialize, "initialize")?;
        Ok(self.install(passphrase))
    }

    async fn add_keyslot(
        &self,
        _target: &CryptTarget,
        existing: &str,
        new: &str,
    ) -> Result<u32, SysError> {
        self.record(Call::AddKeyslot {
            existing: existing.into(),
            new: new.into(),
        });
        if self.slot_of(existing).is_none() {
            return Err(SysError::KeyRejected("fake".into()));
        }
        Ok(self.install(new))
    }

    async fn change_keyslot(
        &self,
        _target: &CryptTarget,
        old: &str,
        new: &str,
    ) -> Result<u32, SysError> {
        self.record(Call::ChangeKeyslot {
            old: old.into(),
            new: new.into(),
        });
        let done = self.changes.fetch_add(1, Ordering::SeqCst);
        if let Some(budget) = *self.change_budget.lock().unwrap()
            && done >= budget
        {
            return Err(SysError::KeyRejected("fake".into()));
        }
        let slot = self
            .slot_of(old)
            .ok_or_else(|| SysError::KeyRejected("fake".into()))?;
        self.keyslots.lock().unwrap().insert(slot, new.into());
        Ok(slot)
    }

    async fn destroy_keyslot(
        &self,
        _target: &CryptTarget,
        slot: u32,
        _remaining: &str,
    ) -> Result<(), SysError> {
        self.record(Call::DestroyKeyslot(slot));
        self.keyslots.lock().unwrap().remove(&slot);
        Ok(())
    }

    async fn requirements(&self, _target: &CryptTarget) -> Result<BitFlags<Requirement>, SysError> {
        Ok(*self.requirements.lock().unwrap())
    }

    async fn data_offset(&self, _target: &CryptTarget) -> Result<u64, SysError> {
        Ok(HEADER_FILE_SIZE)
    }

    async fn reencrypt(
        &self,
        _target: &CryptTarget,
        params: &ReencryptArgs,
        _passphrase: &str,
        progress: ProgressSink<'_>,
    ) -> Result<(), SysError> {
        params.validate()?;
        self.record(Call::Reencrypt {
            mode: params.mode,
            active_name: params.active_name.clone(),
        });
        failing(&self.fail_reencrypt, "reencrypt")?;
        progress(512, 1024);
        progress(1024, 1024);
        Ok(())
    }

    async fn activate(
        &self,
        _target: &CryptTarget,
        name: &str,
        _passphrase: &str,
    ) -> Result<(), SysError> {
        self.record(Call::Activate(name.into()));
        Ok(())
    }

    async fn deactivate(&self, name: &str) -> Result<(), SysError> {
        self.record(Call::Deactivate(name.into()));
        Ok(())
    }

    async fn backup_header(&self, _device: &str, file: &Path) -> Result<(), SysError> {
        std::fs::write(file, b"header")?;
        self.record(Call::BackupHeader(file.to_path_buf()));
        Ok(())
    }

    async fn restore_header(&self, _device: &str, file: &Path) -> Result<(), SysError> {
        self.record(Call::RestoreHeader {
            present: file.exists(),
        });
        failing(&self.fail_restore, "restore header")
    }

    async fn token(&self, _device: &str, id: u32) -> Result<Option<String>, SysError> {
        Ok(self.tokens.lock().unwrap().get(&id).cloned())
    }

    async fn set_token(&self, _device: &str, id: Option<u32>, json: &str) -> Result<(), SysError> {
        self.record(Call::SetToken(id, json.into()));
        if self.fail_set_token.load(Ordering::SeqCst) {
            return Err(SysError::OperationFailed("token store full".into()));
        }
        Ok(())
    }

    async fn set_label(&self, _device: &str, label: &str) -> Result<(), SysError> {
        self.record(Call::SetLabel(label.into()));
        failing(&self.fail_set_label, "set label")
    }
}

pub struct FakeBlocks {
    pub blocks: Mutex<Vec<BlockInfo>>,
}

#[async_trait]
impl BlockDevices for FakeBlocks {
    async fn list(&self) -> Result<Vec<BlockInfo>, SysError> {
        Ok(self.blocks.lock().unwrap().clone())
    }

    fn is_block_device(&self, device: &str) -> bool {
        device.starts_with("/dev/")
    }
}

#[derive(Default)]
pub struct FakeResizer {
    pub calls: Mutex<Vec<String>>,
    /// When set, `shrink` waits for a notification.
    pub gate: Mutex<Option<Arc<Notify>>>,
    pub fail_shrink: AtomicBool,
}

impl FakeResizer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FsResizer for FakeResizer {
    async fn shrink(&self, device: &str, _reserve_bytes: u64) -> Result<(), SysError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.calls.lock().unwrap().push(format!("shrink {device}"));
        failing(&self.fail_shrink, "shrink")
    }

    async fn expand(&self, device: &str) -> Result<(), SysError> {
        self.calls.lock().unwrap().push(format!("expand {device}"));
        Ok(())
    }

    async fn recover(&self, device: &str, data_offset: u64) -> Result<(), SysError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("recover {device} from {data_offset}"));
        Ok(())
    }
}

pub struct FakeAuthority(pub bool);

#[async_trait]
impl Authority for FakeAuthority {
    async fn is_authorized(&self, _caller: &str, _action: Action) -> bool {
        self.0
    }
}

pub fn block(device: &str, uuid: &str) -> BlockInfo {
    BlockInfo {
        device: device.into(),
        uuid: uuid.into(),
        id_type: "ext4".into(),
        id_version: "1.0".into(),
        ..Default::default()
    }
}

pub fn encrypted_block(device: &str, uuid: &str) -> BlockInfo {
    BlockInfo {
        device: device.into(),
        uuid: uuid.into(),
        id_type: "crypto_LUKS".into(),
        id_version: "2".into(),
        encrypted: true,
        ..Default::default()
    }
}

pub const TPM_TOKEN: &str = r#"{"type":"usec-tpm2","keyslots":["0"],"kek-priv":"abc"}"#;

pub struct Harness {
    pub dir: TempDir,
    pub config: ServiceConfig,
    pub crypt: Arc<FakeCrypt>,
    pub blocks: Arc<FakeBlocks>,
    pub resizer: Arc<FakeResizer>,
    pub manager: EncryptManager,
    pub events: broadcast::Receiver<EncryptEvent>,
}

impl Harness {
    pub fn new(blocks: Vec<BlockInfo>) -> Self {
        Self::with_authority(blocks, true)
    }

    pub fn with_authority(blocks: Vec<BlockInfo>, authorized: bool) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).expect("scratch dir");
        let config = ServiceConfig {
            job_dir: dir.path().join("boot"),
            crypttab_path: dir.path().join("crypttab"),
            fstab_path: dir.path().join("fstab"),
            scratch_dir: scratch,
            param_retry_ms: 20,
            ..ServiceConfig::default()
        };
        std::fs::write(&config.fstab_path, "").expect("fstab");

        let crypt = Arc::new(FakeCrypt::default());
        let blocks = Arc::new(FakeBlocks {
            blocks: Mutex::new(blocks),
        });
        let resizer = Arc::new(FakeResizer::default());
        let ctx = JobContext::new(
            config.clone(),
            crypt.clone(),
            blocks.clone(),
            resizer.clone(),
            None,
        );
        let manager = EncryptManager::new(ctx, Arc::new(FakeAuthority(authorized)));
        let events = manager.subscribe();
        Self {
            dir,
            config,
            crypt,
            blocks,
            resizer,
            manager,
            events,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Next event matching `pred`, skipping others.
    pub async fn wait_for(&mut self, pred: impl Fn(&EncryptEvent) -> bool) -> EncryptEvent {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(5), async move {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Next terminal outcome, whatever its kind.
    pub async fn outcome(&mut self) -> EncryptEvent {
        self.wait_for(|e| e.outcome().is_some()).await
    }

    pub async fn wait_finished(&self, job_id: &str) -> JobState {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(state @ JobState::Finished(_)) = self.manager.job_state(job_id).await {
                    return state;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not finish")
    }
}

pub fn outcome_of(event: &EncryptEvent) -> &JobOutcome {
    event.outcome().expect("terminal event")
}
