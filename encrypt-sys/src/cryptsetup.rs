// SPDX-License-Identifier: GPL-3.0-only

//! Execution wrapper for invoking `cryptsetup`.
//!
//! Secrets are always fed through stdin (`--key-file -`) or a private
//! temporary file, never through argv.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use enumflags2::{BitFlags, bitflags};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::error::{Result, SysError};
use crate::luks_meta::{self, LuksMetadata};

/// Header location of a LUKS2 volume: on the device itself or detached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptTarget {
    pub device: String,
    pub header: Option<PathBuf>,
}

impl CryptTarget {
    pub fn device(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            header: None,
        }
    }

    pub fn detached(device: impl Into<String>, header: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            header: Some(header.into()),
        }
    }

    fn push_header_args(&self, args: &mut Vec<String>) {
        if let Some(header) = &self.header {
            args.push("--header".into());
            args.push(header.display().to_string());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReencryptMode {
    Encrypt,
    Decrypt,
    Reencrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resilience {
    Checksum,
    Datashift,
    Journal,
    None,
}

impl Resilience {
    fn as_arg(self) -> &'static str {
        match self {
            Self::Checksum => "checksum",
            Self::Datashift => "datashift",
            Self::Journal => "journal",
            Self::None => "none",
        }
    }
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReencryptFlag {
    InitializeOnly = 0b001,
    MoveFirstSegment = 0b010,
    ResumeOnly = 0b100,
}

/// Parameters of one reencryption run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReencryptArgs {
    pub mode: ReencryptMode,
    pub direction: Direction,
    pub resilience: Resilience,
    /// Checksum algorithm, only meaningful with [`Resilience::Checksum`].
    pub hash: Option<String>,
    /// Data shift in 512-byte sectors.
    pub data_shift_sectors: u64,
    pub flags: BitFlags<ReencryptFlag>,
    /// Cipher spec and key size of the new segment when encrypting.
    pub cipher: Option<(String, u32)>,
    /// Name of the active mapping to reencrypt online.
    pub active_name: Option<String>,
}

impl ReencryptArgs {
    /// Direction and first-segment move `cryptsetup reencrypt` picks on its
    /// own for this mode and data shift. It has no options to set them.
    ///
    /// Encryption with a data shift runs backward and moves the first
    /// segment out of the way of the header; decryption without a shift
    /// runs backward in place. Resumed runs follow the plan stored in the
    /// header and are recorded as forward.
    pub fn cli_layout(&self) -> (Direction, bool) {
        match self.mode {
            ReencryptMode::Encrypt if self.data_shift_sectors > 0 => (Direction::Backward, true),
            ReencryptMode::Encrypt | ReencryptMode::Reencrypt => (Direction::Forward, false),
            ReencryptMode::Decrypt => (Direction::Backward, false),
        }
    }

    /// Rejects runs whose direction or segment move the command line would
    /// not carry out as asked.
    pub fn validate(&self) -> Result<()> {
        if self.data_shift_sectors > 0 && self.mode != ReencryptMode::Encrypt {
            return Err(SysError::Unsupported(format!(
                "data shift with {:?} mode",
                self.mode
            )));
        }
        if self
            .flags
            .contains(ReencryptFlag::InitializeOnly | ReencryptFlag::ResumeOnly)
        {
            return Err(SysError::Unsupported(
                "initialize-only and resume-only together".into(),
            ));
        }
        let (direction, move_first_segment) = self.cli_layout();
        if self.direction != direction {
            return Err(SysError::Unsupported(format!(
                "{:?} direction for {:?} with a data shift of {} sectors",
                self.direction, self.mode, self.data_shift_sectors
            )));
        }
        if self.flags.contains(ReencryptFlag::MoveFirstSegment) != move_first_segment {
            return Err(SysError::Unsupported(format!(
                "first segment move {} for {:?} with a data shift of {} sectors",
                if move_first_segment { "required" } else { "not possible" },
                self.mode,
                self.data_shift_sectors
            )));
        }
        Ok(())
    }

    /// `cryptsetup reencrypt` arguments, without the device.
    pub fn to_cli_args(&self, target: &CryptTarget) -> Result<Vec<String>> {
        self.validate()?;

        let mut args = vec!["reencrypt".to_string(), "--batch-mode".to_string()];
        match self.mode {
            ReencryptMode::Encrypt => args.extend(strings(&["--encrypt", "--type", "luks2"])),
            ReencryptMode::Decrypt => args.push("--decrypt".into()),
            ReencryptMode::Reencrypt => {}
        }
        if self.flags.contains(ReencryptFlag::InitializeOnly) {
            args.push("--init-only".into());
        }
        if self.flags.contains(ReencryptFlag::ResumeOnly) {
            args.push("--resume-only".into());
        }
        args.push("--resilience".into());
        args.push(self.resilience.as_arg().into());
        if let (Resilience::Checksum, Some(hash)) = (self.resilience, &self.hash) {
            args.push("--resilience-hash".into());
            args.push(hash.clone());
        }
        if self.data_shift_sectors > 0 {
            args.push("--reduce-device-size".into());
            args.push(format!("{}s", self.data_shift_sectors));
        }
        if let Some((cipher, key_bits)) = &self.cipher {
            args.push("--cipher".into());
            args.push(cipher.clone());
            args.push("--key-size".into());
            args.push(key_bits.to_string());
        }
        if let Some(name) = &self.active_name {
            args.push("--active-name".into());
            args.push(name.clone());
        }
        target.push_header_args(&mut args);
        if !self.flags.contains(ReencryptFlag::InitializeOnly) {
            args.push("--progress-json".into());
        }
        args.push("--key-file".into());
        args.push("-".into());
        Ok(args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReencryptProgress {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug)]
struct CommandOutput {
    stdout: String,
    stderr: String,
    status: i32,
}

impl CommandOutput {
    fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cryptsetup {
    binary: PathBuf,
    timeout: Duration,
}

impl Cryptsetup {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    /// Locates `cryptsetup` on `PATH`.
    pub fn discover(timeout: Duration) -> Result<Self> {
        let binary = which::which("cryptsetup")
            .map_err(|e| SysError::OperationFailed(format!("cryptsetup not found: {e}")))?;
        Ok(Self::new(binary, timeout))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Adds a keyslot for `new`, authorized by `existing`.
    pub async fn add_key(&self, target: &CryptTarget, existing: &[u8], new: &[u8]) -> Result<()> {
        let keyfile = private_keyfile(new)?;
        let mut args = strings(&["luksAddKey", "--batch-mode"]);
        target.push_header_args(&mut args);
        args.extend(strings(&["--key-file", "-", &target.device]));
        args.push(keyfile.path().display().to_string());
        self.run_checked("luksAddKey", &args, Some(existing))
            .await
            .map(drop)
    }

    /// Replaces the keyslot opened by `old` with one for `new`.
    pub async fn change_key(&self, target: &CryptTarget, old: &[u8], new: &[u8]) -> Result<()> {
        let keyfile = private_keyfile(new)?;
        let mut args = strings(&["luksChangeKey", "--batch-mode"]);
        target.push_header_args(&mut args);
        args.extend(strings(&["--key-file", "-", &target.device]));
        args.push(keyfile.path().display().to_string());
        self.run_checked("luksChangeKey", &args, Some(old))
            .await
            .map(drop)
    }

    /// Wipes keyslot `slot`, authorized by a passphrase of another slot.
    pub async fn kill_slot(&self, target: &CryptTarget, slot: u32, passphrase: &[u8]) -> Result<()> {
        let mut args = strings(&["luksKillSlot", "--batch-mode"]);
        target.push_header_args(&mut args);
        args.extend(strings(&["--key-file", "-", &target.device, &slot.to_string()]));
        self.run_checked("luksKillSlot", &args, Some(passphrase))
            .await
            .map(drop)
    }

    /// Keyslot opened by `passphrase`.
    pub async fn unlocked_slot(&self, target: &CryptTarget, passphrase: &[u8]) -> Result<u32> {
        let mut args = strings(&["open", "--test-passphrase", "--verbose"]);
        target.push_header_args(&mut args);
        args.extend(strings(&["--key-file", "-", &target.device]));
        let out = self.run_checked("open --test-passphrase", &args, Some(passphrase)).await?;
        luks_meta::parse_unlocked_slot(&out.stdout)
            .or_else(|| luks_meta::parse_unlocked_slot(&out.stderr))
            .ok_or_else(|| SysError::Parse(format!("no unlocked keyslot reported for {}", target.device)))
    }

    pub async fn metadata(&self, target: &CryptTarget) -> Result<LuksMetadata> {
        let mut args = strings(&["luksDump", "--dump-json-metadata"]);
        target.push_header_args(&mut args);
        args.push(target.device.clone());
        let out = self.run_checked("luksDump", &args, None).await?;
        LuksMetadata::parse(&out.stdout)
    }

    /// Runs a reencryption to completion. Not bounded by the command timeout.
    pub async fn reencrypt(
        &self,
        target: &CryptTarget,
        params: &ReencryptArgs,
        passphrase: &[u8],
        progress: &(dyn Fn(ReencryptProgress) + Send + Sync),
    ) -> Result<()> {
        let mut args = params.to_cli_args(target)?;
        args.push(target.device.clone());
        tracing::debug!("cryptsetup {:?}", args);

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(passphrase).await?;
            stdin.shutdown().await?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SysError::OperationFailed("reencrypt stdout not captured".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| SysError::OperationFailed("reencrypt stderr not captured".into()))?;
        let stderr_reader = tokio::spawn(async move {
            let mut buf = String::new();
            stderr.read_to_string(&mut buf).await.map(|_| buf)
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some((offset, size)) = luks_meta::parse_progress_line(&line) {
                progress(ReencryptProgress { offset, size });
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_reader
            .await
            .map_err(|e| SysError::OperationFailed(format!("stderr reader failed: {e}")))??;

        let out = CommandOutput {
            stdout: String::new(),
            stderr,
            status: status.code().unwrap_or(-1),
        };
        check("reencrypt", out).map(drop)
    }

    /// Opens `target` as `/dev/mapper/<name>`.
    pub async fn open(&self, target: &CryptTarget, name: &str, passphrase: &[u8]) -> Result<()> {
        let mut args = strings(&["open", "--type", "luks2"]);
        target.push_header_args(&mut args);
        args.extend(strings(&["--key-file", "-", &target.device, name]));
        self.run_checked("open", &args, Some(passphrase)).await.map(drop)
    }

    pub async fn close(&self, name: &str) -> Result<()> {
        self.run_checked("close", &strings(&["close", name]), None)
            .await
            .map(drop)
    }

    pub async fn header_backup(&self, device: &str, file: &Path) -> Result<()> {
        let file = file.display().to_string();
        let args = strings(&["luksHeaderBackup", "--batch-mode", device, "--header-backup-file", &file]);
        self.run_checked("luksHeaderBackup", &args, None).await.map(drop)
    }

    pub async fn header_restore(&self, device: &str, file: &Path) -> Result<()> {
        let file = file.display().to_string();
        let args = strings(&["luksHeaderRestore", "--batch-mode", device, "--header-backup-file", &file]);
        self.run_checked("luksHeaderRestore", &args, None).await.map(drop)
    }

    /// JSON of token `id`, `None` when the slot is empty.
    pub async fn token_export(&self, device: &str, id: u32) -> Result<Option<String>> {
        let args = strings(&["token", "export", "--token-id", &id.to_string(), device]);
        let out = self.run(&args, None).await?;
        if out.status == 0 {
            let json = out.stdout.trim();
            return Ok((!json.is_empty()).then(|| json.to_string()));
        }
        let diagnostic = out.diagnostic().to_ascii_lowercase();
        if diagnostic.contains("token") {
            return Ok(None);
        }
        check("token export", out).map(|_| None)
    }

    /// Stores `json` as token `id`, replacing it, or in a free slot when `id` is `None`.
    pub async fn token_import(&self, device: &str, id: Option<u32>, json: &str) -> Result<()> {
        let mut args = strings(&["token", "import", "--json-file", "-"]);
        if let Some(id) = id {
            args.extend(strings(&["--token-id", &id.to_string(), "--token-replace"]));
        }
        args.push(device.to_string());
        self.run_checked("token import", &args, Some(json.as_bytes()))
            .await
            .map(drop)
    }

    pub async fn set_label(&self, device: &str, label: &str) -> Result<()> {
        let args = strings(&["config", "--label", label, device]);
        self.run_checked("config --label", &args, None).await.map(drop)
    }

    async fn run_checked(
        &self,
        action: &str,
        args: &[String],
        input: Option<&[u8]>,
    ) -> Result<CommandOutput> {
        let out = self.run(args, input).await?;
        check(action, out)
    }

    async fn run(&self, args: &[String], input: Option<&[u8]>) -> Result<CommandOutput> {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn()?;
        if let Some(payload) = input
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin.write_all(payload).await?;
            stdin.shutdown().await?;
        }

        let action = args.first().cloned().unwrap_or_default();
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SysError::Timeout(format!("cryptsetup {action}")))??;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        })
    }
}

fn check(action: &str, out: CommandOutput) -> Result<CommandOutput> {
    if out.status == 0 {
        return Ok(out);
    }
    let diagnostic = out.diagnostic();
    if diagnostic.contains("No key available with this passphrase") {
        return Err(SysError::KeyRejected(action.to_string()));
    }
    if diagnostic.contains("Permission denied") {
        return Err(SysError::PermissionDenied(diagnostic));
    }
    Err(SysError::CommandFailed {
        command: format!("cryptsetup {action}"),
        status: out.status,
        diagnostic,
    })
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Key material for commands that take a second key as a file argument.
fn private_keyfile(key: &[u8]) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new().prefix(".cosmic-key-").tempfile()?;
    file.write_all(key)?;
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt_init() -> ReencryptArgs {
        ReencryptArgs {
            mode: ReencryptMode::Encrypt,
            direction: Direction::Backward,
            resilience: Resilience::Datashift,
            hash: None,
            data_shift_sectors: 65536,
            flags: ReencryptFlag::InitializeOnly | ReencryptFlag::MoveFirstSegment,
            cipher: Some(("aes-xts-plain64".into(), 256)),
            active_name: None,
        }
    }

    #[test]
    fn encrypt_init_arguments() {
        let target = CryptTarget::detached("/dev/sdb1", "/tmp/sdb1_luks2_pre_enc");
        let args = encrypt_init().to_cli_args(&target).expect("expressible");
        let joined = args.join(" ");
        assert!(joined.starts_with("reencrypt --batch-mode --encrypt --type luks2 --init-only"));
        assert!(joined.contains("--resilience datashift"));
        assert!(joined.contains("--reduce-device-size 65536s"));
        assert!(joined.contains("--cipher aes-xts-plain64 --key-size 256"));
        assert!(joined.contains("--header /tmp/sdb1_luks2_pre_enc"));
        assert!(!joined.contains("--progress-json"));
        assert!(!joined.contains("--resilience-hash"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn resume_arguments_report_progress_online() {
        let params = ReencryptArgs {
            mode: ReencryptMode::Reencrypt,
            direction: Direction::Forward,
            resilience: Resilience::Checksum,
            hash: Some("sha256".into()),
            data_shift_sectors: 0,
            flags: ReencryptFlag::ResumeOnly.into(),
            cipher: None,
            active_name: Some("dm-sdb1".into()),
        };
        let joined = params
            .to_cli_args(&CryptTarget::device("/dev/sdb1"))
            .expect("expressible")
            .join(" ");
        assert!(joined.contains("--resume-only"));
        assert!(joined.contains("--resilience checksum --resilience-hash sha256"));
        assert!(joined.contains("--active-name dm-sdb1"));
        assert!(joined.contains("--progress-json"));
        assert!(!joined.contains("--header"));
        assert!(!joined.contains("--reduce-device-size"));
    }

    #[test]
    fn layout_the_command_line_cannot_honor_is_rejected() {
        let target = CryptTarget::detached("/dev/sdb1", "/tmp/sdb1_luks2_pre_enc");

        let forward = ReencryptArgs {
            direction: Direction::Forward,
            ..encrypt_init()
        };
        assert!(matches!(
            forward.to_cli_args(&target),
            Err(SysError::Unsupported(_))
        ));

        let unmoved = ReencryptArgs {
            flags: ReencryptFlag::InitializeOnly.into(),
            ..encrypt_init()
        };
        assert!(matches!(
            unmoved.to_cli_args(&target),
            Err(SysError::Unsupported(_))
        ));

        let shifted_decrypt = ReencryptArgs {
            mode: ReencryptMode::Decrypt,
            flags: BitFlags::empty(),
            cipher: None,
            ..encrypt_init()
        };
        assert!(matches!(
            shifted_decrypt.to_cli_args(&target),
            Err(SysError::Unsupported(_))
        ));
    }

    #[test]
    fn decrypt_runs_backward_in_place() {
        let params = ReencryptArgs {
            mode: ReencryptMode::Decrypt,
            direction: Direction::Backward,
            resilience: Resilience::Checksum,
            hash: Some("sha256".into()),
            data_shift_sectors: 0,
            flags: BitFlags::empty(),
            cipher: None,
            active_name: None,
        };
        assert_eq!(params.cli_layout(), (Direction::Backward, false));
        let joined = params
            .to_cli_args(&CryptTarget::detached("/dev/sdb1", "/tmp/dm_header_sdb1"))
            .expect("expressible")
            .join(" ");
        assert!(joined.contains("--decrypt --resilience checksum --resilience-hash sha256"));
        assert!(joined.contains("--header /tmp/dm_header_sdb1"));

        let forward = ReencryptArgs {
            direction: Direction::Forward,
            ..params
        };
        assert!(forward.validate().is_err());
    }

    #[test]
    fn failures_are_classified() {
        let rejected = check(
            "open",
            CommandOutput {
                stdout: String::new(),
                stderr: "No key available with this passphrase.\n".into(),
                status: 2,
            },
        );
        assert!(matches!(rejected, Err(SysError::KeyRejected(_))));

        let failed = check(
            "luksFormat",
            CommandOutput {
                stdout: String::new(),
                stderr: "Device /dev/sdz1 does not exist.\n".into(),
                status: 4,
            },
        );
        assert!(matches!(
            failed,
            Err(SysError::CommandFailed { status: 4, .. })
        ));
    }

    #[test]
    fn keyfile_is_private_and_holds_key() {
        use std::os::unix::fs::PermissionsExt;

        let file = private_keyfile(b"new-secret").expect("keyfile");
        let meta = std::fs::metadata(file.path()).expect("metadata");
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(std::fs::read(file.path()).expect("read"), b"new-secret");
    }

    #[tokio::test]
    async fn missing_binary_surfaces_io_error() {
        let cs = Cryptsetup::new(
            PathBuf::from("/nonexistent/cryptsetup"),
            Duration::from_secs(1),
        );
        let result = cs.close("dm-none").await;
        assert!(matches!(result, Err(SysError::Io(_))));
    }
}
