// SPDX-License-Identifier: GPL-3.0-only

//! ext2/3/4 resize through e2fsprogs.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::device::device_size;
use crate::error::{Result, SysError};

#[derive(Debug, Clone)]
pub struct E2fsTools {
    e2fsck: PathBuf,
    resize2fs: PathBuf,
}

impl E2fsTools {
    pub fn new(e2fsck: PathBuf, resize2fs: PathBuf) -> Self {
        Self { e2fsck, resize2fs }
    }

    pub fn discover() -> Result<Self> {
        let find = |name: &str| {
            which::which(name)
                .map_err(|e| SysError::OperationFailed(format!("{name} not found: {e}")))
        };
        Ok(Self::new(find("e2fsck")?, find("resize2fs")?))
    }

    /// Shrinks the filesystem on `device` so `reserve_bytes` at its end are free.
    pub async fn shrink(&self, device: &str, reserve_bytes: u64) -> Result<()> {
        let size = device_size(device)?;
        let target_kib = size
            .checked_sub(reserve_bytes)
            .map(|bytes| bytes / 1024)
            .filter(|kib| *kib > 0)
            .ok_or_else(|| {
                SysError::OperationFailed(format!("{device} is too small to shrink by {reserve_bytes} bytes"))
            })?;

        self.check(device).await?;
        run(&self.resize2fs, &[device, &format!("{target_kib}K")]).await
    }

    /// Grows the filesystem on `device` to fill it.
    pub async fn expand(&self, device: &str) -> Result<()> {
        self.check(device).await?;
        run(&self.resize2fs, &[device]).await
    }

    /// Brings back a filesystem that an in-place decryption left
    /// `data_offset` bytes into `device`: moves it to the start, repairs it
    /// and grows it over the freed tail.
    pub async fn recover(&self, device: &str, data_offset: u64) -> Result<()> {
        let path = PathBuf::from(device);
        let moved = tokio::task::spawn_blocking(move || relocate_to_start(&path, data_offset))
            .await
            .map_err(|e| SysError::OperationFailed(format!("relocation task failed: {e}")))??;
        tracing::info!("{}: moved {} bytes down from offset {}", device, moved, data_offset);

        self.check(device).await?;
        run(&self.resize2fs, &[device]).await
    }

    async fn check(&self, device: &str) -> Result<()> {
        let output = Command::new(&self.e2fsck)
            .args(["-f", "-y", device])
            .output()
            .await?;
        // 0: clean, 1: errors corrected. Anything else needs an operator.
        match output.status.code() {
            Some(0) | Some(1) => Ok(()),
            status => Err(SysError::CommandFailed {
                command: "e2fsck".into(),
                status: status.unwrap_or(-1),
                diagnostic: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }
}

/// Bytes copied per step by [`relocate_to_start`].
const RELOCATE_CHUNK: usize = 4 * 1024 * 1024;

/// Copies everything from `offset` to the end of `device` down to its start,
/// front to back, and returns the number of bytes moved. A source byte is
/// always read before its range can be overwritten.
pub fn relocate_to_start(device: &Path, offset: u64) -> Result<u64> {
    if offset == 0 {
        return Ok(0);
    }
    let size = device_size(device)?;
    if offset >= size {
        return Err(SysError::OperationFailed(format!(
            "{} is smaller than its data offset {}",
            device.display(),
            offset
        )));
    }

    let file = OpenOptions::new().read(true).write(true).open(device)?;
    let mut buf = vec![0u8; RELOCATE_CHUNK];
    let mut moved = 0u64;
    while offset + moved < size {
        let len = (size - offset - moved).min(RELOCATE_CHUNK as u64) as usize;
        file.read_exact_at(&mut buf[..len], offset + moved)?;
        file.write_all_at(&buf[..len], moved)?;
        moved += len as u64;
    }
    file.sync_all()?;
    Ok(moved)
}

async fn run(binary: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new(binary).args(args).output().await?;
    if !output.status.success() {
        return Err(SysError::CommandFailed {
            command: binary.display().to_string(),
            status: output.status.code().unwrap_or(-1),
            diagnostic: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shrink_refuses_device_smaller_than_reserve() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        std::fs::write(file.path(), vec![0u8; 4096]).expect("write");
        let tools = E2fsTools::new("/bin/false".into(), "/bin/false".into());

        let path = file.path().display().to_string();
        let result = tools.shrink(&path, 32 * 1024 * 1024).await;
        assert!(matches!(result, Err(SysError::OperationFailed(_))));
    }

    #[test]
    fn relocation_moves_data_to_the_start() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        let offset = 4096u64;
        let payload: Vec<u8> = (0..RELOCATE_CHUNK + 10_000).map(|i| (i % 251) as u8).collect();
        let mut image = vec![0xEEu8; offset as usize];
        image.extend_from_slice(&payload);
        std::fs::write(file.path(), &image).expect("write");

        let moved = relocate_to_start(file.path(), offset).expect("relocate");
        assert_eq!(moved, payload.len() as u64);
        let after = std::fs::read(file.path()).expect("read");
        assert_eq!(after.len(), image.len());
        assert_eq!(&after[..payload.len()], payload.as_slice());
    }

    #[test]
    fn relocation_without_offset_is_a_no_op() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        std::fs::write(file.path(), b"superblock").expect("write");
        assert_eq!(relocate_to_start(file.path(), 0).expect("relocate"), 0);
        assert_eq!(std::fs::read(file.path()).expect("read"), b"superblock");
        assert!(relocate_to_start(file.path(), 64).is_err());
    }

    #[tokio::test]
    async fn failing_tool_is_reported_with_status() {
        let result = run(Path::new("/bin/false"), &["/dev/null"]).await;
        assert!(matches!(
            result,
            Err(SysError::CommandFailed { status: 1, .. })
        ));
        assert!(run(Path::new("/bin/true"), &[]).await.is_ok());
    }
}
