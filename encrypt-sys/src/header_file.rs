// SPDX-License-Identifier: GPL-3.0-only

//! Detached header files kept outside the device being converted.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use encrypt_types::device_basename;

use crate::error::{Result, SysError};

/// Size of a detached LUKS2 header file, equal to the space reserved in
/// front of the data segment.
pub const HEADER_FILE_SIZE: u64 = 32 * 1024 * 1024;

/// A header file in the scratch directory. The file is removed when the
/// value is dropped.
#[derive(Debug)]
pub struct ScratchHeader {
    path: PathBuf,
}

impl ScratchHeader {
    /// Creates `<dir>/<devname>_luks2_pre_enc` exclusively and preallocates it.
    ///
    /// Fails with [`SysError::AlreadyExists`] when another job left its header
    /// there; that file is never touched.
    pub fn allocate(dir: &Path, device: &str) -> Result<Self> {
        let path = dir.join(format!("{}_luks2_pre_enc", device_basename(device)));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    SysError::AlreadyExists(path.display().to_string())
                }
                _ => SysError::Io(e),
            })?;

        let header = Self { path };
        preallocate(&file, HEADER_FILE_SIZE)?;
        tracing::debug!("Allocated header file {}", header.path.display());
        Ok(header)
    }

    /// Guards `<dir>/dm_header_<devname>`, the target of a header backup.
    /// A stale file from an earlier run is removed first.
    pub fn backup_slot(dir: &Path, device: &str) -> Result<Self> {
        let path = dir.join(format!("dm_header_{}", device_basename(device)));
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::info!("Removed stale header backup {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SysError::Io(e)),
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchHeader {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed header file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}

fn preallocate(file: &File, len: u64) -> Result<()> {
    let len = libc::off_t::try_from(len)
        .map_err(|_| SysError::OperationFailed(format!("header size {len} out of range")))?;
    // posix_fallocate reports failure through its return value, not errno.
    let ret = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) };
    if ret != 0 {
        return Err(SysError::Io(std::io::Error::from_raw_os_error(ret)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn allocates_private_full_size_file_and_removes_it_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let header = ScratchHeader::allocate(dir.path(), "/dev/sdb1").expect("allocate");
        let path = header.path().to_path_buf();
        assert!(path.ends_with("sdb1_luks2_pre_enc"));

        let meta = std::fs::metadata(&path).expect("metadata");
        assert_eq!(meta.len(), HEADER_FILE_SIZE);
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        drop(header);
        assert!(!path.exists());
    }

    #[test]
    fn second_allocation_for_same_device_fails_without_touching_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = ScratchHeader::allocate(dir.path(), "/dev/sdb1").expect("allocate");

        let second = ScratchHeader::allocate(dir.path(), "/dev/sdb1");
        assert!(matches!(second, Err(SysError::AlreadyExists(_))));
        assert!(first.path().exists());
    }

    #[test]
    fn backup_slot_clears_stale_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stale = dir.path().join("dm_header_sdc1");
        std::fs::write(&stale, b"old").expect("write stale");

        let slot = ScratchHeader::backup_slot(dir.path(), "/dev/sdc1").expect("slot");
        assert_eq!(slot.path(), stale.as_path());
        assert!(!stale.exists());
    }
}
