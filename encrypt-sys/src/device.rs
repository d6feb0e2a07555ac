// SPDX-License-Identifier: GPL-3.0-only

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use crate::error::{Result, SysError};

/// True when `path` exists and is a block special file.
pub fn is_block_device(path: impl AsRef<Path>) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_block_device())
        .unwrap_or(false)
}

/// Size in bytes of a block device (or regular file).
pub fn device_size(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SysError::DeviceNotFound(path.display().to_string()),
        std::io::ErrorKind::PermissionDenied => {
            SysError::PermissionDenied(path.display().to_string())
        }
        _ => SysError::Io(e),
    })?;
    Ok(file.seek(SeekFrom::End(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn regular_files_are_not_block_devices() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&[0u8; 4096]).expect("write");
        assert!(!is_block_device(file.path()));
        assert!(!is_block_device("/nonexistent/device"));
        assert_eq!(device_size(file.path()).expect("size"), 4096);
    }

    #[test]
    fn missing_device_is_reported() {
        assert!(matches!(
            device_size("/nonexistent/device"),
            Err(SysError::DeviceNotFound(_))
        ));
    }
}
