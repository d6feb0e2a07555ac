// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;

use async_trait::async_trait;
use encrypt_sys::SysError;
use udisks2::block::BlockProxy;
use udisks2::encrypted::EncryptedProxy;
use udisks2::filesystem::FilesystemProxy;
use zbus::Connection;
use zbus::zvariant::{self, OwnedObjectPath, Value};
use zbus_macros::proxy;

use crate::backend::{BlockDevices, BlockInfo};

#[proxy(
    default_service = "org.freedesktop.UDisks2",
    default_path = "/org/freedesktop/UDisks2/Manager",
    interface = "org.freedesktop.UDisks2.Manager"
)]
pub trait UDisks2Manager {
    fn get_block_devices(
        &self,
        options: HashMap<String, Value<'_>>,
    ) -> zbus::Result<Vec<zvariant::OwnedObjectPath>>;
}

/// Block device enumeration through UDisks2.
pub struct UdisksBlockDevices {
    connection: Connection,
}

impl UdisksBlockDevices {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    async fn block_info(&self, path: &OwnedObjectPath) -> zbus::Result<BlockInfo> {
        let block = BlockProxy::builder(&self.connection)
            .path(path)?
            .build()
            .await?;

        let mount_points = match FilesystemProxy::builder(&self.connection)
            .path(path)?
            .build()
            .await
        {
            Ok(fs) => fs
                .mount_points()
                .await
                .map(decode_mount_points)
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        // Only volumes exporting the Encrypted interface answer CleartextDevice.
        let encrypted = match EncryptedProxy::builder(&self.connection)
            .path(path)?
            .build()
            .await
        {
            Ok(proxy) => proxy.cleartext_device().await.is_ok(),
            Err(_) => false,
        };

        let device = block
            .device()
            .await
            .map_err(|e| zbus::Error::Failure(e.to_string()))?;

        Ok(BlockInfo {
            device: decode_c_string(&device),
            uuid: block.id_uuid().await.unwrap_or_default(),
            id_type: block.id_type().await.unwrap_or_default(),
            id_version: block.id_version().await.unwrap_or_default(),
            mount_points,
            encrypted,
        })
    }
}

#[async_trait]
impl BlockDevices for UdisksBlockDevices {
    async fn list(&self) -> Result<Vec<BlockInfo>, SysError> {
        let manager = UDisks2ManagerProxy::new(&self.connection)
            .await
            .map_err(|e| SysError::OperationFailed(format!("UDisks2 manager: {e}")))?;
        let paths = manager
            .get_block_devices(HashMap::new())
            .await
            .map_err(|e| SysError::OperationFailed(format!("GetBlockDevices: {e}")))?;

        let mut blocks = Vec::with_capacity(paths.len());
        for path in paths {
            match self.block_info(&path).await {
                Ok(info) if !info.device.is_empty() => blocks.push(info),
                Ok(_) => {}
                Err(e) => tracing::info!("Could not read block device {}: {}", path, e),
            }
        }
        Ok(blocks)
    }

    fn is_block_device(&self, device: &str) -> bool {
        encrypt_sys::is_block_device(device)
    }
}

fn decode_c_string(bytes: &[u8]) -> String {
    let raw = bytes.split(|b| *b == 0).next().unwrap_or(bytes);
    String::from_utf8_lossy(raw).to_string()
}

fn decode_mount_points(mount_points: Vec<Vec<u8>>) -> Vec<String> {
    mount_points
        .iter()
        .map(|mp| decode_c_string(mp))
        .filter(|mp| !mp.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_strings_stop_at_nul() {
        assert_eq!(decode_c_string(b"/dev/sdb1\0"), "/dev/sdb1");
        assert_eq!(decode_c_string(b"/dev/sdb1"), "/dev/sdb1");
        assert_eq!(
            decode_mount_points(vec![b"/media/data\0".to_vec(), b"\0".to_vec()]),
            vec!["/media/data".to_string()]
        );
    }
}
