// SPDX-License-Identifier: GPL-3.0-only

//! Domain models for the COSMIC Ext disk encryption service
//!
//! These types are shared by the lifecycle engine and by D-Bus clients:
//!
//! - **params**: requests as submitted over the bus (JSON)
//! - **config**: job records persisted across reboots
//! - **status**: live encryption state derived from the volume header
//! - **error**: failure kinds and the signed result codes published to callers
//! - **token**: helpers for LUKS2 token JSON
//! - **event**: progress and completion notifications

pub mod config;
pub mod error;
pub mod event;
pub mod params;
pub mod status;
pub mod token;

pub use config::{DecryptJobConfig, EncryptJobConfig, KeyConfig};
pub use error::{ErrorCategory, ErrorKind, JobResult};
pub use event::{EncryptEvent, JobId, JobOutcome, ProgressUpdate};
pub use params::{ChangePassphraseRequest, DecryptRequest, EncryptRequest, KeyMode};
pub use status::{EncryptStatus, EncryptVersion, Requirement};

/// Prefix of `/dev/` node paths.
pub const DEV_PREFIX: &str = "/dev/";

/// Kernel name of a device node: `/dev/sdb1` -> `sdb1`.
pub fn device_basename(device: &str) -> &str {
    device.strip_prefix(DEV_PREFIX).unwrap_or(device)
}

/// Device-mapper name used while a volume is transiently or permanently opened.
pub fn mapper_name(device: &str) -> String {
    format!("dm-{}", device_basename(device))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapper_name_uses_kernel_name() {
        assert_eq!(device_basename("/dev/sdb1"), "sdb1");
        assert_eq!(device_basename("nvme0n1p3"), "nvme0n1p3");
        assert_eq!(mapper_name("/dev/nvme0n1p3"), "dm-nvme0n1p3");
    }
}
