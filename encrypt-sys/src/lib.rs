// SPDX-License-Identifier: GPL-3.0-only

//! Low-level system operations for disk encryption
//!
//! This crate wraps the tools and files the encryption service touches
//! directly:
//! - `cryptsetup` invocations (keyslots, reencryption, tokens)
//! - LUKS2 JSON metadata parsing
//! - Detached scratch header allocation
//! - `/etc/crypttab` and `/etc/fstab` edits
//! - e2fsprogs resize calls
//!
//! These operations require elevated privileges and should only be called
//! from the privileged service.

pub mod cryptsetup;
pub mod device;
pub mod error;
pub mod header_file;
pub mod luks_meta;
pub mod resize;
pub mod tables;

pub use cryptsetup::{
    CryptTarget, Cryptsetup, Direction, ReencryptArgs, ReencryptFlag,
    ReencryptMode, ReencryptProgress, Resilience,
};
pub use device::is_block_device;
pub use error::{Result, SysError};
pub use header_file::{HEADER_FILE_SIZE, ScratchHeader};
pub use luks_meta::LuksMetadata;
pub use resize::E2fsTools;
