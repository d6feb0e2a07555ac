// SPDX-License-Identifier: GPL-3.0-only

//! Live encryption state of a block device.

use enumflags2::{BitFlags, bitflags};
use serde::{Deserialize, Serialize};

/// LUKS flavour of a device as reported by blkid/UDisks (`IdType`/`IdVersion`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptVersion {
    NotEncrypted,
    Luks1,
    Luks2,
    LuksUnknown,
    /// Encrypted with something other than LUKS.
    Unknown,
}

impl EncryptVersion {
    pub fn from_id_fields(id_type: &str, id_version: &str, encrypted: bool) -> Self {
        if id_type == "crypto_LUKS" {
            return match id_version {
                "1" => Self::Luks1,
                "2" => Self::Luks2,
                _ => Self::LuksUnknown,
            };
        }
        if encrypted {
            Self::Unknown
        } else {
            Self::NotEncrypted
        }
    }

    pub fn is_encrypted(self) -> bool {
        self != Self::NotEncrypted
    }
}

/// Persistent requirement flags found in a LUKS2 header.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Requirement {
    OnlineReencrypt = 0b001,
    OfflineReencrypt = 0b010,
    /// A requirement this service does not understand.
    Unknown = 0b100,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptStatus {
    NotEncrypted,
    Luks1,
    Luks2Finished,
    OfflineReencryptUnfinished,
    OnlineReencryptUnfinished,
    Unknown,
}

impl EncryptStatus {
    /// Status of a LUKS2 header carrying `flags`. Unknown requirements win over
    /// the reencryption ones since the volume cannot be trusted to resume.
    pub fn from_requirements(flags: BitFlags<Requirement>) -> Self {
        if flags.contains(Requirement::Unknown) {
            Self::Unknown
        } else if flags.contains(Requirement::OnlineReencrypt) {
            Self::OnlineReencryptUnfinished
        } else if flags.contains(Requirement::OfflineReencrypt) {
            Self::OfflineReencryptUnfinished
        } else {
            Self::Luks2Finished
        }
    }

    pub fn has_unfinished_reencrypt(self) -> bool {
        matches!(
            self,
            Self::OfflineReencryptUnfinished | Self::OnlineReencryptUnfinished
        )
    }
}
