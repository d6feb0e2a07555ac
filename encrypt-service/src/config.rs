// SPDX-License-Identifier: GPL-3.0-only

//! Service configuration, read once at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServiceError};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cosmic-ext-encrypt/service.toml";
pub const CONFIG_PATH_ENV: &str = "COSMIC_EXT_ENCRYPT_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Boot-accessible directory holding `encrypt.json` and `decrypt.json`.
    pub job_dir: PathBuf,
    pub crypttab_path: PathBuf,
    pub fstab_path: PathBuf,
    /// Detached headers, header backups and token caches.
    pub scratch_dir: PathBuf,
    /// Resolved from `PATH` when unset.
    pub cryptsetup_binary: Option<PathBuf>,
    /// Delay between parameter requests of the boot-time resume job.
    pub param_retry_ms: u64,
    /// Mount points that must never be encrypted.
    pub disabled_mount_points: Vec<String>,
    /// Bound on short `cryptsetup` calls; reencryption itself is unbounded.
    pub command_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            job_dir: PathBuf::from("/boot/usec-crypt"),
            crypttab_path: PathBuf::from("/etc/crypttab"),
            fstab_path: PathBuf::from("/etc/fstab"),
            scratch_dir: PathBuf::from("/tmp"),
            cryptsetup_binary: None,
            param_retry_ms: 3000,
            disabled_mount_points: ["/boot", "/boot/efi", "/efi", "/recovery"]
                .into_iter()
                .map(String::from)
                .collect(),
            command_timeout_secs: 120,
        }
    }
}

impl ServiceConfig {
    /// Loads the file named by `COSMIC_EXT_ENCRYPT_CONFIG`, or the default
    /// location. A missing file means defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ServiceError::Config {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        toml::from_str(&raw).map_err(|e| ServiceError::Config {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn param_retry(&self) -> Duration {
        Duration::from_millis(self.param_retry_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn encrypt_job_path(&self) -> PathBuf {
        self.job_dir.join("encrypt.json")
    }

    pub fn decrypt_job_path(&self) -> PathBuf {
        self.job_dir.join("decrypt.json")
    }

    pub fn is_disabled_mount_point(&self, mount_point: &str) -> bool {
        let trimmed = match mount_point.trim_end_matches('/') {
            "" => "/",
            other => other,
        };
        self.disabled_mount_points.iter().any(|p| p == trimmed)
    }
}
