// SPDX-License-Identifier: GPL-3.0-only

//! Job records on the boot partition.
//!
//! `encrypt.json` existing is the only evidence across restarts that an
//! encryption is outstanding. Removing it commits the job.

use std::path::{Path, PathBuf};

use encrypt_types::{DecryptJobConfig, EncryptJobConfig, ErrorKind};
use serde::Serialize;

use crate::config::ServiceConfig;

pub struct JobStore<'a> {
    config: &'a ServiceConfig,
}

impl<'a> JobStore<'a> {
    pub fn new(config: &'a ServiceConfig) -> Self {
        Self { config }
    }

    pub fn encrypt_path(&self) -> PathBuf {
        self.config.encrypt_job_path()
    }

    pub fn has_pending_encrypt(&self) -> bool {
        self.encrypt_path().exists()
    }

    pub fn write_encrypt(&self, job: &EncryptJobConfig) -> Result<(), ErrorKind> {
        self.write(&self.encrypt_path(), job, "pending encrypt job replaced")
    }

    pub fn write_decrypt(&self, job: &DecryptJobConfig) -> Result<(), ErrorKind> {
        self.write(
            &self.config.decrypt_job_path(),
            job,
            "pending decrypt job replaced",
        )
    }

    /// The pending encryption, if any. An unreadable record is reported and
    /// treated as absent.
    pub fn read_encrypt(&self) -> Option<EncryptJobConfig> {
        let path = self.encrypt_path();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No pending encrypt job");
                return None;
            }
            Err(e) => {
                tracing::warn!("Cannot read {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::warn!("Malformed {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn remove_encrypt(&self) -> Result<(), ErrorKind> {
        let path = self.encrypt_path();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!("Encrypt job record {} removed", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                tracing::warn!("Cannot remove {}: {}", path.display(), e);
                Err(ErrorKind::OpenFileFailed)
            }
        }
    }

    fn write(&self, path: &Path, job: &impl Serialize, replaced: &str) -> Result<(), ErrorKind> {
        if let Err(e) = std::fs::create_dir_all(&self.config.job_dir) {
            tracing::warn!("Cannot create {}: {}", self.config.job_dir.display(), e);
            return Err(ErrorKind::OpenFileFailed);
        }
        if path.exists() {
            tracing::info!("{}", replaced);
        }
        let json = serde_json::to_string_pretty(job).map_err(|e| {
            tracing::warn!("Cannot serialize job record: {}", e);
            ErrorKind::OpenFileFailed
        })?;
        std::fs::write(path, json).map_err(|e| {
            tracing::warn!("Cannot write {}: {}", path.display(), e);
            ErrorKind::OpenFileFailed
        })?;
        tracing::info!("Job record written to {}", path.display());
        Ok(())
    }
}
