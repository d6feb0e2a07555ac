// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::backend::{RECOVERY_KEY_LEN, RecoveryKeyGenerator};

const GENERATOR_BINARY: &str = "usec-recoverykey";

/// Runs the vendor recovery key tool, which prints one key on stdout.
pub struct CommandKeyGenerator {
    binary: PathBuf,
}

impl CommandKeyGenerator {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    pub fn discover() -> Option<Self> {
        which::which(GENERATOR_BINARY).ok().map(Self::new)
    }
}

#[async_trait]
impl RecoveryKeyGenerator for CommandKeyGenerator {
    async fn generate(&self) -> Option<String> {
        let output = match Command::new(&self.binary)
            .arg(RECOVERY_KEY_LEN.to_string())
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("{} failed to start: {}", self.binary.display(), e);
                return None;
            }
        };
        if !output.status.success() {
            tracing::warn!("{} exited with {}", self.binary.display(), output.status);
            return None;
        }
        parse_key(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_key(stdout: &str) -> Option<String> {
    let key = stdout.lines().next()?.trim();
    (key.len() == RECOVERY_KEY_LEN).then(|| key.to_string())
}
