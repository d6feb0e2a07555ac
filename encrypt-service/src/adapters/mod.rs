// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use encrypt_sys::{Cryptsetup, E2fsTools};
use zbus::Connection;

use crate::backend::{BlockDevices, CryptBackend, FsResizer, RecoveryKeyGenerator};
use crate::config::ServiceConfig;

pub mod cryptsetup;
pub mod recovery;
pub mod resize;
pub mod udisks;

pub use cryptsetup::CryptsetupBackend;
pub use recovery::CommandKeyGenerator;
pub use resize::E2fsResizer;
pub use udisks::UdisksBlockDevices;

pub struct DefaultAdapters {
    pub crypt: Arc<dyn CryptBackend>,
    pub blocks: Arc<dyn BlockDevices>,
    pub resizer: Arc<dyn FsResizer>,
    pub recovery_keys: Option<Arc<dyn RecoveryKeyGenerator>>,
}

/// Wires the system tools. Fails fast when a required tool is missing.
pub fn build_default_adapters(
    config: &ServiceConfig,
    connection: Connection,
) -> anyhow::Result<DefaultAdapters> {
    let cryptsetup = match &config.cryptsetup_binary {
        Some(binary) => Cryptsetup::new(binary.clone(), config.command_timeout()),
        None => Cryptsetup::discover(config.command_timeout())?,
    };
    tracing::info!("Using {}", cryptsetup.binary().display());

    let recovery_keys = CommandKeyGenerator::discover()
        .map(|generator| Arc::new(generator) as Arc<dyn RecoveryKeyGenerator>);
    if recovery_keys.is_none() {
        tracing::info!("Recovery key generator not installed, falling back to UUID keys");
    }

    Ok(DefaultAdapters {
        crypt: Arc::new(CryptsetupBackend::new(cryptsetup)),
        blocks: Arc::new(UdisksBlockDevices::new(connection)),
        resizer: Arc::new(E2fsResizer::new(E2fsTools::discover()?)),
        recovery_keys,
    })
}
