// SPDX-License-Identifier: GPL-3.0-only

//! COSMIC Ext Disk Encryption Service - D-Bus service for in-place LUKS2
//! encryption, with Polkit-based authorization.

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt};
use zbus::Connection;
use zbus::connection::Builder as ConnectionBuilder;

use encrypt_service::adapters::build_default_adapters;
use encrypt_service::auth::PolkitAuthority;
use encrypt_service::dbus::{self, BUS_NAME, DiskEncryptHandler, OBJECT_PATH};
use encrypt_service::{EncryptManager, JobContext, ServiceConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging to journald/stderr
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("encrypt_service=info,encrypt_sys=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        "Starting COSMIC Ext Disk Encryption Service v{}",
        env!("CARGO_PKG_VERSION")
    );

    if unsafe { libc::geteuid() } != 0 {
        tracing::error!("Encryption service must run as root");
        anyhow::bail!("Service must run with root privileges");
    }

    let config = ServiceConfig::load()?;
    tracing::debug!("Configuration: {:?}", config);

    // UDisks2 and Polkit are reached over a client connection of their own.
    let system = Connection::system().await?;
    let adapters = build_default_adapters(&config, system.clone())?;
    let ctx = JobContext::new(
        config,
        adapters.crypt,
        adapters.blocks,
        adapters.resizer,
        adapters.recovery_keys,
    );
    let manager = Arc::new(EncryptManager::new(
        ctx,
        Arc::new(PolkitAuthority::new(system)),
    ));

    let connection = ConnectionBuilder::system()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, DiskEncryptHandler::new(manager.clone()))?
        .build()
        .await?;
    tracing::info!("Service registered on D-Bus system bus");
    tracing::info!("  - {} at {}", BUS_NAME, OBJECT_PATH);

    // Subscribe before any job can publish.
    dbus::forward_events(&connection, &manager).await?;
    manager.start().await;

    tracing::info!("Service ready, waiting for requests...");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    tracing::info!("COSMIC Ext Disk Encryption Service shutting down");
    Ok(())
}
