// SPDX-License-Identifier: GPL-3.0-only

//! COSMIC Ext Disk Encryption Service
//!
//! In-place LUKS2 encryption and decryption of block devices, driven over
//! the D-Bus system bus. Work runs as tracked jobs:
//!
//! - **manager**: authorization, per-device admission and job lifecycle
//! - **jobs**: prepare/encrypt, decrypt, passphrase change and boot resume
//! - **engine**: header handling, reencryption steps and system tables
//! - **adapters**: production collaborators over cryptsetup, UDisks2 and e2fsprogs
//! - **dbus**: the bus interface and its signal relay

pub mod adapters;
pub mod auth;
pub mod backend;
pub mod config;
pub mod context;
pub mod dbus;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod manager;

pub use config::ServiceConfig;
pub use context::JobContext;
pub use error::{Result, ServiceError};
pub use manager::{EncryptManager, JobKind, JobState};
