// SPDX-License-Identifier: GPL-3.0-only

//! Building blocks the job workers sequence: header preparation, reencryption
//! runs, boot table upkeep, job records and tokens.
//!
//! Every operation here reports failures as the [`ErrorKind`] callers see and
//! logs the underlying system error.

use encrypt_sys::SysError;
use encrypt_types::ErrorKind;

pub mod header;
pub mod jobfile;
pub mod reencrypt;
pub mod tables;
pub mod token;

pub use header::{HeaderManager, KeySlots, PreparedHeader};
pub use jobfile::JobStore;
pub use reencrypt::ProgressReporter;
pub use tables::TableMaintainer;

/// Node of an opened mapping.
pub fn mapper_path(name: &str) -> String {
    format!("/dev/mapper/{name}")
}

/// Logs `error` against `device` and yields `kind`.
pub(crate) fn fail(kind: ErrorKind, device: &str) -> impl FnOnce(SysError) -> ErrorKind + '_ {
    move |error| {
        tracing::warn!("{}: {} ({})", device, kind, error);
        kind
    }
}
