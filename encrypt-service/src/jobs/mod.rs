// SPDX-License-Identifier: GPL-3.0-only

//! Job workers. Each runs its steps strictly in order and ends in one result
//! code; none of them publishes its own terminal result.

pub mod decrypt;
pub mod passphrase;
pub mod prepare;
pub mod reencrypt;
pub mod resume;

pub use prepare::Prepared;
pub use resume::ResumeWorker;
