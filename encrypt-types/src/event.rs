// SPDX-License-Identifier: GPL-3.0-only

//! Notifications published while jobs run.
//!
//! Every event names the device it concerns. Consumers must match on that
//! rather than assume an event belongs to the job they started last.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::KeyConfig;
use crate::error::JobResult;

/// Request-scoped job identifier handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(format!("job_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub device: String,
    pub device_name: String,
    /// `offset / size`, in `0.0..=1.0`.
    pub fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub device: String,
    pub device_name: String,
    /// Empty when the request was rejected before a job existed.
    pub job_id: String,
    pub result: JobResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "payload")]
pub enum EncryptEvent {
    EncryptProgress(ProgressUpdate),
    DecryptProgress(ProgressUpdate),
    PrepareEncryptResult(JobOutcome),
    EncryptResult(JobOutcome),
    DecryptResult(JobOutcome),
    ChangePassphraseResult(JobOutcome),
    /// The pending boot job waits for a client to supply its parameters.
    RequestEncryptParams(KeyConfig),
}

impl EncryptEvent {
    /// Device the event concerns.
    pub fn device(&self) -> &str {
        match self {
            Self::EncryptProgress(p) | Self::DecryptProgress(p) => &p.device,
            Self::PrepareEncryptResult(o)
            | Self::EncryptResult(o)
            | Self::DecryptResult(o)
            | Self::ChangePassphraseResult(o) => &o.device,
            Self::RequestEncryptParams(k) => &k.device,
        }
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        match self {
            Self::PrepareEncryptResult(o)
            | Self::EncryptResult(o)
            | Self::DecryptResult(o)
            | Self::ChangePassphraseResult(o) => Some(o),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn job_ids_are_prefixed_and_distinct() {
        let a = JobId::new();
        let b = JobId::new();
        assert!(a.as_str().starts_with("job_"));
        assert_ne!(a, b);
    }

    #[test]
    fn events_expose_their_device() {
        let event = EncryptEvent::DecryptResult(JobOutcome {
            device: "/dev/sdc1".into(),
            device_name: "Backup".into(),
            job_id: "job_1".into(),
            result: JobResult::failed(ErrorKind::WrongPassphrase),
        });
        assert_eq!(event.device(), "/dev/sdc1");
        assert_eq!(
            event.outcome().map(|o| o.result.kind()),
            Some(Some(ErrorKind::WrongPassphrase))
        );

        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "decrypt_result");
    }
}
