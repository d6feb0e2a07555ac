// SPDX-License-Identifier: GPL-3.0-only

//! Parsers for `cryptsetup` output.

use std::collections::{BTreeMap, BTreeSet};

use encrypt_types::Requirement;
use enumflags2::BitFlags;
use serde_json::Value;

use crate::error::{Result, SysError};

/// The parts of a LUKS2 header (`luksDump --dump-json-metadata`) the service reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LuksMetadata {
    pub keyslots: BTreeSet<u32>,
    pub tokens: BTreeMap<u32, Value>,
    pub requirements: BitFlags<Requirement>,
    /// Byte offset of the first data segment on the data device.
    pub data_offset: Option<u64>,
}

impl LuksMetadata {
    pub fn parse(json: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(json)?;
        let object = root
            .as_object()
            .ok_or_else(|| SysError::Parse("LUKS2 metadata is not an object".into()))?;

        let keyslots = object
            .get("keyslots")
            .and_then(Value::as_object)
            .map(|slots| slots.keys().filter_map(|k| k.parse().ok()).collect())
            .unwrap_or_default();

        let tokens = object
            .get("tokens")
            .and_then(Value::as_object)
            .map(|tokens| {
                tokens
                    .iter()
                    .filter_map(|(k, v)| k.parse().ok().map(|id| (id, v.clone())))
                    .collect()
            })
            .unwrap_or_default();

        let requirements = object
            .get("config")
            .and_then(|config| config.get("requirements"))
            .and_then(|reqs| reqs.get("mandatory"))
            .and_then(Value::as_array)
            .map(|mandatory| {
                mandatory
                    .iter()
                    .filter_map(Value::as_str)
                    .map(requirement_from_name)
                    .collect()
            })
            .unwrap_or_default();

        let data_offset = object
            .get("segments")
            .and_then(Value::as_object)
            .and_then(|segments| {
                segments
                    .values()
                    .filter_map(|segment| match segment.get("offset")? {
                        Value::String(s) => s.parse::<u64>().ok(),
                        Value::Number(n) => n.as_u64(),
                        _ => None,
                    })
                    .min()
            });

        Ok(Self {
            keyslots,
            tokens,
            requirements,
            data_offset,
        })
    }
}

fn requirement_from_name(name: &str) -> Requirement {
    if name.starts_with("online-reencrypt") {
        Requirement::OnlineReencrypt
    } else if name.starts_with("offline-reencrypt") {
        Requirement::OfflineReencrypt
    } else {
        Requirement::Unknown
    }
}

/// Keyslot reported by `open --test-passphrase -v` ("Key slot 1 unlocked.").
pub fn parse_unlocked_slot(output: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Key slot ")?;
        let (slot, tail) = rest.split_once(' ')?;
        tail.starts_with("unlocked").then(|| slot.parse().ok())?
    })
}

/// One `--progress-json` line: bytes processed and total bytes.
pub fn parse_progress_line(line: &str) -> Option<(u64, u64)> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let number = |key: &str| match value.get(key)? {
        Value::String(s) => s.parse::<u64>().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    };
    Some((number("device_bytes")?, number("device_size")?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"{
        "keyslots": {
            "0": {"type": "luks2", "key_size": 64},
            "2": {"type": "luks2", "key_size": 64}
        },
        "tokens": {
            "1": {"type": "usec-tpm2", "keyslots": ["0"]}
        },
        "segments": {
            "0": {"type": "crypt", "offset": "33554432", "size": "dynamic"}
        },
        "digests": {},
        "config": {
            "json_size": "12288",
            "keyslots_size": "16744448",
            "requirements": {"mandatory": ["online-reencrypt-v2"]}
        }
    }"#;

    #[test]
    fn parses_slots_tokens_and_requirements() {
        let meta = LuksMetadata::parse(DUMP).expect("parse");
        assert_eq!(meta.keyslots, BTreeSet::from([0, 2]));
        assert_eq!(meta.tokens.len(), 1);
        assert_eq!(meta.tokens[&1]["type"], "usec-tpm2");
        assert_eq!(meta.requirements, BitFlags::from(Requirement::OnlineReencrypt));
        assert_eq!(meta.data_offset, Some(32 * 1024 * 1024));
    }

    #[test]
    fn finished_header_has_no_requirements() {
        let meta = LuksMetadata::parse(r#"{"keyslots":{"0":{}},"config":{}}"#).expect("parse");
        assert!(meta.requirements.is_empty());
        assert_eq!(meta.data_offset, None);
    }

    #[test]
    fn unrecognized_requirement_is_flagged_unknown() {
        let meta = LuksMetadata::parse(
            r#"{"config":{"requirements":{"mandatory":["offline-reencrypt","future-thing"]}}}"#,
        )
        .expect("parse");
        assert!(meta.requirements.contains(Requirement::OfflineReencrypt));
        assert!(meta.requirements.contains(Requirement::Unknown));
    }

    #[test]
    fn unlocked_slot_from_verbose_output() {
        let out = "No usable token is available.\nKey slot 3 unlocked.\nCommand successful.\n";
        assert_eq!(parse_unlocked_slot(out), Some(3));
        assert_eq!(parse_unlocked_slot("Command successful.\n"), None);
    }

    #[test]
    fn progress_lines_accept_string_or_number_fields() {
        assert_eq!(
            parse_progress_line(
                r#"{"device":"/dev/sdb1","device_bytes":"1048576","device_size":"4194304","speed":"0"}"#
            ),
            Some((1_048_576, 4_194_304))
        );
        assert_eq!(
            parse_progress_line(r#"{"device_bytes":10,"device_size":20}"#),
            Some((10, 20))
        );
        assert_eq!(parse_progress_line("Progress: 10.0%"), None);
    }
}
