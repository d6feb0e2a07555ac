// SPDX-License-Identifier: GPL-3.0-only

//! LUKS2 token JSON helpers.
//!
//! Tokens are opaque to the service except for three keys: `type`, `keyslots`
//! and the `token_index` hint clients attach to say where a token belongs.

use serde_json::{Map, Value, json};

/// Substring identifying a trust module token.
pub const TPM_TOKEN_MARKER: &str = "usec-tpm2";
/// `type` of the token marking a recovery keyslot.
pub const RECOVERY_TOKEN_TYPE: &str = "usec-recoverykey";
/// Number of token ids in a LUKS2 header.
pub const MAX_TOKENS: u32 = 32;
const TOKEN_INDEX_KEY: &str = "token_index";

fn parse_object(token: &str) -> Result<Map<String, Value>, serde_json::Error> {
    serde_json::from_str(token)
}

pub fn is_tpm_token(token: &str) -> bool {
    token.contains(TPM_TOKEN_MARKER)
}

/// Returns `token` with `token_index` set to `index`.
pub fn with_token_index(token: &str, index: u32) -> Result<String, serde_json::Error> {
    let mut object = parse_object(token)?;
    object.insert(TOKEN_INDEX_KEY.to_string(), Value::from(index));
    serde_json::to_string(&object)
}

/// Slot requested through `token_index`, if any.
pub fn token_index(token: &str) -> Option<u32> {
    let object = parse_object(token).ok()?;
    match object.get(TOKEN_INDEX_KEY)? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Token body as stored in the header, without the `token_index` hint.
pub fn stored_form(token: &str) -> Result<String, serde_json::Error> {
    let mut object = parse_object(token)?;
    object.remove(TOKEN_INDEX_KEY);
    serde_json::to_string(&object)
}

/// Returns `token` bound to the single keyslot `slot`.
pub fn with_keyslot(token: &str, slot: u32) -> Result<String, serde_json::Error> {
    let mut object = parse_object(token)?;
    object.insert("keyslots".to_string(), json!([slot.to_string()]));
    serde_json::to_string(&object)
}

pub fn recovery_token(slot: u32) -> String {
    json!({ "type": RECOVERY_TOKEN_TYPE, "keyslots": [slot.to_string()] }).to_string()
}
