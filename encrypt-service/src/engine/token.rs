// SPDX-License-Identifier: GPL-3.0-only

use encrypt_types::{ErrorKind, token};

use super::fail;
use crate::context::JobContext;

/// Writes `token` into the header of `device`.
///
/// A `token_index` inside the JSON selects the token id, otherwise any free
/// id is used. An empty token is accepted and ignored.
pub async fn set_token(ctx: &JobContext, device: &str, token: &str) -> Result<(), ErrorKind> {
    if token.is_empty() {
        return Ok(());
    }
    let index = token::token_index(token);
    let body = token::stored_form(token).map_err(|e| {
        tracing::warn!("{}: token is not a JSON object: {}", device, e);
        ErrorKind::SetTokenFailed
    })?;
    ctx.crypt
        .set_token(device, index, &body)
        .await
        .map_err(fail(ErrorKind::SetTokenFailed, device))
}

/// First trust module token of `device` with its `token_index` filled in, or
/// an empty string.
pub async fn query_token(ctx: &JobContext, device: &str) -> String {
    for id in 0..token::MAX_TOKENS {
        let json = match ctx.crypt.token(device, id).await {
            Ok(Some(json)) => json,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("{}: cannot read token {}: {}", device, id, e);
                return String::new();
            }
        };
        if !token::is_tpm_token(&json) {
            continue;
        }
        match token::with_token_index(&json, id) {
            Ok(indexed) => return indexed,
            Err(e) => {
                tracing::warn!("{}: token {} is not valid JSON: {}", device, id, e);
                return String::new();
            }
        }
    }
    tracing::info!("{}: no trust module token", device);
    String::new()
}
