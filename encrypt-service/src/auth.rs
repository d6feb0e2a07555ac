// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;
use zbus::Connection;
use zbus_polkit::policykit1::AuthorityProxy;

/// Actions callers must be authorized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Encrypt,
    Decrypt,
    ChangePassphrase,
}

impl Action {
    pub fn id(self) -> &'static str {
        match self {
            Self::Encrypt => "org.cosmic.ext.disk-encrypt.encrypt",
            Self::Decrypt => "org.cosmic.ext.disk-encrypt.decrypt",
            Self::ChangePassphrase => "org.cosmic.ext.disk-encrypt.change-passphrase",
        }
    }
}

/// Decides whether `caller` (a bus name) may perform `action`.
#[async_trait]
pub trait Authority: Send + Sync {
    async fn is_authorized(&self, caller: &str, action: Action) -> bool;
}

/// Polkit-backed [`Authority`].
pub struct PolkitAuthority {
    connection: Connection,
}

impl PolkitAuthority {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl Authority for PolkitAuthority {
    async fn is_authorized(&self, caller: &str, action: Action) -> bool {
        match check_authorization(&self.connection, caller, action.id()).await {
            Ok(authorized) => authorized,
            Err(e) => {
                tracing::warn!("Authorization check for {} failed: {}", action.id(), e);
                false
            }
        }
    }
}

/// Check D-Bus caller authorization using Polkit
pub async fn check_authorization(
    connection: &Connection,
    sender: &str,
    action_id: &str,
) -> Result<bool, zbus::Error> {
    tracing::debug!(
        "Checking authorization for sender={} action={}",
        sender,
        action_id
    );

    let authority = AuthorityProxy::new(connection).await?;

    let dbus_proxy = zbus::fdo::DBusProxy::new(connection).await?;
    let bus_name: zbus::names::BusName = sender
        .try_into()
        .map_err(|e| zbus::Error::Failure(format!("Invalid bus name: {}", e)))?;
    let pid = dbus_proxy.get_connection_unix_process_id(bus_name).await?;

    let subject = zbus_polkit::policykit1::Subject::new_for_owner(pid, None, None)
        .map_err(|e| zbus::Error::Failure(format!("Failed to create subject: {}", e)))?;

    let result = authority
        .check_authorization(
            &subject,
            action_id,
            &std::collections::HashMap::new(),
            zbus_polkit::policykit1::CheckAuthorizationFlags::AllowUserInteraction.into(),
            "",
        )
        .await?;

    tracing::debug!(
        "Authorization result for {}: authorized={}, challenged={}",
        action_id,
        result.is_authorized,
        result.is_challenge
    );

    Ok(result.is_authorized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_ids_share_the_service_prefix() {
        for action in [Action::Encrypt, Action::Decrypt, Action::ChangePassphrase] {
            assert!(action.id().starts_with("org.cosmic.ext.disk-encrypt."));
        }
    }
}
