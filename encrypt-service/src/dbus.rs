// SPDX-License-Identifier: GPL-3.0-only

//! D-Bus facade of the encryption service.
//!
//! Request parameters arrive as JSON objects. Methods answer with a job id
//! (empty when the request was rejected outright); outcomes follow as signals.

use std::sync::Arc;

use encrypt_types::{ChangePassphraseRequest, DecryptRequest, EncryptEvent, EncryptRequest};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::RecvError;
use zbus::message::Header as MessageHeader;
use zbus::object_server::SignalEmitter;
use zbus::{Connection, interface};

use crate::error::{Result, ServiceError};
use crate::manager::EncryptManager;

pub const BUS_NAME: &str = "org.cosmic.ext.DiskEncrypt.Service";
pub const OBJECT_PATH: &str = "/org/cosmic/ext/DiskEncrypt";

pub struct DiskEncryptHandler {
    manager: Arc<EncryptManager>,
}

impl DiskEncryptHandler {
    pub fn new(manager: Arc<EncryptManager>) -> Self {
        Self { manager }
    }
}

fn parse<T: DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| ServiceError::InvalidArgument(e.to_string()))
}

fn caller(header: &MessageHeader<'_>) -> String {
    header
        .sender()
        .map(|sender| sender.to_string())
        .unwrap_or_default()
}

#[interface(name = "org.cosmic.ext.DiskEncrypt")]
impl DiskEncryptHandler {
    #[zbus(signal)]
    async fn encrypt_progress(
        signal_ctxt: &SignalEmitter<'_>,
        device: &str,
        device_name: &str,
        fraction: f64,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn decrypt_progress(
        signal_ctxt: &SignalEmitter<'_>,
        device: &str,
        device_name: &str,
        fraction: f64,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn prepare_encrypt_disk_result(
        signal_ctxt: &SignalEmitter<'_>,
        device: &str,
        device_name: &str,
        job_id: &str,
        code: i32,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn encrypt_disk_result(
        signal_ctxt: &SignalEmitter<'_>,
        device: &str,
        device_name: &str,
        code: i32,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn decrypt_disk_result(
        signal_ctxt: &SignalEmitter<'_>,
        device: &str,
        device_name: &str,
        job_id: &str,
        code: i32,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn change_passphrase_result(
        signal_ctxt: &SignalEmitter<'_>,
        device: &str,
        device_name: &str,
        job_id: &str,
        code: i32,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn request_encrypt_params(
        signal_ctxt: &SignalEmitter<'_>,
        key_config: &str,
    ) -> zbus::Result<()>;

    /// Starts encrypting a device, or records it for the next boot.
    ///
    /// Authorization: org.cosmic.ext.disk-encrypt.encrypt
    async fn prepare_encrypt_disk(
        &self,
        #[zbus(header)] header: MessageHeader<'_>,
        params: &str,
    ) -> zbus::fdo::Result<String> {
        let req: EncryptRequest = parse(params)?;
        tracing::debug!("PrepareEncryptDisk {:?}", req);
        Ok(self.manager.prepare_encrypt(&caller(&header), req).await)
    }

    /// Authorization: org.cosmic.ext.disk-encrypt.decrypt
    async fn decrypt_disk(
        &self,
        #[zbus(header)] header: MessageHeader<'_>,
        params: &str,
    ) -> zbus::fdo::Result<String> {
        let req: DecryptRequest = parse(params)?;
        tracing::debug!("DecryptDisk {:?}", req);
        Ok(self.manager.decrypt(&caller(&header), req).await)
    }

    /// Authorization: org.cosmic.ext.disk-encrypt.change-passphrase
    async fn change_encrypt_passphrase(
        &self,
        #[zbus(header)] header: MessageHeader<'_>,
        params: &str,
    ) -> zbus::fdo::Result<String> {
        let req: ChangePassphraseRequest = parse(params)?;
        tracing::debug!("ChangeEncryptPassphrase {:?}", req);
        Ok(self.manager.change_passphrase(&caller(&header), req).await)
    }

    /// Trust module token of `device` with its `token_index`, or "".
    async fn query_tpm_token(&self, device: &str) -> String {
        self.manager.query_token(device).await
    }

    /// Supplies the parameters a pending boot-time encryption asked for.
    async fn set_encrypt_params(
        &self,
        #[zbus(header)] header: MessageHeader<'_>,
        params: &str,
    ) -> zbus::fdo::Result<()> {
        let req: EncryptRequest = parse(params)?;
        self.manager.set_deferred_params(&caller(&header), req).await;
        Ok(())
    }
}

/// Relays job events as signals of the object at [`OBJECT_PATH`].
pub async fn forward_events(connection: &Connection, manager: &EncryptManager) -> zbus::Result<()> {
    let iface_ref = connection
        .object_server()
        .interface::<_, DiskEncryptHandler>(OBJECT_PATH)
        .await?;
    let mut events = manager.subscribe();

    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Signal relay lagged, {} events dropped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if let Err(e) = emit(iface_ref.signal_emitter(), &event).await {
                tracing::error!("Failed to emit signal for {}: {}", event.device(), e);
            }
        }
    });
    Ok(())
}

async fn emit(ctxt: &SignalEmitter<'_>, event: &EncryptEvent) -> zbus::Result<()> {
    match event {
        EncryptEvent::EncryptProgress(p) => {
            DiskEncryptHandler::encrypt_progress(ctxt, &p.device, &p.device_name, p.fraction).await
        }
        EncryptEvent::DecryptProgress(p) => {
            DiskEncryptHandler::decrypt_progress(ctxt, &p.device, &p.device_name, p.fraction).await
        }
        EncryptEvent::PrepareEncryptResult(o) => {
            DiskEncryptHandler::prepare_encrypt_disk_result(
                ctxt,
                &o.device,
                &o.device_name,
                &o.job_id,
                o.result.code(),
            )
            .await
        }
        EncryptEvent::EncryptResult(o) => {
            DiskEncryptHandler::encrypt_disk_result(ctxt, &o.device, &o.device_name, o.result.code())
                .await
        }
        EncryptEvent::DecryptResult(o) => {
            DiskEncryptHandler::decrypt_disk_result(
                ctxt,
                &o.device,
                &o.device_name,
                &o.job_id,
                o.result.code(),
            )
            .await
        }
        EncryptEvent::ChangePassphraseResult(o) => {
            DiskEncryptHandler::change_passphrase_result(
                ctxt,
                &o.device,
                &o.device_name,
                &o.job_id,
                o.result.code(),
            )
            .await
        }
        EncryptEvent::RequestEncryptParams(config) => {
            let json = serde_json::to_string(config)
                .map_err(|e| zbus::Error::Failure(format!("Serialize error: {e}")))?;
            DiskEncryptHandler::request_encrypt_params(ctxt, &json).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_params_are_invalid_arguments() {
        let err = parse::<EncryptRequest>("{").expect_err("must fail");
        assert!(matches!(
            zbus::fdo::Error::from(err),
            zbus::fdo::Error::InvalidArgs(_)
        ));
    }
}
