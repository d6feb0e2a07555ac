// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use encrypt_types::EncryptEvent;
use tokio::sync::broadcast;

use crate::backend::{
    BlockDevices, CryptBackend, FsResizer, RecoveryKeyGenerator, fallback_recovery_key,
};
use crate::config::ServiceConfig;

/// Capacity of the process-wide event channel. Slow subscribers lose old
/// progress updates rather than stall workers.
pub const EVENT_CAPACITY: usize = 256;

/// Everything a job needs: configuration, collaborators and the event channel.
pub struct JobContext {
    pub config: Arc<ServiceConfig>,
    pub crypt: Arc<dyn CryptBackend>,
    pub blocks: Arc<dyn BlockDevices>,
    pub resizer: Arc<dyn FsResizer>,
    pub recovery_keys: Option<Arc<dyn RecoveryKeyGenerator>>,
    pub events: broadcast::Sender<EncryptEvent>,
}

impl JobContext {
    pub fn new(
        config: ServiceConfig,
        crypt: Arc<dyn CryptBackend>,
        blocks: Arc<dyn BlockDevices>,
        resizer: Arc<dyn FsResizer>,
        recovery_keys: Option<Arc<dyn RecoveryKeyGenerator>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config: Arc::new(config),
            crypt,
            blocks,
            resizer,
            recovery_keys,
            events,
        }
    }

    pub fn publish(&self, event: EncryptEvent) {
        // No subscriber is fine: results are fire-and-forget.
        let _ = self.events.send(event);
    }

    pub async fn recovery_key(&self) -> String {
        if let Some(generator) = &self.recovery_keys
            && let Some(key) = generator.generate().await
        {
            return key;
        }
        tracing::info!("No recovery key generator, using a UUID-derived key");
        fallback_recovery_key()
    }
}
