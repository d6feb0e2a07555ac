// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;
use encrypt_sys::{E2fsTools, SysError};

use crate::backend::FsResizer;

pub struct E2fsResizer {
    tools: E2fsTools,
}

impl E2fsResizer {
    pub fn new(tools: E2fsTools) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl FsResizer for E2fsResizer {
    async fn shrink(&self, device: &str, reserve_bytes: u64) -> Result<(), SysError> {
        self.tools.shrink(device, reserve_bytes).await
    }

    async fn expand(&self, device: &str) -> Result<(), SysError> {
        self.tools.expand(device).await
    }

    async fn recover(&self, device: &str, data_offset: u64) -> Result<(), SysError> {
        self.tools.recover(device, data_offset).await
    }
}
