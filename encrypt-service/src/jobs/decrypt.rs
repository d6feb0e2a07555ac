// SPDX-License-Identifier: GPL-3.0-only

use encrypt_types::{DecryptJobConfig, DecryptRequest, ErrorKind};

use crate::context::JobContext;
use crate::engine::{JobStore, reencrypt};

pub async fn run(ctx: &JobContext, req: &DecryptRequest) -> Result<(), ErrorKind> {
    if req.init_params_only {
        JobStore::new(&ctx.config).write_decrypt(&DecryptJobConfig::new(&req.device, &req.uuid))?;
        tracing::info!("{}: decryption deferred to next boot", req.device);
        return Err(ErrorKind::RebootRequired);
    }
    reencrypt::run_decrypt(ctx, &req.device, &req.device_name, &req.passphrase).await
}
