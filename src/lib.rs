pub mod api;
pub mod commands;
pub mod config;
pub mod context;
pub mod device;
pub mod events;
pub mod ingest;
pub mod serial;
pub mod store;

use std::sync::Arc;

use anyhow::Context as _;

use config::AppConfig;
use context::AppContext;
use serial::SystemSerial;

/// Run the service on the real serial ports until Ctrl-C.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let ctx = AppContext::build(config, Arc::new(SystemSerial::new()))
        .await
        .context("Failed to build application context")?;
    ctx.start();

    log::info!("SensorLink started");

    if ctx.config().api.enabled {
        let api = api::serve(Arc::clone(&ctx), async {
            let _ = tokio::signal::ctrl_c().await;
        });
        if let Err(e) = api.await {
            ctx.shutdown().await;
            return Err(e).context("HTTP API failed");
        }
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    }

    ctx.shutdown().await;
    Ok(())
}
