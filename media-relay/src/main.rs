use std::sync::Arc;

use anyhow::Context;
use mimalloc::MiMalloc;
use tracing::{error, info};

use media_relay::api::{ApiServer, AppState};
use media_relay::logging::init_logging;
use media_relay::{ArtifactStore, Pipeline, RelayConfig};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Logging first, so configuration problems are reported.
    let _log_guard = init_logging(RelayConfig::log_format_from_env())?;
    let config = RelayConfig::from_env();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        extractor = %config.pipeline.extractor.program(),
        transcoder = %config.pipeline.transcoder.program(),
        timeout_ms = config.pipeline.timeout.as_millis() as u64,
        proxy = config.pipeline.proxy.is_some(),
        "Starting media-relay"
    );

    let store = ArtifactStore::open(&config.artifact_dir, config.artifact_retention)
        .await
        .context("opening artifact store")?;
    let state = AppState::new(Pipeline::new(config.pipeline.clone()), Arc::new(store));
    let server = ApiServer::new(config.server.clone(), state);

    let cancel_token = server.cancel_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        cancel_token.cancel();
    });

    server.run().await?;
    info!("media-relay stopped");
    Ok(())
}
