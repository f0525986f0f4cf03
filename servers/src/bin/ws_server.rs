//! Real-time gateway: websocket connections keyed by user id, hydrated on
//! connect and fed by the fan-out push channel.

use std::sync::Arc;

use anyhow::Result;

use lib_common::connections::RedisCache;
use lib_common::retrieve::ReadApiClient;
use lib_common::{configs, loggers, ReadApi, TimelineCache};
use servers::boot;
use servers::gateway::{self, ConnectionRegistry, GatewayState};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cfg = configs::load_config();
    loggers::setup_logging(cfg.log_dir.as_deref(), &cfg.log_level, "ws_server")?;

    let token = boot::shutdown_token();

    let cache: Arc<dyn TimelineCache> = Arc::new(RedisCache::connect(&cfg).await?);
    let api: Arc<dyn ReadApi> = Arc::new(ReadApiClient::new(&cfg.api_base_url, cfg.op_timeout)?);

    let state = GatewayState {
        registry: ConnectionRegistry::new(),
        cache,
        api,
        hydrate_page_size: cfg.hydrate_page_size,
        shutdown: token.clone(),
    };

    // The relay cancels the shutdown token itself if the subscription is
    // lost, which also stops the accept loop below.
    let relay = tokio::spawn(gateway::relay_envelopes(state.clone()));

    gateway::run(cfg.ws_port, state, token.clone()).await?;
    token.cancel();

    match relay.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            log::error!("envelope relay fatal: {e}");
            return Err(e.into());
        }
        Err(e) => log::error!("envelope relay panicked: {e}"),
    }

    log::info!("Shutdown complete.");
    Ok(())
}
