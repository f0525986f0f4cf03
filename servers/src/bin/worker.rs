//! Fan-out worker: consumes tweet-created events and distributes each
//! tweet into follower timelines and live pushes.

use std::sync::Arc;

use anyhow::Result;

use lib_common::connections::RedisCache;
use lib_common::retrieve::ReadApiClient;
use lib_common::{configs, loggers, ReadApi, TimelineCache};
use servers::boot;
use servers::fanout::FanoutWorker;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cfg = configs::load_config();
    loggers::setup_logging(cfg.log_dir.as_deref(), &cfg.log_level, "worker")?;

    let token = boot::shutdown_token();

    let cache: Arc<dyn TimelineCache> = Arc::new(RedisCache::connect(&cfg).await?);
    let api: Arc<dyn ReadApi> = Arc::new(ReadApiClient::new(&cfg.api_base_url, cfg.op_timeout)?);

    let worker = FanoutWorker::new(cache, api, &cfg);
    log::info!(
        "Fan-out worker '{}' consuming tweet-created events",
        cfg.consumer_name
    );

    // A persistent event-source failure is fatal: exit non-zero and let
    // the supervisor restart us; pending stream entries are redelivered.
    if let Err(e) = worker.run(token).await {
        log::error!("fan-out worker fatal: {e}");
        return Err(e.into());
    }

    log::info!("Shutdown complete.");
    Ok(())
}
