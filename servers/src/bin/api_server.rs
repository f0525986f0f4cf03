//! HTTP API server: tweet/user/follow writes plus the read surface the
//! worker and the gateway fall back to.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;

use lib_common::connections::{MemoryStore, PostgresStore, RedisCache};
use lib_common::{configs, loggers, TimelineCache, TweetStore};
use servers::boot;
use servers::ingest::TweetService;
use servers::routes::{self, ApiState};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cfg = configs::load_config();
    loggers::setup_logging(cfg.log_dir.as_deref(), &cfg.log_level, "api_server")?;

    let token = boot::shutdown_token();

    let cache: Arc<dyn TimelineCache> = Arc::new(RedisCache::connect(&cfg).await?);
    let store: Arc<dyn TweetStore> = match cfg.database_driver.as_str() {
        "memory" => {
            log::warn!("using the in-memory store; data is gone on restart");
            Arc::new(MemoryStore::new())
        }
        _ => Arc::new(PostgresStore::connect(&cfg)?),
    };

    let service = Arc::new(TweetService::new(store, cache));
    let app = routes::router(ApiState {
        service,
        shutdown: token.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.api_port));
    log::info!("API server listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            token.cancelled().await;
            log::info!("API server shutting down.");
        })
        .await?;

    log::info!("Shutdown complete.");
    Ok(())
}
