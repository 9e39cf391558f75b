//! Example: Running a small gateway cluster
//!
//! Fetches the recommended shard count over REST, starts every shard and
//! logs the events they receive until Ctrl+C.
//!
//! Run with: BOT_TOKEN=... cargo run --example gateway
//!
//! Set `IDENTIFY_REDIS_URL` to share identify slots with other processes.

use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ws_gateway_shard::{
    Cluster, GatewayConfig, GatewayEvent, GatewayHandler, IdentifyConfig, IdentifyStrategy,
    RestClient, RestConfig, ShardConnectionState, ShardInfo,
};

/// GUILDS | GUILD_MESSAGES
const INTENTS: u64 = 1 | 1 << 9;

struct LogHandler;

impl GatewayHandler for LogHandler {
    async fn on_event(&self, shard: ShardInfo, event: GatewayEvent) {
        match event {
            GatewayEvent::Ready(ready) => info!(
                "[SHARD-{}] Ready as {} (session {})",
                shard.id, ready.user.id, ready.session_id
            ),
            GatewayEvent::Dispatch { kind, .. } => info!("[SHARD-{}] {:?}", shard.id, kind),
            other => info!("[SHARD-{}] {:?}", shard.id, other),
        }
    }

    async fn on_state_change(&self, shard: ShardInfo, state: ShardConnectionState) {
        info!("[SHARD-{}] -> {:?}", shard.id, state);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = std::env::var("BOT_TOKEN")?;

    let strategy = match std::env::var("IDENTIFY_REDIS_URL") {
        Ok(url) => IdentifyStrategy::RedisLock { url },
        Err(_) => IdentifyStrategy::Local,
    };
    let config = GatewayConfig::builder(token.clone())
        .intents(INTENTS)
        .identify(IdentifyConfig {
            strategy,
            ..Default::default()
        })
        .build()?;

    let rest = RestClient::new(RestConfig::new(token))?;
    let cluster = Arc::new(Cluster::new(config, LogHandler));

    match rest.gateway_bot().await {
        Ok(info) => cluster.start_recommended(&info).await?,
        Err(e) => {
            warn!("Could not fetch /gateway/bot ({}), starting a single shard", e);
            cluster.start(0..=0, 1).await?;
        }
    }
    info!("Cluster started with shards {:?}", cluster.shard_ids());

    info!("Running... Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    let snapshot = cluster.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Identifies: {}", snapshot.identifies_total);
    info!("  Resumes: {}", snapshot.resumes_total);
    info!("  Events: {}", snapshot.events_dispatched_total);
    info!("  Active connections: {}", snapshot.active_connections);

    cluster.shutdown().await;
    info!("Cluster stopped");

    Ok(())
}
