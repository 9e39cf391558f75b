use crate::config::{ConfigError, GatewayConfig};
use crate::connection::{ConnectionCommand, ShardRunner};
use crate::error::Error;
use crate::handler::GatewayHandler;
use crate::identify::IdentifyArbiter;
use crate::metrics::Metrics;
use crate::protocol::{GatewayPacket, ShardInfo};
use crate::rest::GatewayBotInfo;
use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default channel buffer size
const DEFAULT_CHANNEL_SIZE: usize = 100;

/// Runs a range of gateway shards that share one identify arbiter.
///
/// # Thread Safety
///
/// `Cluster` is `Send + Sync` and all methods can be safely called from
/// multiple tasks concurrently. Internal state is protected by `parking_lot::RwLock`
/// which does not poison on panic.
pub struct Cluster<H: GatewayHandler> {
    handler: Arc<H>,
    config: GatewayConfig,
    metrics: Arc<Metrics>,
    /// Control channels indexed by shard id
    shards: RwLock<BTreeMap<u32, mpsc::Sender<ConnectionCommand>>>,
    shard_handles: RwLock<BTreeMap<u32, JoinHandle<()>>>,
    /// Serializes start/shutdown. A tokio::Mutex so it can be held across await points.
    lifecycle_lock: Mutex<()>,
    /// Bumped by every shutdown; an in-progress launch stops staggering when it changes
    shutdown_epoch: watch::Sender<u64>,
}

impl<H: GatewayHandler> Cluster<H> {
    pub fn new(config: GatewayConfig, handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            config,
            metrics: Arc::new(Metrics::new()),
            shards: RwLock::new(BTreeMap::new()),
            shard_handles: RwLock::new(BTreeMap::new()),
            lifecycle_lock: Mutex::new(()),
            shutdown_epoch: watch::Sender::new(0),
        }
    }

    /// Get the metrics for this cluster
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Get a reference to the handler
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Check if any shard has been started and not shut down
    pub fn is_running(&self) -> bool {
        !self.shards.read().is_empty()
    }

    /// Ids of the shards this cluster runs
    pub fn shard_ids(&self) -> Vec<u32> {
        self.shards.read().keys().copied().collect()
    }

    /// Start shards `shard_ids` out of `total`.
    ///
    /// Shards are launched one by one, `shard_start_delay` apart; this call
    /// returns once the last one has been spawned, or early if [`Cluster::shutdown`]
    /// is called meanwhile. Connecting to the identify
    /// store (for the Redis strategy) happens here.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster is already running, if the range does
    /// not fit in `total`, or if the identify arbiter cannot be built.
    pub async fn start(&self, shard_ids: RangeInclusive<u32>, total: u32) -> Result<(), Error> {
        self.launch(shard_ids, total, self.config.clone()).await
    }

    /// Start every shard recommended by `GET /gateway/bot`, on the gateway
    /// URL and identify concurrency it reports.
    pub async fn start_recommended(&self, info: &GatewayBotInfo) -> Result<(), Error> {
        let total = info.shards.max(1);
        let mut config = self.config.clone();
        config.gateway_url = info.url.clone();
        config.identify.recommended_concurrency = info.session_start_limit.max_concurrency.max(1);

        info!(
            "Gateway recommends {} shards (max concurrency {}, {} sessions left)",
            info.shards,
            info.session_start_limit.max_concurrency,
            info.session_start_limit.remaining
        );
        self.launch(0..=total - 1, total, config).await
    }

    async fn launch(
        &self,
        shard_ids: RangeInclusive<u32>,
        total: u32,
        config: GatewayConfig,
    ) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;
        let mut shutdown = self.shutdown_epoch.subscribe();

        if self.is_running() {
            return Err(Error::Protocol("Cluster is already running".to_string()));
        }
        if total == 0 || shard_ids.is_empty() || *shard_ids.end() >= total {
            return Err(ConfigError::InvalidShards(format!(
                "{}..={} of {}",
                shard_ids.start(),
                shard_ids.end(),
                total
            ))
            .into());
        }

        let arbiter = Arc::new(IdentifyArbiter::from_config(&config.identify).await?);
        info!(
            "Starting shards {}..={} of {} ({} identify)",
            shard_ids.start(),
            shard_ids.end(),
            total,
            arbiter.name()
        );

        let start_delay = config.connection.shard_start_delay;
        let last = *shard_ids.end();
        for shard_id in shard_ids {
            self.create_shard(ShardInfo::new(shard_id, total), &config, arbiter.clone());
            if shard_id != last && !start_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(start_delay) => {}
                    _ = shutdown.changed() => {
                        info!("Shutdown requested, not starting shards after {}", shard_id);
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Stop all shards gracefully
    ///
    /// This will close all connections and wait for tasks to complete.
    /// After stopping, the cluster can be started again.
    pub async fn shutdown(&self) {
        // Cut a staggered start short so it releases the lifecycle lock
        self.shutdown_epoch.send_modify(|epoch| *epoch += 1);
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        info!("Shutting down cluster");

        let channels: Vec<_> = std::mem::take(&mut *self.shards.write()).into_iter().collect();

        // Send close commands outside the lock
        for (shard_id, tx) in channels {
            if let Err(e) = tx.send(ConnectionCommand::Close).await {
                debug!("[SHARD-{}] Already stopped: {}", shard_id, e);
            }
        }

        let handles = std::mem::take(&mut *self.shard_handles.write());
        for (_shard_id, handle) in handles {
            let _ = handle.await;
        }

        info!("Cluster stopped");
    }

    /// Send a raw packet (e.g. a presence update) on one shard's socket
    pub async fn send(&self, shard_id: u32, packet: GatewayPacket) -> Result<(), Error> {
        self.command(shard_id, ConnectionCommand::Send(packet)).await
    }

    /// Force reconnection of a specific shard; its session is resumed
    pub async fn reconnect_shard(&self, shard_id: u32) -> Result<(), Error> {
        self.command(shard_id, ConnectionCommand::Reconnect).await
    }

    /// Get WebSocket connection health status.
    ///
    /// Returns `(connected_count, total_count, is_healthy)` where `is_healthy`
    /// is true if the connected ratio is at least `min_connected_ratio`.
    pub fn websocket_health(&self, min_connected_ratio: f64) -> (usize, usize, bool) {
        let metrics = self.metrics.shard_metrics();
        let total = metrics.len();

        if total == 0 {
            return (0, 0, true);
        }

        let connected = metrics.iter().filter(|s| s.is_connected).count();
        let ratio = connected as f64 / total as f64;
        let is_healthy = ratio >= min_connected_ratio;

        (connected, total, is_healthy)
    }

    async fn command(&self, shard_id: u32, command: ConnectionCommand) -> Result<(), Error> {
        let command_tx = self.shards.read().get(&shard_id).cloned();
        match command_tx {
            Some(tx) => tx
                .send(command)
                .await
                .map_err(|e| Error::ChannelSend(e.to_string())),
            None => Err(Error::ShuttingDown),
        }
    }

    fn create_shard(&self, shard: ShardInfo, config: &GatewayConfig, arbiter: Arc<IdentifyArbiter>) {
        let (tx, rx) = mpsc::channel::<ConnectionCommand>(DEFAULT_CHANNEL_SIZE);
        debug!("[SHARD-{}] Creating shard {}/{}", shard.id, shard.id, shard.total);

        let runner = ShardRunner::new(
            shard,
            config,
            self.handler.clone(),
            arbiter,
            self.metrics.clone(),
            rx,
        );
        let metrics = self.metrics.clone();
        let handle = tokio::spawn(Self::run_with_recovery(shard.id, runner, metrics));

        self.shards.write().insert(shard.id, tx);
        self.shard_handles.write().insert(shard.id, handle);
    }

    /// Run a shard with panic recovery
    async fn run_with_recovery(
        shard_id: u32,
        runner: ShardRunner<H, IdentifyArbiter>,
        metrics: Arc<Metrics>,
    ) {
        match AssertUnwindSafe(runner.run()).catch_unwind().await {
            Ok(Ok(())) => {
                debug!("[SHARD-{}] Shard task completed normally", shard_id);
            }
            Ok(Err(e)) => {
                warn!("[SHARD-{}] Shard task ended with error: {}", shard_id, e);
            }
            Err(panic_err) => {
                // Extract panic message if possible
                let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!(
                    "[SHARD-{}] Shard task PANICKED: {}. Shard is now dead.",
                    shard_id, panic_msg
                );
                metrics.record_error();
            }
        }
    }
}

impl<H: GatewayHandler> Drop for Cluster<H> {
    fn drop(&mut self) {
        // Abort all shard handles to prevent orphaned tasks
        let handles = std::mem::take(&mut *self.shard_handles.write());
        for (_shard_id, handle) in handles {
            handle.abort();
        }
    }
}
