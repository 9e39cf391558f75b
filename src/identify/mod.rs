//! Identify arbitration: decides when a shard may start a new session.
//!
//! All strategies bucket shards by `shard_id % max_concurrency`; shards in
//! the same bucket identify at most once per window.

mod local;
mod lock;
mod queue;

pub use local::{LocalQueue, BUCKET_PERIOD, WARMUP_DELAY};
pub use lock::{IdentifyLockStore, LockQueue, RedisLockStore, LOCK_TTL, RETRY_INTERVAL};
pub use queue::RemoteQueue;

use crate::config::{IdentifyConfig, IdentifyStrategy};
use crate::error::Error;
use std::future::Future;
use tracing::info;

/// Something a shard waits on before sending identify.
///
/// Dropping the returned future abandons the wait without holding up other
/// shards.
pub trait IdentifyQueue: Send + Sync + 'static {
    /// Resolve once `shard_id` may identify
    fn await_turn(&self, shard_id: u32) -> impl Future<Output = ()> + Send;
}

/// The arbiter chosen by [`IdentifyStrategy`]
#[derive(Debug, Clone)]
pub enum IdentifyArbiter {
    Local(LocalQueue),
    RedisLock(LockQueue<RedisLockStore>),
    RemoteQueue(RemoteQueue),
}

impl IdentifyArbiter {
    /// Build the arbiter for `config`, connecting to Redis if needed
    pub async fn from_config(config: &IdentifyConfig) -> Result<Self, Error> {
        let concurrency = config.effective_concurrency();
        let arbiter = match &config.strategy {
            IdentifyStrategy::Local => IdentifyArbiter::Local(LocalQueue::new(concurrency)),
            IdentifyStrategy::RedisLock { url } => {
                let store = RedisLockStore::connect(url).await?;
                IdentifyArbiter::RedisLock(LockQueue::new(store, concurrency))
            }
            IdentifyStrategy::RemoteQueue { url, timeout } => {
                IdentifyArbiter::RemoteQueue(RemoteQueue::new(url, *timeout)?)
            }
        };
        info!(
            "Identify arbiter ready ({}, max concurrency {})",
            arbiter.name(),
            concurrency
        );
        Ok(arbiter)
    }

    pub fn name(&self) -> &'static str {
        match self {
            IdentifyArbiter::Local(_) => "local",
            IdentifyArbiter::RedisLock(_) => "redis-lock",
            IdentifyArbiter::RemoteQueue(_) => "remote-queue",
        }
    }
}

impl IdentifyQueue for IdentifyArbiter {
    async fn await_turn(&self, shard_id: u32) {
        match self {
            IdentifyArbiter::Local(queue) => queue.await_turn(shard_id).await,
            IdentifyArbiter::RedisLock(queue) => queue.await_turn(shard_id).await,
            IdentifyArbiter::RemoteQueue(queue) => queue.await_turn(shard_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_local_from_config_uses_effective_concurrency() {
        let config = IdentifyConfig {
            recommended_concurrency: 16,
            max_concurrency: Some(4),
            strategy: IdentifyStrategy::Local,
        };
        match IdentifyArbiter::from_config(&config).await.unwrap() {
            IdentifyArbiter::Local(queue) => assert_eq!(queue.max_concurrency(), 4),
            other => panic!("unexpected arbiter {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_remote_from_config() {
        let config = IdentifyConfig {
            strategy: IdentifyStrategy::RemoteQueue {
                url: "http://127.0.0.1:9/identify".to_string(),
                timeout: Duration::from_secs(1),
            },
            ..Default::default()
        };
        let arbiter = IdentifyArbiter::from_config(&config).await.unwrap();
        assert_eq!(arbiter.name(), "remote-queue");
    }

    #[tokio::test]
    async fn test_invalid_redis_url_fails() {
        let config = IdentifyConfig {
            strategy: IdentifyStrategy::RedisLock {
                url: "not-a-redis-url".to_string(),
            },
            ..Default::default()
        };
        assert!(IdentifyArbiter::from_config(&config).await.is_err());
    }
}
