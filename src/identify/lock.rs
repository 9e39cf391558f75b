use super::IdentifyQueue;
use crate::error::Error;
use redis::aio::ConnectionManager;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info};

/// Lifetime of an identify lock key
pub const LOCK_TTL: Duration = Duration::from_secs(6);

/// Wait between failed acquisition attempts
pub const RETRY_INTERVAL: Duration = Duration::from_millis(500);

const KEY_PREFIX: &str = "identify:";

/// A shared store offering set-if-absent with expiry
pub trait IdentifyLockStore: Send + Sync + 'static {
    /// Create `key` with a `ttl` expiry unless it already exists.
    /// Returns `true` if this call created it.
    fn try_acquire(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<bool, Error>> + Send;
}

/// Redis-backed store using `SET key 1 EX ttl NX`
#[derive(Clone)]
pub struct RedisLockStore {
    conn: ConnectionManager,
}

impl RedisLockStore {
    /// Connect to the Redis server at `url`
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

impl std::fmt::Debug for RedisLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockStore").finish_non_exhaustive()
    }
}

impl IdentifyLockStore for RedisLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}

/// Identify arbitration through a lock key per concurrency bucket, shared by
/// every process of the fleet.
#[derive(Debug, Clone)]
pub struct LockQueue<S> {
    store: S,
    max_concurrency: u32,
}

impl<S: IdentifyLockStore> LockQueue<S> {
    pub fn new(store: S, max_concurrency: u32) -> Self {
        Self {
            store,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: IdentifyLockStore> IdentifyQueue for LockQueue<S> {
    async fn await_turn(&self, shard_id: u32) {
        let bucket = shard_id % self.max_concurrency;
        let key = format!("{}{}", KEY_PREFIX, bucket);

        info!("[SHARD-{}] Waiting for identify lock {}", shard_id, key);
        loop {
            match self.store.try_acquire(&key, LOCK_TTL).await {
                Ok(true) => {
                    info!("[SHARD-{}] Acquired identify lock {}", shard_id, key);
                    return;
                }
                Ok(false) => debug!("[SHARD-{}] Identify lock {} is held", shard_id, key),
                Err(e) => error!(
                    "[SHARD-{}] Failed to acquire identify lock {}: {}",
                    shard_id, key, e
                ),
            }
            sleep(RETRY_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    /// Set-if-absent with expiry on tokio's clock
    #[derive(Default, Clone)]
    struct MemoryLockStore {
        keys: Arc<Mutex<HashMap<String, Instant>>>,
        failures_left: Arc<AtomicU32>,
    }

    impl IdentifyLockStore for MemoryLockStore {
        async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(Error::Protocol("store unavailable".to_string()));
            }

            let now = Instant::now();
            let mut keys = self.keys.lock();
            if keys.get(key).is_some_and(|expires| *expires > now) {
                return Ok(false);
            }
            keys.insert(key.to_string(), now + ttl);
            Ok(true)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_shard_waits_for_expiry() {
        let queue = LockQueue::new(MemoryLockStore::default(), 1);
        let start = Instant::now();

        queue.await_turn(0).await;
        assert_eq!(Instant::now(), start);

        queue.await_turn(1).await;
        let waited = Instant::now() - start;
        assert!(waited >= LOCK_TTL);
        assert!(waited < LOCK_TTL + RETRY_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_use_separate_keys() {
        let queue = LockQueue::new(MemoryLockStore::default(), 2);
        let start = Instant::now();

        queue.await_turn(0).await;
        queue.await_turn(1).await;
        assert_eq!(Instant::now(), start);

        let keys = queue.store().keys.lock();
        assert!(keys.contains_key("identify:0"));
        assert!(keys.contains_key("identify:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_errors_are_retried() {
        let store = MemoryLockStore::default();
        store.failures_left.store(2, Ordering::SeqCst);
        let queue = LockQueue::new(store, 1);
        let start = Instant::now();

        queue.await_turn(0).await;
        assert_eq!(Instant::now() - start, RETRY_INTERVAL * 2);
    }
}
