use super::Bucket;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Buckets unused for longer than this are dropped by the prune task
pub const STALE_BUCKET_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Owns every [`Bucket`] and the endpoint to bucket-key mapping learned from
/// responses.
#[derive(Debug, Default)]
pub struct BucketManager {
    buckets: RwLock<HashMap<(String, u64), Arc<Bucket>>>,
    endpoint_keys: RwLock<HashMap<String, String>>,
    known_limits: RwLock<HashMap<String, u32>>,
}

impl BucketManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket for `(endpoint, major)`, created on demand once the endpoint's
    /// key and that key's limit are known.
    pub fn get_bucket(&self, endpoint: &str, major: u64) -> Option<Arc<Bucket>> {
        let key = self.endpoint_keys.read().get(endpoint)?.clone();
        let bucket_id = (key, major);

        if let Some(bucket) = self.buckets.read().get(&bucket_id) {
            return Some(bucket.clone());
        }

        let limit = *self.known_limits.read().get(&bucket_id.0)?;
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(bucket_id).or_insert_with_key(|(key, major)| {
            debug!("Creating bucket {}/{} with limit {}", key, major, limit);
            Arc::new(Bucket::new(key.clone(), *major, limit))
        });
        Some(bucket.clone())
    }

    /// Record which bucket an endpoint belongs to, and that bucket's limit
    pub fn update_endpoint_info(&self, endpoint: &str, key: &str, limit: Option<u32>) {
        self.endpoint_keys
            .write()
            .insert(endpoint.to_string(), key.to_string());
        if let Some(limit) = limit {
            self.known_limits.write().insert(key.to_string(), limit);
        }
    }

    /// Drop buckets unused since before `now - STALE_BUCKET_TIMEOUT`.
    /// Returns how many were removed.
    pub fn prune_stale(&self, now: DateTime<Utc>) -> usize {
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let keep = (now - bucket.last_used())
                .to_std()
                .map_or(true, |idle| idle <= STALE_BUCKET_TIMEOUT);
            if !keep {
                debug!(
                    "Pruning unused bucket {}/{} (last used {})",
                    bucket.key(),
                    bucket.major(),
                    bucket.last_used()
                );
            }
            keep
        });
        before - buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// Spawn the periodic prune task. It only holds a weak reference and
    /// exits once the manager is dropped.
    pub fn spawn_pruner(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let pruned = manager.prune_stale(Utc::now());
                if pruned > 0 {
                    debug!("Pruned {} stale rate limit buckets", pruned);
                }
            }
        })
    }
}
