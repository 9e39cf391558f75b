use super::{BucketManager, RatelimitHeaders};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Added to every bucket retry delay to absorb clock skew with the server
pub const RETRY_PADDING: Duration = Duration::from_millis(50);

/// Outcome of asking whether a request may be sent now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The bucket is exhausted; try again after this long
    RetryAfter(Duration),
    /// A global limit is in effect; check again later
    GloballyBlocked,
}

/// Admission control for REST requests
#[derive(Debug)]
pub struct Ratelimiter {
    buckets: Arc<BucketManager>,
    global_expiry: Mutex<Option<DateTime<Utc>>>,
    pruner: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Ratelimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Ratelimiter {
    pub fn new() -> Self {
        Self::with_buckets(Arc::new(BucketManager::new()))
    }

    pub fn with_buckets(buckets: Arc<BucketManager>) -> Self {
        Self {
            buckets,
            global_expiry: Mutex::new(None),
            pruner: Mutex::new(None),
        }
    }

    pub fn buckets(&self) -> &Arc<BucketManager> {
        &self.buckets
    }

    /// Start pruning idle buckets every `interval`. Replaces a previous pruner.
    pub fn start_pruning(&self, interval: Duration) {
        let handle = self.buckets.spawn_pruner(interval);
        if let Some(previous) = self.pruner.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Decide whether a request to `endpoint` scoped to `major` may go out at `now`
    pub fn check(&self, endpoint: &str, major: u64, now: DateTime<Utc>) -> Admission {
        // Held until the bucket decides, so a global block cannot slip in between
        let global = self.global_expiry.lock();
        if let Some(expiry) = *global {
            if expiry > now {
                warn!("Globally rate limited until {}, holding request", expiry);
                return Admission::GloballyBlocked;
            }
        }

        let Some(bucket) = self.buckets.get_bucket(endpoint, major) else {
            debug!("No rate limit data for {}, allowing through", endpoint);
            return Admission::Allowed;
        };

        match bucket.admit(now) {
            Ok(()) => Admission::Allowed,
            Err(delay) => Admission::RetryAfter(delay + RETRY_PADDING),
        }
    }

    /// Feed a response's headers back into the limiter
    pub fn handle_response(&self, headers: &RatelimitHeaders, endpoint: &str, major: u64) {
        self.handle_response_at(headers, endpoint, major, Utc::now());
    }

    pub fn handle_response_at(
        &self,
        headers: &RatelimitHeaders,
        endpoint: &str,
        major: u64,
        now: DateTime<Utc>,
    ) {
        if !headers.has_ratelimit_info() {
            return;
        }

        if headers.global {
            warn!(
                "Global rate limit hit, blocking until {:?} (in {:?})",
                headers.reset, headers.reset_after
            );
            *self.global_expiry.lock() = headers.reset;
            return;
        }

        let Some(key) = headers.bucket.as_deref() else {
            return;
        };
        self.buckets.update_endpoint_info(endpoint, key, headers.limit);
        if let Some(bucket) = self.buckets.get_bucket(endpoint, major) {
            bucket.handle_response_at(headers, now);
        }
    }

    /// Expiry of the current global block, if one is in effect at `now`
    pub fn global_block_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.global_expiry.lock().filter(|expiry| *expiry > now)
    }
}

impl Drop for Ratelimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.pruner.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn bucket_headers(
        bucket: &str,
        limit: u32,
        remaining: u32,
        reset_after: Duration,
        now: DateTime<Utc>,
    ) -> RatelimitHeaders {
        RatelimitHeaders {
            global: false,
            limit: Some(limit),
            remaining: Some(remaining),
            reset: now.checked_add_signed(TimeDelta::from_std(reset_after).unwrap()),
            reset_after: Some(reset_after),
            bucket: Some(bucket.to_string()),
            server_date: None,
        }
    }

    #[test]
    fn test_unknown_endpoint_is_allowed() {
        let limiter = Ratelimiter::new();
        assert_eq!(limiter.check("GET /users/@me", 0, Utc::now()), Admission::Allowed);
    }

    #[test]
    fn test_exhausted_bucket_returns_padded_delay() {
        let limiter = Ratelimiter::new();
        let now = Utc::now();
        let endpoint = "POST /channels/{id}/messages";

        limiter.handle_response_at(
            &bucket_headers("msgs", 5, 1, Duration::from_secs(2), now),
            endpoint,
            42,
            now,
        );

        assert_eq!(limiter.check(endpoint, 42, now), Admission::Allowed);
        assert_eq!(
            limiter.check(endpoint, 42, now),
            Admission::RetryAfter(Duration::from_secs(2) + RETRY_PADDING)
        );

        // Another major parameter has its own bucket
        assert_eq!(limiter.check(endpoint, 43, now), Admission::Allowed);
    }

    #[test]
    fn test_headers_without_full_info_are_ignored() {
        let limiter = Ratelimiter::new();
        let now = Utc::now();
        let mut headers = bucket_headers("b", 1, 0, Duration::from_secs(1), now);
        headers.reset = None;

        limiter.handle_response_at(&headers, "GET /a", 1, now);
        assert_eq!(limiter.buckets().bucket_count(), 0);
        assert_eq!(limiter.check("GET /a", 1, now), Admission::Allowed);
    }

    #[test]
    fn test_global_block() {
        let limiter = Ratelimiter::new();
        let now = Utc::now();
        let mut headers = bucket_headers("b", 1, 0, Duration::from_secs(3), now);
        headers.global = true;

        limiter.handle_response_at(&headers, "GET /a", 1, now);
        assert_eq!(limiter.check("GET /b", 1, now), Admission::GloballyBlocked);
        assert!(limiter.global_block_expiry(now).is_some());

        // Global responses do not create buckets
        assert_eq!(limiter.buckets().bucket_count(), 0);

        let later = now + TimeDelta::seconds(4);
        assert_eq!(limiter.check("GET /b", 1, later), Admission::Allowed);
        assert!(limiter.global_block_expiry(later).is_none());
    }

    #[test]
    fn test_global_block_is_never_overtaken_by_admission() {
        let limiter = Arc::new(Ratelimiter::new());
        let now = Utc::now();
        let endpoint = "GET /guilds/{id}";
        limiter.handle_response_at(
            &bucket_headers("guilds", 10_000, 10_000, Duration::from_secs(60), now),
            endpoint,
            1,
            now,
        );

        let start = Arc::new(std::sync::Barrier::new(5));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                let start = start.clone();
                std::thread::spawn(move || {
                    start.wait();
                    let mut blocked = false;
                    for _ in 0..500 {
                        match limiter.check(endpoint, 1, now) {
                            Admission::GloballyBlocked => blocked = true,
                            Admission::Allowed => assert!(!blocked, "admitted after a global block"),
                            Admission::RetryAfter(_) => {}
                        }
                    }
                })
            })
            .collect();

        start.wait();
        let mut global = bucket_headers("guilds", 1, 0, Duration::from_secs(60), now);
        global.global = true;
        limiter.handle_response_at(&global, endpoint, 1, now);

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(limiter.check(endpoint, 1, now), Admission::GloballyBlocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_pruning_replaces_task() {
        let limiter = Ratelimiter::new();
        limiter.start_pruning(Duration::from_secs(60));
        limiter.start_pruning(Duration::from_secs(60));
        assert!(limiter.pruner.lock().is_some());
    }
}
