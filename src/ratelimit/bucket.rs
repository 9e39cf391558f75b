use super::RatelimitHeaders;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How long an exhausted bucket without a trusted reset time waits before
/// letting one request through
pub const STALE_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay returned when the reset time is unknown or about to pass
pub const FALLBACK_DELAY: Duration = Duration::from_millis(200);

const EPSILON: Duration = Duration::from_millis(10);

/// One server-defined rate limit resource, scoped to a major parameter
#[derive(Debug)]
pub struct Bucket {
    key: String,
    major: u64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    limit: u32,
    remaining: u32,
    next_reset: Option<DateTime<Utc>>,
    reset_time_valid: bool,
    has_received_headers: bool,
    last_used: DateTime<Utc>,
}

impl Bucket {
    pub fn new(key: impl Into<String>, major: u64, limit: u32) -> Self {
        Self {
            key: key.into(),
            major,
            state: Mutex::new(BucketState {
                limit,
                remaining: limit,
                next_reset: None,
                reset_time_valid: false,
                has_received_headers: false,
                last_used: Utc::now(),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn limit(&self) -> u32 {
        self.state.lock().limit
    }

    pub fn remaining(&self) -> u32 {
        self.state.lock().remaining
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.state.lock().last_used
    }

    /// Take one request from the bucket if any are left
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Utc::now())
    }

    pub fn try_acquire_at(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        self.acquire_locked(&mut state, now)
    }

    /// Fold a response's headers into the bucket
    pub fn handle_response(&self, headers: &RatelimitHeaders) {
        self.handle_response_at(headers, Utc::now());
    }

    pub fn handle_response_at(&self, headers: &RatelimitHeaders, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        trace!(
            "{}/{}: received rate limit headers {:?}",
            self.key, self.major, headers
        );

        // Responses can arrive out of order; only ever move the reset later
        let candidate = headers
            .reset_after
            .and_then(|after| TimeDelta::from_std(after).ok())
            .and_then(|after| now.checked_add_signed(after));
        if let Some(candidate) = candidate {
            if state.next_reset.map_or(true, |current| candidate > current) {
                state.next_reset = Some(candidate);
                state.reset_time_valid = true;
            }
        }

        if let Some(limit) = headers.limit {
            state.limit = limit;
        }

        // Local decrements are authoritative once seeded by the first response
        if let Some(remaining) = headers.remaining {
            if !state.has_received_headers {
                let previous = state.remaining;
                state.remaining = remaining.min(previous);
                state.has_received_headers = true;
                debug!(
                    "{}/{}: first remaining from server is {}, local was {}, now {}",
                    self.key, self.major, remaining, previous, state.remaining
                );
            }
        }
    }

    /// Advance the bucket's clock: refill on a passed reset, or release one
    /// request from a stale exhausted bucket.
    pub fn tick(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        self.tick_locked(&mut state, now);
    }

    /// How long a denied caller should wait before trying again
    pub fn reset_delay(&self, now: DateTime<Utc>) -> Duration {
        let state = self.state.lock();
        reset_delay_locked(&state, now)
    }

    /// Tick then acquire under one lock. On denial returns the reset delay.
    pub fn admit(&self, now: DateTime<Utc>) -> Result<(), Duration> {
        let mut state = self.state.lock();
        self.tick_locked(&mut state, now);
        if self.acquire_locked(&mut state, now) {
            Ok(())
        } else {
            Err(reset_delay_locked(&state, now))
        }
    }

    fn acquire_locked(&self, state: &mut BucketState, now: DateTime<Utc>) -> bool {
        state.last_used = now;
        if state.remaining > 0 {
            trace!(
                "{}/{}: [{}/{}] left, allowing through",
                self.key, self.major, state.remaining, state.limit
            );
            state.remaining -= 1;
            true
        } else {
            debug!(
                "{}/{}: [{}/{}] left, denying",
                self.key, self.major, state.remaining, state.limit
            );
            false
        }
    }

    fn tick_locked(&self, state: &mut BucketState, now: DateTime<Utc>) {
        // Snap an unset reset to now so a fresh bucket is not instantly stale
        let next_reset = *state.next_reset.get_or_insert(now);

        if state.reset_time_valid && now > next_reset {
            debug!(
                "{}/{}: reset passed, refilling with {} requests",
                self.key, self.major, state.limit
            );
            state.remaining = state.limit;
            state.reset_time_valid = false;
            return;
        }

        let stale = !state.reset_time_valid
            && state.remaining == 0
            && (now - next_reset)
                .to_std()
                .is_ok_and(|elapsed| elapsed > STALE_TIMEOUT);
        if stale {
            warn!(
                "{}/{}: no rate limit info for {:?}, allowing one request through",
                self.key, self.major, STALE_TIMEOUT
            );
            state.remaining = 1;
            state.next_reset = Some(now);
        }
    }
}

fn reset_delay_locked(state: &BucketState, now: DateTime<Utc>) -> Duration {
    if !state.reset_time_valid {
        return FALLBACK_DELAY;
    }

    let delay = state
        .next_reset
        .and_then(|reset| (reset - now).to_std().ok())
        .unwrap_or(Duration::ZERO);
    if delay < EPSILON {
        FALLBACK_DELAY
    } else {
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(limit: u32, remaining: u32, reset_after: Duration) -> RatelimitHeaders {
        RatelimitHeaders {
            limit: Some(limit),
            remaining: Some(remaining),
            reset_after: Some(reset_after),
            ..Default::default()
        }
    }

    fn ms(millis: i64) -> TimeDelta {
        TimeDelta::milliseconds(millis)
    }

    #[test]
    fn test_never_exceeds_limit() {
        let bucket = Bucket::new("key", 1, 5);
        let now = Utc::now();
        let granted = (0..20).filter(|_| bucket.try_acquire_at(now)).count();
        assert_eq!(granted, 5);
        assert_eq!(bucket.remaining(), 0);
    }

    #[test]
    fn test_first_response_seeds_remaining_only_once() {
        let bucket = Bucket::new("key", 1, 10);
        let now = Utc::now();

        bucket.handle_response_at(&headers(10, 3, Duration::from_secs(1)), now);
        assert_eq!(bucket.remaining(), 3);

        bucket.handle_response_at(&headers(10, 7, Duration::from_secs(1)), now);
        assert_eq!(bucket.remaining(), 3);
    }

    #[test]
    fn test_limit_follows_latest_response() {
        let bucket = Bucket::new("key", 1, 10);
        bucket.handle_response(&headers(20, 10, Duration::from_secs(1)));
        assert_eq!(bucket.limit(), 20);
    }

    #[test]
    fn test_tick_refills_after_valid_reset() {
        let bucket = Bucket::new("key", 1, 2);
        let start = Utc::now();
        bucket.handle_response_at(&headers(2, 0, Duration::from_secs(1)), start);
        assert_eq!(bucket.remaining(), 0);

        // Reset is one second in the past
        let now = start + ms(2000);
        bucket.tick(now);
        assert_eq!(bucket.remaining(), 2);

        // Reset time is no longer trusted, so the fallback applies
        assert_eq!(bucket.reset_delay(now), FALLBACK_DELAY);
    }

    #[test]
    fn test_stale_bucket_grants_exactly_one() {
        let bucket = Bucket::new("key", 1, 1);
        let start = Utc::now();
        bucket.tick(start);
        assert!(bucket.try_acquire_at(start));
        assert!(!bucket.try_acquire_at(start));

        // Not yet stale
        bucket.tick(start + ms(5000));
        assert_eq!(bucket.remaining(), 0);

        let later = start + ms(5001);
        bucket.tick(later);
        assert_eq!(bucket.remaining(), 1);
        assert!(bucket.try_acquire_at(later));
        assert!(!bucket.try_acquire_at(later));

        // Baseline moved to `later`, so the valve does not reopen immediately
        bucket.tick(later + ms(100));
        assert_eq!(bucket.remaining(), 0);
    }

    #[test]
    fn test_fresh_bucket_is_not_immediately_stale() {
        let bucket = Bucket::new("key", 1, 0);
        let now = Utc::now();
        bucket.tick(now);
        assert_eq!(bucket.remaining(), 0);
    }

    #[test]
    fn test_reset_delay() {
        let bucket = Bucket::new("key", 1, 5);
        let now = Utc::now();
        assert_eq!(bucket.reset_delay(now), FALLBACK_DELAY);

        bucket.handle_response_at(&headers(5, 0, Duration::from_millis(1500)), now);
        assert_eq!(bucket.reset_delay(now), Duration::from_millis(1500));

        // Inside the epsilon window
        assert_eq!(bucket.reset_delay(now + ms(1495)), FALLBACK_DELAY);

        // Already passed
        assert_eq!(bucket.reset_delay(now + ms(3000)), FALLBACK_DELAY);
    }

    #[test]
    fn test_reset_time_only_moves_forward() {
        let bucket = Bucket::new("key", 1, 5);
        let now = Utc::now();
        bucket.handle_response_at(&headers(5, 4, Duration::from_secs(3)), now);
        bucket.handle_response_at(&headers(5, 4, Duration::from_secs(1)), now);
        assert_eq!(bucket.reset_delay(now), Duration::from_secs(3));
    }

    #[test]
    fn test_admit_returns_delay_on_denial() {
        let bucket = Bucket::new("key", 1, 1);
        let now = Utc::now();
        bucket.handle_response_at(&headers(1, 1, Duration::from_secs(2)), now);

        assert_eq!(bucket.admit(now), Ok(()));
        assert_eq!(bucket.admit(now), Err(Duration::from_secs(2)));

        // After the reset passes, admission succeeds again
        assert_eq!(bucket.admit(now + ms(2001)), Ok(()));
    }

    #[test]
    fn test_concurrent_admit_never_exceeds_limit() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let bucket = Arc::new(Bucket::new("key", 1, 50));
        let now = Utc::now();
        bucket.handle_response_at(&headers(50, 50, Duration::from_secs(60)), now);

        let granted = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let bucket = bucket.clone();
                let granted = granted.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if bucket.admit(now).is_ok() {
                            granted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(granted.load(Ordering::SeqCst), 50);
        assert_eq!(bucket.remaining(), 0);
    }
}
