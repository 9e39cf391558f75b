//! REST rate limiting: per-route buckets learned from response headers, plus
//! the global block.
//!
//! Admission never fails; it returns an [`Admission`] the caller acts on.

mod bucket;
mod buckets;
mod headers;
mod limiter;

pub use bucket::{Bucket, FALLBACK_DELAY, STALE_TIMEOUT};
pub use buckets::{BucketManager, STALE_BUCKET_TIMEOUT};
pub use headers::RatelimitHeaders;
pub use limiter::{Admission, Ratelimiter, RETRY_PADDING};
