use chrono::{DateTime, Utc};
use http::HeaderMap;
use std::time::Duration;

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";
const RESET_AFTER_HEADER: &str = "x-ratelimit-reset-after";
const BUCKET_HEADER: &str = "x-ratelimit-bucket";
const GLOBAL_HEADER: &str = "x-ratelimit-global";

/// Rate limit information carried by one REST response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RatelimitHeaders {
    pub global: bool,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Absolute reset time
    pub reset: Option<DateTime<Utc>>,
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub server_date: Option<DateTime<Utc>>,
}

impl RatelimitHeaders {
    /// Parse a response's headers. Missing or malformed values are left unset.
    pub fn parse(headers: &HeaderMap) -> Self {
        let text = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);
        let float = |name: &str| text(name).and_then(|v| v.parse::<f64>().ok());

        Self {
            global: text(GLOBAL_HEADER)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            limit: text(LIMIT_HEADER).and_then(|v| v.parse().ok()),
            remaining: text(REMAINING_HEADER).and_then(|v| v.parse().ok()),
            reset: float(RESET_HEADER)
                .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)),
            reset_after: float(RESET_AFTER_HEADER).and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
            bucket: text(BUCKET_HEADER).map(str::to_string),
            server_date: text(http::header::DATE.as_str())
                .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                .map(|d| d.with_timezone(&Utc)),
        }
    }

    /// True only when every field needed to track a bucket is present
    pub fn has_ratelimit_info(&self) -> bool {
        self.limit.is_some()
            && self.remaining.is_some()
            && self.reset.is_some()
            && self.reset_after.is_some()
            && self.bucket.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn header_map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn test_parse_full_headers() {
        let headers = RatelimitHeaders::parse(&header_map(&[
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "4"),
            ("x-ratelimit-reset", "1470173023.123"),
            ("x-ratelimit-reset-after", "1.5"),
            ("x-ratelimit-bucket", "abcd1234"),
            ("date", "Tue, 02 Aug 2016 21:23:41 GMT"),
        ]));

        assert_eq!(headers.limit, Some(5));
        assert_eq!(headers.remaining, Some(4));
        assert_eq!(
            headers.reset.unwrap().timestamp_millis(),
            1_470_173_023_123
        );
        assert_eq!(headers.reset_after, Some(Duration::from_millis(1500)));
        assert_eq!(headers.bucket.as_deref(), Some("abcd1234"));
        assert_eq!(headers.server_date.unwrap().timestamp(), 1_470_173_021);
        assert!(!headers.global);
        assert!(headers.has_ratelimit_info());
    }

    #[test]
    fn test_global_flag() {
        let headers = RatelimitHeaders::parse(&header_map(&[("x-ratelimit-global", "True")]));
        assert!(headers.global);
        assert!(!headers.has_ratelimit_info());
    }

    #[test]
    fn test_malformed_values_are_ignored() {
        let headers = RatelimitHeaders::parse(&header_map(&[
            ("x-ratelimit-limit", "lots"),
            ("x-ratelimit-remaining", "-1"),
            ("x-ratelimit-reset-after", "-3"),
            ("date", "yesterday"),
        ]));
        assert_eq!(headers, RatelimitHeaders::default());
    }
}
