use crate::config::RestConfig;
use crate::error::Error;
use crate::ratelimit::{Admission, RatelimitHeaders, Ratelimiter, FALLBACK_DELAY};
use chrono::Utc;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Response of `GET /gateway/bot`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayBotInfo {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    pub reset_after: u64,
    pub max_concurrency: u32,
}

/// HTTP client that consults the rate limiter before every request and feeds
/// every response back into it.
#[derive(Debug)]
pub struct RestClient {
    http: reqwest::Client,
    config: RestConfig,
    ratelimiter: Ratelimiter,
}

impl RestClient {
    /// Build a client. Must be called from within a Tokio runtime, since the
    /// bucket prune task is spawned here.
    pub fn new(config: RestConfig) -> Result<Self, Error> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        let mut authorization = HeaderValue::from_str(&config.authorization())
            .map_err(|e| Error::Protocol(format!("invalid token header: {}", e)))?;
        authorization.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, authorization);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .build()?;

        let ratelimiter = Ratelimiter::new();
        ratelimiter.start_pruning(config.bucket_prune_interval);

        Ok(Self {
            http,
            config,
            ratelimiter,
        })
    }

    pub fn ratelimiter(&self) -> &Ratelimiter {
        &self.ratelimiter
    }

    /// Absolute URL for an API path
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Send a request once the rate limiter admits it.
    ///
    /// `endpoint` names the route (e.g. `"GET /channels/{id}"`) and `major` is
    /// its major parameter, or 0 if it has none. `build` creates the request
    /// and is only called after admission. Non-success statuses are returned
    /// as responses; only transport failures and exhausted rate limit waits
    /// are errors.
    pub async fn execute<F>(&self, endpoint: &str, major: u64, build: F) -> Result<reqwest::Response, Error>
    where
        F: FnOnce(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        self.wait_for_admission(endpoint, major).await?;

        let started = Instant::now();
        let response = match build(&self.http).send().await {
            Ok(response) => response,
            Err(e) => {
                error!("HTTP error on {}: {}", endpoint, e);
                return Err(e.into());
            }
        };

        let headers = RatelimitHeaders::parse(response.headers());
        self.ratelimiter.handle_response(&headers, endpoint, major);

        debug!(
            "{} -> {} in {:?} (bucket {:?}, remaining {:?})",
            endpoint,
            response.status(),
            started.elapsed(),
            headers.bucket,
            headers.remaining
        );
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            warn!("{} was rate limited by the server", endpoint);
        }

        Ok(response)
    }

    /// `GET` a JSON resource. A 404 yields `None`.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        endpoint: &str,
        major: u64,
    ) -> Result<Option<T>, Error> {
        let url = self.url(path);
        let response = self
            .execute(endpoint, major, |http| http.get(url))
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(None),
            _ => Ok(Some(response.error_for_status()?.json().await?)),
        }
    }

    /// Recommended shard count, gateway URL and identify concurrency
    pub async fn gateway_bot(&self) -> Result<GatewayBotInfo, Error> {
        self.get("/gateway/bot", "GET /gateway/bot", 0)
            .await?
            .ok_or_else(|| Error::Protocol("/gateway/bot returned no content".to_string()))
    }

    async fn wait_for_admission(&self, endpoint: &str, major: u64) -> Result<(), Error> {
        let mut waits = 0u32;
        loop {
            let now = Utc::now();
            let delay = match self.ratelimiter.check(endpoint, major, now) {
                Admission::Allowed => return Ok(()),
                Admission::RetryAfter(delay) => delay,
                Admission::GloballyBlocked => self
                    .ratelimiter
                    .global_block_expiry(now)
                    .and_then(|expiry| (expiry - now).to_std().ok())
                    .filter(|delay| !delay.is_zero())
                    .unwrap_or(FALLBACK_DELAY),
            };

            if waits >= self.config.max_retries {
                return Err(Error::RateLimited {
                    endpoint: endpoint.to_string(),
                    retry_after: Some(delay),
                });
            }
            waits += 1;

            debug!(
                "{} rate limited, waiting {:?} (attempt {}/{})",
                endpoint, delay, waits, self.config.max_retries
            );
            tokio::time::sleep(delay.max(Duration::from_millis(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `response` to every connection; returns the base URL and a request counter
    async fn serve(response: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                if stream.read(&mut buf).await.unwrap_or(0) == 0 {
                    continue;
                }
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        (format!("http://{}", addr), hits)
    }

    fn config(base_url: String, max_retries: u32) -> RestConfig {
        RestConfig {
            base_url,
            max_retries,
            ..RestConfig::new("token")
        }
    }

    #[tokio::test]
    async fn test_exhausted_bucket_fails_without_sending() {
        let (base_url, hits) = serve(
            "HTTP/1.1 200 OK\r\n\
             x-ratelimit-limit: 1\r\n\
             x-ratelimit-remaining: 0\r\n\
             x-ratelimit-reset: 9999999999\r\n\
             x-ratelimit-reset-after: 60\r\n\
             x-ratelimit-bucket: abc\r\n\
             content-length: 2\r\n\
             connection: close\r\n\r\n{}",
        )
        .await;
        let client = RestClient::new(config(base_url, 0)).unwrap();
        let url = client.url("/channels/1");

        let response = client
            .execute("GET /channels/{id}", 1, |http| http.get(url.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let result = client
            .execute("GET /channels/{id}", 1, |http| http.get(url.clone()))
            .await;
        match result {
            Err(Error::RateLimited { endpoint, retry_after }) => {
                assert_eq!(endpoint, "GET /channels/{id}");
                assert!(retry_after.unwrap() > Duration::from_secs(59));
            }
            other => panic!("unexpected result {:?}", other.map(|r| r.status())),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // A different major parameter is unaffected
        client
            .execute("GET /channels/{id}", 2, |http| http.get(url.clone()))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gateway_bot() {
        let (base_url, _) = serve(
            "HTTP/1.1 200 OK\r\n\
             content-type: application/json\r\n\
             content-length: 142\r\n\
             connection: close\r\n\r\n\
             {\"url\":\"wss://gateway.example.com\",\"shards\":9,\"session_start_limit\":{\"total\":1000,\"remaining\":999,\"reset_after\":14400000,\"max_concurrency\":1}}",
        )
        .await;
        let client = RestClient::new(config(base_url, 3)).unwrap();

        let info = client.gateway_bot().await.unwrap();
        assert_eq!(info.url, "wss://gateway.example.com");
        assert_eq!(info.shards, 9);
        assert_eq!(info.session_start_limit.max_concurrency, 1);
    }

    #[tokio::test]
    async fn test_not_found_is_none() {
        let (base_url, _) = serve(
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let client = RestClient::new(config(base_url, 3)).unwrap();

        let result: Option<GatewayBotInfo> = client.get("/missing", "GET /missing", 0).await.unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_url_joining() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let client = RestClient::new(config("https://api.example.com/v10/".to_string(), 3)).unwrap();
        assert_eq!(client.url("/gateway/bot"), "https://api.example.com/v10/gateway/bot");
    }

    #[test]
    fn test_empty_token_rejected() {
        let mut config = RestConfig::new("");
        config.base_url = "https://api.example.com".to_string();
        assert!(matches!(RestClient::new(config), Err(Error::Config(_))));
    }
}
