use std::fmt;
use std::time::Duration;
use url::Url;

/// Default gateway endpoint, used when the caller does not supply one
/// obtained from the REST `/gateway/bot` route.
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Default REST API base URL
pub const DEFAULT_API_BASE_URL: &str = "https://discord.com/api/v10";

/// Configuration for a gateway cluster
#[derive(Clone)]
pub struct GatewayConfig {
    /// Bot token used for identify and resume
    pub token: String,
    /// Gateway intents bitfield sent on identify
    pub intents: u64,
    /// Gateway WebSocket URL (without query string)
    pub gateway_url: String,
    /// Connection-related settings
    pub connection: ConnectionConfig,
    /// Backoff settings for reconnection after connect failures
    pub backoff: BackoffConfig,
    /// Identify arbitration settings
    pub identify: IdentifyConfig,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token", &"***")
            .field("intents", &self.intents)
            .field("gateway_url", &self.gateway_url)
            .field("connection", &self.connection)
            .field("backoff", &self.backoff)
            .field("identify", &self.identify)
            .finish()
    }
}

impl GatewayConfig {
    /// Create a new builder for configuration
    pub fn builder(token: impl Into<String>) -> GatewayConfigBuilder {
        GatewayConfigBuilder {
            config: GatewayConfig {
                token: token.into(),
                intents: 0,
                gateway_url: DEFAULT_GATEWAY_URL.to_string(),
                connection: ConnectionConfig::default(),
                backoff: BackoffConfig::default(),
                identify: IdentifyConfig::default(),
            },
        }
    }
}

/// Builder for GatewayConfig
#[derive(Debug, Clone)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set the gateway intents
    pub fn intents(mut self, intents: u64) -> Self {
        self.config.intents = intents;
        self
    }

    /// Set the gateway URL
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.gateway_url = url.into();
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Set identify configuration
    pub fn identify(mut self, config: IdentifyConfig) -> Self {
        self.config.identify = config;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        if self.config.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }

        Url::parse(&self.config.gateway_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("gateway_url: {}", e)))?;

        if self.config.backoff.max_delay < self.config.backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if self.config.backoff.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }

        self.config.identify.validate()?;

        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// No token configured
    #[error("A bot token is required")]
    MissingToken,
    /// A URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid identify configuration
    #[error("Invalid identify configuration: {0}")]
    InvalidIdentify(String),
    /// Invalid REST configuration
    #[error("Invalid REST configuration: {0}")]
    InvalidRest(String),
    /// Requested shard range does not fit the shard count
    #[error("Invalid shard range: {0}")]
    InvalidShards(String),
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
    /// Maximum number of consecutive connection attempts before giving up
    pub max_connect_attempts: u32,
    /// Circuit breaker: consecutive failures before tripping
    pub circuit_breaker_threshold: u32,
    /// Circuit breaker: how long to wait before allowing retry after trip
    pub circuit_breaker_reset_timeout: Duration,
    /// Delay between starting consecutive shards of a cluster
    pub shard_start_delay: Duration,
    /// Low-latency mode: disable panic protection for event handlers.
    /// When enabled, handler panics will crash the connection task.
    pub low_latency_mode: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_connect_attempts: 10,
            circuit_breaker_threshold: 5,
            circuit_breaker_reset_timeout: Duration::from_secs(60),
            shard_start_delay: Duration::from_millis(200),
            low_latency_mode: false,
        }
    }
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay before first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true, // Full jitter recommended by AWS
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }
}

/// How shards of a fleet take turns sending identify
#[derive(Debug, Clone, Default)]
pub enum IdentifyStrategy {
    /// In-process FIFO queues, one per concurrency bucket
    #[default]
    Local,
    /// Shared Redis key with a short expiry, acquired with `SET NX`
    RedisLock {
        /// Redis connection URL (e.g. `redis://127.0.0.1/`)
        url: String,
    },
    /// External identify queue service reached over HTTP
    RemoteQueue {
        /// Queue endpoint; `?shard=<id>` is appended per request
        url: String,
        /// Client-side timeout for one queue request
        timeout: Duration,
    },
}

/// Identify arbitration configuration
#[derive(Debug, Clone)]
pub struct IdentifyConfig {
    /// `max_concurrency` reported by the gateway (identify slots per window)
    pub recommended_concurrency: u32,
    /// Optional local cap on the concurrency actually used
    pub max_concurrency: Option<u32>,
    /// Arbitration strategy
    pub strategy: IdentifyStrategy,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            recommended_concurrency: 1,
            max_concurrency: None,
            strategy: IdentifyStrategy::Local,
        }
    }
}

impl IdentifyConfig {
    /// Concurrency actually used by the arbiter
    pub fn effective_concurrency(&self) -> u32 {
        match self.max_concurrency {
            Some(cap) => cap.min(self.recommended_concurrency),
            None => self.recommended_concurrency,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.recommended_concurrency == 0 {
            return Err(ConfigError::InvalidIdentify(
                "recommended_concurrency cannot be 0".to_string(),
            ));
        }

        if let Some(0) = self.max_concurrency {
            return Err(ConfigError::InvalidIdentify(
                "max_concurrency cannot be 0".to_string(),
            ));
        }

        match &self.strategy {
            IdentifyStrategy::Local => {}
            IdentifyStrategy::RedisLock { url } => {
                Url::parse(url).map_err(|e| ConfigError::InvalidUrl(format!("redis: {}", e)))?;
            }
            IdentifyStrategy::RemoteQueue { url, timeout } => {
                Url::parse(url)
                    .map_err(|e| ConfigError::InvalidUrl(format!("identify queue: {}", e)))?;
                if timeout.is_zero() {
                    return Err(ConfigError::InvalidIdentify(
                        "queue timeout must be > 0".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// REST client configuration
#[derive(Clone)]
pub struct RestConfig {
    /// Bot token; `Bot ` is prefixed if missing
    pub token: String,
    /// API base URL, request paths are appended to it
    pub base_url: String,
    /// User-Agent header value
    pub user_agent: String,
    /// Timeout for a single HTTP request
    pub request_timeout: Duration,
    /// How many times a rate-limited request waits and re-checks before failing
    pub max_retries: u32,
    /// How often idle rate-limit buckets are pruned
    pub bucket_prune_interval: Duration,
}

impl fmt::Debug for RestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestConfig")
            .field("token", &"***")
            .field("base_url", &self.base_url)
            .field("user_agent", &self.user_agent)
            .field("request_timeout", &self.request_timeout)
            .field("max_retries", &self.max_retries)
            .field("bucket_prune_interval", &self.bucket_prune_interval)
            .finish()
    }
}

impl RestConfig {
    /// Create a REST configuration with defaults for everything but the token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            base_url: DEFAULT_API_BASE_URL.to_string(),
            user_agent: concat!("ws-gateway-shard/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
            bucket_prune_interval: Duration::from_secs(60),
        }
    }

    /// Authorization header value
    pub fn authorization(&self) -> String {
        if self.token.starts_with("Bot ") {
            self.token.clone()
        } else {
            format!("Bot {}", self.token)
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidUrl(format!("base_url: {}", e)))?;
        if self.bucket_prune_interval.is_zero() {
            return Err(ConfigError::InvalidRest(
                "bucket_prune_interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
