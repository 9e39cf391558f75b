//! # ws-gateway-shard
//!
//! A resilient gateway shard runtime for bots that talk to a sharded
//! WebSocket gateway plus a rate limited REST API.
//!
//! ## Features
//!
//! - **Shard state machine** handling Hello, identify/resume, Ready, Invalid Session and Reconnect
//! - **Heartbeats** with jittered first beat and missed-ack detection
//! - **Identify arbitration** in-process, through a Redis lock, or through a remote queue
//! - **REST rate limiting** with per-route buckets learned from response headers and the global limit
//! - **Auto-reconnection** with exponential backoff, full jitter and a circuit breaker
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use ws_gateway_shard::{Cluster, GatewayConfig, GatewayEvent, GatewayHandler, ShardInfo};
//!
//! struct MyHandler;
//!
//! impl GatewayHandler for MyHandler {
//!     async fn on_event(&self, shard: ShardInfo, event: GatewayEvent) {
//!         // ...
//!     }
//! }
//!
//! let config = GatewayConfig::builder(token).intents(513).build()?;
//!
//! let cluster = Cluster::new(config, MyHandler);
//! cluster.start(0..=3, 4).await?;
//! ```

mod config;
mod connection;
mod error;
mod event;
mod handler;
mod health;
mod heartbeat;
pub mod identify;
mod manager;
mod metrics;
mod protocol;
pub mod ratelimit;
mod rest;
mod state;

pub use config::{
    BackoffConfig, ConfigError, ConnectionConfig, GatewayConfig, GatewayConfigBuilder,
    IdentifyConfig, IdentifyStrategy, RestConfig, DEFAULT_API_BASE_URL, DEFAULT_GATEWAY_URL,
};
pub use error::{Error, ErrorKind};
pub use event::{ApplicationInfo, CurrentUser, DecodeError, DispatchKind, GatewayEvent, Ready};
pub use handler::GatewayHandler;
pub use health::HeartbeatHealth;
pub use heartbeat::HeartbeatScheduler;
pub use identify::{IdentifyArbiter, IdentifyQueue};
pub use manager::Cluster;
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use protocol::{
    gateway_url_with_query, CloseCode, ConnectionProperties, GatewayPacket, Hello,
    IdentifyPayload, Opcode, ShardInfo, UnknownOpcode, GATEWAY_VERSION, LARGE_THRESHOLD,
};
pub use ratelimit::{Admission, Ratelimiter};
pub use rest::{GatewayBotInfo, RestClient, SessionStartLimit};
pub use state::{Disruption, HeartbeatTick, ShardConnectionState, ShardPorts, ShardStateMachine};

/// Result type for ws-gateway-shard operations
pub type Result<T> = std::result::Result<T, Error>;
