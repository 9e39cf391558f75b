use crate::error::ErrorKind;
use crate::event::GatewayEvent;
use crate::protocol::ShardInfo;
use crate::state::ShardConnectionState;
use std::future::Future;
use std::time::Duration;

/// Trait that users implement to receive gateway events.
///
/// The cluster owns the sockets, sessions and heartbeats; the handler only
/// sees decoded events and lifecycle notifications.
///
/// # Example
///
/// ```ignore
/// use ws_gateway_shard::{GatewayEvent, GatewayHandler, ShardInfo};
///
/// struct LogHandler;
///
/// impl GatewayHandler for LogHandler {
///     async fn on_event(&self, shard: ShardInfo, event: GatewayEvent) {
///         println!("[{}/{}] {:?}", shard.id, shard.total, event);
///     }
/// }
/// ```
pub trait GatewayHandler: Send + Sync + 'static {
    /// Called for every recognised event received on `shard`, in sequence order.
    fn on_event(&self, shard: ShardInfo, event: GatewayEvent) -> impl Future<Output = ()> + Send;

    /// Called whenever a shard's connection state changes.
    fn on_state_change(
        &self,
        _shard: ShardInfo,
        _state: ShardConnectionState,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called with each new heartbeat round trip measurement.
    fn on_latency(&self, _shard: ShardInfo, _latency: Duration) {}

    /// Called when a connection attempt or an open socket fails, and when the
    /// circuit breaker trips (`ErrorKind::CircuitBreakerOpen`).
    ///
    /// Receives the error kind for type-based decision making and the error message.
    /// Return `true` to attempt reconnection, `false` to stop the shard.
    fn on_error(
        &self,
        _shard: ShardInfo,
        _kind: ErrorKind,
        _message: &str,
    ) -> impl Future<Output = bool> + Send {
        async { true }
    }
}
