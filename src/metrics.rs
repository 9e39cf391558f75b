use crate::state::ShardConnectionState;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters are cluster-wide; per-shard gauges are keyed by shard id.
/// Use `snapshot()` to get a point-in-time view of everything.
///
/// # Example
/// ```ignore
/// let metrics = cluster.metrics();
///
/// println!("Identifies: {}", metrics.identifies());
/// println!("Events: {}", metrics.events_dispatched());
///
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    frames_received_total: AtomicU64,
    frames_sent_total: AtomicU64,
    errors_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeat_acks_total: AtomicU64,
    heartbeat_failures_total: AtomicU64,
    invalid_sessions_total: AtomicU64,
    server_reconnects_total: AtomicU64,
    events_dispatched_total: AtomicU64,
    circuit_breaker_trips_total: AtomicU64,

    /// Per-shard metrics
    shard_metrics: RwLock<BTreeMap<u32, ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    pub shard_id: u32,
    pub state: ShardConnectionState,
    /// Whether the socket is currently open
    pub is_connected: bool,
    /// Round trip of the last acknowledged heartbeat
    pub latency: Option<Duration>,
    /// Dispatch events delivered to the handler
    pub events_received: u64,
    /// Duration since last successful connection (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Duration since last event (None if no events)
    pub time_since_last_event: Option<Duration>,
    /// Current reconnection attempt (0 if connected)
    pub reconnect_attempt: u32,
    /// Total time the socket has been open
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
    #[doc(hidden)]
    pub(crate) last_event_at: Option<Instant>,
}

impl ShardMetrics {
    fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            state: ShardConnectionState::Disconnected,
            is_connected: false,
            latency: None,
            events_received: 0,
            time_since_connected: None,
            time_since_last_event: None,
            reconnect_attempt: 0,
            total_uptime: Duration::ZERO,
            last_connected_at: None,
            last_event_at: None,
        }
    }

    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            time_since_last_event: self.last_event_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received_total.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent_total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    pub fn heartbeat_acks(&self) -> u64 {
        self.heartbeat_acks_total.load(Ordering::Relaxed)
    }

    /// Reconnects forced by a missing heartbeat ack or a bad Hello
    pub fn heartbeat_failures(&self) -> u64 {
        self.heartbeat_failures_total.load(Ordering::Relaxed)
    }

    pub fn invalid_sessions(&self) -> u64 {
        self.invalid_sessions_total.load(Ordering::Relaxed)
    }

    /// Reconnects requested by the server
    pub fn server_reconnects(&self) -> u64 {
        self.server_reconnects_total.load(Ordering::Relaxed)
    }

    pub fn events_dispatched(&self) -> u64 {
        self.events_dispatched_total.load(Ordering::Relaxed)
    }

    pub fn circuit_breaker_trips(&self) -> u64 {
        self.circuit_breaker_trips_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_received(&self) {
        self.frames_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_sent(&self) {
        self.frames_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_identify(&self) {
        self.identifies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_sent(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_failure(&self) {
        self.heartbeat_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid_session(&self) {
        self.invalid_sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_server_reconnect(&self) {
        self.server_reconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_circuit_breaker_trip(&self) {
        self.circuit_breaker_trips_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count an acked heartbeat and store the shard's latency
    pub(crate) fn record_heartbeat_ack(&self, shard_id: u32, latency: Duration) {
        self.heartbeat_acks_total.fetch_add(1, Ordering::Relaxed);
        self.update_shard(shard_id, |s| s.latency = Some(latency));
    }

    /// Count an event delivered to the handler
    pub(crate) fn record_event(&self, shard_id: u32) {
        self.events_dispatched_total.fetch_add(1, Ordering::Relaxed);
        self.update_shard(shard_id, |s| {
            s.events_received += 1;
            s.last_event_at = Some(Instant::now());
        });
    }

    /// Update metrics for a specific shard, creating its entry if needed
    pub(crate) fn update_shard(&self, shard_id: u32, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();
        let entry = shards
            .entry(shard_id)
            .or_insert_with(|| ShardMetrics::new(shard_id));
        update_fn(entry);
    }

    /// Snapshot of one shard, if it has been started
    pub fn shard(&self, shard_id: u32) -> Option<ShardMetrics> {
        self.shard_metrics.read().get(&shard_id).map(|s| s.snapshot())
    }

    /// Get a snapshot of all shard metrics with computed durations
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().values().map(|s| s.snapshot()).collect()
    }

    /// Number of shards with an open socket
    pub fn active_connections(&self) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.is_connected)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Take the shard lock once to ensure consistency
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.values().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            frames_received_total: self.frames_received_total.load(Ordering::Acquire),
            frames_sent_total: self.frames_sent_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeat_acks_total: self.heartbeat_acks_total.load(Ordering::Acquire),
            heartbeat_failures_total: self.heartbeat_failures_total.load(Ordering::Acquire),
            invalid_sessions_total: self.invalid_sessions_total.load(Ordering::Acquire),
            server_reconnects_total: self.server_reconnects_total.load(Ordering::Acquire),
            events_dispatched_total: self.events_dispatched_total.load(Ordering::Acquire),
            circuit_breaker_trips_total: self.circuit_breaker_trips_total.load(Ordering::Acquire),
            active_connections: shard_snapshots.iter().filter(|s| s.is_connected).count(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub frames_received_total: u64,
    pub frames_sent_total: u64,
    pub errors_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeat_acks_total: u64,
    pub heartbeat_failures_total: u64,
    pub invalid_sessions_total: u64,
    pub server_reconnects_total: u64,
    pub events_dispatched_total: u64,
    pub circuit_breaker_trips_total: u64,
    pub active_connections: usize,
    pub shards: Vec<ShardMetrics>,
}
