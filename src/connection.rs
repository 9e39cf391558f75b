use crate::config::{BackoffConfig, ConfigError, ConnectionConfig, GatewayConfig};
use crate::error::Error;
use crate::event::GatewayEvent;
use crate::handler::GatewayHandler;
use crate::identify::IdentifyQueue;
use crate::metrics::Metrics;
use crate::protocol::{gateway_url_with_query, CloseCode, GatewayPacket, IdentifyPayload, ShardInfo};
use crate::state::{
    Disruption, HeartbeatTick, ShardConnectionState, ShardPorts, ShardStateMachine,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Commands the cluster can send to a running shard
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Send a packet on the current socket (e.g. a presence update)
    Send(GatewayPacket),
    /// Gracefully close the connection and stop the shard
    Close,
    /// Drop the socket and reconnect, resuming if possible
    Reconnect,
}

/// Work produced by the state machine for the socket loop
#[derive(Debug)]
enum ShardCommand {
    Send(GatewayPacket),
    Reconnect { close_code: CloseCode, delay: Duration },
}

/// How a socket session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    /// Stop the shard for good
    Stop,
    /// The state machine asked for a new socket after this delay
    Reconnect(Duration),
    /// The server or the network dropped us
    Lost,
}

/// [`ShardPorts`] that queue packets for the socket loop and forward events to
/// the user's handler.
pub(crate) struct DriverPorts<H: GatewayHandler> {
    shard: ShardInfo,
    token: String,
    intents: u64,
    outbound: mpsc::UnboundedSender<ShardCommand>,
    handler: Arc<H>,
    metrics: Arc<Metrics>,
    low_latency_mode: bool,
}

impl<H: GatewayHandler> DriverPorts<H> {
    fn queue(&self, command: ShardCommand) -> Result<(), Error> {
        self.outbound
            .send(command)
            .map_err(|e| Error::ChannelSend(format!("shard {} socket loop is gone: {:?}", self.shard.id, e.0)))
    }
}

impl<H: GatewayHandler> ShardPorts for DriverPorts<H> {
    async fn send_identify(&self) -> Result<(), Error> {
        let payload = IdentifyPayload::new(self.token.clone(), self.intents, self.shard);
        self.queue(ShardCommand::Send(GatewayPacket::identify(&payload)?))?;
        self.metrics.record_identify();
        Ok(())
    }

    async fn send_resume(&self, session_id: String, last_sequence: Option<u64>) -> Result<(), Error> {
        let packet = GatewayPacket::resume(&self.token, &session_id, last_sequence)?;
        self.queue(ShardCommand::Send(packet))?;
        self.metrics.record_resume();
        Ok(())
    }

    async fn send_heartbeat(&self, last_sequence: Option<u64>) -> Result<(), Error> {
        self.queue(ShardCommand::Send(GatewayPacket::heartbeat(last_sequence)))?;
        self.metrics.record_heartbeat_sent();
        Ok(())
    }

    async fn reconnect(&self, close_code: CloseCode, delay: Duration) -> Result<(), Error> {
        self.queue(ShardCommand::Reconnect { close_code, delay })
    }

    fn disrupted(&self, reason: Disruption) {
        match reason {
            Disruption::ReconnectRequested => self.metrics.record_server_reconnect(),
            Disruption::InvalidSession { .. } => self.metrics.record_invalid_session(),
            Disruption::HeartbeatAckMissed => self.metrics.record_heartbeat_failure(),
            Disruption::BadHello => self.metrics.record_error(),
        }
    }

    /// Call handler.on_event, optionally with panic protection.
    ///
    /// In low-latency mode, handlers are called directly (panics crash the task).
    /// Otherwise, handlers are spawned in a separate task for panic isolation.
    async fn deliver_event(&self, event: GatewayEvent) {
        let shard = self.shard;
        if self.low_latency_mode {
            let start = Instant::now();
            self.handler.on_event(shard, event).await;
            trace!("[SHARD-{}] Handler processed event in {:?}", shard.id, start.elapsed());
        } else {
            let handler = self.handler.clone();
            let result = tokio::task::spawn(async move {
                let start = Instant::now();
                let fut = AssertUnwindSafe(handler.on_event(shard, event));
                fut.await;
                trace!("[SHARD-{}] Handler processed event in {:?}", shard.id, start.elapsed());
            })
            .await;

            if let Err(e) = result {
                if e.is_panic() {
                    error!(
                        "[SHARD-{}] Handler.on_event panicked! Event dropped. Error: {:?}",
                        shard.id, e
                    );
                    self.metrics.record_error();
                } else {
                    warn!("[SHARD-{}] Handler.on_event task failed: {:?}", shard.id, e);
                }
                return;
            }
        }
        self.metrics.record_event(shard.id);
    }

    fn latency_changed(&self, latency: Duration) {
        self.metrics.record_heartbeat_ack(self.shard.id, latency);
        self.handler.on_latency(self.shard, latency);
    }
}

/// Drives one shard: owns its state machine and socket, reconnects on failure
pub(crate) struct ShardRunner<H: GatewayHandler, Q: IdentifyQueue> {
    shard: ShardInfo,
    gateway_url: String,
    config: ConnectionConfig,
    backoff: BackoffConfig,
    machine: ShardStateMachine<DriverPorts<H>>,
    tick_rx: mpsc::UnboundedReceiver<HeartbeatTick>,
    outbound_rx: mpsc::UnboundedReceiver<ShardCommand>,
    control_rx: mpsc::Receiver<ConnectionCommand>,
    arbiter: Arc<Q>,
    handler: Arc<H>,
    metrics: Arc<Metrics>,
    reported_state: ShardConnectionState,
}

impl<H: GatewayHandler, Q: IdentifyQueue> ShardRunner<H, Q> {
    pub(crate) fn new(
        shard: ShardInfo,
        config: &GatewayConfig,
        handler: Arc<H>,
        arbiter: Arc<Q>,
        metrics: Arc<Metrics>,
        control_rx: mpsc::Receiver<ConnectionCommand>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let ports = DriverPorts {
            shard,
            token: config.token.clone(),
            intents: config.intents,
            outbound,
            handler: handler.clone(),
            metrics: metrics.clone(),
            low_latency_mode: config.connection.low_latency_mode,
        };
        let (machine, tick_rx) = ShardStateMachine::new(shard, ports);
        metrics.update_shard(shard.id, |_| {});

        Self {
            shard,
            gateway_url: config.gateway_url.clone(),
            config: config.connection.clone(),
            backoff: config.backoff.clone(),
            machine,
            tick_rx,
            outbound_rx,
            control_rx,
            arbiter,
            handler,
            metrics,
            reported_state: ShardConnectionState::Disconnected,
        }
    }

    /// Run the connection loop (reconnects on failure)
    pub(crate) async fn run(mut self) -> Result<(), Error> {
        let shard_id = self.shard.id;
        let mut reconnect_attempt = 0u32;
        let mut is_first_connect = true;
        let mut consecutive_failures = 0u32;
        let mut circuit_breaker_tripped_at: Option<Instant> = None;
        let mut requested_delay: Option<Duration> = None;

        loop {
            // Check circuit breaker
            if let Some(tripped_at) = circuit_breaker_tripped_at {
                let remaining = self
                    .config
                    .circuit_breaker_reset_timeout
                    .saturating_sub(tripped_at.elapsed());
                if !remaining.is_zero() {
                    warn!(
                        "[SHARD-{}] Circuit breaker open, waiting {:?} before retry",
                        shard_id, remaining
                    );
                    if !self.pause(remaining).await {
                        return Ok(());
                    }
                }
                circuit_breaker_tripped_at = None;
                consecutive_failures = 0;
            }

            // A delay asked for by the state machine replaces the backoff
            let delay = match requested_delay.take() {
                Some(delay) => Some(delay),
                None if !is_first_connect => Some(self.backoff.delay_for_attempt(reconnect_attempt)),
                None => None,
            };
            if let Some(delay) = delay.filter(|d| !d.is_zero()) {
                debug!(
                    "[SHARD-{}] Reconnecting in {:?} (attempt {})",
                    shard_id,
                    delay,
                    reconnect_attempt + 1
                );
                if !self.pause(delay).await {
                    return Ok(());
                }
            }

            // Only a brand new session needs an identify slot
            if !self.machine.has_session() && !self.await_identify_turn().await {
                info!("[SHARD-{}] Stopped while waiting to identify", shard_id);
                return Ok(());
            }

            match self.connect_and_run(reconnect_attempt).await {
                Ok(Disconnect::Stop) => {
                    info!("[SHARD-{}] Connection closed gracefully", shard_id);
                    return Ok(());
                }
                Ok(outcome) => {
                    // Clean disconnect, reset counters
                    reconnect_attempt = 0;
                    consecutive_failures = 0;
                    if let Disconnect::Reconnect(delay) = outcome {
                        requested_delay = Some(delay);
                    }
                }
                Err(e) => {
                    self.metrics.record_error();
                    consecutive_failures += 1;
                    warn!(
                        "[SHARD-{}] Connection error: {} (attempt {}, consecutive failures: {})",
                        shard_id,
                        e,
                        reconnect_attempt + 1,
                        consecutive_failures
                    );

                    if consecutive_failures >= self.config.circuit_breaker_threshold {
                        error!(
                            "[SHARD-{}] Circuit breaker tripped after {} consecutive failures",
                            shard_id, consecutive_failures
                        );
                        self.metrics.record_circuit_breaker_trip();

                        let tripped = Error::CircuitBreakerOpen {
                            failures: consecutive_failures,
                        };
                        if !self.call_on_error_safe(&tripped).await {
                            error!("[SHARD-{}] Handler declined waiting out the circuit breaker", shard_id);
                            return Err(tripped);
                        }
                        circuit_breaker_tripped_at = Some(Instant::now());
                        // Don't count against max_connect_attempts when circuit breaker is handling it
                        continue;
                    }

                    let should_retry = self.call_on_error_safe(&e).await;
                    if !should_retry {
                        error!("[SHARD-{}] Handler declined reconnection", shard_id);
                        return Err(e);
                    }

                    reconnect_attempt += 1;
                    if reconnect_attempt >= self.config.max_connect_attempts {
                        error!(
                            "[SHARD-{}] Max reconnection attempts ({}) reached",
                            shard_id, self.config.max_connect_attempts
                        );
                        return Err(Error::ConnectionFailed {
                            attempts: reconnect_attempt,
                            last_error: e.to_string(),
                        });
                    }
                }
            }

            is_first_connect = false;
            self.metrics.record_reconnection();
            self.metrics
                .update_shard(shard_id, |s| s.reconnect_attempt = reconnect_attempt);
        }
    }

    /// Call handler.on_error with panic protection
    ///
    /// If the handler panics, we log the error and return true (retry).
    async fn call_on_error_safe(&self, error: &Error) -> bool {
        let handler = self.handler.clone();
        let error_kind = error.kind();
        let error_msg = error.to_string();
        let shard = self.shard;

        let result = tokio::task::spawn(async move {
            let fut = AssertUnwindSafe(handler.on_error(shard, error_kind, &error_msg));
            fut.await
        })
        .await;

        match result {
            Ok(should_retry) => should_retry,
            Err(e) => {
                if e.is_panic() {
                    error!(
                        "[SHARD-{}] Handler.on_error panicked! Defaulting to retry. Error: {:?}",
                        shard.id, e
                    );
                } else {
                    warn!("[SHARD-{}] Handler.on_error task failed: {:?}", shard.id, e);
                }
                true
            }
        }
    }

    /// Sleep while still honouring cluster commands. Returns `false` if the shard must stop.
    async fn pause(&mut self, delay: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                cmd = self.control_rx.recv() => {
                    if !self.handle_idle_command(cmd) {
                        return false;
                    }
                }
            }
        }
    }

    /// Wait for the identify arbiter. Returns `false` if the shard must stop;
    /// the pending wait is dropped in that case.
    async fn await_identify_turn(&mut self) -> bool {
        let arbiter = self.arbiter.clone();
        let turn = arbiter.await_turn(self.shard.id);
        tokio::pin!(turn);

        loop {
            tokio::select! {
                _ = &mut turn => return true,
                cmd = self.control_rx.recv() => {
                    if !self.handle_idle_command(cmd) {
                        return false;
                    }
                }
            }
        }
    }

    /// Handle a cluster command while no socket is open
    fn handle_idle_command(&self, cmd: Option<ConnectionCommand>) -> bool {
        match cmd {
            Some(ConnectionCommand::Send(packet)) => {
                warn!(
                    "[SHARD-{}] Dropping {:?} packet, not connected",
                    self.shard.id, packet.op
                );
                true
            }
            Some(ConnectionCommand::Reconnect) => true,
            Some(ConnectionCommand::Close) | None => false,
        }
    }

    /// Forward a state transition to metrics and the handler
    async fn sync_state(&mut self) {
        let state = self.machine.state();
        if state == self.reported_state {
            return;
        }
        debug!(
            "[SHARD-{}] State {:?} -> {:?}",
            self.shard.id, self.reported_state, state
        );
        self.reported_state = state;
        self.metrics.update_shard(self.shard.id, |s| s.state = state);
        self.handler.on_state_change(self.shard, state).await;
    }

    /// Connect and run until disconnection
    async fn connect_and_run(&mut self, reconnect_attempt: u32) -> Result<Disconnect, Error> {
        let shard_id = self.shard.id;
        let url = gateway_url_with_query(&self.gateway_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("gateway_url: {}", e)))?;

        debug!("[SHARD-{}] Connecting to {}", shard_id, url);
        let ws_stream = match timeout(self.config.connect_timeout, connect(&url)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::ConnectionFailed {
                    attempts: 0,
                    last_error: "Connection timeout".to_string(),
                })
            }
        };

        // Packets queued for the previous socket mean nothing on this one
        while self.outbound_rx.try_recv().is_ok() {}

        self.metrics.record_connection();
        self.metrics.update_shard(shard_id, |s| {
            s.is_connected = true;
            s.last_connected_at = Some(Instant::now());
            s.reconnect_attempt = reconnect_attempt;
        });
        info!("[SHARD-{}] Connected to {}", shard_id, url);

        self.machine.handle_connection_opened();
        self.sync_state().await;

        let result = self.run_socket(ws_stream).await;

        self.machine.handle_connection_closed().await;
        self.sync_state().await;
        self.metrics.update_shard(shard_id, |s| {
            s.is_connected = false;
            s.latency = None;
            if let Some(connected_at) = s.last_connected_at {
                s.total_uptime += connected_at.elapsed();
            }
        });

        result
    }

    async fn run_socket(&mut self, ws_stream: WsStream) -> Result<Disconnect, Error> {
        let shard_id = self.shard.id;
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                // Handle incoming frames
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.metrics.record_frame_received();
                            match serde_json::from_str::<GatewayPacket>(&text) {
                                Ok(packet) => {
                                    trace!("[SHARD-{}] Received {:?} (seq {:?})", shard_id, packet.op, packet.s);
                                    self.machine.handle_frame(packet).await?;
                                    self.sync_state().await;
                                }
                                Err(e) => {
                                    warn!("[SHARD-{}] Dropping unparseable frame: {}", shard_id, e);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            debug!("[SHARD-{}] Received ping, sending pong", shard_id);
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("[SHARD-{}] Connection closed by server: {:?}", shard_id, frame);
                            return Ok(Disconnect::Lost);
                        }
                        Some(Ok(Message::Binary(_))) => {
                            warn!("[SHARD-{}] Ignoring binary frame", shard_id);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("[SHARD-{}] WebSocket error: {}", shard_id, e);
                            return Err(Error::WebSocket(e));
                        }
                        None => {
                            info!("[SHARD-{}] WebSocket stream ended", shard_id);
                            return Ok(Disconnect::Lost);
                        }
                    }
                }

                // Packets and reconnect requests from the state machine
                Some(cmd) = self.outbound_rx.recv() => {
                    match cmd {
                        ShardCommand::Send(packet) => {
                            let json = serde_json::to_string(&packet)?;
                            if let Err(e) = write.send(Message::text(json)).await {
                                warn!("[SHARD-{}] Failed to send {:?}: {}", shard_id, packet.op, e);
                                return Err(Error::WebSocket(e));
                            }
                            self.metrics.record_frame_sent();
                        }
                        ShardCommand::Reconnect { close_code, delay } => {
                            info!(
                                "[SHARD-{}] Closing socket ({:?}), reconnecting in {:?}",
                                shard_id, close_code, delay
                            );
                            let _ = write.send(Message::Close(close_code.close_frame())).await;
                            return Ok(Disconnect::Reconnect(delay));
                        }
                    }
                }

                // Heartbeat timer
                Some(tick) = self.tick_rx.recv() => {
                    self.machine.handle_heartbeat_tick(tick).await?;
                    self.sync_state().await;
                }

                // Handle commands from the cluster
                cmd = self.control_rx.recv() => {
                    match cmd {
                        Some(ConnectionCommand::Send(packet)) => {
                            let json = serde_json::to_string(&packet)?;
                            write.send(Message::text(json)).await?;
                            self.metrics.record_frame_sent();
                        }
                        Some(ConnectionCommand::Close) | None => {
                            info!("[SHARD-{}] Received close command", shard_id);
                            let _ = write.send(Message::Close(CloseCode::Normal.close_frame())).await;
                            return Ok(Disconnect::Stop);
                        }
                        Some(ConnectionCommand::Reconnect) => {
                            info!("[SHARD-{}] Received reconnect command", shard_id);
                            let _ = write.send(Message::Close(CloseCode::Resumable.close_frame())).await;
                            return Ok(Disconnect::Reconnect(Duration::ZERO));
                        }
                    }
                }
            }
        }
    }
}

/// Type alias for WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Open a WebSocket to `url`, using TLS for `wss`
async fn connect(url: &Url) -> Result<WsStream, Error> {
    let host = url.host_str().ok_or_else(|| Error::ConnectionFailed {
        attempts: 0,
        last_error: "No host in URL".to_string(),
    })?;

    let is_tls = url.scheme() == "wss";
    let port = url.port().unwrap_or(if is_tls { 443 } else { 80 });

    let request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("Invalid WebSocket request: {}", e),
        })?;

    let tcp_stream = connect_direct(host, port).await?;

    // Set TCP options for low latency
    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new().map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("TLS error: {}", e),
        })?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) = client_async_tls_with_config(request, tcp_stream, None, connector)
        .await
        .map_err(Error::WebSocket)?;

    Ok(ws_stream)
}

async fn connect_direct(host: &str, port: u16) -> Result<tokio::net::TcpStream, Error> {
    let dest_str = format!("{}:{}", host, port);
    let dest_addr: SocketAddr = tokio::net::lookup_host(&dest_str)
        .await
        .map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("DNS lookup failed: {}", e),
        })?
        .next()
        .ok_or_else(|| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("No addresses found for {}", host),
        })?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::ConnectionFailed {
        attempts: 0,
        last_error: format!("Failed to create socket: {}", e),
    })?;

    socket
        .connect(dest_addr)
        .await
        .map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("TCP connect to {} failed: {}", dest_addr, e),
        })
}

/// Set TCP options for low latency
fn set_tcp_options(stream: &tokio::net::TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    // Enable TCP_NODELAY (disable Nagle's algorithm)
    let _ = sock2.set_nodelay(true);

    // Set keepalive to detect dead connections
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}
