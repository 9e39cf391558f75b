use crate::error::Error;
use crate::event::{ApplicationInfo, CurrentUser, GatewayEvent};
use crate::health::HeartbeatHealth;
use crate::heartbeat::HeartbeatScheduler;
use crate::protocol::{CloseCode, GatewayPacket, Hello, Opcode, ShardInfo};
use serde_json::Value;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Delay before reconnecting when the server asks us to
const RECONNECT_REQUEST_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle of one shard connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardConnectionState {
    #[default]
    Disconnected,
    Handshaking,
    Identifying,
    Connected,
    Reconnecting,
}

/// Outbound side of the state machine, implemented by whatever owns the socket.
///
/// The send methods only fail if the socket owner is gone.
pub trait ShardPorts: Send + Sync + 'static {
    /// Send an identify frame (start a new session)
    fn send_identify(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Send a resume frame for an existing session
    fn send_resume(
        &self,
        session_id: String,
        last_sequence: Option<u64>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Send a heartbeat frame
    fn send_heartbeat(
        &self,
        last_sequence: Option<u64>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Close the socket with `close_code` and connect again after `delay`
    fn reconnect(
        &self,
        close_code: CloseCode,
        delay: Duration,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Hand a decoded event to the layer above
    fn deliver_event(&self, event: GatewayEvent) -> impl Future<Output = ()> + Send;

    /// Called whenever a heartbeat ack yields a new latency measurement
    fn latency_changed(&self, _latency: Duration) {}

    /// Called right before [`ShardPorts::reconnect`] with the reason for it
    fn disrupted(&self, _reason: Disruption) {}
}

/// Why the state machine gave up on the current socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disruption {
    /// The server sent Reconnect
    ReconnectRequested,
    /// The server rejected the session
    InvalidSession { resumable: bool },
    /// The previous heartbeat was never acknowledged
    HeartbeatAckMissed,
    /// Hello carried an unusable heartbeat interval
    BadHello,
}

/// A heartbeat timer tick, tagged with the schedule that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTick {
    generation: u64,
}

/// Protocol state for one shard.
///
/// Owned by a single task: inbound frames and heartbeat ticks are both fed
/// through `&mut self`, so transitions never race. The heartbeat timer only
/// posts [`HeartbeatTick`]s onto the channel returned from [`ShardStateMachine::new`].
pub struct ShardStateMachine<P: ShardPorts> {
    shard: ShardInfo,
    ports: P,
    state: ShardConnectionState,

    session_id: Option<String>,
    last_sequence: Option<u64>,
    user: Option<CurrentUser>,
    application: Option<ApplicationInfo>,

    health: HeartbeatHealth,
    heartbeat: HeartbeatScheduler,
    generation: u64,
    ticks: mpsc::UnboundedSender<HeartbeatTick>,
}

impl<P: ShardPorts> ShardStateMachine<P> {
    pub fn new(shard: ShardInfo, ports: P) -> (Self, mpsc::UnboundedReceiver<HeartbeatTick>) {
        let (ticks, tick_rx) = mpsc::unbounded_channel();
        let machine = Self {
            shard,
            ports,
            state: ShardConnectionState::Disconnected,
            session_id: None,
            last_sequence: None,
            user: None,
            application: None,
            health: HeartbeatHealth::new(),
            heartbeat: HeartbeatScheduler::new(),
            generation: 0,
            ticks,
        };
        (machine, tick_rx)
    }

    pub fn shard(&self) -> ShardInfo {
        self.shard
    }

    pub fn state(&self) -> ShardConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn has_session(&self) -> bool {
        self.session_id.is_some()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn latency(&self) -> Option<Duration> {
        self.health.latency()
    }

    pub fn user(&self) -> Option<&CurrentUser> {
        self.user.as_ref()
    }

    pub fn application(&self) -> Option<&ApplicationInfo> {
        self.application.as_ref()
    }

    pub fn ports(&self) -> &P {
        &self.ports
    }

    /// The socket is open; waiting for Hello
    pub fn handle_connection_opened(&mut self) {
        self.state = ShardConnectionState::Handshaking;
    }

    /// The socket is gone. Returns once no heartbeat callback is running.
    pub async fn handle_connection_closed(&mut self) {
        self.heartbeat.stop().await;
        self.health.clear_latency();
        self.state = ShardConnectionState::Disconnected;
    }

    /// Process one inbound frame
    pub async fn handle_frame(&mut self, packet: GatewayPacket) -> Result<(), Error> {
        match packet.op {
            Opcode::Hello => match packet.payload_as::<Hello>() {
                Ok(hello) => self.handle_hello(hello).await,
                Err(e) => {
                    error!("[SHARD-{}] Malformed Hello payload: {}", self.shard.id, e);
                    Ok(())
                }
            },
            Opcode::Heartbeat => {
                debug!("[SHARD-{}] Server requested a heartbeat", self.shard.id);
                self.ports.send_heartbeat(self.last_sequence).await?;
                self.health.record_requested_sent();
                Ok(())
            }
            Opcode::HeartbeatAck => {
                if let Some(latency) = self.health.record_ack() {
                    debug!(
                        "[SHARD-{}] Received heartbeat ack (latency {:?})",
                        self.shard.id, latency
                    );
                    self.ports.latency_changed(latency);
                }
                Ok(())
            }
            Opcode::Reconnect => {
                info!("[SHARD-{}] Received Reconnect", self.shard.id);
                self.request_reconnect(
                    Disruption::ReconnectRequested,
                    CloseCode::Resumable,
                    RECONNECT_REQUEST_DELAY,
                )
                .await
            }
            Opcode::InvalidSession => {
                let resumable = packet.payload_as::<bool>().unwrap_or_else(|e| {
                    warn!(
                        "[SHARD-{}] Malformed Invalid Session payload, assuming not resumable: {}",
                        self.shard.id, e
                    );
                    false
                });
                self.handle_invalid_session(resumable).await
            }
            Opcode::Dispatch => self.handle_dispatch(packet).await,
            op => {
                debug!(
                    "[SHARD-{}] Ignoring outbound-only opcode {:?}",
                    self.shard.id, op
                );
                Ok(())
            }
        }
    }

    /// Process a heartbeat timer tick
    pub async fn handle_heartbeat_tick(&mut self, tick: HeartbeatTick) -> Result<(), Error> {
        if tick.generation != self.generation || !self.heartbeat.is_running() {
            return Ok(());
        }
        if matches!(
            self.state,
            ShardConnectionState::Reconnecting | ShardConnectionState::Disconnected
        ) {
            return Ok(());
        }

        if self.health.is_ack_overdue() {
            warn!(
                "[SHARD-{}] Heartbeat ack not received within one interval, reconnecting",
                self.shard.id
            );
            return self
                .request_reconnect(
                    Disruption::HeartbeatAckMissed,
                    CloseCode::ProtocolError,
                    Duration::ZERO,
                )
                .await;
        }

        self.ports.send_heartbeat(self.last_sequence).await?;
        self.health.record_sent();
        Ok(())
    }

    async fn handle_hello(&mut self, hello: Hello) -> Result<(), Error> {
        if hello.heartbeat_interval == 0 {
            error!("[SHARD-{}] Hello with zero heartbeat interval", self.shard.id);
            return self
                .request_reconnect(Disruption::BadHello, CloseCode::ProtocolError, Duration::ZERO)
                .await;
        }

        let interval = Duration::from_millis(hello.heartbeat_interval);
        self.health.reset();
        self.generation += 1;

        let generation = self.generation;
        let ticks = self.ticks.clone();
        self.heartbeat
            .start(interval, move || {
                let _ = ticks.send(HeartbeatTick { generation });
                std::future::ready(())
            })
            .await;

        self.state = ShardConnectionState::Identifying;
        match &self.session_id {
            Some(session_id) => {
                info!(
                    "[SHARD-{}] Received Hello, resuming session (seq {:?})",
                    self.shard.id, self.last_sequence
                );
                self.ports
                    .send_resume(session_id.clone(), self.last_sequence)
                    .await
            }
            None => {
                info!("[SHARD-{}] Received Hello, identifying", self.shard.id);
                self.ports.send_identify().await
            }
        }
    }

    async fn handle_invalid_session(&mut self, resumable: bool) -> Result<(), Error> {
        info!(
            "[SHARD-{}] Received Invalid Session (resumable: {})",
            self.shard.id, resumable
        );
        if !resumable {
            self.session_id = None;
            self.last_sequence = None;
        }

        // A normal close would discard a session we still intend to resume
        let close_code = if resumable {
            CloseCode::Resumable
        } else {
            CloseCode::Normal
        };
        let delay = Duration::from_millis(rand::random_range(1000..5000));
        self.request_reconnect(Disruption::InvalidSession { resumable }, close_code, delay)
            .await
    }

    async fn handle_dispatch(&mut self, packet: GatewayPacket) -> Result<(), Error> {
        if let Some(sequence) = packet.s {
            self.last_sequence = Some(sequence);
        }

        let Some(event_type) = packet.t else {
            warn!("[SHARD-{}] Dispatch frame without event type", self.shard.id);
            return Ok(());
        };

        let event = match GatewayEvent::decode(&event_type, packet.d.unwrap_or(Value::Null)) {
            Ok(event) => event,
            Err(e) => {
                error!("[SHARD-{}] {}", self.shard.id, e);
                return Ok(());
            }
        };

        match &event {
            GatewayEvent::Ready(ready) => {
                info!(
                    "[SHARD-{}] Received Ready (session {})",
                    self.shard.id, ready.session_id
                );
                self.session_id = Some(ready.session_id.clone());
                self.user = Some(ready.user.clone());
                self.application = ready.application.clone();
                self.state = ShardConnectionState::Connected;
            }
            GatewayEvent::Resumed => {
                info!("[SHARD-{}] Session resumed", self.shard.id);
                self.state = ShardConnectionState::Connected;
            }
            GatewayEvent::Unrecognized { name } => {
                debug!("[SHARD-{}] Ignoring unknown event {}", self.shard.id, name);
                return Ok(());
            }
            GatewayEvent::Dispatch { .. } => {}
        }

        self.ports.deliver_event(event).await;
        Ok(())
    }

    async fn request_reconnect(
        &mut self,
        reason: Disruption,
        close_code: CloseCode,
        delay: Duration,
    ) -> Result<(), Error> {
        self.state = ShardConnectionState::Reconnecting;
        self.ports.disrupted(reason);
        self.ports.reconnect(close_code, delay).await
    }
}
