//! Gateway wire envelope: opcodes, packets, close codes and the outbound
//! payloads the shard itself produces.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

/// Gateway API version requested in the connection URL
pub const GATEWAY_VERSION: u8 = 10;

/// Members threshold above which guilds are sent without the offline member list
pub const LARGE_THRESHOLD: u32 = 50;

const LIBRARY_NAME: &str = "ws-gateway-shard";

/// Gateway opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Opcode {
    Dispatch,
    Heartbeat,
    Identify,
    PresenceUpdate,
    VoiceStateUpdate,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
}

/// An opcode this crate does not know about
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown gateway opcode {0}")]
pub struct UnknownOpcode(pub u8);

impl TryFrom<u8> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Opcode::Dispatch,
            1 => Opcode::Heartbeat,
            2 => Opcode::Identify,
            3 => Opcode::PresenceUpdate,
            4 => Opcode::VoiceStateUpdate,
            6 => Opcode::Resume,
            7 => Opcode::Reconnect,
            8 => Opcode::RequestGuildMembers,
            9 => Opcode::InvalidSession,
            10 => Opcode::Hello,
            11 => Opcode::HeartbeatAck,
            other => return Err(UnknownOpcode(other)),
        })
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        match op {
            Opcode::Dispatch => 0,
            Opcode::Heartbeat => 1,
            Opcode::Identify => 2,
            Opcode::PresenceUpdate => 3,
            Opcode::VoiceStateUpdate => 4,
            Opcode::Resume => 6,
            Opcode::Reconnect => 7,
            Opcode::RequestGuildMembers => 8,
            Opcode::InvalidSession => 9,
            Opcode::Hello => 10,
            Opcode::HeartbeatAck => 11,
        }
    }
}

/// One gateway frame: `{op, d, s, t}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPacket {
    pub op: Opcode,
    #[serde(default)]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPacket {
    /// Build a packet without sequence or event name (all outbound packets)
    pub fn new(op: Opcode, d: Option<Value>) -> Self {
        Self { op, d, s: None, t: None }
    }

    /// Build a dispatch packet
    pub fn dispatch(event_type: impl Into<String>, sequence: u64, d: Value) -> Self {
        Self {
            op: Opcode::Dispatch,
            d: Some(d),
            s: Some(sequence),
            t: Some(event_type.into()),
        }
    }

    /// Heartbeat carrying the last sequence seen (`null` before the first dispatch)
    pub fn heartbeat(last_sequence: Option<u64>) -> Self {
        Self::new(Opcode::Heartbeat, Some(Value::from(last_sequence)))
    }

    /// Identify packet
    pub fn identify(payload: &IdentifyPayload) -> Result<Self, serde_json::Error> {
        Ok(Self::new(Opcode::Identify, Some(serde_json::to_value(payload)?)))
    }

    /// Resume packet; a missing sequence resumes from 0
    pub fn resume(
        token: &str,
        session_id: &str,
        last_sequence: Option<u64>,
    ) -> Result<Self, serde_json::Error> {
        let payload = ResumePayload {
            token,
            session_id,
            seq: last_sequence.unwrap_or(0),
        };
        Ok(Self::new(Opcode::Resume, Some(serde_json::to_value(payload)?)))
    }

    /// Deserialize `d` into a concrete payload type
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(self.d.clone().unwrap_or(Value::Null))
    }
}

/// Payload of the Hello frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

/// Position of a shard within the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardInfo {
    pub id: u32,
    pub total: u32,
}

impl ShardInfo {
    pub fn new(id: u32, total: u32) -> Self {
        Self { id, total }
    }
}

/// Identify payload sent when starting a new session
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub intents: u64,
    pub properties: ConnectionProperties,
    pub shard: [u32; 2],
    pub large_threshold: u32,
    pub compress: bool,
}

impl IdentifyPayload {
    pub fn new(token: impl Into<String>, intents: u64, shard: ShardInfo) -> Self {
        Self {
            token: token.into(),
            intents,
            properties: ConnectionProperties::default(),
            shard: [shard.id, shard.total],
            large_threshold: LARGE_THRESHOLD,
            compress: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: LIBRARY_NAME.to_string(),
            device: LIBRARY_NAME.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ResumePayload<'a> {
    token: &'a str,
    session_id: &'a str,
    seq: u64,
}

/// How a connection is closed when the state machine asks for a reconnect.
///
/// Closing with 1000 or 1001 invalidates the session server-side, so a close
/// that should allow resuming is sent without any status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: session is discarded by the server
    Normal,
    /// No status code: session stays resumable
    Resumable,
    /// 1002: we consider the peer to have violated the protocol
    ProtocolError,
}

impl CloseCode {
    /// The close frame to send, if any
    pub fn close_frame(self) -> Option<CloseFrame> {
        let code = match self {
            CloseCode::Normal => WsCloseCode::Normal,
            CloseCode::ProtocolError => WsCloseCode::Protocol,
            CloseCode::Resumable => return None,
        };
        Some(CloseFrame {
            code,
            reason: "".into(),
        })
    }
}

/// Append the version/encoding query to a gateway URL
pub fn gateway_url_with_query(base: &str) -> Result<url::Url, url::ParseError> {
    let mut url = url::Url::parse(base)?;
    url.query_pairs_mut()
        .clear()
        .append_pair("v", &GATEWAY_VERSION.to_string())
        .append_pair("encoding", "json");
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_hello_packet() {
        let raw = r#"{"op":10,"d":{"heartbeat_interval":41250},"s":null,"t":null}"#;
        let packet: GatewayPacket = serde_json::from_str(raw).unwrap();
        assert_eq!(packet.op, Opcode::Hello);
        let hello: Hello = packet.payload_as().unwrap();
        assert_eq!(hello.heartbeat_interval, 41250);
    }

    #[test]
    fn test_parse_dispatch_packet() {
        let raw = r#"{"op":0,"d":{"id":"1"},"s":42,"t":"MESSAGE_CREATE"}"#;
        let packet: GatewayPacket = serde_json::from_str(raw).unwrap();
        assert_eq!(packet.op, Opcode::Dispatch);
        assert_eq!(packet.s, Some(42));
        assert_eq!(packet.t.as_deref(), Some("MESSAGE_CREATE"));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let raw = r#"{"op":5,"d":null}"#;
        assert!(serde_json::from_str::<GatewayPacket>(raw).is_err());
    }

    #[test]
    fn test_invalid_session_payload_is_bool() {
        let raw = r#"{"op":9,"d":true}"#;
        let packet: GatewayPacket = serde_json::from_str(raw).unwrap();
        assert!(packet.payload_as::<bool>().unwrap());
    }

    #[test]
    fn test_heartbeat_serializes_null_before_first_dispatch() {
        let value = serde_json::to_value(GatewayPacket::heartbeat(None)).unwrap();
        assert_eq!(value, json!({"op": 1, "d": null}));

        let value = serde_json::to_value(GatewayPacket::heartbeat(Some(7))).unwrap();
        assert_eq!(value, json!({"op": 1, "d": 7}));
    }

    #[test]
    fn test_resume_defaults_sequence_to_zero() {
        let packet = GatewayPacket::resume("tok", "abc", None).unwrap();
        assert_eq!(packet.op, Opcode::Resume);
        assert_eq!(
            packet.d.unwrap(),
            json!({"token": "tok", "session_id": "abc", "seq": 0})
        );
    }

    #[test]
    fn test_identify_payload_shape() {
        let payload = IdentifyPayload::new("tok", 513, ShardInfo::new(3, 16));
        let packet = GatewayPacket::identify(&payload).unwrap();
        let d = packet.d.unwrap();
        assert_eq!(d["shard"], json!([3, 16]));
        assert_eq!(d["intents"], json!(513));
        assert_eq!(d["large_threshold"], json!(50));
    }

    #[test]
    fn test_close_frames() {
        assert!(CloseCode::Resumable.close_frame().is_none());
        assert_eq!(
            CloseCode::ProtocolError.close_frame().unwrap().code,
            WsCloseCode::Protocol
        );
        assert_eq!(CloseCode::Normal.close_frame().unwrap().code, WsCloseCode::Normal);
    }

    #[test]
    fn test_gateway_url_query() {
        let url = gateway_url_with_query("wss://gateway.example.com").unwrap();
        assert_eq!(url.query(), Some("v=10&encoding=json"));
    }
}
