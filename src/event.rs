use serde::Deserialize;
use serde_json::Value;

/// Identity of the account the session is authenticated as
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// Identity of the application that owns the session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApplicationInfo {
    pub id: String,
}

/// The handshake-success event
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ready {
    pub session_id: String,
    pub user: CurrentUser,
    #[serde(default)]
    pub application: Option<ApplicationInfo>,
}

/// Dispatch event names this crate forwards. Payloads are passed through
/// untouched; interpreting them is up to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchKind {
    GuildCreate,
    GuildUpdate,
    GuildDelete,
    GuildMemberAdd,
    GuildMemberRemove,
    GuildMemberUpdate,
    GuildRoleCreate,
    GuildRoleUpdate,
    GuildRoleDelete,
    ChannelCreate,
    ChannelUpdate,
    ChannelDelete,
    ThreadCreate,
    ThreadUpdate,
    ThreadDelete,
    ThreadListSync,
    MessageCreate,
    MessageUpdate,
    MessageDelete,
    MessageDeleteBulk,
    MessageReactionAdd,
    MessageReactionRemove,
    MessageReactionRemoveAll,
    MessageReactionRemoveEmoji,
    InteractionCreate,
}

impl DispatchKind {
    pub fn from_name(name: &str) -> Option<Self> {
        use DispatchKind::*;
        Some(match name {
            "GUILD_CREATE" => GuildCreate,
            "GUILD_UPDATE" => GuildUpdate,
            "GUILD_DELETE" => GuildDelete,
            "GUILD_MEMBER_ADD" => GuildMemberAdd,
            "GUILD_MEMBER_REMOVE" => GuildMemberRemove,
            "GUILD_MEMBER_UPDATE" => GuildMemberUpdate,
            "GUILD_ROLE_CREATE" => GuildRoleCreate,
            "GUILD_ROLE_UPDATE" => GuildRoleUpdate,
            "GUILD_ROLE_DELETE" => GuildRoleDelete,
            "CHANNEL_CREATE" => ChannelCreate,
            "CHANNEL_UPDATE" => ChannelUpdate,
            "CHANNEL_DELETE" => ChannelDelete,
            "THREAD_CREATE" => ThreadCreate,
            "THREAD_UPDATE" => ThreadUpdate,
            "THREAD_DELETE" => ThreadDelete,
            "THREAD_LIST_SYNC" => ThreadListSync,
            "MESSAGE_CREATE" => MessageCreate,
            "MESSAGE_UPDATE" => MessageUpdate,
            "MESSAGE_DELETE" => MessageDelete,
            "MESSAGE_DELETE_BULK" => MessageDeleteBulk,
            "MESSAGE_REACTION_ADD" => MessageReactionAdd,
            "MESSAGE_REACTION_REMOVE" => MessageReactionRemove,
            "MESSAGE_REACTION_REMOVE_ALL" => MessageReactionRemoveAll,
            "MESSAGE_REACTION_REMOVE_EMOJI" => MessageReactionRemoveEmoji,
            "INTERACTION_CREATE" => InteractionCreate,
            _ => return None,
        })
    }
}

/// A decoded dispatch event
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Ready(Ready),
    Resumed,
    Dispatch { kind: DispatchKind, payload: Value },
    /// An event name we have no decoder for; never forwarded to handlers
    Unrecognized { name: String },
}

/// A known event whose payload did not have the expected shape
#[derive(Debug, thiserror::Error)]
#[error("failed to decode {event_type}: {reason}")]
pub struct DecodeError {
    pub event_type: String,
    pub reason: String,
}

impl GatewayEvent {
    /// Decode a dispatch payload by event name
    pub fn decode(event_type: &str, payload: Value) -> Result<Self, DecodeError> {
        let fail = |reason: String| DecodeError {
            event_type: event_type.to_string(),
            reason,
        };

        match event_type {
            "READY" => Ready::deserialize(payload)
                .map(GatewayEvent::Ready)
                .map_err(|e| fail(e.to_string())),
            "RESUMED" => Ok(GatewayEvent::Resumed),
            name => match DispatchKind::from_name(name) {
                Some(kind) if payload.is_object() => Ok(GatewayEvent::Dispatch { kind, payload }),
                Some(_) => Err(fail(format!("expected an object payload, got {}", payload))),
                None => Ok(GatewayEvent::Unrecognized {
                    name: name.to_string(),
                }),
            },
        }
    }
}
