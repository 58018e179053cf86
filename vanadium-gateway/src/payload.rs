//! Gateway payload structures.
//!
//! Everything on the gateway wire is a `{op, d, s?, t?}` envelope; the
//! structures here are the payloads the runtime itself sends and the few
//! it decodes eagerly.

use crate::opcode::OpCode;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use vanadium_model::{Application, Intents, Snowflake, UnavailableGuild, User};

/// Inbound envelope, with `d` deferred as raw JSON.
#[derive(Debug, Deserialize)]
pub struct RawPayload {
    /// Opcode for the payload.
    pub op: OpCode,

    /// Event data.
    #[serde(default)]
    pub d: Option<serde_json::Value>,

    /// Sequence number (Dispatch only).
    #[serde(default)]
    pub s: Option<u64>,

    /// Event name (Dispatch only).
    #[serde(default)]
    pub t: Option<String>,
}

/// Outbound envelope.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayPayload<D> {
    pub op: OpCode,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<D>,
}

impl<D: Serialize> GatewayPayload<D> {
    /// Envelope an opcode with its data.
    pub fn new(op: OpCode, data: D) -> Self {
        Self { op, d: Some(data) }
    }

    /// Serialize to the wire string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Hello (op 10)
// ============================================================================

/// Received immediately after connecting.
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    /// Interval (in milliseconds) at which to send heartbeats.
    pub heartbeat_interval: u64,
}

// ============================================================================
// Identify (op 2)
// ============================================================================

/// Sent to authenticate and start a new session.
#[derive(Debug, Clone, Serialize)]
pub struct Identify<'a> {
    /// Authentication token.
    pub token: Cow<'a, str>,

    /// Gateway intents, an unsigned 32-bit mask.
    pub intents: Intents,

    /// Connection properties.
    pub properties: ConnectionProperties<'a>,

    /// Whether payload compression was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,

    /// Threshold for large guilds (50-250).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u8>,

    /// Shard information: `[shard_id, total_shards]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u16; 2]>,

    /// Initial presence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<UpdatePresence>,
}

impl<'a> Identify<'a> {
    pub fn new(token: impl Into<Cow<'a, str>>, intents: Intents) -> Self {
        Self {
            token: token.into(),
            intents,
            properties: ConnectionProperties::default(),
            compress: None,
            large_threshold: None,
            shard: None,
            presence: None,
        }
    }

    pub fn with_shard(mut self, shard_id: u16, total_shards: u16) -> Self {
        self.shard = Some([shard_id, total_shards]);
        self
    }

    pub fn with_large_threshold(mut self, threshold: u8) -> Self {
        self.large_threshold = Some(threshold);
        self
    }
}

/// Connection properties sent with Identify.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties<'a> {
    /// Operating system.
    pub os: Cow<'a, str>,

    /// Library name.
    pub browser: Cow<'a, str>,

    /// Library name (again, for device).
    pub device: Cow<'a, str>,
}

impl Default for ConnectionProperties<'_> {
    fn default() -> Self {
        Self {
            os: Cow::Borrowed(std::env::consts::OS),
            browser: Cow::Borrowed("vanadium"),
            device: Cow::Borrowed("vanadium"),
        }
    }
}

// ============================================================================
// Resume (op 6)
// ============================================================================

/// Sent to resume a dropped session without re-identifying.
#[derive(Debug, Clone, Serialize)]
pub struct Resume<'a> {
    /// Authentication token.
    pub token: Cow<'a, str>,

    /// Session ID from the previous READY.
    pub session_id: Cow<'a, str>,

    /// Last sequence number received.
    pub seq: u64,
}

// ============================================================================
// Request Guild Members (op 8)
// ============================================================================

/// Ask the gateway to stream a guild's member list in chunks.
#[derive(Debug, Clone, Serialize)]
pub struct RequestGuildMembers {
    pub guild_id: Snowflake,

    /// Username prefix filter; empty requests everyone.
    pub query: String,

    /// Maximum members to return; 0 is unlimited (requires the
    /// GUILD_MEMBERS intent).
    pub limit: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub presences: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl RequestGuildMembers {
    /// Request every member of a guild.
    pub fn all(guild_id: Snowflake) -> Self {
        Self {
            guild_id,
            query: String::new(),
            limit: 0,
            presences: None,
            nonce: None,
        }
    }
}

// ============================================================================
// Voice State Update (op 4)
// ============================================================================

/// Join, move, or leave a voice channel.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateVoiceState {
    pub guild_id: Snowflake,

    /// `None` disconnects from voice.
    pub channel_id: Option<Snowflake>,

    pub self_mute: bool,
    pub self_deaf: bool,
}

// ============================================================================
// Presence Update (op 3)
// ============================================================================

/// Update the bot's presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePresence {
    /// Unix ms the client went idle, if idle.
    pub since: Option<u64>,

    /// Activity objects, passed through untyped.
    pub activities: Vec<serde_json::Value>,

    /// `online`, `dnd`, `idle`, `invisible` or `offline`.
    pub status: String,

    pub afk: bool,
}

// ============================================================================
// READY dispatch
// ============================================================================

/// Payload of the READY dispatch event.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyData {
    /// Gateway protocol version.
    pub v: u8,

    /// Current user.
    pub user: User,

    /// Guilds this shard serves, all unavailable at this point.
    pub guilds: Vec<UnavailableGuild>,

    /// Session ID for resuming.
    pub session_id: String,

    /// URL to use for resuming the session.
    pub resume_gateway_url: String,

    /// Shard information: `[shard_id, total_shards]`.
    #[serde(default)]
    pub shard: Option<[u16; 2]>,

    /// Partial application.
    pub application: Application,
}

// ============================================================================
// Heartbeat (op 1)
// ============================================================================

/// Build a heartbeat frame carrying the last received sequence.
pub fn heartbeat_json(sequence: Option<u64>) -> String {
    match sequence {
        Some(seq) => format!(r#"{{"op":1,"d":{seq}}}"#),
        None => r#"{"op":1,"d":null}"#.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_parses() {
        let hello: Hello = serde_json::from_str(r#"{"heartbeat_interval": 41250}"#).unwrap();
        assert_eq!(hello.heartbeat_interval, 41250);
    }

    #[test]
    fn identify_serialization() {
        let identify = Identify::new("token", Intents::GUILDS | Intents::GUILD_MESSAGES)
            .with_shard(2, 16)
            .with_large_threshold(250);
        let json = GatewayPayload::new(OpCode::Identify, identify).to_json().unwrap();

        assert!(json.contains(r#""op":2"#));
        assert!(json.contains(r#""intents":513"#));
        assert!(json.contains(r#""shard":[2,16]"#));
    }

    #[test]
    fn heartbeat_frames() {
        assert_eq!(heartbeat_json(Some(42)), r#"{"op":1,"d":42}"#);
        assert_eq!(heartbeat_json(None), r#"{"op":1,"d":null}"#);
    }

    #[test]
    fn request_guild_members_all() {
        let req = RequestGuildMembers::all(Snowflake::new(41771983423143937));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""query":"""#));
        assert!(json.contains(r#""limit":0"#));
    }
}
