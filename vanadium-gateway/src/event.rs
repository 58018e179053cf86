//! Gateway event decoding.
//!
//! The runtime decodes eagerly only what it needs for its own protocol
//! bookkeeping (session data, guild streaming, the voice handshake);
//! every other dispatch is forwarded untyped as [`GatewayEvent::Dispatch`]
//! for the layer above to interpret.

use crate::payload::ReadyData;
use serde_json::Value;
use vanadium_model::{Snowflake, VoiceServerUpdate, VoiceStateUpdate};

/// A decoded gateway occurrence, dispatches and shard lifecycle alike.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum GatewayEvent {
    // =========================================================================
    // Dispatches the runtime reads
    // =========================================================================
    /// READY: a fresh session was established.
    Ready(Box<ReadyData>),

    /// RESUMED: the previous session continues.
    Resumed,

    /// GUILD_CREATE, forwarded untyped; the id is pre-extracted for the
    /// startup streaming window.
    GuildCreate {
        /// The guild's ID.
        guild_id: Option<Snowflake>,
        /// Full event payload.
        data: Box<Value>,
    },

    /// GUILD_MEMBERS_CHUNK, answer to a member request.
    GuildMembersChunk {
        /// The guild being chunked.
        guild_id: Option<Snowflake>,
        /// 0-based index of this chunk.
        chunk_index: u32,
        /// Total chunks for this request.
        chunk_count: u32,
        /// Full event payload.
        data: Box<Value>,
    },

    /// VOICE_STATE_UPDATE (any user's, including our own session id).
    VoiceStateUpdate(Box<VoiceStateUpdate>),

    /// VOICE_SERVER_UPDATE: endpoint + token for a voice connection.
    VoiceServerUpdate(Box<VoiceServerUpdate>),

    /// Any other dispatch, untyped.
    Dispatch {
        /// The `t` field.
        name: String,
        /// The `d` field.
        data: Box<Value>,
    },

    // =========================================================================
    // Shard lifecycle
    // =========================================================================
    /// The shard finished streaming its initial guilds.
    ShardReady {
        /// Guilds still pending when the streaming window closed.
        pending_guilds: usize,
    },

    /// The shard resumed after a drop.
    ShardResumed,

    /// The shard lost its connection and will retry (unless shutdown).
    ShardDisconnected {
        /// Close code, when one was received.
        code: Option<u16>,
    },

    /// Every shard of the manager is ready.
    AllShardsReady,

    /// Every shard of the manager is disconnected.
    AllShardsDisconnected,
}

impl GatewayEvent {
    /// Decode a dispatch from its `t` name and `d` payload.
    pub fn decode(name: &str, data: Value) -> Result<Self, serde_json::Error> {
        Ok(match name {
            "READY" => GatewayEvent::Ready(Box::new(serde_json::from_value(data)?)),
            "RESUMED" => GatewayEvent::Resumed,
            "GUILD_CREATE" => GatewayEvent::GuildCreate {
                guild_id: extract_id(&data),
                data: Box::new(data),
            },
            "GUILD_MEMBERS_CHUNK" => GatewayEvent::GuildMembersChunk {
                guild_id: data
                    .get("guild_id")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok()),
                chunk_index: data
                    .get("chunk_index")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32,
                chunk_count: data
                    .get("chunk_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(1) as u32,
                data: Box::new(data),
            },
            "VOICE_STATE_UPDATE" => {
                GatewayEvent::VoiceStateUpdate(Box::new(serde_json::from_value(data)?))
            }
            "VOICE_SERVER_UPDATE" => {
                GatewayEvent::VoiceServerUpdate(Box::new(serde_json::from_value(data)?))
            }
            _ => GatewayEvent::Dispatch {
                name: name.to_string(),
                data: Box::new(data),
            },
        })
    }
}

fn extract_id(data: &Value) -> Option<Snowflake> {
    data.get("id")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_guild_create_id() {
        let event = GatewayEvent::decode(
            "GUILD_CREATE",
            json!({"id": "41771983423143937", "name": "test", "unavailable": false}),
        )
        .unwrap();
        match event {
            GatewayEvent::GuildCreate { guild_id, .. } => {
                assert_eq!(guild_id.unwrap().get(), 41771983423143937);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn decodes_voice_server_update() {
        let event = GatewayEvent::decode(
            "VOICE_SERVER_UPDATE",
            json!({"token": "t", "guild_id": "1", "endpoint": "smart.loyal.discord.gg:443"}),
        )
        .unwrap();
        assert!(matches!(event, GatewayEvent::VoiceServerUpdate(_)));
    }

    #[test]
    fn unknown_dispatch_passes_through() {
        let event =
            GatewayEvent::decode("MESSAGE_CREATE", json!({"content": "hi"})).unwrap();
        match event {
            GatewayEvent::Dispatch { name, data } => {
                assert_eq!(name, "MESSAGE_CREATE");
                assert_eq!(data.get("content").unwrap(), "hi");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
