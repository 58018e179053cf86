//! Voice handshake events from the main gateway.
//!
//! Joining a voice channel is a cross-plane handshake: the bot sends a
//! VOICE_STATE_UPDATE over the gateway and waits for the server to answer
//! with its own VOICE_STATE_UPDATE (session id) and a VOICE_SERVER_UPDATE
//! (endpoint + token). These two events are the inputs to a voice session.

use crate::Snowflake;
use serde::{Deserialize, Serialize};

/// VOICE_STATE_UPDATE dispatch event.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VoiceStateUpdate {
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    pub channel_id: Option<Snowflake>,
    pub user_id: Snowflake,
    pub session_id: String,
    pub deaf: bool,
    pub mute: bool,
    pub self_deaf: bool,
    pub self_mute: bool,
    #[serde(default)]
    pub self_stream: bool,
    #[serde(default)]
    pub self_video: bool,
    pub suppress: bool,
}

/// VOICE_SERVER_UPDATE dispatch event.
///
/// `endpoint` is `None` while the voice server is being reallocated; a
/// follow-up event with a concrete endpoint arrives once it settles.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VoiceServerUpdate {
    pub token: String,
    pub guild_id: Snowflake,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_server_update_without_endpoint() {
        let event: VoiceServerUpdate =
            serde_json::from_str(r#"{"token":"abc","guild_id":"41771983423143937"}"#).unwrap();
        assert!(event.endpoint.is_none());
    }
}
