//! Partial entities the gateway handshake carries.
//!
//! READY ships the bot's own user, a partial application, and the list of
//! guilds (all unavailable at that point). Nothing richer is modelled here;
//! the full object model lives above the runtime.

use crate::Snowflake;
use serde::{Deserialize, Serialize};

/// The current user as carried inside READY.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct User {
    pub id: Snowflake,
    pub username: String,
    #[serde(default)]
    pub discriminator: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

/// Partial application object inside READY.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Application {
    pub id: Snowflake,
    #[serde(default)]
    pub flags: Option<u64>,
}

/// A guild the shard serves, before its GUILD_CREATE has streamed in.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct UnavailableGuild {
    pub id: Snowflake,
    #[serde(default)]
    pub unavailable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_guild_roundtrip() {
        let guild: UnavailableGuild =
            serde_json::from_str(r#"{"id":"41771983423143937","unavailable":true}"#).unwrap();
        assert_eq!(guild.id.get(), 41771983423143937);
        assert!(guild.unavailable);
    }
}
