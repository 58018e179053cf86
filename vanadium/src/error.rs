//! Top-level error type.

use thiserror::Error;

/// Anything that can go wrong across the runtime's layers.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid client configuration, caught at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// REST pipeline failure.
    #[error(transparent)]
    Rest(#[from] vanadium_rest::RestError),

    /// Gateway failure.
    #[error(transparent)]
    Gateway(#[from] vanadium_gateway::GatewayError),

    /// Voice failure.
    #[error(transparent)]
    Voice(#[from] vanadium_voice::VoiceError),

    /// An operation needed a live connection.
    #[error("client is not connected")]
    NotConnected,

    /// The voice server never answered a join request.
    #[error("timed out joining voice channel in guild {guild_id}")]
    VoiceJoinTimeout {
        /// The guild whose join timed out.
        guild_id: vanadium_model::Snowflake,
    },
}
