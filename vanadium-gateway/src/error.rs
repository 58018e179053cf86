//! Gateway error types.

use thiserror::Error;

/// Errors that can occur during gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// WebSocket connection or protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Failed to decode a gateway payload.
    #[error("decode error: {0}")]
    Decode(String),

    /// Session was invalidated by Discord; the boolean says whether a
    /// RESUME is still worth attempting.
    #[error("session invalidated, resumable: {resumable}")]
    InvalidSession {
        /// Whether the session can be resumed.
        resumable: bool,
    },

    /// Connection was closed.
    #[error("connection closed: code={code}, reason={reason}")]
    Closed {
        /// WebSocket close code, 0 when the stream just ended.
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// A close code Discord defines as unrecoverable; the shard must not
    /// reconnect.
    #[error("fatal gateway close {code}: {reason}")]
    Fatal {
        /// The fatal close code.
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// Heartbeat acknowledgment was not received before the next tick.
    #[error("heartbeat acknowledgment timeout")]
    HeartbeatTimeout,

    /// The server asked for a reconnect (op 7).
    #[error("server requested reconnect")]
    ReconnectRequested,

    /// Invalid shard/intent configuration, detected at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// Reconnect budget exhausted.
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The connection or handshake did not complete in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Failed to send through a channel (receiver dropped).
    #[error("channel send error: {0}")]
    ChannelSend(String),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// I/O error (decompression, socket).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Decode(err.to_string())
    }
}

impl<T> From<flume::SendError<T>> for GatewayError {
    fn from(err: flume::SendError<T>) -> Self {
        GatewayError::ChannelSend(err.to_string())
    }
}

/// Discord gateway close codes.
///
/// See: <https://discord.com/developers/docs/topics/opcodes-and-status-codes#gateway-gateway-close-event-codes>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Unknown error occurred.
    UnknownError = 4000,
    /// Invalid opcode sent.
    UnknownOpcode = 4001,
    /// Invalid payload (decode error).
    DecodeError = 4002,
    /// Payload sent before identifying.
    NotAuthenticated = 4003,
    /// Invalid token.
    AuthenticationFailed = 4004,
    /// Already authenticated.
    AlreadyAuthenticated = 4005,
    /// Invalid sequence number for resume.
    InvalidSeq = 4007,
    /// Rate limited.
    RateLimited = 4008,
    /// Session timed out.
    SessionTimedOut = 4009,
    /// Invalid shard configuration.
    InvalidShard = 4010,
    /// Too many guilds; sharding required.
    ShardingRequired = 4011,
    /// Invalid API version.
    InvalidApiVersion = 4012,
    /// Invalid intents.
    InvalidIntents = 4013,
    /// Disallowed intents (privileged intent not enabled).
    DisallowedIntents = 4014,
}

impl CloseCode {
    /// Close codes after which a reconnect is pointless: the same
    /// configuration would be rejected again. These surface to the host.
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            CloseCode::AuthenticationFailed
                | CloseCode::InvalidShard
                | CloseCode::ShardingRequired
                | CloseCode::InvalidApiVersion
                | CloseCode::InvalidIntents
                | CloseCode::DisallowedIntents
        )
    }

    /// Close codes after which the session itself is dead and a fresh
    /// IDENTIFY is required (reconnecting is still fine).
    pub const fn clears_session(self) -> bool {
        matches!(self, CloseCode::InvalidSeq | CloseCode::SessionTimedOut)
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            4000 => Some(CloseCode::UnknownError),
            4001 => Some(CloseCode::UnknownOpcode),
            4002 => Some(CloseCode::DecodeError),
            4003 => Some(CloseCode::NotAuthenticated),
            4004 => Some(CloseCode::AuthenticationFailed),
            4005 => Some(CloseCode::AlreadyAuthenticated),
            4007 => Some(CloseCode::InvalidSeq),
            4008 => Some(CloseCode::RateLimited),
            4009 => Some(CloseCode::SessionTimedOut),
            4010 => Some(CloseCode::InvalidShard),
            4011 => Some(CloseCode::ShardingRequired),
            4012 => Some(CloseCode::InvalidApiVersion),
            4013 => Some(CloseCode::InvalidIntents),
            4014 => Some(CloseCode::DisallowedIntents),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_set_matches_protocol() {
        for code in [4004, 4010, 4011, 4012, 4013, 4014] {
            assert!(CloseCode::from_code(code).unwrap().is_fatal(), "{code}");
        }
        for code in [4000, 4001, 4002, 4003, 4005, 4007, 4008, 4009] {
            assert!(!CloseCode::from_code(code).unwrap().is_fatal(), "{code}");
        }
    }

    #[test]
    fn session_clearing_codes() {
        assert!(CloseCode::InvalidSeq.clears_session());
        assert!(CloseCode::SessionTimedOut.clears_session());
        assert!(!CloseCode::UnknownError.clears_session());
    }
}
