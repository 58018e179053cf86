//! Voice error types.

use thiserror::Error;

/// Errors that can occur during voice operations.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection was closed.
    #[error("voice connection closed: code={code}, reason={reason}")]
    Closed {
        /// Close code, 0 when the stream just ended.
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// Timeout waiting for a protocol step.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// IO error (UDP socket, pipes).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// IP discovery failed.
    #[error("IP discovery failed: {0}")]
    IpDiscovery(String),

    /// Encryption or decryption failure.
    #[error("encryption error: {0}")]
    Crypto(String),

    /// None of the server's encryption modes are supported.
    #[error("no supported encryption mode among {offered:?}")]
    NoSupportedMode {
        /// Modes the server offered.
        offered: Vec<String>,
    },

    /// Audio source failed to produce a frame.
    #[error("audio source error: {0}")]
    Source(String),

    /// An external encoder binary was requested but none is available.
    #[error("no ffmpeg/avconv binary found on PATH")]
    EncoderUnavailable,

    /// The session is configured opus-only; external encoding is off.
    #[error("external encoder disabled by opus_only")]
    OpusOnly,

    /// Not connected to the voice server.
    #[error("not connected to voice")]
    NotConnected,

    /// Channel to a session task is gone.
    #[error("voice channel error: {0}")]
    Channel(String),
}

impl<T> From<flume::SendError<T>> for VoiceError {
    fn from(err: flume::SendError<T>) -> Self {
        VoiceError::Channel(err.to_string())
    }
}

/// Discord voice close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum VoiceCloseCode {
    /// Unknown error.
    UnknownError = 4000,
    /// Unknown opcode.
    UnknownOpcode = 4001,
    /// Failed to decode payload.
    FailedToDecodePayload = 4002,
    /// Not authenticated.
    NotAuthenticated = 4003,
    /// Authentication failed.
    AuthenticationFailed = 4004,
    /// Already authenticated.
    AlreadyAuthenticated = 4005,
    /// Session is no longer valid.
    SessionNoLongerValid = 4006,
    /// Session timed out.
    SessionTimeout = 4009,
    /// Voice server not found.
    ServerNotFound = 4011,
    /// Unknown protocol.
    UnknownProtocol = 4012,
    /// Disconnected from the channel (kicked, channel deleted).
    Disconnected = 4014,
    /// The voice server crashed.
    VoiceServerCrashed = 4015,
    /// Unknown encryption mode.
    UnknownEncryptionMode = 4016,
}

impl VoiceCloseCode {
    /// Whether a transient reconnect (with RESUME) makes sense.
    ///
    /// 4014 and 4015 dispose the session: the host must re-initiate via
    /// a fresh VOICE_STATE_UPDATE on the main gateway.
    pub const fn can_resume(self) -> bool {
        matches!(
            self,
            VoiceCloseCode::UnknownError
                | VoiceCloseCode::FailedToDecodePayload
                | VoiceCloseCode::SessionTimeout
        )
    }

    /// Whether the session is permanently dead.
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            VoiceCloseCode::Disconnected
                | VoiceCloseCode::VoiceServerCrashed
                | VoiceCloseCode::AuthenticationFailed
                | VoiceCloseCode::SessionNoLongerValid
                | VoiceCloseCode::ServerNotFound
                | VoiceCloseCode::UnknownEncryptionMode
        )
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            4000 => Some(VoiceCloseCode::UnknownError),
            4001 => Some(VoiceCloseCode::UnknownOpcode),
            4002 => Some(VoiceCloseCode::FailedToDecodePayload),
            4003 => Some(VoiceCloseCode::NotAuthenticated),
            4004 => Some(VoiceCloseCode::AuthenticationFailed),
            4005 => Some(VoiceCloseCode::AlreadyAuthenticated),
            4006 => Some(VoiceCloseCode::SessionNoLongerValid),
            4009 => Some(VoiceCloseCode::SessionTimeout),
            4011 => Some(VoiceCloseCode::ServerNotFound),
            4012 => Some(VoiceCloseCode::UnknownProtocol),
            4014 => Some(VoiceCloseCode::Disconnected),
            4015 => Some(VoiceCloseCode::VoiceServerCrashed),
            4016 => Some(VoiceCloseCode::UnknownEncryptionMode),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_codes_dispose_session() {
        assert!(VoiceCloseCode::Disconnected.is_fatal());
        assert!(VoiceCloseCode::VoiceServerCrashed.is_fatal());
        assert!(!VoiceCloseCode::SessionTimeout.is_fatal());
    }

    #[test]
    fn resumable_codes() {
        assert!(VoiceCloseCode::UnknownError.can_resume());
        assert!(!VoiceCloseCode::Disconnected.can_resume());
    }
}
