//! Voice gateway payloads.

use crate::opcode::VoiceOpCode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outbound voice payload envelope.
#[derive(Debug, Clone, Serialize)]
pub struct VoicePayload<D> {
    pub op: VoiceOpCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<D>,
}

impl<D: Serialize> VoicePayload<D> {
    pub fn new(op: VoiceOpCode, data: D) -> Self {
        Self { op, d: Some(data) }
    }
}

/// Inbound envelope with `d` deferred.
#[derive(Debug, Clone, Deserialize)]
pub struct RawVoicePayload {
    pub op: VoiceOpCode,
    #[serde(default)]
    pub d: Option<serde_json::Value>,
    /// Server-side sequence number (voice gateway v8), echoed back in
    /// heartbeats and RESUME.
    #[serde(default)]
    pub seq: Option<u64>,
}

/// Hello (op 8).
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceHello {
    /// Heartbeat interval in milliseconds. The wire type is fractional.
    pub heartbeat_interval: f64,
}

/// Identify (op 0).
#[derive(Debug, Clone, Serialize)]
pub struct VoiceIdentify {
    /// Guild ID.
    pub server_id: String,
    pub user_id: String,
    /// Session ID from VOICE_STATE_UPDATE.
    pub session_id: String,
    /// Token from VOICE_SERVER_UPDATE.
    pub token: String,
}

/// Ready (op 2).
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceReady {
    /// SSRC assigned to this connection.
    pub ssrc: u32,
    /// Voice server UDP address.
    pub ip: String,
    pub port: u16,
    /// Encryption modes the server accepts.
    pub modes: Vec<String>,
}

/// Select Protocol (op 1).
#[derive(Debug, Clone, Serialize)]
pub struct SelectProtocol {
    /// Always `"udp"`.
    pub protocol: String,
    pub data: SelectProtocolData,
}

/// Data for Select Protocol.
#[derive(Debug, Clone, Serialize)]
pub struct SelectProtocolData {
    /// Our discovered external address.
    pub address: String,
    pub port: u16,
    /// Chosen encryption mode.
    pub mode: String,
}

impl SelectProtocol {
    pub fn udp(address: String, port: u16, mode: EncryptionMode) -> Self {
        Self {
            protocol: "udp".to_string(),
            data: SelectProtocolData {
                address,
                port,
                mode: mode.to_string(),
            },
        }
    }
}

/// Session Description (op 4).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionDescription {
    /// Mode the server settled on.
    pub mode: String,
    /// 32-byte packet encryption key.
    pub secret_key: Vec<u8>,
}

/// Speaking (op 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speaking {
    /// Speaking bitmask.
    pub speaking: u8,
    /// Always 0 for bots.
    pub delay: u32,
    pub ssrc: u32,
}

bitflags::bitflags! {
    /// Speaking state bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpeakingFlags: u8 {
        /// Normal voice audio.
        const MICROPHONE = 1 << 0;
        /// Context audio for screen share.
        const SOUNDSHARE = 1 << 1;
        /// Priority speaker, lowering others' volume.
        const PRIORITY = 1 << 2;
    }
}

/// Resume (op 7).
#[derive(Debug, Clone, Serialize)]
pub struct VoiceResume {
    pub server_id: String,
    pub session_id: String,
    pub token: String,
    /// Last server sequence we saw.
    pub seq_ack: u64,
}

/// Heartbeat (op 3).
#[derive(Debug, Clone, Serialize)]
pub struct VoiceHeartbeat {
    /// Monotonically increasing nonce, echoed back in the ACK.
    pub t: u64,
    /// Last server sequence we saw.
    pub seq_ack: u64,
}

/// Client Disconnect (op 13).
#[derive(Debug, Clone, Deserialize)]
pub struct ClientDisconnect {
    pub user_id: vanadium_model::Snowflake,
}

/// Packet encryption modes this library implements.
///
/// Both are "rtpsize" AEAD modes: the RTP header is authenticated (not
/// encrypted) and a 32-bit packet counter rides in the packet as the
/// nonce seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionMode {
    /// AEAD XChaCha20-Poly1305, the required mode.
    #[default]
    AeadXChaCha20Poly1305Rtpsize,
    /// AEAD AES-256-GCM, preferred by Discord where hardware allows.
    AeadAes256GcmRtpsize,
}

impl EncryptionMode {
    /// Parse a wire mode name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aead_xchacha20_poly1305_rtpsize" => Some(Self::AeadXChaCha20Poly1305Rtpsize),
            "aead_aes256_gcm_rtpsize" => Some(Self::AeadAes256GcmRtpsize),
            _ => None,
        }
    }

    /// Choose the best supported mode among the server's offer.
    pub fn select(offered: &[String]) -> Option<Self> {
        for candidate in [
            "aead_xchacha20_poly1305_rtpsize",
            "aead_aes256_gcm_rtpsize",
        ] {
            if offered.iter().any(|m| m == candidate) {
                return Self::parse(candidate);
            }
        }
        None
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AeadXChaCha20Poly1305Rtpsize => write!(f, "aead_xchacha20_poly1305_rtpsize"),
            Self::AeadAes256GcmRtpsize => write!(f, "aead_aes256_gcm_rtpsize"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_selection_prefers_xchacha() {
        let offered = vec![
            "aead_aes256_gcm_rtpsize".to_string(),
            "aead_xchacha20_poly1305_rtpsize".to_string(),
        ];
        assert_eq!(
            EncryptionMode::select(&offered),
            Some(EncryptionMode::AeadXChaCha20Poly1305Rtpsize)
        );
    }

    #[test]
    fn mode_selection_falls_back_to_gcm() {
        let offered = vec![
            "xsalsa20_poly1305".to_string(),
            "aead_aes256_gcm_rtpsize".to_string(),
        ];
        assert_eq!(
            EncryptionMode::select(&offered),
            Some(EncryptionMode::AeadAes256GcmRtpsize)
        );
    }

    #[test]
    fn unsupported_offer_selects_nothing() {
        assert_eq!(EncryptionMode::select(&["xsalsa20_poly1305".to_string()]), None);
    }

    #[test]
    fn select_protocol_shape() {
        let payload = SelectProtocol::udp("203.0.113.4".into(), 50004, EncryptionMode::default());
        let json = serde_json::to_string(&VoicePayload::new(VoiceOpCode::SelectProtocol, payload))
            .unwrap();
        assert!(json.contains(r#""op":1"#));
        assert!(json.contains(r#""protocol":"udp""#));
        assert!(json.contains("aead_xchacha20_poly1305_rtpsize"));
    }
}
