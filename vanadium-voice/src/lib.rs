//! Vanadium Voice - Discord voice transport
#![deny(unsafe_code)]
//!
//! Everything needed to put audio into a voice channel: the control
//! WebSocket (identify/resume, nonce heartbeats, protocol selection),
//! the UDP/RTP data plane with IP discovery and AEAD packet sealing, a
//! wall-clock send pacer, and the Piper: pluggable Opus frame sources
//! covering raw frames, DCA, Ogg/Opus, and an external-encoder pipe.
//!
//! # Architecture
//!
//! - [`VoiceSession`] - per-guild orchestrator and resume policy
//! - [`VoiceWs`] - control-plane WebSocket driver
//! - [`VoiceUdp`] - UDP transport and RTP state
//! - [`VoiceCrypto`] - rtpsize AEAD packet sealing
//! - [`OpusSource`] / [`sources`] - audio inputs
//!
//! # Example
//!
//! ```ignore
//! use vanadium_voice::{VoiceOptions, VoiceSession};
//!
//! // session_id from VOICE_STATE_UPDATE, endpoint+token from
//! // VOICE_SERVER_UPDATE:
//! let session = VoiceSession::new(VoiceOptions::new(
//!     guild_id, channel_id, user_id, session_id, endpoint, token,
//! ));
//! let (events_tx, events_rx) = flume::unbounded();
//! session.connect(events_tx);
//! ```

pub mod crypto;
pub mod error;
mod opcode;
mod pacer;
mod payload;
mod piper;
mod session;
pub mod sources;
mod udp;
mod ws;

pub use crypto::{build_rtp_header, parse_rtp_header, VoiceCrypto, KEY_SIZE, RTP_HEADER_SIZE};
pub use error::{VoiceCloseCode, VoiceError};
pub use opcode::VoiceOpCode;
pub use pacer::{PacerConfig, PlaybackEnd};
pub use payload::{
    EncryptionMode, SelectProtocol, SessionDescription, Speaking, SpeakingFlags, VoiceHello,
    VoiceIdentify, VoiceReady, VoiceResume,
};
pub use piper::{OpusSource, RawOpusSource, SharedOpusStream, SharedSubscriber};
pub use session::{VoiceOptions, VoiceSession, VoiceSessionEvent, VoiceStatus};
pub use udp::{VoiceUdp, SAMPLES_PER_FRAME, SILENCE_FRAME, SILENCE_FRAME_COUNT};
pub use ws::{VoiceHandshake, VoiceWs, VoiceWsCommand, VoiceWsEvent};

/// Voice gateway version this crate speaks.
pub const VOICE_VERSION: u8 = 8;
