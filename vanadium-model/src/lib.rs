//! Vanadium Model - wire-level Discord types shared by the runtime crates
#![deny(unsafe_code)]
//!
//! This crate deliberately carries only the types the core runtime itself
//! reads off the wire: snowflake IDs, the gateway intents mask, the voice
//! handshake events, and the handful of partial entities inside READY.
//! The full guild/channel/message object model is layered on top by
//! consumers and is not part of the runtime.

pub mod intents;
pub mod snowflake;
pub mod user;
pub mod voice;

pub use intents::Intents;
pub use snowflake::Snowflake;
pub use user::{Application, UnavailableGuild, User};
pub use voice::{VoiceServerUpdate, VoiceStateUpdate};
