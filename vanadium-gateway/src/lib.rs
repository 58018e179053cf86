//! Vanadium Gateway - sharded Discord gateway WebSocket client
#![deny(unsafe_code)]
//!
//! This crate keeps a bot connected to Discord's real-time gateway: one
//! [`Shard`] per WebSocket session, a [`ShardManager`] to spawn fleets of
//! them under Discord's identify concurrency rules, and a [`TokenBucket`]
//! pacing everything the shards send.
//!
//! # Highlights
//!
//! - Full gateway state machine: HELLO, IDENTIFY/RESUME, heartbeats with
//!   zombie detection, close-code policy, replay after resume
//! - zlib-stream transport compression with a shared inflate context
//! - Outbound pacing (120 frames / 60 s) with a reserved priority slice
//!   for heartbeats
//! - Guild streaming window after READY, optional full member sweeps
//!
//! # Example
//!
//! ```ignore
//! use vanadium_gateway::{ManagerConfig, ShardConfig, ShardManager};
//! use vanadium_model::Intents;
//!
//! let config = ManagerConfig::new(
//!     ShardConfig::new("token", Intents::GUILDS | Intents::GUILD_MESSAGES),
//!     2,
//! );
//! let (manager, events) = ShardManager::new(config)?;
//! manager.start()?;
//!
//! while let Ok((shard_id, event)) = events.recv_async().await {
//!     println!("shard {shard_id}: {event:?}");
//! }
//! ```

mod bucket;
mod compression;
pub mod error;
pub mod event;
mod heartbeat;
mod manager;
mod opcode;
mod payload;
mod session;
mod shard;

pub use bucket::{LatencyRef, Priority, TokenBucket};
pub use compression::ZlibStreamInflater;
pub use error::{CloseCode, GatewayError};
pub use event::GatewayEvent;
pub use heartbeat::Heartbeats;
pub use manager::{IdentifyLimiter, ManagerConfig, ShardManager};
pub use opcode::OpCode;
pub use payload::{
    heartbeat_json, ConnectionProperties, GatewayPayload, Hello, Identify, ReadyData,
    RequestGuildMembers, Resume, UpdatePresence, UpdateVoiceState,
};
pub use session::{ReplayBuffer, Session};
pub use shard::{
    default_reconnect_delay, ReconnectDelayFn, Shard, ShardConfig, ShardStatus,
};

/// Discord gateway API version this crate speaks.
pub const GATEWAY_VERSION: u8 = 10;

/// Default gateway URL, overridden by `/gateway/bot`.
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";
