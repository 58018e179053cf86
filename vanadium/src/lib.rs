//! Vanadium - Discord bot core runtime
#![deny(unsafe_code)]
//!
//! A layered runtime for Discord bots: a sharded gateway client, a
//! rate-limited REST pipeline, and a voice transport, assembled behind
//! one [`Client`]. Higher layers (object caches, command frameworks,
//! endpoint wrappers) build on the primitives this crate exposes: the
//! typed REST invocation, the merged gateway event stream, and the
//! voice-attach interface.
//!
//! # Example
//!
//! ```ignore
//! use vanadium::{Client, ClientOptions, GatewayEvent, Intents};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(ClientOptions::new(
//!         std::env::var("DISCORD_TOKEN")?,
//!         Intents::GUILDS | Intents::GUILD_MESSAGES | Intents::GUILD_VOICE_STATES,
//!     ))?;
//!
//!     let events = client.connect().await?;
//!     while let Ok((shard_id, event)) = events.recv_async().await {
//!         if let GatewayEvent::Dispatch { name, .. } = &event {
//!             println!("shard {shard_id}: {name}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod error;
mod options;
mod voice;

pub use client::Client;
pub use error::Error;
pub use options::{ClientOptions, Concurrency, ShardCount};
pub use voice::VoiceManager;

pub use vanadium_gateway::{GatewayEvent, ShardStatus};
pub use vanadium_model::{Intents, Snowflake};
pub use vanadium_rest::{FileAttachment, Method, RequestOptions, RestClient, RestOptions};
pub use vanadium_voice::{
    OpusSource, PlaybackEnd, SharedOpusStream, VoiceSession, VoiceSessionEvent,
};

/// Commonly used items.
pub mod prelude {
    pub use crate::{Client, ClientOptions, Error, GatewayEvent, Intents, Snowflake};
    pub use vanadium_rest::{Method, RequestOptions};
}
