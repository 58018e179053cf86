//! Host-facing configuration surface.

use crate::error::Error;
use std::sync::Arc;
use std::time::Duration;
use vanadium_gateway::{default_reconnect_delay, ReconnectDelayFn};
use vanadium_model::Intents;
use vanadium_rest::RestOptions;

/// Shard count: fixed, or discovered from `/gateway/bot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardCount {
    /// Ask Discord for the recommended count.
    #[default]
    Auto,
    /// Run exactly this many shards.
    Fixed(u16),
}

/// Identify concurrency: fixed, or discovered from `/gateway/bot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    /// Use the account's `max_concurrency`.
    #[default]
    Auto,
    /// Force a specific concurrency.
    Fixed(u16),
}

/// Everything a [`crate::Client`] can be configured with.
#[derive(Clone)]
pub struct ClientOptions {
    /// Bot token.
    pub token: String,

    /// Gateway intents mask.
    pub intents: Intents,

    /// Number of shards.
    pub shard_count: ShardCount,

    /// First shard this process runs (for multi-process fleets).
    pub first_shard: Option<u16>,

    /// Last shard this process runs (inclusive).
    pub last_shard: Option<u16>,

    /// Identify concurrency.
    pub max_concurrency: Concurrency,

    /// Large guild threshold, clamped to 50..=250.
    pub large_threshold: u8,

    /// zlib-stream transport compression.
    pub compress: bool,

    /// Budget for socket open + HELLO.
    pub connection_timeout: Duration,

    /// Quiet window closing the post-READY guild stream.
    pub guild_create_timeout: Duration,

    /// RESUME attempts before a fresh IDENTIFY.
    pub max_resume_attempts: u32,

    /// Reconnect attempts before a shard gives up.
    pub max_reconnect_attempts: u32,

    /// Reconnect at all after a drop.
    pub autoreconnect: bool,

    /// Reconnect delay schedule `(attempt, last_delay) -> delay`.
    pub reconnect_delay: ReconnectDelayFn,

    /// Request full member lists after startup (needs GUILD_MEMBERS).
    pub get_all_users: bool,

    /// Never spawn an external encoder; only pre-encoded Opus plays.
    pub opus_only: bool,

    /// REST pipeline options.
    pub rest: RestOptions,
}

impl ClientOptions {
    /// Options with library defaults.
    pub fn new(token: impl Into<String>, intents: Intents) -> Self {
        Self {
            token: token.into(),
            intents,
            shard_count: ShardCount::Auto,
            first_shard: None,
            last_shard: None,
            max_concurrency: Concurrency::Auto,
            large_threshold: 250,
            compress: false,
            connection_timeout: Duration::from_secs(30),
            guild_create_timeout: Duration::from_secs(2),
            max_resume_attempts: 5,
            max_reconnect_attempts: 10,
            autoreconnect: true,
            reconnect_delay: Arc::new(default_reconnect_delay),
            get_all_users: false,
            opus_only: false,
            rest: RestOptions::default(),
        }
    }

    pub fn with_shard_count(mut self, count: ShardCount) -> Self {
        self.shard_count = count;
        self
    }

    pub fn with_shard_range(mut self, first: u16, last: u16) -> Self {
        self.first_shard = Some(first);
        self.last_shard = Some(last);
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_large_threshold(mut self, threshold: u8) -> Self {
        self.large_threshold = threshold;
        self
    }

    pub fn with_get_all_users(mut self, get_all_users: bool) -> Self {
        self.get_all_users = get_all_users;
        self
    }

    pub fn with_rest(mut self, rest: RestOptions) -> Self {
        self.rest = rest;
        self
    }

    /// Fail fast on configurations the gateway would reject at runtime.
    pub fn validate(&self) -> Result<(), Error> {
        if self.token.trim().is_empty() {
            return Err(Error::Config("token must not be empty".into()));
        }
        if !(50..=250).contains(&self.large_threshold) {
            return Err(Error::Config(format!(
                "large_threshold must be within 50..=250, got {}",
                self.large_threshold
            )));
        }
        if self.get_all_users && !self.intents.contains(Intents::GUILD_MEMBERS) {
            return Err(Error::Config(
                "get_all_users requires the GUILD_MEMBERS intent".into(),
            ));
        }
        match (self.first_shard, self.last_shard) {
            (Some(first), Some(last)) if first > last => {
                return Err(Error::Config(format!(
                    "shard range {first}..={last} is inverted"
                )));
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::Config(
                    "first_shard and last_shard must be set together".into(),
                ));
            }
            _ => {}
        }
        if let (ShardCount::Fixed(total), Some(last)) = (self.shard_count, self.last_shard) {
            if last >= total {
                return Err(Error::Config(format!(
                    "last_shard {last} outside shard count {total}"
                )));
            }
        }
        if self.shard_count == ShardCount::Fixed(0) {
            return Err(Error::Config("shard count must be at least 1".into()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("intents", &self.intents)
            .field("shard_count", &self.shard_count)
            .field("compress", &self.compress)
            .field("get_all_users", &self.get_all_users)
            .field("opus_only", &self.opus_only)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ClientOptions::new("token", Intents::default()).validate().is_ok());
    }

    #[test]
    fn rejects_member_sweep_without_intent() {
        let options = ClientOptions::new("token", Intents::GUILDS).with_get_all_users(true);
        assert!(options.validate().is_err());
    }

    #[test]
    fn rejects_inverted_and_partial_ranges() {
        assert!(ClientOptions::new("t", Intents::default())
            .with_shard_range(4, 2)
            .validate()
            .is_err());

        let mut partial = ClientOptions::new("t", Intents::default());
        partial.first_shard = Some(1);
        assert!(partial.validate().is_err());
    }

    #[test]
    fn rejects_range_outside_fixed_count() {
        let options = ClientOptions::new("t", Intents::default())
            .with_shard_count(ShardCount::Fixed(4))
            .with_shard_range(0, 4);
        assert!(options.validate().is_err());
    }

    #[test]
    fn rejects_bad_threshold() {
        let options = ClientOptions::new("t", Intents::default()).with_large_threshold(30);
        assert!(options.validate().is_err());
    }
}
