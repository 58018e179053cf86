//! The client: REST + gateway + voice, wired together.

use crate::error::Error;
use crate::options::{ClientOptions, Concurrency, ShardCount};
use crate::voice::VoiceManager;

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;
use vanadium_gateway::{
    GatewayEvent, ManagerConfig, OpCode, ShardConfig, ShardManager, UpdatePresence,
};
use vanadium_rest::RestClient;

/// A Discord bot client.
///
/// Owns the REST pipeline and, once [`connect`](Self::connect)ed, the
/// shard manager and voice manager. The client is the delegation point:
/// typed endpoint wrappers live in layers above and call
/// [`Client::rest`] for their transport.
pub struct Client {
    options: ClientOptions,
    rest: Arc<RestClient>,
    manager: RwLock<Option<Arc<ShardManager>>>,
    voice: RwLock<Option<Arc<VoiceManager>>>,
}

impl Client {
    /// Build a client. Configuration errors surface here, before any
    /// connection is made.
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        options.validate()?;
        let rest = Arc::new(RestClient::with_options(
            options.token.clone(),
            options.rest.clone(),
        )?);

        Ok(Self {
            options,
            rest,
            manager: RwLock::new(None),
            voice: RwLock::new(None),
        })
    }

    /// The REST pipeline.
    pub fn rest(&self) -> &Arc<RestClient> {
        &self.rest
    }

    /// Resolve sharding, spawn the shards, and return the merged event
    /// stream of `(shard_id, event)` pairs.
    pub async fn connect(&self) -> Result<flume::Receiver<(u16, GatewayEvent)>, Error> {
        let info = self.rest.get_gateway_bot().await?;

        let total = match self.options.shard_count {
            ShardCount::Auto => info.shards,
            ShardCount::Fixed(count) => count,
        };
        let concurrency = match self.options.max_concurrency {
            Concurrency::Auto => info.session_start_limit.max_concurrency,
            Concurrency::Fixed(count) => count,
        };

        info!(
            shards = total,
            max_concurrency = concurrency,
            remaining_starts = info.session_start_limit.remaining,
            "resolved gateway configuration"
        );

        let mut shard = ShardConfig::new(self.options.token.clone(), self.options.intents);
        shard.gateway_url = info.url;
        shard.large_threshold = self.options.large_threshold;
        shard.compress = self.options.compress;
        shard.connection_timeout = self.options.connection_timeout;
        shard.guild_create_timeout = self.options.guild_create_timeout;
        shard.max_reconnect_attempts = self.options.max_reconnect_attempts;
        shard.max_resume_attempts = self.options.max_resume_attempts;
        shard.autoreconnect = self.options.autoreconnect;
        shard.reconnect_delay = self.options.reconnect_delay.clone();
        shard.get_all_users = self.options.get_all_users;

        let mut config = ManagerConfig::new(shard, total).with_max_concurrency(concurrency);
        if let (Some(first), Some(last)) = (self.options.first_shard, self.options.last_shard) {
            config = config.with_range(first, last);
        }

        let (manager, manager_rx) = ShardManager::new(config)?;
        let manager = Arc::new(manager);
        manager.start()?;

        let voice = VoiceManager::new(Arc::clone(&manager), self.options.opus_only);
        *self.manager.write() = Some(Arc::clone(&manager));
        *self.voice.write() = Some(Arc::clone(&voice));

        // Tap the stream for the voice handshake and our user identity,
        // then hand everything to the host untouched.
        let (host_tx, host_rx) = flume::unbounded();
        tokio::spawn(async move {
            while let Ok((shard_id, event)) = manager_rx.recv_async().await {
                voice.handle_event(&event);
                if host_tx.send_async((shard_id, event)).await.is_err() {
                    break;
                }
            }
        });

        Ok(host_rx)
    }

    /// The shard manager, once connected.
    pub fn shards(&self) -> Result<Arc<ShardManager>, Error> {
        self.manager.read().clone().ok_or(Error::NotConnected)
    }

    /// The voice manager, once connected.
    pub fn voice(&self) -> Result<Arc<VoiceManager>, Error> {
        self.voice.read().clone().ok_or(Error::NotConnected)
    }

    /// Update the bot's presence on every shard.
    pub fn update_presence(&self, presence: UpdatePresence) -> Result<(), Error> {
        let manager = self.shards()?;
        for shard_id in manager.shard_ids() {
            manager.send(shard_id, OpCode::PresenceUpdate, presence.clone())?;
        }
        Ok(())
    }

    /// Disconnect: voice sessions first, then every shard (close 1000,
    /// reconnect disabled). In-flight REST requests complete naturally.
    pub async fn disconnect(&self) {
        if let Some(voice) = self.voice.write().take() {
            voice.disconnect_all();
        }
        if let Some(manager) = self.manager.write().take() {
            manager.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vanadium_model::Intents;

    #[test]
    fn construction_validates_options() {
        let bad = ClientOptions::new("", Intents::default());
        assert!(matches!(Client::new(bad), Err(Error::Config(_))));

        let good = ClientOptions::new("token", Intents::default());
        let client = Client::new(good).unwrap();
        assert!(matches!(client.shards(), Err(Error::NotConnected)));
        assert!(matches!(client.voice(), Err(Error::NotConnected)));
    }
}
