//! Voice attachment: joining and leaving voice channels.
//!
//! Joining is a handshake spanning both planes: the client sends a
//! VOICE_STATE_UPDATE over the guild's shard, the gateway answers with
//! our own VOICE_STATE_UPDATE (session id) and a VOICE_SERVER_UPDATE
//! (endpoint + token), and only then can a [`VoiceSession`] open its own
//! WebSocket. The manager tracks those pending joins and owns the live
//! sessions, one per guild.

use crate::error::Error;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use vanadium_gateway::{GatewayEvent, OpCode, ShardManager, UpdateVoiceState};
use vanadium_model::Snowflake;
use vanadium_voice::sources::{FfmpegOptions, FfmpegSource};
use vanadium_voice::{VoiceError, VoiceOptions, VoiceSession, VoiceSessionEvent};

/// How long to wait for the gateway to answer a join request.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

struct PendingJoin {
    session_id: Option<String>,
    endpoint: Option<String>,
    token: Option<String>,
    notify: flume::Sender<(String, String, String)>,
}

impl PendingJoin {
    fn try_complete(&self) {
        if let (Some(session_id), Some(endpoint), Some(token)) =
            (&self.session_id, &self.endpoint, &self.token)
        {
            let _ = self
                .notify
                .send((session_id.clone(), endpoint.clone(), token.clone()));
        }
    }
}

/// Owns every voice session of the client, keyed by guild.
pub struct VoiceManager {
    manager: Arc<ShardManager>,
    /// Our user ID, learned from READY.
    user_id: RwLock<Option<Snowflake>>,
    sessions: DashMap<u64, Arc<VoiceSession>>,
    pending: DashMap<u64, PendingJoin>,
    opus_only: bool,
}

impl VoiceManager {
    pub(crate) fn new(manager: Arc<ShardManager>, opus_only: bool) -> Arc<Self> {
        Arc::new(Self {
            manager,
            user_id: RwLock::new(None),
            sessions: DashMap::new(),
            pending: DashMap::new(),
            opus_only,
        })
    }

    /// Inspect gateway traffic for the pieces of a voice handshake.
    pub(crate) fn handle_event(&self, event: &GatewayEvent) {
        match event {
            GatewayEvent::Ready(data) => {
                *self.user_id.write() = Some(data.user.id);
            }
            GatewayEvent::VoiceStateUpdate(update) => {
                let ours = *self.user_id.read() == Some(update.user_id);
                if !ours {
                    return;
                }
                if let Some(guild_id) = update.guild_id {
                    if let Some(mut pending) = self.pending.get_mut(&guild_id.get()) {
                        pending.session_id = Some(update.session_id.clone());
                        pending.try_complete();
                    }
                }
            }
            GatewayEvent::VoiceServerUpdate(update) => {
                // A None endpoint means the server is still allocating;
                // another update follows.
                let Some(endpoint) = update.endpoint.clone() else {
                    debug!(guild_id = %update.guild_id, "voice server pending allocation");
                    return;
                };
                if let Some(mut pending) = self.pending.get_mut(&update.guild_id.get()) {
                    pending.endpoint = Some(endpoint);
                    pending.token = Some(update.token.clone());
                    pending.try_complete();
                }
            }
            _ => {}
        }
    }

    /// Join a voice channel, tearing down any existing session for the
    /// guild first.
    ///
    /// Resolves once the session's control plane is launched; the
    /// returned receiver carries its lifecycle events (including the
    /// `Connected` notification once audio can flow).
    pub async fn join(
        &self,
        guild_id: Snowflake,
        channel_id: Snowflake,
    ) -> Result<(Arc<VoiceSession>, flume::Receiver<VoiceSessionEvent>), Error> {
        let user_id = (*self.user_id.read()).ok_or(Error::NotConnected)?;

        if let Some((_, old)) = self.sessions.remove(&guild_id.get()) {
            info!(guild_id = %guild_id, "replacing existing voice session");
            old.disconnect();
        }

        let (notify_tx, notify_rx) = flume::bounded(1);
        self.pending.insert(
            guild_id.get(),
            PendingJoin {
                session_id: None,
                endpoint: None,
                token: None,
                notify: notify_tx,
            },
        );

        let shard_id = self.manager.shard_for_guild(guild_id);
        self.manager.send(
            shard_id,
            OpCode::VoiceStateUpdate,
            UpdateVoiceState {
                guild_id,
                channel_id: Some(channel_id),
                self_mute: false,
                self_deaf: false,
            },
        )?;

        let handshake = timeout(JOIN_TIMEOUT, notify_rx.recv_async()).await;
        self.pending.remove(&guild_id.get());

        let (session_id, endpoint, token) = match handshake {
            Ok(Ok(parts)) => parts,
            Ok(Err(_)) | Err(_) => {
                warn!(guild_id = %guild_id, "voice join timed out");
                return Err(Error::VoiceJoinTimeout { guild_id });
            }
        };

        let session = VoiceSession::new(VoiceOptions::new(
            guild_id, channel_id, user_id, session_id, endpoint, token,
        ));
        let (events_tx, events_rx) = flume::unbounded();
        session.connect(events_tx);

        self.sessions.insert(guild_id.get(), Arc::clone(&session));
        Ok((session, events_rx))
    }

    /// Leave a guild's voice channel.
    pub fn leave(&self, guild_id: Snowflake) -> Result<(), Error> {
        if let Some((_, session)) = self.sessions.remove(&guild_id.get()) {
            session.disconnect();
        }

        let shard_id = self.manager.shard_for_guild(guild_id);
        self.manager.send(
            shard_id,
            OpCode::VoiceStateUpdate,
            UpdateVoiceState {
                guild_id,
                channel_id: None,
                self_mute: false,
                self_deaf: false,
            },
        )?;
        Ok(())
    }

    /// The live session for a guild, if any.
    pub fn get(&self, guild_id: Snowflake) -> Option<Arc<VoiceSession>> {
        self.sessions.get(&guild_id.get()).map(|s| Arc::clone(s.value()))
    }

    /// Spawn an external-encoder source, honoring `opus_only`.
    pub fn external_source(
        &self,
        input: &str,
        options: FfmpegOptions,
    ) -> Result<FfmpegSource, Error> {
        if self.opus_only {
            return Err(Error::Voice(VoiceError::OpusOnly));
        }
        FfmpegSource::spawn(input, options).map_err(Error::from)
    }

    /// Disconnect every session (client shutdown).
    pub(crate) fn disconnect_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().disconnect();
        }
        self.sessions.clear();
    }
}
