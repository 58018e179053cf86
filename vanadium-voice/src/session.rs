//! Per-guild voice session orchestration.
//!
//! A [`VoiceSession`] wires the control plane and the data plane
//! together: it runs the WebSocket handshake, performs IP discovery,
//! installs the packet key, drives playback through the pacer, and
//! applies the close policy: transient drops resume with the key and
//! SSRC intact, fatal closes (4014, 4015 and friends) dispose the
//! session so the host can re-initiate over the main gateway.

use crate::error::{VoiceCloseCode, VoiceError};
use crate::pacer::{self, PacerConfig, PlaybackEnd};
use crate::payload::{EncryptionMode, SelectProtocol, VoiceReady};
use crate::piper::OpusSource;
use crate::udp::VoiceUdp;
use crate::ws::{VoiceHandshake, VoiceWs, VoiceWsCommand, VoiceWsEvent};

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use vanadium_model::Snowflake;

/// Session configuration, assembled from the gateway's voice handshake
/// events.
#[derive(Debug, Clone)]
pub struct VoiceOptions {
    pub guild_id: Snowflake,
    pub channel_id: Snowflake,
    pub user_id: Snowflake,
    /// Session ID from VOICE_STATE_UPDATE.
    pub session_id: String,
    /// Endpoint from VOICE_SERVER_UPDATE.
    pub endpoint: String,
    /// Token from VOICE_SERVER_UPDATE.
    pub token: String,
    /// Send pacing configuration.
    pub pacer: PacerConfig,
    /// Transient reconnects before the session is disposed.
    pub max_resume_attempts: u32,
}

impl VoiceOptions {
    pub fn new(
        guild_id: Snowflake,
        channel_id: Snowflake,
        user_id: Snowflake,
        session_id: impl Into<String>,
        endpoint: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            guild_id,
            channel_id,
            user_id,
            session_id: session_id.into(),
            endpoint: endpoint.into(),
            token: token.into(),
            pacer: PacerConfig::default(),
            max_resume_attempts: 5,
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VoiceStatus {
    Disconnected = 0,
    Connecting = 1,
    Discovering = 2,
    SelectingProtocol = 3,
    Ready = 4,
    Disposed = 5,
}

impl From<u8> for VoiceStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => VoiceStatus::Connecting,
            2 => VoiceStatus::Discovering,
            3 => VoiceStatus::SelectingProtocol,
            4 => VoiceStatus::Ready,
            5 => VoiceStatus::Disposed,
            _ => VoiceStatus::Disconnected,
        }
    }
}

/// Events a session reports to its host.
#[derive(Debug)]
pub enum VoiceSessionEvent {
    /// Handshake complete; audio can flow.
    Connected {
        ssrc: u32,
        mode: EncryptionMode,
    },
    /// Transient drop recovered without a new handshake.
    Resumed,
    /// Another user left the channel.
    UserDisconnected(Snowflake),
    /// A playback run ended.
    PlaybackEnded(PlaybackEnd),
    /// The session is dead; rejoin via a fresh VOICE_STATE_UPDATE.
    Disposed {
        code: Option<u16>,
        reason: String,
    },
}

/// A voice connection to one guild.
pub struct VoiceSession {
    options: VoiceOptions,
    status: AtomicU8,
    ws: Arc<VoiceWs>,
    udp: Arc<Mutex<Option<VoiceUdp>>>,
    /// 0 until READY assigns one.
    ssrc: AtomicU32,
    /// Secret key and mode survive resumes.
    secret: RwLock<Option<(Vec<u8>, EncryptionMode)>>,
    ws_commands: RwLock<Option<flume::Sender<VoiceWsCommand>>>,
    events: RwLock<Option<flume::Sender<VoiceSessionEvent>>>,
    stop_playback: parking_lot::Mutex<Option<flume::Sender<()>>>,
    shutdown: AtomicBool,
}

impl VoiceSession {
    pub fn new(options: VoiceOptions) -> Arc<Self> {
        let ws = Arc::new(VoiceWs::new(&options.endpoint));
        Arc::new(Self {
            options,
            status: AtomicU8::new(VoiceStatus::Disconnected as u8),
            ws,
            udp: Arc::new(Mutex::new(None)),
            ssrc: AtomicU32::new(0),
            secret: RwLock::new(None),
            ws_commands: RwLock::new(None),
            events: RwLock::new(None),
            stop_playback: parking_lot::Mutex::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn status(&self) -> VoiceStatus {
        VoiceStatus::from(self.status.load(Ordering::SeqCst))
    }

    pub fn is_ready(&self) -> bool {
        self.status() == VoiceStatus::Ready
    }

    pub fn guild_id(&self) -> Snowflake {
        self.options.guild_id
    }

    pub fn channel_id(&self) -> Snowflake {
        self.options.channel_id
    }

    /// SSRC assigned by the voice server, if connected.
    pub fn ssrc(&self) -> Option<u32> {
        match self.ssrc.load(Ordering::SeqCst) {
            0 => None,
            ssrc => Some(ssrc),
        }
    }

    /// Control-plane heartbeat latency.
    pub fn latency(&self) -> Option<Duration> {
        self.ws.latency()
    }

    /// Start the session; lifecycle notifications flow into `events`.
    pub fn connect(self: &Arc<Self>, events: flume::Sender<VoiceSessionEvent>) {
        *self.events.write() = Some(events.clone());
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.supervise(events).await;
        });
    }

    /// The connection supervisor: runs the WebSocket, reacts to its
    /// events, and decides resume-vs-dispose on every drop.
    async fn supervise(self: Arc<Self>, events: flume::Sender<VoiceSessionEvent>) {
        let handshake = VoiceHandshake {
            server_id: self.options.guild_id.to_string(),
            user_id: self.options.user_id.to_string(),
            session_id: self.options.session_id.clone(),
            token: self.options.token.clone(),
        };

        let mut resume = false;
        let mut attempts = 0u32;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let (ws_event_tx, ws_event_rx) = flume::unbounded();
            let (command_tx, command_rx) = flume::unbounded();
            *self.ws_commands.write() = Some(command_tx);
            self.status
                .store(VoiceStatus::Connecting as u8, Ordering::SeqCst);

            let run = {
                let ws = Arc::clone(&self.ws);
                let handshake = handshake.clone();
                async move {
                    ws.connect_and_run(&handshake, resume, ws_event_tx, command_rx)
                        .await
                }
            };
            tokio::pin!(run);

            let outcome = loop {
                tokio::select! {
                    result = &mut run => break result,
                    event = ws_event_rx.recv_async() => {
                        let Ok(event) = event else { continue };
                        if let Err(err) = self.handle_ws_event(event, &events, &mut attempts).await {
                            error!(guild_id = %self.options.guild_id, error = %err, "voice setup failed");
                            break Err(err);
                        }
                    }
                }
            };

            match outcome {
                Ok(()) => break,
                Err(VoiceError::Closed { code, reason }) => {
                    let known = VoiceCloseCode::from_code(code);
                    if known.is_some_and(VoiceCloseCode::is_fatal) {
                        self.dispose(Some(code), reason, &events).await;
                        return;
                    }
                    warn!(guild_id = %self.options.guild_id, code, reason = %reason, "voice connection dropped");
                }
                Err(VoiceError::Timeout(what)) => {
                    warn!(guild_id = %self.options.guild_id, what, "voice connection timed out");
                }
                Err(VoiceError::WebSocket(err)) => {
                    warn!(guild_id = %self.options.guild_id, error = %err, "voice websocket error");
                }
                Err(err) => {
                    self.dispose(None, err.to_string(), &events).await;
                    return;
                }
            }

            attempts += 1;
            if attempts > self.options.max_resume_attempts {
                self.dispose(None, "resume budget exhausted".to_string(), &events)
                    .await;
                return;
            }

            // The session itself is still valid server-side: resume with
            // key and SSRC intact.
            resume = true;
            self.status
                .store(VoiceStatus::Connecting as u8, Ordering::SeqCst);
            sleep(Duration::from_millis(500).saturating_mul(attempts)).await;
        }

        self.stop();
        *self.udp.lock().await = None;
        self.status
            .store(VoiceStatus::Disconnected as u8, Ordering::SeqCst);
        info!(guild_id = %self.options.guild_id, "voice session closed");
    }

    async fn handle_ws_event(
        &self,
        event: VoiceWsEvent,
        events: &flume::Sender<VoiceSessionEvent>,
        attempts: &mut u32,
    ) -> Result<(), VoiceError> {
        match event {
            VoiceWsEvent::Ready(info) => self.setup_transport(info).await,
            VoiceWsEvent::SessionDescription(desc) => {
                let mode = EncryptionMode::parse(&desc.mode).ok_or_else(|| {
                    VoiceError::NoSupportedMode {
                        offered: vec![desc.mode.clone()],
                    }
                })?;

                {
                    let mut guard = self.udp.lock().await;
                    let udp = guard.as_mut().ok_or(VoiceError::NotConnected)?;
                    udp.set_secret(&desc.secret_key, mode)?;
                }
                *self.secret.write() = Some((desc.secret_key, mode));
                self.status.store(VoiceStatus::Ready as u8, Ordering::SeqCst);
                *attempts = 0;

                info!(guild_id = %self.options.guild_id, mode = %mode, "voice session ready");
                let _ = events
                    .send_async(VoiceSessionEvent::Connected {
                        ssrc: self.ssrc.load(Ordering::SeqCst),
                        mode,
                    })
                    .await;
                Ok(())
            }
            VoiceWsEvent::Resumed => {
                // Key and SSRC persist across a voice resume.
                self.status.store(VoiceStatus::Ready as u8, Ordering::SeqCst);
                *attempts = 0;
                let _ = events.send_async(VoiceSessionEvent::Resumed).await;
                Ok(())
            }
            VoiceWsEvent::ClientDisconnect(user_id) => {
                let _ = events
                    .send_async(VoiceSessionEvent::UserDisconnected(user_id))
                    .await;
                Ok(())
            }
        }
    }

    /// READY: bind UDP, discover our external address, select the
    /// protocol.
    async fn setup_transport(&self, info: VoiceReady) -> Result<(), VoiceError> {
        self.status
            .store(VoiceStatus::Discovering as u8, Ordering::SeqCst);
        self.ssrc.store(info.ssrc, Ordering::SeqCst);

        let mode = EncryptionMode::select(&info.modes).ok_or(VoiceError::NoSupportedMode {
            offered: info.modes.clone(),
        })?;

        let udp = VoiceUdp::connect(&info.ip, info.port, info.ssrc).await?;
        let (address, port) = udp.discover_ip().await?;
        *self.udp.lock().await = Some(udp);

        self.status
            .store(VoiceStatus::SelectingProtocol as u8, Ordering::SeqCst);
        self.ws_command(VoiceWsCommand::SelectProtocol(SelectProtocol::udp(
            address, port, mode,
        )))?;

        debug!(guild_id = %self.options.guild_id, mode = %mode, "selected voice protocol");
        Ok(())
    }

    fn ws_command(&self, command: VoiceWsCommand) -> Result<(), VoiceError> {
        self.ws_commands
            .read()
            .as_ref()
            .ok_or(VoiceError::NotConnected)?
            .send(command)
            .map_err(VoiceError::from)
    }

    /// Play an Opus source to the channel.
    ///
    /// Any playback already running is stopped first; the outcome is
    /// reported as [`VoiceSessionEvent::PlaybackEnded`].
    pub fn play(
        self: &Arc<Self>,
        source: impl OpusSource + 'static,
    ) -> Result<(), VoiceError> {
        if !self.is_ready() {
            return Err(VoiceError::NotConnected);
        }
        self.stop();

        let (stop_tx, stop_rx) = flume::bounded(1);
        *self.stop_playback.lock() = Some(stop_tx);

        let udp = Arc::clone(&self.udp);
        let commands = self
            .ws_commands
            .read()
            .clone()
            .ok_or(VoiceError::NotConnected)?;
        let ssrc = self.ssrc.load(Ordering::SeqCst);
        let config = self.options.pacer.clone();
        let events = self.events.read().clone();

        tokio::spawn(async move {
            let end = pacer::run(source, udp, commands, ssrc, config, stop_rx).await;
            if let Some(events) = events {
                let _ = events
                    .send_async(VoiceSessionEvent::PlaybackEnded(end))
                    .await;
            }
        });
        Ok(())
    }

    /// Stop the current playback, if any.
    pub fn stop(&self) {
        if let Some(stop) = self.stop_playback.lock().take() {
            let _ = stop.send(());
        }
    }

    /// Leave voice: stops playback and closes the control plane. The
    /// supervisor winds the session down to `Disconnected`.
    pub fn disconnect(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.stop();
        // Dropping the command sender closes the WebSocket cleanly.
        *self.ws_commands.write() = None;
    }

    async fn dispose(
        &self,
        code: Option<u16>,
        reason: String,
        events: &flume::Sender<VoiceSessionEvent>,
    ) {
        error!(guild_id = %self.options.guild_id, ?code, reason = %reason, "voice session disposed");
        self.stop();
        *self.udp.lock().await = None;
        *self.ws_commands.write() = None;
        self.status
            .store(VoiceStatus::Disposed as u8, Ordering::SeqCst);
        let _ = events
            .send_async(VoiceSessionEvent::Disposed { code, reason })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> VoiceOptions {
        VoiceOptions::new(
            Snowflake::new(41771983423143937),
            Snowflake::new(127121515262115840),
            Snowflake::new(80351110224678912),
            "session",
            "smart.loyal.discord.gg:80",
            "token",
        )
    }

    #[test]
    fn status_roundtrip() {
        assert_eq!(VoiceStatus::from(4), VoiceStatus::Ready);
        assert_eq!(VoiceStatus::from(0), VoiceStatus::Disconnected);
        assert_eq!(VoiceStatus::from(99), VoiceStatus::Disconnected);
    }

    #[tokio::test]
    async fn fresh_session_is_disconnected() {
        let session = VoiceSession::new(options());
        assert_eq!(session.status(), VoiceStatus::Disconnected);
        assert_eq!(session.ssrc(), None);
        assert!(!session.is_ready());
    }

    #[tokio::test]
    async fn play_requires_ready() {
        let session = VoiceSession::new(options());
        let source = crate::piper::RawOpusSource::new([vec![1u8]]);
        assert!(matches!(
            session.play(source),
            Err(VoiceError::NotConnected)
        ));
    }
}
