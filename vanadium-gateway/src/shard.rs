//! One gateway WebSocket session.
//!
//! A [`Shard`] owns a single connection to Discord's gateway and drives
//! the protocol state machine: HELLO, IDENTIFY or RESUME, the heartbeat
//! loop, event dispatch, and reconnection with resume preference. Large
//! bots run many shards, each serving a partition of the guild set.

use crate::bucket::{LatencyRef, Priority, TokenBucket};
use crate::compression::ZlibStreamInflater;
use crate::error::{CloseCode, GatewayError};
use crate::event::GatewayEvent;
use crate::heartbeat::Heartbeats;
use crate::manager::IdentifyLimiter;
use crate::opcode::OpCode;
use crate::payload::{
    heartbeat_json, GatewayPayload, Hello, Identify, RawPayload, ReadyData, RequestGuildMembers,
    Resume, UpdatePresence,
};
use crate::session::{ReplayBuffer, Session};
use crate::{DEFAULT_GATEWAY_URL, GATEWAY_VERSION};

use flume::Sender;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Outbound gateway frame budget: 120 commands per rolling 60 seconds,
/// with a slice held back so heartbeats can never starve.
const SEND_CAPACITY: u32 = 120;
const SEND_INTERVAL: Duration = Duration::from_secs(60);
const SEND_RESERVED: u32 = 4;

/// Pluggable reconnect delay: `(attempt, previous_delay) -> delay`.
pub type ReconnectDelayFn = Arc<dyn Fn(u32, Option<Duration>) -> Duration + Send + Sync>;

/// Default reconnect schedule: exponential from 1 s capped at 60 s, with
/// up to 25% random jitter so a fleet of shards does not thunder back in
/// lockstep.
pub fn default_reconnect_delay(attempt: u32, _last: Option<Duration>) -> Duration {
    let base = 1_000u64
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        .min(60_000);
    let jitter = rand::rng().random_range(0..=base / 4);
    Duration::from_millis(base + jitter)
}

/// Shard connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    /// Not running.
    Disconnected,
    /// Opening the socket.
    Connecting,
    /// Socket open, waiting for HELLO.
    Handshaking,
    /// IDENTIFY sent, waiting for READY.
    Identifying,
    /// RESUME sent, waiting for RESUMED.
    Resuming,
    /// Receiving events.
    Ready,
    /// Waiting out a reconnect delay.
    Reconnecting,
}

/// Configuration for a shard.
#[derive(Clone)]
pub struct ShardConfig {
    /// Bot token.
    pub token: String,

    /// Gateway intents (the IDENTIFY mask).
    pub intents: vanadium_model::Intents,

    /// Gateway URL, usually from `/gateway/bot`.
    pub gateway_url: String,

    /// Large guild threshold (50-250).
    pub large_threshold: u8,

    /// Enable zlib-stream transport compression.
    pub compress: bool,

    /// Budget for opening the socket and completing the HELLO handshake.
    pub connection_timeout: Duration,

    /// Quiet period after the last GUILD_CREATE before the shard is
    /// considered ready.
    pub guild_create_timeout: Duration,

    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,

    /// RESUME attempts before falling back to a fresh IDENTIFY.
    pub max_resume_attempts: u32,

    /// Whether to reconnect at all after a drop.
    pub autoreconnect: bool,

    /// Reconnect delay schedule.
    pub reconnect_delay: ReconnectDelayFn,

    /// Request every guild's full member list after startup. Requires
    /// the GUILD_MEMBERS intent.
    pub get_all_users: bool,

    /// Presence to send with IDENTIFY.
    pub presence: Option<UpdatePresence>,
}

impl fmt::Debug for ShardConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardConfig")
            .field("intents", &self.intents)
            .field("gateway_url", &self.gateway_url)
            .field("large_threshold", &self.large_threshold)
            .field("compress", &self.compress)
            .field("get_all_users", &self.get_all_users)
            .finish_non_exhaustive()
    }
}

impl ShardConfig {
    /// Create a configuration with required fields and defaults.
    pub fn new(token: impl Into<String>, intents: vanadium_model::Intents) -> Self {
        Self {
            token: token.into(),
            intents,
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            large_threshold: 250,
            compress: false,
            connection_timeout: Duration::from_secs(30),
            guild_create_timeout: Duration::from_secs(2),
            max_reconnect_attempts: 10,
            max_resume_attempts: 5,
            autoreconnect: true,
            reconnect_delay: Arc::new(default_reconnect_delay),
            get_all_users: false,
            presence: None,
        }
    }

    /// Set a custom gateway URL.
    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = url.into();
        self
    }

    /// Check constraints that would otherwise only fail at runtime.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if !(50..=250).contains(&self.large_threshold) {
            return Err(GatewayError::Config(format!(
                "large_threshold must be within 50..=250, got {}",
                self.large_threshold
            )));
        }
        if self.get_all_users
            && !self.intents.contains(vanadium_model::Intents::GUILD_MEMBERS)
        {
            return Err(GatewayError::Config(
                "get_all_users requires the GUILD_MEMBERS intent".to_string(),
            ));
        }
        Ok(())
    }
}

/// Command sent into the shard's run loop.
#[derive(Debug)]
enum ShardCommand {
    /// Send a frame; `priority` skips the send queue, `replay` records
    /// the frame for re-send after a RESUME.
    Send {
        frame: String,
        priority: bool,
        replay: bool,
    },
    /// Wake the loop so a shutdown flag is observed promptly.
    Shutdown,
}

/// What to do after decoding one inbound frame.
enum FrameAction {
    None,
    Dispatch(GatewayEvent),
    HeartbeatRequest,
    Reconnect,
    InvalidSession(bool),
}

/// Guild streaming bookkeeping between READY and shard-ready.
struct GuildStreaming {
    /// Every guild READY listed for this shard.
    all: HashSet<u64>,
    /// Guilds whose GUILD_CREATE has not arrived yet.
    pending: HashSet<u64>,
    deadline: Option<Instant>,
}

/// A Discord gateway shard.
pub struct Shard {
    shard_id: u16,
    total_shards: u16,
    config: ShardConfig,

    /// Identify pacing shared across the manager's shards.
    identify_limiter: Arc<IdentifyLimiter>,

    /// Outbound frame pacing.
    send_bucket: TokenBucket,

    /// Heartbeat RTT estimate, shared with the send bucket.
    latency: LatencyRef,

    status: RwLock<ShardStatus>,
    session: RwLock<Option<Session>>,
    sequence: AtomicU64,
    heartbeat: Heartbeats,
    replay: parking_lot::Mutex<ReplayBuffer>,
    resume_attempts: AtomicU32,
    /// Set when a connection reaches READY/RESUMED, so the reconnect
    /// budget restarts after every healthy session.
    became_ready: AtomicBool,
    shutdown: AtomicBool,

    command_tx: Sender<ShardCommand>,
    command_rx: flume::Receiver<ShardCommand>,
}

impl Shard {
    /// Create a shard with its own identify limiter (single-shard bots).
    pub fn new(shard_id: u16, total_shards: u16, config: ShardConfig) -> Result<Self, GatewayError> {
        Self::with_identify_limiter(shard_id, total_shards, config, Arc::new(IdentifyLimiter::new(1)))
    }

    /// Create a shard sharing an identify limiter with its siblings.
    pub fn with_identify_limiter(
        shard_id: u16,
        total_shards: u16,
        config: ShardConfig,
        identify_limiter: Arc<IdentifyLimiter>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;

        let latency = LatencyRef::new();
        let (command_tx, command_rx) = flume::unbounded();

        Ok(Self {
            shard_id,
            total_shards,
            config,
            identify_limiter,
            send_bucket: TokenBucket::new(SEND_CAPACITY, SEND_INTERVAL)
                .with_reserved(SEND_RESERVED)
                .with_latency(latency.clone()),
            heartbeat: Heartbeats::new(latency.clone()),
            latency,
            status: RwLock::new(ShardStatus::Disconnected),
            session: RwLock::new(None),
            sequence: AtomicU64::new(0),
            replay: parking_lot::Mutex::new(ReplayBuffer::default()),
            resume_attempts: AtomicU32::new(0),
            became_ready: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            command_tx,
            command_rx,
        })
    }

    pub fn shard_id(&self) -> u16 {
        self.shard_id
    }

    pub fn total_shards(&self) -> u16 {
        self.total_shards
    }

    pub fn status(&self) -> ShardStatus {
        *self.status.read()
    }

    /// Last received dispatch sequence.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Smoothed heartbeat latency.
    pub fn latency(&self) -> Duration {
        self.latency.get()
    }

    /// Request a graceful shutdown: close 1000, no reconnect.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.command_tx.send(ShardCommand::Shutdown);
    }

    /// Send a gateway frame.
    ///
    /// The frame is paced by the shard's send bucket; heartbeat, resume
    /// and identify opcodes take the priority lane, everything else is
    /// FIFO and recorded for replay after a RESUME.
    pub fn send(&self, op: OpCode, data: impl serde::Serialize) -> Result<(), GatewayError> {
        let frame = GatewayPayload::new(op, data).to_json()?;
        let priority = matches!(op, OpCode::Heartbeat | OpCode::Resume | OpCode::Identify);
        self.command_tx
            .send(ShardCommand::Send {
                frame,
                priority,
                replay: !priority,
            })
            .map_err(GatewayError::from)
    }

    /// Run the shard until shutdown or a fatal error.
    ///
    /// Connects, dispatches events into `events`, and reconnects per the
    /// configured policy. Recoverable faults never surface here; they are
    /// logged and healed by reconnecting.
    pub async fn run(&self, events: Sender<GatewayEvent>) -> Result<(), GatewayError> {
        let mut reconnect_attempts = 0u32;
        let mut last_delay = None;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                *self.status.write() = ShardStatus::Disconnected;
                return Ok(());
            }

            let result = self.connect_and_run(&events).await;
            if self.became_ready.swap(false, Ordering::SeqCst) {
                reconnect_attempts = 0;
                last_delay = None;
            }

            let close_code = match result {
                Ok(()) => {
                    info!(shard_id = self.shard_id, "shard shut down cleanly");
                    *self.status.write() = ShardStatus::Disconnected;
                    return Ok(());
                }
                Err(GatewayError::Fatal { code, reason }) => {
                    error!(shard_id = self.shard_id, code, reason = %reason, "fatal close, not reconnecting");
                    *self.status.write() = ShardStatus::Disconnected;
                    let _ = events
                        .send_async(GatewayEvent::ShardDisconnected { code: Some(code) })
                        .await;
                    return Err(GatewayError::Fatal { code, reason });
                }
                Err(GatewayError::InvalidSession { resumable }) => {
                    if !resumable {
                        self.clear_session();
                    }
                    warn!(shard_id = self.shard_id, resumable, "session invalidated");
                    let _ = events
                        .send_async(GatewayEvent::ShardDisconnected { code: None })
                        .await;
                    if !self.config.autoreconnect {
                        *self.status.write() = ShardStatus::Disconnected;
                        return Err(GatewayError::InvalidSession { resumable });
                    }
                    // The gateway asks for a randomized 1-5 s pause before
                    // the replacement IDENTIFY.
                    let wait = Duration::from_millis(rand::rng().random_range(1_000..=5_000));
                    *self.status.write() = ShardStatus::Reconnecting;
                    sleep(wait).await;
                    continue;
                }
                Err(GatewayError::Closed { code, reason }) => {
                    if let Some(known) = CloseCode::from_code(code) {
                        if known.is_fatal() {
                            error!(shard_id = self.shard_id, code, reason = %reason, "fatal close, not reconnecting");
                            *self.status.write() = ShardStatus::Disconnected;
                            let _ = events
                                .send_async(GatewayEvent::ShardDisconnected { code: Some(code) })
                                .await;
                            return Err(GatewayError::Fatal { code, reason });
                        }
                        if known.clears_session() {
                            self.clear_session();
                        }
                    }
                    warn!(shard_id = self.shard_id, code, reason = %reason, "connection closed");
                    reconnect_attempts += 1;
                    Some(code)
                }
                Err(GatewayError::HeartbeatTimeout) => {
                    warn!(shard_id = self.shard_id, "heartbeat timed out, assuming zombie connection");
                    reconnect_attempts += 1;
                    None
                }
                Err(GatewayError::ReconnectRequested) => {
                    info!(shard_id = self.shard_id, "server requested reconnect");
                    // Not counted against the budget; the server asked.
                    None
                }
                Err(err) => {
                    warn!(shard_id = self.shard_id, error = %err, "shard error");
                    reconnect_attempts += 1;
                    None
                }
            };

            let _ = events
                .send_async(GatewayEvent::ShardDisconnected { code: close_code })
                .await;

            if !self.config.autoreconnect {
                *self.status.write() = ShardStatus::Disconnected;
                return Ok(());
            }

            // A session that keeps failing to resume gets thrown away so
            // the next attempt identifies fresh.
            if self.session.read().is_some() {
                let resumes = self.resume_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if resumes > self.config.max_resume_attempts {
                    warn!(shard_id = self.shard_id, attempts = resumes, "resume budget exhausted, identifying fresh");
                    self.clear_session();
                }
            }

            if reconnect_attempts > self.config.max_reconnect_attempts {
                error!(shard_id = self.shard_id, attempts = reconnect_attempts, "reconnect budget exhausted");
                *self.status.write() = ShardStatus::Disconnected;
                return Err(GatewayError::ReconnectExhausted {
                    attempts: reconnect_attempts,
                });
            }

            let delay = (self.config.reconnect_delay)(reconnect_attempts.max(1), last_delay);
            last_delay = Some(delay);
            info!(
                shard_id = self.shard_id,
                attempt = reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "waiting before reconnect"
            );
            *self.status.write() = ShardStatus::Reconnecting;
            sleep(delay).await;
        }
    }

    /// One connection lifetime: connect, handshake, pump events.
    async fn connect_and_run(&self, events: &Sender<GatewayEvent>) -> Result<(), GatewayError> {
        let url = self.build_gateway_url()?;

        info!(shard_id = self.shard_id, url = %url, "connecting to gateway");
        *self.status.write() = ShardStatus::Connecting;

        let (ws_stream, _response) =
            timeout(self.config.connection_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| GatewayError::Timeout("gateway connection"))??;
        let (mut sink, mut stream) = ws_stream.split();
        let mut inflater = ZlibStreamInflater::new();

        *self.status.write() = ShardStatus::Handshaking;

        let hello = self.wait_for_hello(&mut stream, &mut inflater).await?;
        let interval = Duration::from_millis(hello.heartbeat_interval);
        self.heartbeat.set_interval(interval);
        debug!(shard_id = self.shard_id, interval_ms = hello.heartbeat_interval, "received HELLO");

        let resuming = self.send_identify_or_resume(&mut sink).await?;
        self.heartbeat.reset();

        // First heartbeat lands at a random offset inside the interval so
        // a mass reconnect does not synchronize every shard's ticks.
        let jitter = interval.mul_f64(rand::rng().random_range(0.0..1.0));
        let mut next_heartbeat = Instant::now() + jitter;

        let mut streaming = GuildStreaming {
            all: HashSet::new(),
            pending: HashSet::new(),
            deadline: None,
        };

        if resuming {
            trace!(shard_id = self.shard_id, "resume sent, awaiting replayed dispatches");
        }

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                let _ = sink
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: WsCloseCode::Normal,
                        reason: "".into(),
                    })))
                    .await;
                return Ok(());
            }

            tokio::select! {
                message = stream.next() => {
                    match message {
                        Some(Ok(msg)) => {
                            self.handle_message(msg, events, &mut sink, &mut inflater, &mut streaming).await?;
                        }
                        Some(Err(e)) => return Err(GatewayError::WebSocket(e)),
                        None => {
                            return Err(GatewayError::Closed {
                                code: 0,
                                reason: "websocket stream ended".to_string(),
                            });
                        }
                    }
                }

                _ = sleep_until(next_heartbeat) => {
                    if !self.heartbeat.is_acked() {
                        // Zombie connection: close 4000 so the session
                        // stays resumable, then reconnect.
                        let _ = sink
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: WsCloseCode::from(4000u16),
                                reason: "heartbeat ack timeout".into(),
                            })))
                            .await;
                        return Err(GatewayError::HeartbeatTimeout);
                    }
                    self.send_heartbeat(&mut sink).await?;
                    next_heartbeat = Instant::now() + self.heartbeat.interval();
                }

                _ = sleep_until(streaming.deadline.unwrap_or_else(Instant::now)), if streaming.deadline.is_some() => {
                    self.finish_guild_streaming(&mut streaming, events).await?;
                }

                command = self.command_rx.recv_async() => {
                    match command {
                        Ok(ShardCommand::Send { frame, priority, replay }) => {
                            let lane = if priority { Priority::High } else { Priority::Normal };
                            self.send_bucket.acquire(lane).await;
                            sink.send(WsMessage::Text(frame.clone().into())).await?;
                            if replay {
                                self.replay.lock().push(frame);
                            }
                        }
                        Ok(ShardCommand::Shutdown) => {
                            // Loop top observes the flag and closes.
                        }
                        Err(_) => {
                            return Err(GatewayError::ChannelSend(
                                "shard command channel closed".to_string(),
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Build the connection URL, preferring the session's resume URL.
    fn build_gateway_url(&self) -> Result<Url, GatewayError> {
        let base = self
            .session
            .read()
            .as_ref()
            .map(|s| s.resume_url.clone())
            .unwrap_or_else(|| self.config.gateway_url.clone());

        let mut url = Url::parse(&base)?;
        url.query_pairs_mut()
            .clear()
            .append_pair("v", &GATEWAY_VERSION.to_string())
            .append_pair("encoding", "json");

        if self.config.compress {
            url.query_pairs_mut().append_pair("compress", "zlib-stream");
        }

        Ok(url)
    }

    async fn wait_for_hello(
        &self,
        stream: &mut SplitStream<WsStream>,
        inflater: &mut ZlibStreamInflater,
    ) -> Result<Hello, GatewayError> {
        let deadline = self.config.connection_timeout;

        timeout(deadline, async {
            while let Some(message) = stream.next().await {
                let payload: RawPayload = match message? {
                    WsMessage::Text(text) => serde_json::from_str(&text)?,
                    WsMessage::Binary(data) => match inflater.push(&data)? {
                        Some(bytes) => serde_json::from_slice(bytes)?,
                        None => continue,
                    },
                    WsMessage::Close(frame) => {
                        let (code, reason) = frame
                            .map(|f| (f.code.into(), f.reason.to_string()))
                            .unwrap_or((0, String::new()));
                        return Err(GatewayError::Closed { code, reason });
                    }
                    _ => continue,
                };

                if payload.op == OpCode::Hello {
                    if let Some(data) = payload.d {
                        return Ok(serde_json::from_value(data)?);
                    }
                }
            }
            Err(GatewayError::Closed {
                code: 0,
                reason: "connection closed before HELLO".to_string(),
            })
        })
        .await
        .map_err(|_| GatewayError::Timeout("HELLO"))?
    }

    /// Send RESUME when a session is resumable, IDENTIFY otherwise.
    /// Returns whether a resume was attempted.
    async fn send_identify_or_resume(&self, sink: &mut WsSink) -> Result<bool, GatewayError> {
        let session = self.session.read().clone();
        let sequence = self.sequence.load(Ordering::SeqCst);

        if let Some(session) = session.filter(|_| sequence > 0) {
            *self.status.write() = ShardStatus::Resuming;
            info!(shard_id = self.shard_id, session_id = %session.session_id, seq = sequence, "resuming session");

            let resume = Resume {
                token: self.config.token.as_str().into(),
                session_id: session.session_id.as_str().into(),
                seq: sequence,
            };
            self.send_bucket.acquire(Priority::High).await;
            let frame = GatewayPayload::new(OpCode::Resume, resume).to_json()?;
            sink.send(WsMessage::Text(frame.into())).await?;
            return Ok(true);
        }

        *self.status.write() = ShardStatus::Identifying;

        // One IDENTIFY per 5 s per concurrency bucket, fleet-wide.
        self.identify_limiter.acquire(self.shard_id).await;

        info!(shard_id = self.shard_id, "identifying");
        let mut identify = Identify::new(self.config.token.as_str(), self.config.intents)
            .with_shard(self.shard_id, self.total_shards)
            .with_large_threshold(self.config.large_threshold);
        identify.presence = self.config.presence.clone();

        self.send_bucket.acquire(Priority::High).await;
        let frame = GatewayPayload::new(OpCode::Identify, identify).to_json()?;
        sink.send(WsMessage::Text(frame.into())).await?;
        Ok(false)
    }

    async fn send_heartbeat(&self, sink: &mut WsSink) -> Result<(), GatewayError> {
        let seq = self.sequence.load(Ordering::SeqCst);
        let frame = heartbeat_json((seq > 0).then_some(seq));

        self.send_bucket.acquire(Priority::High).await;
        trace!(shard_id = self.shard_id, seq, "sending heartbeat");
        sink.send(WsMessage::Text(frame.into())).await?;
        self.heartbeat.mark_sent();
        Ok(())
    }

    async fn handle_message(
        &self,
        message: WsMessage,
        events: &Sender<GatewayEvent>,
        sink: &mut WsSink,
        inflater: &mut ZlibStreamInflater,
        streaming: &mut GuildStreaming,
    ) -> Result<(), GatewayError> {
        let action = match message {
            WsMessage::Text(text) => self.process_frame(text.as_bytes())?,
            WsMessage::Binary(data) => match inflater.push(&data)? {
                Some(bytes) => self.process_frame(bytes)?,
                None => FrameAction::None,
            },
            WsMessage::Close(frame) => {
                let (code, reason) = frame
                    .map(|f: CloseFrame| (f.code.into(), f.reason.to_string()))
                    .unwrap_or((0, String::new()));
                return Err(GatewayError::Closed { code, reason });
            }
            WsMessage::Ping(data) => {
                sink.send(WsMessage::Pong(data)).await?;
                return Ok(());
            }
            WsMessage::Pong(_) | WsMessage::Frame(_) => return Ok(()),
        };

        match action {
            FrameAction::None => {}
            FrameAction::HeartbeatRequest => {
                debug!(shard_id = self.shard_id, "server requested heartbeat");
                self.send_heartbeat(sink).await?;
            }
            FrameAction::Reconnect => {
                // Close 4000 keeps the session resumable.
                let _ = sink
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: WsCloseCode::from(4000u16),
                        reason: "reconnect requested".into(),
                    })))
                    .await;
                return Err(GatewayError::ReconnectRequested);
            }
            FrameAction::InvalidSession(resumable) => {
                return Err(GatewayError::InvalidSession { resumable });
            }
            FrameAction::Dispatch(event) => {
                let mut streaming_complete = false;
                match &event {
                    GatewayEvent::Ready(data) => {
                        self.handle_ready(data, streaming);
                    }
                    GatewayEvent::Resumed => {
                        self.handle_resumed(sink).await?;
                    }
                    GatewayEvent::GuildCreate { guild_id, .. } => {
                        if streaming.deadline.is_some() {
                            if let Some(id) = guild_id {
                                streaming.pending.remove(&id.get());
                            }
                            // The quiet-period clock restarts with every
                            // streamed guild.
                            streaming.deadline =
                                Some(Instant::now() + self.config.guild_create_timeout);
                            streaming_complete = streaming.pending.is_empty();
                        }
                    }
                    _ => {}
                }
                events.send_async(event).await?;
                if streaming_complete {
                    self.finish_guild_streaming(streaming, events).await?;
                }
            }
        }

        Ok(())
    }

    /// Decode one inbound frame and decide what to do with it.
    fn process_frame(&self, bytes: &[u8]) -> Result<FrameAction, GatewayError> {
        let payload: RawPayload = serde_json::from_slice(bytes)?;

        if let Some(seq) = payload.s {
            // Dispatch sequences only ever move the cursor forward.
            self.sequence.fetch_max(seq, Ordering::SeqCst);
        }

        Ok(match payload.op {
            OpCode::Dispatch => {
                if let (Some(name), Some(data)) = (payload.t.as_deref(), payload.d) {
                    FrameAction::Dispatch(GatewayEvent::decode(name, data)?)
                } else {
                    FrameAction::None
                }
            }
            OpCode::Heartbeat => FrameAction::HeartbeatRequest,
            OpCode::Reconnect => FrameAction::Reconnect,
            OpCode::InvalidSession => {
                let resumable = payload.d.and_then(|d| d.as_bool()).unwrap_or(false);
                FrameAction::InvalidSession(resumable)
            }
            OpCode::HeartbeatAck => {
                let rtt = self.heartbeat.mark_acked();
                trace!(shard_id = self.shard_id, rtt_ms = rtt.as_millis() as u64, "heartbeat acked");
                FrameAction::None
            }
            other => {
                trace!(shard_id = self.shard_id, opcode = ?other, "ignoring opcode");
                FrameAction::None
            }
        })
    }

    fn handle_ready(&self, ready: &ReadyData, streaming: &mut GuildStreaming) {
        *self.session.write() = Some(Session {
            session_id: ready.session_id.clone(),
            resume_url: ready.resume_gateway_url.clone(),
        });
        *self.status.write() = ShardStatus::Ready;
        self.resume_attempts.store(0, Ordering::SeqCst);
        self.became_ready.store(true, Ordering::SeqCst);
        self.replay.lock().clear();

        streaming.all = ready.guilds.iter().map(|g| g.id.get()).collect();
        streaming.pending = streaming.all.clone();
        streaming.deadline = Some(Instant::now() + self.config.guild_create_timeout);

        info!(
            shard_id = self.shard_id,
            session_id = %ready.session_id,
            guilds = ready.guilds.len(),
            "shard identified"
        );
    }

    /// After RESUMED, frames sent into the dead socket get re-sent, then
    /// the buffer resets.
    async fn handle_resumed(&self, sink: &mut WsSink) -> Result<(), GatewayError> {
        *self.status.write() = ShardStatus::Ready;
        self.resume_attempts.store(0, Ordering::SeqCst);
        self.became_ready.store(true, Ordering::SeqCst);

        let frames = self.replay.lock().drain();
        if !frames.is_empty() {
            debug!(shard_id = self.shard_id, frames = frames.len(), "replaying frames after resume");
            for frame in frames {
                self.send_bucket.acquire(Priority::Normal).await;
                sink.send(WsMessage::Text(frame.into())).await?;
            }
        }

        info!(shard_id = self.shard_id, seq = self.sequence(), "session resumed");
        Ok(())
    }

    /// The guild stream went quiet (or completed): the shard is ready.
    async fn finish_guild_streaming(
        &self,
        streaming: &mut GuildStreaming,
        events: &Sender<GatewayEvent>,
    ) -> Result<(), GatewayError> {
        streaming.deadline = None;
        let pending = streaming.pending.len();
        if pending > 0 {
            debug!(shard_id = self.shard_id, pending, "guild stream timed out with guilds outstanding");
        }

        if self.config.get_all_users {
            self.request_all_members(&streaming.all)?;
        }

        events
            .send_async(GatewayEvent::ShardReady {
                pending_guilds: pending,
            })
            .await?;
        Ok(())
    }

    /// Queue REQUEST_GUILD_MEMBERS sweeps for the shard's guilds.
    fn request_all_members(&self, guilds: &HashSet<u64>) -> Result<(), GatewayError> {
        debug!(shard_id = self.shard_id, guilds = guilds.len(), "requesting all guild members");
        for &id in guilds {
            self.send(
                OpCode::RequestGuildMembers,
                RequestGuildMembers::all(vanadium_model::Snowflake::new(id)),
            )?;
        }
        Ok(())
    }

    fn clear_session(&self) {
        *self.session.write() = None;
        self.sequence.store(0, Ordering::SeqCst);
        self.resume_attempts.store(0, Ordering::SeqCst);
        self.replay.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vanadium_model::Intents;

    fn shard() -> Shard {
        Shard::new(0, 1, ShardConfig::new("token", Intents::default())).unwrap()
    }

    #[test]
    fn config_rejects_get_all_users_without_intent() {
        let mut config = ShardConfig::new("token", Intents::GUILDS);
        config.get_all_users = true;
        assert!(matches!(
            Shard::new(0, 1, config),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn config_rejects_bad_large_threshold() {
        let mut config = ShardConfig::new("token", Intents::GUILDS);
        config.large_threshold = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn gateway_url_carries_version_and_encoding() {
        let shard = shard();
        let url = shard.build_gateway_url().unwrap();
        assert!(url.as_str().starts_with("wss://gateway.discord.gg"));
        assert!(url.query().unwrap().contains("v=10"));
        assert!(url.query().unwrap().contains("encoding=json"));
        assert!(!url.query().unwrap().contains("zlib-stream"));
    }

    #[test]
    fn gateway_url_with_compression() {
        let mut config = ShardConfig::new("token", Intents::default());
        config.compress = true;
        let shard = Shard::new(0, 1, config).unwrap();
        let url = shard.build_gateway_url().unwrap();
        assert!(url.query().unwrap().contains("compress=zlib-stream"));
    }

    #[test]
    fn sequence_advances_monotonically() {
        let shard = shard();

        shard
            .process_frame(br#"{"op":0,"s":5,"t":"TYPING_START","d":{}}"#)
            .unwrap();
        assert_eq!(shard.sequence(), 5);

        // A lower sequence must not move the cursor backwards.
        shard
            .process_frame(br#"{"op":0,"s":3,"t":"TYPING_START","d":{}}"#)
            .unwrap();
        assert_eq!(shard.sequence(), 5);

        shard
            .process_frame(br#"{"op":0,"s":9,"t":"TYPING_START","d":{}}"#)
            .unwrap();
        assert_eq!(shard.sequence(), 9);
    }

    #[test]
    fn invalid_session_resumable_flag() {
        let shard = shard();
        let action = shard.process_frame(br#"{"op":9,"d":true}"#).unwrap();
        assert!(matches!(action, FrameAction::InvalidSession(true)));
        let action = shard.process_frame(br#"{"op":9,"d":false}"#).unwrap();
        assert!(matches!(action, FrameAction::InvalidSession(false)));
    }

    #[test]
    fn heartbeat_ack_updates_latency() {
        let shard = shard();
        shard.heartbeat.mark_sent();
        shard.process_frame(br#"{"op":11}"#).unwrap();
        assert!(shard.heartbeat.is_acked());
    }

    #[test]
    fn reconnect_op_maps_to_action() {
        let shard = shard();
        let action = shard.process_frame(br#"{"op":7,"d":null}"#).unwrap();
        assert!(matches!(action, FrameAction::Reconnect));
    }
}
