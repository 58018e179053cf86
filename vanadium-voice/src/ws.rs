//! Voice control-plane WebSocket.
//!
//! The signalling side of a voice session: identify/resume handshake,
//! nonce heartbeats, protocol selection and speaking state. The data
//! plane (UDP/RTP) is driven separately from the events this task emits.

use crate::error::VoiceError;
use crate::opcode::VoiceOpCode;
use crate::payload::{
    RawVoicePayload, SelectProtocol, SessionDescription, Speaking, SpeakingFlags, VoiceHeartbeat,
    VoiceHello, VoiceIdentify, VoicePayload, VoiceReady, VoiceResume,
};
use crate::VOICE_VERSION;

use flume::{Receiver, Sender};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Identity of one voice connection, as handed over by the main gateway.
#[derive(Debug, Clone)]
pub struct VoiceHandshake {
    /// Guild ID as a string (the voice gateway's `server_id`).
    pub server_id: String,
    /// Our user ID.
    pub user_id: String,
    /// Session ID from VOICE_STATE_UPDATE.
    pub session_id: String,
    /// Token from VOICE_SERVER_UPDATE.
    pub token: String,
}

/// Events surfaced by the control plane.
#[derive(Debug, Clone)]
pub enum VoiceWsEvent {
    /// READY: ssrc, server address, offered modes.
    Ready(VoiceReady),
    /// SESSION_DESCRIPTION: the packet key.
    SessionDescription(SessionDescription),
    /// RESUMED: the previous session continues, key and SSRC intact.
    Resumed,
    /// A user left the channel.
    ClientDisconnect(vanadium_model::Snowflake),
}

/// Commands into the control plane.
#[derive(Debug)]
pub enum VoiceWsCommand {
    /// Send SELECT_PROTOCOL after IP discovery.
    SelectProtocol(SelectProtocol),
    /// Update speaking state.
    Speaking {
        flags: SpeakingFlags,
        ssrc: u32,
    },
}

/// The voice WebSocket driver.
///
/// Heartbeat nonce and server-sequence bookkeeping live here so they
/// survive reconnects within one logical session.
pub struct VoiceWs {
    url: String,
    /// Last server sequence seen, echoed in heartbeats and RESUME.
    seq_ack: AtomicU64,
    /// Monotonic heartbeat nonce.
    nonce: AtomicU64,
    acked: AtomicBool,
    /// Unix ms the in-flight heartbeat left, for latency measurement.
    sent_at: AtomicU64,
    latency_ms: RwLock<Option<u64>>,
}

impl VoiceWs {
    /// Build a driver for the given endpoint from VOICE_SERVER_UPDATE.
    pub fn new(endpoint: &str) -> Self {
        let host = endpoint.trim_start_matches("wss://");
        // Discord appends :80 to voice endpoints; the real port is 443.
        let host = host.trim_end_matches(":80");
        Self {
            url: format!("wss://{host}/?v={VOICE_VERSION}"),
            seq_ack: AtomicU64::new(0),
            nonce: AtomicU64::new(0),
            acked: AtomicBool::new(true),
            sent_at: AtomicU64::new(0),
            latency_ms: RwLock::new(None),
        }
    }

    /// Most recent heartbeat latency.
    pub fn latency(&self) -> Option<Duration> {
        self.latency_ms.read().map(Duration::from_millis)
    }

    /// Connect and pump the control plane until close.
    ///
    /// With `resume` set, a RESUME is sent instead of IDENTIFY and the
    /// existing key/SSRC remain valid on RESUMED. The return value is
    /// always an error describing why the socket ended; clean shutdown
    /// happens by dropping the command sender.
    pub async fn connect_and_run(
        &self,
        handshake: &VoiceHandshake,
        resume: bool,
        event_tx: Sender<VoiceWsEvent>,
        command_rx: Receiver<VoiceWsCommand>,
    ) -> Result<(), VoiceError> {
        info!(url = %self.url, resume, "connecting to voice gateway");

        let (ws_stream, _response) = connect_async(&self.url).await?;
        let (mut sink, mut stream) = ws_stream.split();

        let hello = self.wait_for_hello(&mut stream).await?;
        let interval = Duration::from_millis(hello.heartbeat_interval as u64);
        debug!(interval_ms = hello.heartbeat_interval, "voice HELLO");

        if resume {
            let payload = VoiceResume {
                server_id: handshake.server_id.clone(),
                session_id: handshake.session_id.clone(),
                token: handshake.token.clone(),
                seq_ack: self.seq_ack.load(Ordering::SeqCst),
            };
            self.send(&mut sink, VoiceOpCode::Resume, &payload).await?;
            info!(server_id = %handshake.server_id, "voice resume sent");
        } else {
            let payload = VoiceIdentify {
                server_id: handshake.server_id.clone(),
                user_id: handshake.user_id.clone(),
                session_id: handshake.session_id.clone(),
                token: handshake.token.clone(),
            };
            self.send(&mut sink, VoiceOpCode::Identify, &payload).await?;
            info!(server_id = %handshake.server_id, "voice identify sent");
        }

        self.acked.store(true, Ordering::SeqCst);
        let mut next_heartbeat = Instant::now() + interval;

        loop {
            tokio::select! {
                command = command_rx.recv_async() => {
                    match command {
                        Ok(VoiceWsCommand::SelectProtocol(payload)) => {
                            self.send(&mut sink, VoiceOpCode::SelectProtocol, &payload).await?;
                        }
                        Ok(VoiceWsCommand::Speaking { flags, ssrc }) => {
                            let payload = Speaking { speaking: flags.bits(), delay: 0, ssrc };
                            self.send(&mut sink, VoiceOpCode::Speaking, &payload).await?;
                        }
                        Err(_) => {
                            // Session dropped us: close cleanly.
                            let _ = sink.close().await;
                            return Ok(());
                        }
                    }
                }

                _ = sleep_until(next_heartbeat) => {
                    if !self.acked.load(Ordering::SeqCst) {
                        warn!("voice heartbeat not acknowledged");
                        return Err(VoiceError::Timeout("voice heartbeat ack"));
                    }
                    let payload = VoiceHeartbeat {
                        t: self.nonce.fetch_add(1, Ordering::SeqCst) + 1,
                        seq_ack: self.seq_ack.load(Ordering::SeqCst),
                    };
                    self.acked.store(false, Ordering::SeqCst);
                    self.sent_at.store(now_ms(), Ordering::SeqCst);
                    self.send(&mut sink, VoiceOpCode::Heartbeat, &payload).await?;
                    trace!(nonce = payload.t, "voice heartbeat sent");
                    next_heartbeat = Instant::now() + interval;
                }

                message = stream.next() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.handle_text(&text, &event_tx).await?;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((0, String::new()));
                            return Err(VoiceError::Closed { code, reason });
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            sink.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(VoiceError::WebSocket(e)),
                        None => {
                            return Err(VoiceError::Closed {
                                code: 0,
                                reason: "voice websocket stream ended".to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    async fn wait_for_hello(
        &self,
        stream: &mut SplitStream<WsStream>,
    ) -> Result<VoiceHello, VoiceError> {
        timeout(Duration::from_secs(10), async {
            while let Some(message) = stream.next().await {
                if let WsMessage::Text(text) = message? {
                    let payload: RawVoicePayload = serde_json::from_str(&text)?;
                    self.note_seq(&payload);
                    if payload.op == VoiceOpCode::Hello {
                        if let Some(data) = payload.d {
                            return Ok(serde_json::from_value(data)?);
                        }
                    }
                }
            }
            Err(VoiceError::Closed {
                code: 0,
                reason: "connection closed before HELLO".to_string(),
            })
        })
        .await
        .map_err(|_| VoiceError::Timeout("voice HELLO"))?
    }

    async fn handle_text(
        &self,
        text: &str,
        event_tx: &Sender<VoiceWsEvent>,
    ) -> Result<(), VoiceError> {
        let payload: RawVoicePayload = serde_json::from_str(text)?;
        self.note_seq(&payload);

        match payload.op {
            VoiceOpCode::Ready => {
                if let Some(data) = payload.d {
                    let ready: VoiceReady = serde_json::from_value(data)?;
                    info!(ssrc = ready.ssrc, ip = %ready.ip, port = ready.port, "voice READY");
                    event_tx.send_async(VoiceWsEvent::Ready(ready)).await?;
                }
            }
            VoiceOpCode::SessionDescription => {
                if let Some(data) = payload.d {
                    let desc: SessionDescription = serde_json::from_value(data)?;
                    info!(mode = %desc.mode, "voice session description");
                    event_tx
                        .send_async(VoiceWsEvent::SessionDescription(desc))
                        .await?;
                }
            }
            VoiceOpCode::HeartbeatAck => {
                self.acked.store(true, Ordering::SeqCst);
                let sent = self.sent_at.load(Ordering::SeqCst);
                if sent > 0 {
                    let latency = now_ms().saturating_sub(sent);
                    *self.latency_ms.write() = Some(latency);
                    trace!(latency_ms = latency, "voice heartbeat acked");
                }
            }
            VoiceOpCode::Resumed => {
                info!("voice session resumed");
                event_tx.send_async(VoiceWsEvent::Resumed).await?;
            }
            VoiceOpCode::ClientDisconnect => {
                if let Some(data) = payload.d {
                    let gone: crate::payload::ClientDisconnect = serde_json::from_value(data)?;
                    event_tx
                        .send_async(VoiceWsEvent::ClientDisconnect(gone.user_id))
                        .await?;
                }
            }
            VoiceOpCode::Speaking | VoiceOpCode::Hello => {}
            other => {
                trace!(opcode = ?other, "unhandled voice opcode");
            }
        }

        Ok(())
    }

    fn note_seq(&self, payload: &RawVoicePayload) {
        if let Some(seq) = payload.seq {
            self.seq_ack.fetch_max(seq, Ordering::SeqCst);
        }
    }

    async fn send<D: serde::Serialize>(
        &self,
        sink: &mut WsSink,
        op: VoiceOpCode,
        data: &D,
    ) -> Result<(), VoiceError> {
        let json = serde_json::to_string(&VoicePayload::new(op, data))?;
        sink.send(WsMessage::Text(json.into())).await?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_normalization() {
        assert_eq!(
            VoiceWs::new("smart.loyal.discord.gg:80").url,
            "wss://smart.loyal.discord.gg/?v=8"
        );
        assert_eq!(
            VoiceWs::new("wss://smart.loyal.discord.gg").url,
            "wss://smart.loyal.discord.gg/?v=8"
        );
    }

    #[test]
    fn seq_ack_is_monotonic() {
        let ws = VoiceWs::new("host");
        ws.note_seq(&RawVoicePayload {
            op: VoiceOpCode::Ready,
            d: None,
            seq: Some(4),
        });
        ws.note_seq(&RawVoicePayload {
            op: VoiceOpCode::Ready,
            d: None,
            seq: Some(2),
        });
        assert_eq!(ws.seq_ack.load(Ordering::SeqCst), 4);
    }
}
