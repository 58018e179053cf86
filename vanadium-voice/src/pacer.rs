//! The send pacer: one Opus frame onto the wire every 20 ms.
//!
//! Scheduling is wall-clock from play start. When the source falls
//! behind, the pacer never bursts to catch up; it skips the RTP
//! timestamp over the gap so the far end hears silence instead of
//! time-compressed audio. A source that stays silent longer than the
//! configured starvation budget ends playback.

use crate::error::VoiceError;
use crate::payload::SpeakingFlags;
use crate::piper::OpusSource;
use crate::udp::VoiceUdp;
use crate::ws::VoiceWsCommand;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, trace, warn};

/// Pacer tuning.
#[derive(Debug, Clone)]
pub struct PacerConfig {
    /// Audio frame duration; 20 ms for Discord Opus.
    pub frame_duration: Duration,

    /// How long to wait on a starved source before ending playback.
    pub voice_data_timeout: Duration,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            frame_duration: Duration::from_millis(20),
            voice_data_timeout: Duration::from_secs(2),
        }
    }
}

/// Why a playback ended.
#[derive(Debug)]
pub enum PlaybackEnd {
    /// The source ran out of frames.
    Finished,
    /// The source produced nothing within the starvation budget.
    Starved,
    /// Stop was requested.
    Stopped,
    /// Transport or source failure.
    Failed(VoiceError),
}

/// Drive one source to completion.
///
/// Sets the speaking state around the stream and finishes with the
/// five-frame silence burst Opus decoders expect.
pub async fn run(
    mut source: impl OpusSource,
    udp: Arc<Mutex<Option<VoiceUdp>>>,
    ws_commands: flume::Sender<VoiceWsCommand>,
    ssrc: u32,
    config: PacerConfig,
    stop: flume::Receiver<()>,
) -> PlaybackEnd {
    let _ = ws_commands.send(VoiceWsCommand::Speaking {
        flags: SpeakingFlags::MICROPHONE,
        ssrc,
    });

    let mut next = Instant::now();
    let end = loop {
        // Pull the next frame, bounded by the starvation budget; a stop
        // request interrupts the wait.
        let frame = tokio::select! {
            _ = stop.recv_async() => break PlaybackEnd::Stopped,
            pulled = timeout(config.voice_data_timeout, source.next_frame()) => {
                match pulled {
                    Err(_) => {
                        debug!("audio source starved past budget");
                        break PlaybackEnd::Starved;
                    }
                    Ok(Err(err)) => break PlaybackEnd::Failed(err),
                    Ok(Ok(None)) => break PlaybackEnd::Finished,
                    Ok(Ok(Some(frame))) => frame,
                }
            }
        };

        // Catch up silently: account missed frame slots as timestamp
        // skips, never as extra packets.
        let now = Instant::now();
        if now > next {
            let behind =
                (now.duration_since(next).as_micros() / config.frame_duration.as_micros()) as u32;
            if behind > 0 {
                let mut guard = udp.lock().await;
                match guard.as_mut() {
                    Some(udp) => udp.skip_frames(behind),
                    None => break PlaybackEnd::Failed(VoiceError::NotConnected),
                }
                trace!(frames = behind, "skipped timestamps to catch up");
                next += config.frame_duration * behind;
            }
        }

        sleep_until(next).await;
        next += config.frame_duration;

        let mut guard = udp.lock().await;
        let transport = match guard.as_mut() {
            Some(udp) => udp,
            None => break PlaybackEnd::Failed(VoiceError::NotConnected),
        };
        if let Err(err) = transport.send_frame(&frame).await {
            break PlaybackEnd::Failed(err);
        }
    };

    // Wind the decoder down before going quiet.
    {
        let mut guard = udp.lock().await;
        if let Some(udp) = guard.as_mut() {
            if let Err(err) = udp.send_silence().await {
                warn!(error = %err, "failed to send trailing silence");
            }
        }
    }

    let _ = ws_commands.send(VoiceWsCommand::Speaking {
        flags: SpeakingFlags::empty(),
        ssrc,
    });

    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_SIZE;
    use crate::payload::EncryptionMode;
    use crate::piper::RawOpusSource;
    use crate::udp::{SAMPLES_PER_FRAME, SILENCE_FRAME_COUNT};
    use tokio::net::UdpSocket;

    async fn transport() -> (Arc<Mutex<Option<VoiceUdp>>>, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let mut udp = VoiceUdp::connect("127.0.0.1", addr.port(), 7).await.unwrap();
        udp.set_secret(&[0u8; KEY_SIZE], EncryptionMode::default())
            .unwrap();
        (Arc::new(Mutex::new(Some(udp))), server)
    }

    #[tokio::test]
    async fn plays_to_completion_with_stepped_rtp() {
        let (udp, server) = transport().await;
        let (ws_tx, ws_rx) = flume::unbounded();
        let (_stop_tx, stop_rx) = flume::unbounded();

        let source = RawOpusSource::new([vec![1u8; 10], vec![2u8; 10], vec![3u8; 10]]);
        let end = run(
            source,
            Arc::clone(&udp),
            ws_tx,
            7,
            PacerConfig {
                frame_duration: Duration::from_millis(10),
                voice_data_timeout: Duration::from_secs(1),
            },
            stop_rx,
        )
        .await;
        assert!(matches!(end, PlaybackEnd::Finished));

        // Speaking on, then off.
        let first = ws_rx.try_recv().unwrap();
        assert!(matches!(
            first,
            VoiceWsCommand::Speaking { flags, .. } if flags == SpeakingFlags::MICROPHONE
        ));
        let last = ws_rx.drain().last().unwrap();
        assert!(matches!(
            last,
            VoiceWsCommand::Speaking { flags, .. } if flags.is_empty()
        ));

        // 3 audio packets + the trailing silence burst, with contiguous
        // sequences and 960-sample timestamp steps.
        let total = 3 + SILENCE_FRAME_COUNT as usize;
        let mut packets = Vec::new();
        for _ in 0..total {
            let mut buf = [0u8; 256];
            let n = server.recv(&mut buf).await.unwrap();
            packets.push(buf[..n].to_vec());
        }

        let parse = |p: &[u8]| {
            let seq = u16::from_be_bytes([p[2], p[3]]);
            let ts = u32::from_be_bytes([p[4], p[5], p[6], p[7]]);
            (seq, ts)
        };
        for pair in packets.windows(2) {
            let (seq_a, ts_a) = parse(&pair[0]);
            let (seq_b, ts_b) = parse(&pair[1]);
            assert_eq!(seq_b, seq_a.wrapping_add(1));
            assert_eq!(ts_b.wrapping_sub(ts_a), SAMPLES_PER_FRAME);
        }
    }

    #[tokio::test]
    async fn stop_interrupts_playback() {
        let (udp, _server) = transport().await;
        let (ws_tx, _ws_rx) = flume::unbounded();
        let (stop_tx, stop_rx) = flume::unbounded();

        // A source that never produces: the stop signal must win.
        struct Pending;
        impl OpusSource for Pending {
            fn next_frame(
                &mut self,
            ) -> futures_util::future::BoxFuture<'_, Result<Option<Vec<u8>>, VoiceError>>
            {
                Box::pin(std::future::pending())
            }
        }

        stop_tx.send(()).unwrap();
        let end = run(
            Pending,
            udp,
            ws_tx,
            7,
            PacerConfig::default(),
            stop_rx,
        )
        .await;
        assert!(matches!(end, PlaybackEnd::Stopped));
    }

    #[tokio::test]
    async fn starvation_ends_playback() {
        let (udp, _server) = transport().await;
        let (ws_tx, _ws_rx) = flume::unbounded();
        let (_stop_tx, stop_rx) = flume::unbounded();

        struct Pending;
        impl OpusSource for Pending {
            fn next_frame(
                &mut self,
            ) -> futures_util::future::BoxFuture<'_, Result<Option<Vec<u8>>, VoiceError>>
            {
                Box::pin(std::future::pending())
            }
        }

        let end = run(
            Pending,
            udp,
            ws_tx,
            7,
            PacerConfig {
                frame_duration: Duration::from_millis(1),
                voice_data_timeout: Duration::from_millis(20),
            },
            stop_rx,
        )
        .await;
        assert!(matches!(end, PlaybackEnd::Starved));
    }
}
