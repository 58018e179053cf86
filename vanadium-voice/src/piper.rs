//! Opus frame sources.
//!
//! Everything the send pacer plays implements [`OpusSource`]: one method
//! producing the next sized Opus packet, `None` at end of stream.
//! Container demuxers (DCA, Ogg) and the external-encoder pipe live in
//! [`crate::sources`]; this module holds the interface, the trivial
//! in-memory source, and the shared fan-out stream.

use crate::error::VoiceError;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// A producer of 20 ms Opus packets.
pub trait OpusSource: Send {
    /// The next Opus packet, or `None` when the stream has ended.
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, VoiceError>>;
}

impl OpusSource for Box<dyn OpusSource> {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, VoiceError>> {
        (**self).next_frame()
    }
}

/// An in-memory queue of pre-framed Opus packets.
pub struct RawOpusSource {
    frames: VecDeque<Vec<u8>>,
}

impl RawOpusSource {
    pub fn new(frames: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }
}

impl OpusSource for RawOpusSource {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, VoiceError>> {
        async move { Ok(self.frames.pop_front()) }.boxed()
    }
}

/// Fan one source out to any number of voice sessions.
///
/// A driver task pulls the underlying source on the audio clock and
/// broadcasts each packet. Every subscriber receives identical payloads
/// while keeping its own RTP state; a subscriber added mid-play simply
/// starts at the next packet boundary. Slow subscribers skip ahead
/// rather than lag the clock.
pub struct SharedOpusStream {
    /// Cleared by the driver on completion so subscribers observe the
    /// channel closing instead of waiting forever.
    tx: std::sync::Arc<parking_lot::Mutex<Option<broadcast::Sender<Vec<u8>>>>>,
    driver: tokio::task::JoinHandle<()>,
}

impl SharedOpusStream {
    /// Spawn the driver over `source`, emitting one packet per
    /// `frame_duration`.
    pub fn spawn(mut source: impl OpusSource + 'static, frame_duration: Duration) -> Self {
        let (driver_tx, _) = broadcast::channel(8);
        let slot = std::sync::Arc::new(parking_lot::Mutex::new(Some(driver_tx.clone())));
        let driver_slot = std::sync::Arc::clone(&slot);

        let driver = tokio::spawn(async move {
            let mut next = tokio::time::Instant::now();
            loop {
                match source.next_frame().await {
                    Ok(Some(frame)) => {
                        tokio::time::sleep_until(next).await;
                        next += frame_duration;
                        // No receivers is fine: a session may join later.
                        let _ = driver_tx.send(frame);
                    }
                    Ok(None) => {
                        debug!("shared stream source finished");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "shared stream source failed");
                        break;
                    }
                }
            }
            driver_slot.lock().take();
        });

        Self { tx: slot, driver }
    }

    /// Join the stream at the current packet boundary.
    pub fn subscribe(&self) -> SharedSubscriber {
        let rx = match self.tx.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Stream already over: hand out a closed receiver.
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        };
        SharedSubscriber { rx }
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx
            .lock()
            .as_ref()
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}

impl Drop for SharedOpusStream {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// One session's view of a [`SharedOpusStream`].
pub struct SharedSubscriber {
    rx: broadcast::Receiver<Vec<u8>>,
}

impl OpusSource for SharedSubscriber {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, VoiceError>> {
        async move {
            loop {
                match self.rx.recv().await {
                    Ok(frame) => return Ok(Some(frame)),
                    // Fell behind: drop to the oldest retained packet and
                    // keep going; the pacer's timestamp skip covers the gap.
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "shared subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(None),
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raw_source_drains_in_order() {
        let mut source = RawOpusSource::new([vec![1], vec![2], vec![3]]);
        assert_eq!(source.next_frame().await.unwrap(), Some(vec![1]));
        assert_eq!(source.next_frame().await.unwrap(), Some(vec![2]));
        assert_eq!(source.next_frame().await.unwrap(), Some(vec![3]));
        assert_eq!(source.next_frame().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_stream_duplicates_frames() {
        let source = RawOpusSource::new([vec![10], vec![20]]);
        let shared = SharedOpusStream::spawn(source, Duration::from_millis(20));

        let mut a = shared.subscribe();
        let mut b = shared.subscribe();

        assert_eq!(a.next_frame().await.unwrap(), Some(vec![10]));
        assert_eq!(b.next_frame().await.unwrap(), Some(vec![10]));
        assert_eq!(a.next_frame().await.unwrap(), Some(vec![20]));
        assert_eq!(b.next_frame().await.unwrap(), Some(vec![20]));
        assert_eq!(a.next_frame().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_joins_at_packet_boundary() {
        let source = RawOpusSource::new([vec![1], vec![2], vec![3]]);
        let shared = SharedOpusStream::spawn(source, Duration::from_millis(20));

        let mut early = shared.subscribe();
        assert_eq!(early.next_frame().await.unwrap(), Some(vec![1]));

        // Joins after the first packet: sees only what follows.
        let mut late = shared.subscribe();
        assert_eq!(late.next_frame().await.unwrap(), Some(vec![2]));
        assert_eq!(early.next_frame().await.unwrap(), Some(vec![2]));
    }
}
