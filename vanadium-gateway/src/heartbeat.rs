//! Heartbeat bookkeeping.
//!
//! The shard must send a heartbeat every `heartbeat_interval` and sees it
//! acknowledged by op 11. An unacknowledged heartbeat at the next tick
//! means the connection is a zombie. Round-trip samples feed the shared
//! [`LatencyRef`] that paces outbound frames.

use crate::bucket::LatencyRef;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Heartbeats {
    interval_ms: AtomicU64,
    last_sent: RwLock<Instant>,
    acked: AtomicBool,
    latency: LatencyRef,
}

impl Heartbeats {
    pub fn new(latency: LatencyRef) -> Self {
        Self {
            interval_ms: AtomicU64::new(41_250),
            last_sent: RwLock::new(Instant::now()),
            acked: AtomicBool::new(true),
            latency,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Acquire))
    }

    pub fn set_interval(&self, interval: Duration) {
        self.interval_ms
            .store(interval.as_millis() as u64, Ordering::Release);
    }

    /// Forget the previous connection's in-flight heartbeat.
    pub fn reset(&self) {
        self.acked.store(true, Ordering::SeqCst);
        *self.last_sent.write() = Instant::now();
    }

    pub fn mark_sent(&self) {
        self.acked.store(false, Ordering::SeqCst);
        *self.last_sent.write() = Instant::now();
    }

    /// Record the ACK and fold the round trip into the latency estimate.
    pub fn mark_acked(&self) -> Duration {
        let rtt = self.last_sent.read().elapsed();
        self.acked.store(true, Ordering::SeqCst);
        self.latency.record(rtt);
        rtt
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }

    /// Smoothed heartbeat latency.
    pub fn latency(&self) -> Duration {
        self.latency.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_cycle() {
        let hb = Heartbeats::new(LatencyRef::new());
        assert!(hb.is_acked());
        hb.mark_sent();
        assert!(!hb.is_acked());
        hb.mark_acked();
        assert!(hb.is_acked());
    }

    #[test]
    fn interval_update() {
        let hb = Heartbeats::new(LatencyRef::new());
        hb.set_interval(Duration::from_millis(41_250));
        assert_eq!(hb.interval(), Duration::from_millis(41_250));
    }
}
