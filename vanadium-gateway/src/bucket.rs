//! Token-bucket pacing for outbound gateway traffic.
//!
//! Discord allows 120 gateway commands per 60 seconds per connection, and
//! a starved heartbeat kills the session, so part of the bucket is held
//! back for priority frames. The same primitive paces anything that needs
//! "N per T with a reserved slice" semantics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// A live, shared latency estimate in milliseconds.
///
/// The gateway heartbeat feeds its round-trip samples in; the bucket adds
/// the current value as spacing between consecutive grants so a slow link
/// does not pile frames onto a congested socket.
#[derive(Debug, Clone, Default)]
pub struct LatencyRef(Arc<AtomicU64>);

impl LatencyRef {
    /// A latency reference starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current estimate.
    pub fn get(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::Acquire))
    }

    /// Fold a new round-trip sample into the estimate (EWMA, 1/8 weight).
    pub fn record(&self, sample: Duration) {
        let sample = sample.as_millis() as u64;
        let prior = self.0.load(Ordering::Acquire);
        let next = if prior == 0 {
            sample
        } else {
            (prior * 7 + sample) / 8
        };
        self.0.store(next, Ordering::Release);
    }
}

/// Grant priority for [`TokenBucket::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Queued FIFO; may only use the un-reserved slice of the bucket.
    Normal,
    /// Overtakes the queue and may use the full capacity.
    High,
}

/// A capacity-per-interval token bucket with a reserved priority slice.
///
/// At most `capacity` grants are made per `interval`; of those, `reserved`
/// are only reachable by [`Priority::High`] work. The consumed count rolls
/// over `interval + capacity × latency` after a window opens, and
/// consecutive grants are spaced by the live latency estimate.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    interval: Duration,
    reserved: u32,
    latency: Option<LatencyRef>,
    /// Queue discipline: non-priority waiters funnel through this fair
    /// mutex, so they drain strictly FIFO while priority work bypasses it.
    queue: tokio::sync::Mutex<()>,
    state: parking_lot::Mutex<BucketWindow>,
}

#[derive(Debug, Default)]
struct BucketWindow {
    consumed: u32,
    window_open: Option<Instant>,
    last_grant: Option<Instant>,
}

impl TokenBucket {
    /// A bucket granting `capacity` tokens per `interval`.
    pub fn new(capacity: u32, interval: Duration) -> Self {
        Self {
            capacity,
            interval,
            reserved: 0,
            latency: None,
            queue: tokio::sync::Mutex::new(()),
            state: parking_lot::Mutex::new(BucketWindow::default()),
        }
    }

    /// Hold back `reserved` tokens per interval for priority work.
    pub fn with_reserved(mut self, reserved: u32) -> Self {
        self.reserved = reserved.min(self.capacity);
        self
    }

    /// Space grants by a live latency estimate.
    pub fn with_latency(mut self, latency: LatencyRef) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Tokens consumed in the current window.
    pub fn consumed(&self) -> u32 {
        self.state.lock().consumed
    }

    fn latency(&self) -> Duration {
        self.latency.as_ref().map(LatencyRef::get).unwrap_or_default()
    }

    /// Wait for a token.
    pub async fn acquire(&self, priority: Priority) {
        let _turn = match priority {
            Priority::Normal => Some(self.queue.lock().await),
            Priority::High => None,
        };

        loop {
            let wait = self.try_grant(priority);
            match wait {
                None => return,
                Some(wait) => sleep(wait).await,
            }
        }
    }

    /// Take a token now, or report how long until it is worth retrying.
    fn try_grant(&self, priority: Priority) -> Option<Duration> {
        let now = Instant::now();
        let latency = self.latency();
        let window_len = self.interval + latency * self.capacity;
        let mut state = self.state.lock();

        if let Some(open) = state.window_open {
            if now >= open + window_len {
                state.consumed = state.consumed.saturating_sub(self.capacity);
                state.window_open = if state.consumed > 0 { Some(now) } else { None };
            }
        }

        let limit = match priority {
            Priority::High => self.capacity,
            Priority::Normal => self.capacity - self.reserved,
        };

        if state.consumed >= limit {
            let open = state.window_open.unwrap_or(now);
            return Some((open + window_len).saturating_duration_since(now));
        }

        if !latency.is_zero() {
            if let Some(last) = state.last_grant {
                let gap_end = last + latency;
                if now < gap_end {
                    return Some(gap_end - now);
                }
            }
        }

        state.consumed += 1;
        if state.window_open.is_none() {
            state.window_open = Some(now);
        }
        state.last_grant = Some(now);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn grants_up_to_capacity_without_waiting() {
        let bucket = TokenBucket::new(3, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..3 {
            bucket.acquire(Priority::Normal).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(bucket.consumed(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_until_window_rolls() {
        let bucket = TokenBucket::new(2, Duration::from_secs(10));
        bucket.acquire(Priority::Normal).await;
        bucket.acquire(Priority::Normal).await;

        let start = Instant::now();
        bucket.acquire(Priority::Normal).await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn reserved_slice_is_priority_only() {
        let bucket = TokenBucket::new(5, Duration::from_secs(60)).with_reserved(2);

        // Normal work may only take capacity - reserved tokens.
        for _ in 0..3 {
            bucket.acquire(Priority::Normal).await;
        }
        let start = Instant::now();
        // Priority work still gets through instantly.
        bucket.acquire(Priority::High).await;
        bucket.acquire(Priority::High).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(bucket.consumed(), 5);

        // A fourth normal acquisition waits for the next window.
        bucket.acquire(Priority::Normal).await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn latency_spaces_consecutive_grants() {
        let latency = LatencyRef::new();
        latency.record(Duration::from_millis(80));
        let bucket = TokenBucket::new(100, Duration::from_secs(60)).with_latency(latency);

        let start = Instant::now();
        bucket.acquire(Priority::Normal).await;
        bucket.acquire(Priority::Normal).await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn normal_waiters_drain_fifo() {
        let bucket = Arc::new(TokenBucket::new(1, Duration::from_millis(100)));
        bucket.acquire(Priority::Normal).await;

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let bucket = Arc::clone(&bucket);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                bucket.acquire(Priority::Normal).await;
                order.lock().push(i);
            }));
            // Let each waiter enqueue before spawning the next.
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn latency_ref_ewma() {
        let latency = LatencyRef::new();
        latency.record(Duration::from_millis(100));
        assert_eq!(latency.get(), Duration::from_millis(100));
        latency.record(Duration::from_millis(20));
        assert_eq!(latency.get(), Duration::from_millis(90));
    }
}
