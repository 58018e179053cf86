//! Shard lifecycle management.
//!
//! The [`ShardManager`] owns every shard of a deployment: it spawns them
//! through a FIFO connect queue, spaces their IDENTIFYs across
//! `max_concurrency` buckets (one per 5 seconds each), re-tags their
//! events with the shard id, and condenses per-shard lifecycle into
//! fleet-wide ready/disconnect notifications.

use crate::error::GatewayError;
use crate::event::GatewayEvent;
use crate::shard::{Shard, ShardConfig, ShardStatus};

use dashmap::DashMap;
use flume::{Receiver, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

/// Spacing between IDENTIFYs within one concurrency bucket.
const IDENTIFY_SPACING: Duration = Duration::from_secs(5);

/// Paces IDENTIFY frames across the fleet.
///
/// Shards hash into `max_concurrency` buckets by `shard_id % concurrency`;
/// each bucket admits one IDENTIFY per five seconds. The slot is released
/// when the frame goes out, not when READY comes back.
pub struct IdentifyLimiter {
    buckets: Vec<tokio::sync::Mutex<Option<Instant>>>,
}

impl IdentifyLimiter {
    pub fn new(max_concurrency: u16) -> Self {
        let buckets = (0..max_concurrency.max(1))
            .map(|_| tokio::sync::Mutex::new(None))
            .collect();
        Self { buckets }
    }

    pub fn concurrency(&self) -> u16 {
        self.buckets.len() as u16
    }

    /// Wait for the shard's bucket to admit an IDENTIFY.
    pub async fn acquire(&self, shard_id: u16) {
        let bucket = &self.buckets[shard_id as usize % self.buckets.len()];
        let mut last = bucket.lock().await;
        if let Some(previous) = *last {
            let earliest = previous + IDENTIFY_SPACING;
            if Instant::now() < earliest {
                sleep_until(earliest).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Configuration for a shard manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Per-shard settings (token, intents, gateway URL, timeouts).
    pub shard: ShardConfig,

    /// First shard ID this process runs (inclusive).
    pub first_shard: u16,

    /// Last shard ID this process runs (inclusive).
    pub last_shard: u16,

    /// Total shards across all processes.
    pub total_shards: u16,

    /// Identify concurrency from `/gateway/bot`.
    pub max_concurrency: u16,
}

impl ManagerConfig {
    /// Run every shard of a `total_shards`-wide deployment locally.
    pub fn new(shard: ShardConfig, total_shards: u16) -> Self {
        Self {
            shard,
            first_shard: 0,
            last_shard: total_shards.saturating_sub(1),
            total_shards: total_shards.max(1),
            max_concurrency: 1,
        }
    }

    /// Run only `first..=last` of the deployment.
    pub fn with_range(mut self, first: u16, last: u16) -> Self {
        self.first_shard = first;
        self.last_shard = last;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: u16) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Shard IDs this manager runs, in connect order.
    pub fn shard_ids(&self) -> Vec<u16> {
        (self.first_shard..=self.last_shard).collect()
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        self.shard.validate()?;
        if self.total_shards == 0 {
            return Err(GatewayError::Config("total_shards must be at least 1".into()));
        }
        if self.first_shard > self.last_shard {
            return Err(GatewayError::Config(format!(
                "shard range {}..={} is inverted",
                self.first_shard, self.last_shard
            )));
        }
        if self.last_shard >= self.total_shards {
            return Err(GatewayError::Config(format!(
                "last_shard {} outside total of {}",
                self.last_shard, self.total_shards
            )));
        }
        if self.max_concurrency == 0 {
            return Err(GatewayError::Config("max_concurrency must be at least 1".into()));
        }
        Ok(())
    }

    /// Resolve shard count, concurrency, and gateway URL from
    /// `GET /gateway/bot`.
    #[cfg(feature = "auto-sharding")]
    pub async fn auto(
        mut shard: ShardConfig,
        rest: &vanadium_rest::RestClient,
    ) -> Result<Self, GatewayError> {
        let info = rest.get_gateway_bot().await.map_err(|e| {
            GatewayError::Config(format!("failed to fetch /gateway/bot: {e}"))
        })?;

        shard.gateway_url = info.url;
        Ok(Self::new(shard, info.shards)
            .with_max_concurrency(info.session_start_limit.max_concurrency))
    }
}

/// Tracks fleet-wide readiness for the aggregate events.
struct Aggregate {
    total: usize,
    ready: DashMap<u16, bool>,
    ready_count: AtomicUsize,
}

enum AggregateEdge {
    None,
    AllReady,
    AllDisconnected,
}

impl Aggregate {
    fn new(total: usize) -> Self {
        Self {
            total,
            ready: DashMap::new(),
            ready_count: AtomicUsize::new(0),
        }
    }

    fn mark_ready(&self, shard_id: u16) -> AggregateEdge {
        let was = self.ready.insert(shard_id, true).unwrap_or(false);
        if !was {
            let now = self.ready_count.fetch_add(1, Ordering::SeqCst) + 1;
            if now == self.total {
                return AggregateEdge::AllReady;
            }
        }
        AggregateEdge::None
    }

    fn mark_down(&self, shard_id: u16) -> AggregateEdge {
        let was = self.ready.insert(shard_id, false).unwrap_or(false);
        if was {
            let now = self.ready_count.fetch_sub(1, Ordering::SeqCst) - 1;
            if now == 0 {
                return AggregateEdge::AllDisconnected;
            }
        }
        AggregateEdge::None
    }
}

struct ShardRunner {
    shard: Arc<Shard>,
    handle: JoinHandle<Result<(), GatewayError>>,
}

/// Spawns and supervises a range of shards.
pub struct ShardManager {
    config: ManagerConfig,
    identify: Arc<IdentifyLimiter>,
    shards: DashMap<u16, ShardRunner>,
    connect_queue: parking_lot::Mutex<VecDeque<u16>>,
    aggregate: Arc<Aggregate>,
    event_tx: Sender<(u16, GatewayEvent)>,
}

impl ShardManager {
    /// Create a manager and the receiver carrying `(shard_id, event)`
    /// pairs from every shard.
    pub fn new(
        config: ManagerConfig,
    ) -> Result<(Self, Receiver<(u16, GatewayEvent)>), GatewayError> {
        config.validate()?;

        let (event_tx, event_rx) = flume::unbounded();
        let identify = Arc::new(IdentifyLimiter::new(config.max_concurrency));
        let aggregate = Arc::new(Aggregate::new(config.shard_ids().len()));
        let connect_queue = parking_lot::Mutex::new(config.shard_ids().into());

        Ok((
            Self {
                config,
                identify,
                shards: DashMap::new(),
                connect_queue,
                aggregate,
                event_tx,
            },
            event_rx,
        ))
    }

    /// Start every queued shard, in FIFO order.
    ///
    /// Spawning is immediate; the identify limiter inside each shard
    /// provides the actual 5-second-per-bucket pacing.
    pub fn start(&self) -> Result<(), GatewayError> {
        info!(
            first = self.config.first_shard,
            last = self.config.last_shard,
            total = self.config.total_shards,
            max_concurrency = self.config.max_concurrency,
            "starting shards"
        );

        loop {
            let next = self.connect_queue.lock().pop_front();
            match next {
                Some(shard_id) => self.spawn(shard_id)?,
                None => return Ok(()),
            }
        }
    }

    /// Lazily create and launch one shard.
    pub fn spawn(&self, shard_id: u16) -> Result<(), GatewayError> {
        if self.shards.contains_key(&shard_id) {
            return Ok(());
        }

        let shard = Arc::new(Shard::with_identify_limiter(
            shard_id,
            self.config.total_shards,
            self.config.shard.clone(),
            Arc::clone(&self.identify),
        )?);

        let (shard_tx, shard_rx) = flume::unbounded::<GatewayEvent>();

        // Forwarding task: re-tag events with the shard id and fold
        // lifecycle transitions into the fleet aggregate.
        let manager_tx = self.event_tx.clone();
        let aggregate = Arc::clone(&self.aggregate);
        tokio::spawn(async move {
            while let Ok(event) = shard_rx.recv_async().await {
                let edge = match &event {
                    GatewayEvent::ShardReady { .. } | GatewayEvent::ShardResumed => {
                        aggregate.mark_ready(shard_id)
                    }
                    GatewayEvent::ShardDisconnected { .. } => aggregate.mark_down(shard_id),
                    _ => AggregateEdge::None,
                };

                if manager_tx.send_async((shard_id, event)).await.is_err() {
                    break;
                }

                let aggregate_event = match edge {
                    AggregateEdge::AllReady => Some(GatewayEvent::AllShardsReady),
                    AggregateEdge::AllDisconnected => Some(GatewayEvent::AllShardsDisconnected),
                    AggregateEdge::None => None,
                };
                if let Some(event) = aggregate_event {
                    if manager_tx.send_async((shard_id, event)).await.is_err() {
                        break;
                    }
                }
            }
        });

        let shard_task = Arc::clone(&shard);
        let handle = tokio::spawn(async move {
            let result = shard_task.run(shard_tx).await;
            if let Err(ref err) = result {
                error!(shard_id, error = %err, "shard terminated");
            }
            result
        });

        self.shards.insert(shard_id, ShardRunner { shard, handle });
        info!(shard_id, "shard spawned");
        Ok(())
    }

    /// Status of one shard.
    pub fn shard_status(&self, shard_id: u16) -> Option<ShardStatus> {
        self.shards.get(&shard_id).map(|r| r.shard.status())
    }

    /// Latency of one shard.
    pub fn shard_latency(&self, shard_id: u16) -> Option<Duration> {
        self.shards.get(&shard_id).map(|r| r.shard.latency())
    }

    /// IDs of the shards currently spawned.
    pub fn shard_ids(&self) -> Vec<u16> {
        self.shards.iter().map(|r| *r.key()).collect()
    }

    /// Send a gateway frame through a specific shard.
    pub fn send(
        &self,
        shard_id: u16,
        op: crate::opcode::OpCode,
        data: impl serde::Serialize,
    ) -> Result<(), GatewayError> {
        match self.shards.get(&shard_id) {
            Some(runner) => runner.shard.send(op, data),
            None => Err(GatewayError::Config(format!("shard {shard_id} not spawned"))),
        }
    }

    /// The shard serving a guild: `(guild_id >> 22) % total`.
    pub fn shard_for_guild(&self, guild_id: vanadium_model::Snowflake) -> u16 {
        ((guild_id.get() >> 22) % u64::from(self.config.total_shards)) as u16
    }

    /// Gracefully close every shard (close 1000, no reconnect) and wait
    /// for their tasks to finish.
    pub async fn shutdown(&self) {
        info!("shutting down shards");

        for runner in self.shards.iter() {
            runner.shard.shutdown();
        }

        for mut entry in self.shards.iter_mut() {
            let runner = entry.value_mut();
            if let Err(err) = (&mut runner.handle).await {
                warn!(shard_id = *entry.key(), error = %err, "shard task panicked");
            }
        }

        info!("all shards stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vanadium_model::Intents;

    fn config(total: u16) -> ManagerConfig {
        ManagerConfig::new(ShardConfig::new("token", Intents::default()), total)
    }

    #[test]
    fn range_validation() {
        assert!(config(4).validate().is_ok());
        assert!(config(4).with_range(3, 1).validate().is_err());
        assert!(config(4).with_range(0, 4).validate().is_err());
        assert!(config(4).with_max_concurrency(0).validate().is_err());
    }

    #[test]
    fn shard_ids_cover_range() {
        let config = config(8).with_range(2, 5);
        assert_eq!(config.shard_ids(), vec![2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn identify_buckets_space_same_bucket_only() {
        let limiter = IdentifyLimiter::new(2);

        let start = Instant::now();
        // Shards 0 and 1 land in different buckets: no spacing.
        limiter.acquire(0).await;
        limiter.acquire(1).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Shard 2 shares bucket 0 and must wait out the 5 seconds.
        limiter.acquire(2).await;
        assert!(start.elapsed() >= IDENTIFY_SPACING);
    }

    #[tokio::test]
    async fn aggregate_edges() {
        let aggregate = Aggregate::new(2);
        assert!(matches!(aggregate.mark_ready(0), AggregateEdge::None));
        assert!(matches!(aggregate.mark_ready(1), AggregateEdge::AllReady));
        // Re-marking a ready shard is not an edge.
        assert!(matches!(aggregate.mark_ready(1), AggregateEdge::None));
        assert!(matches!(aggregate.mark_down(0), AggregateEdge::None));
        assert!(matches!(aggregate.mark_down(1), AggregateEdge::AllDisconnected));
    }

    #[test]
    fn guild_to_shard_mapping() {
        let (manager, _rx) = ShardManager::new(config(4)).unwrap();
        let id = vanadium_model::Snowflake::new(175928847299117063);
        assert_eq!(
            manager.shard_for_guild(id),
            ((175928847299117063u64 >> 22) % 4) as u16
        );
    }
}
