//! HTTP rate limiting.
//!
//! Implements Discord's bucket-based rate limiting: requests sharing a
//! `(bucket hash, major parameter)` pair are serialized, one in flight at
//! a time, and the next request is scheduled from the `X-RateLimit-*`
//! headers of the previous response. Bucket hashes are discovered at
//! runtime from `X-RateLimit-Bucket`; until then the route template keys
//! the bucket, and several templates may later collapse onto one hash.

use crate::routes::RouteKey;
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::MutexGuard;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

/// Rate limiter for Discord API requests.
pub struct RateLimiter {
    /// Discovered bucket hashes, keyed by `method template`.
    hashes: DashMap<String, String>,
    /// Live buckets, keyed by `hash-or-template:major`.
    buckets: DashMap<String, Arc<RouteBucket>>,
    /// Instant until which the global limit blocks non-priority traffic.
    global_until: Mutex<Option<Instant>>,
    /// Clock-skew compensation added to every computed reset.
    offset: Duration,
}

/// State for one `(hash, major)` bucket.
pub struct RouteBucket {
    /// Serializes requests: held for the full request/response cycle,
    /// released only after the response headers have been recorded.
    serial: tokio::sync::Mutex<()>,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    limit: u32,
    remaining: u32,
    reset_at: Option<Instant>,
}

impl RouteBucket {
    fn new() -> Self {
        Self {
            serial: tokio::sync::Mutex::new(()),
            state: Mutex::new(BucketState {
                limit: u32::MAX,
                remaining: u32::MAX,
                reset_at: None,
            }),
        }
    }

    /// Remaining requests before the bucket is exhausted.
    pub fn remaining(&self) -> u32 {
        self.state.lock().remaining
    }

    /// How long until the bucket resets, if it is exhausted.
    pub fn time_to_reset(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .reset_at
            .and_then(|at| at.checked_duration_since(Instant::now()))
    }
}

impl RateLimiter {
    /// Create a rate limiter with the given clock-skew offset.
    pub fn new(offset: Duration) -> Self {
        Self {
            hashes: DashMap::new(),
            buckets: DashMap::new(),
            global_until: Mutex::new(None),
            offset,
        }
    }

    /// Resolve the live bucket for a route, following any hash alias.
    pub fn bucket(&self, key: &RouteKey) -> Arc<RouteBucket> {
        let id = self.bucket_id(key);
        self.buckets
            .entry(id)
            .or_insert_with(|| Arc::new(RouteBucket::new()))
            .clone()
    }

    fn route_id(key: &RouteKey) -> String {
        format!("{} {}", key.method, key.bucket)
    }

    fn bucket_id(&self, key: &RouteKey) -> String {
        let route_id = Self::route_id(key);
        match self.hashes.get(&route_id) {
            Some(hash) => format!("{}:{}", hash.value(), key.major),
            None => format!("{}:{}", route_id, key.major),
        }
    }

    /// Take the bucket's turn: wait out the global limit (unless the
    /// request is priority), join the FIFO queue, and sleep through any
    /// known exhaustion window. The returned guard must be held until the
    /// response headers have been recorded.
    pub async fn acquire<'a>(
        &self,
        bucket: &'a RouteBucket,
        priority: bool,
    ) -> MutexGuard<'a, ()> {
        if !priority {
            self.wait_global().await;
        }

        // tokio's Mutex queues waiters fairly, which gives strict FIFO
        // dispatch within a bucket.
        let guard = bucket.serial.lock().await;

        let wait = {
            let state = bucket.state.lock();
            if state.remaining == 0 {
                state
                    .reset_at
                    .and_then(|at| at.checked_duration_since(Instant::now()))
            } else {
                None
            }
        };

        if let Some(wait) = wait {
            trace!(wait_ms = wait.as_millis() as u64, "bucket exhausted, sleeping");
            sleep(wait).await;
        }

        guard
    }

    /// Record the `X-RateLimit-*` headers of a completed response.
    ///
    /// Learns the bucket hash (re-keying the bucket so later requests on
    /// aliased templates share it) and updates remaining/reset state.
    pub fn record(&self, key: &RouteKey, headers: &HeaderMap) {
        if let Some(hash) = header_str(headers, "x-ratelimit-bucket") {
            self.alias(key, hash);
        }

        let Some(remaining) = header_parse::<u32>(headers, "x-ratelimit-remaining") else {
            return;
        };

        let bucket = self.bucket(key);
        let mut state = bucket.state.lock();
        state.remaining = remaining;

        if let Some(limit) = header_parse::<u32>(headers, "x-ratelimit-limit") {
            state.limit = limit;
        }

        if let Some(reset_after) = header_parse::<f64>(headers, "x-ratelimit-reset-after") {
            state.reset_at =
                Some(Instant::now() + Duration::from_secs_f64(reset_after.max(0.0)) + self.offset);
        }

        trace!(
            bucket = %key.bucket,
            major = %key.major,
            remaining = state.remaining,
            limit = state.limit,
            "recorded rate limit headers"
        );
    }

    fn alias(&self, key: &RouteKey, hash: &str) {
        let route_id = Self::route_id(key);
        let previous = self.hashes.insert(route_id.clone(), hash.to_string());

        if previous.as_deref() == Some(hash) {
            return;
        }

        // First sighting of this hash for the route: migrate any state
        // accumulated under the template key so waiters and counters
        // carry over.
        let old_id = format!("{}:{}", route_id, key.major);
        let new_id = format!("{}:{}", hash, key.major);
        if let Some((_, bucket)) = self.buckets.remove(&old_id) {
            self.buckets.entry(new_id).or_insert(bucket);
            debug!(route = %route_id, hash = %hash, "route aliased to bucket hash");
        }
    }

    /// Block all non-priority traffic until `retry_after` from now.
    pub fn set_global(&self, retry_after: Duration) {
        warn!(retry_after_ms = retry_after.as_millis() as u64, "global rate limit hit");
        let until = Instant::now() + retry_after + self.offset;
        let mut global = self.global_until.lock();
        if global.map_or(true, |current| until > current) {
            *global = Some(until);
        }
    }

    /// Sleep while a global rate limit is in effect.
    pub async fn wait_global(&self) {
        loop {
            let wait = {
                let global = self.global_until.lock();
                global.and_then(|until| until.checked_duration_since(Instant::now()))
            };
            match wait {
                Some(wait) => sleep(wait).await,
                None => return,
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_parse<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    header_str(headers, name).and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use reqwest::Method;

    fn key(path: &str) -> RouteKey {
        RouteKey::classify(Method::GET, path)
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                reqwest::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_sleeps_until_reset() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let key = key("/channels/1234567890/messages");

        limiter.record(
            &key,
            &headers(&[
                ("x-ratelimit-remaining", "0"),
                ("x-ratelimit-reset-after", "2.500"),
                ("x-ratelimit-bucket", "abc"),
            ]),
        );

        // Hash alias must point at the same state.
        let aliased = limiter.bucket(&key);
        assert_eq!(aliased.remaining(), 0);

        let start = tokio::time::Instant::now();
        let _guard = limiter.acquire(&aliased, false).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(2500), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_bucket_does_not_wait() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let key = key("/gateway/bot");
        let bucket = limiter.bucket(&key);

        let start = tokio::time::Instant::now();
        let _guard = limiter.acquire(&bucket, false).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn global_blocks_non_priority_only() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let key = key("/users/@me");
        let bucket = limiter.bucket(&key);

        limiter.set_global(Duration::from_secs(3));

        let start = tokio::time::Instant::now();
        drop(limiter.acquire(&bucket, true).await);
        assert_eq!(start.elapsed(), Duration::ZERO, "priority must bypass global");

        drop(limiter.acquire(&bucket, false).await);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn aliased_templates_share_a_bucket() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let a = RouteKey::classify(Method::GET, "/channels/1234567890/messages");
        let b = RouteKey::classify(Method::GET, "/channels/1234567890/pins");

        limiter.record(
            &a,
            &headers(&[
                ("x-ratelimit-remaining", "3"),
                ("x-ratelimit-bucket", "shared-hash"),
            ]),
        );
        limiter.record(
            &b,
            &headers(&[
                ("x-ratelimit-remaining", "2"),
                ("x-ratelimit-bucket", "shared-hash"),
            ]),
        );

        let a_bucket = limiter.bucket(&a);
        let b_bucket = limiter.bucket(&b);
        assert!(Arc::ptr_eq(&a_bucket, &b_bucket));
        assert_eq!(a_bucket.remaining(), 2);
    }
}
