//! Client-side write limits per directory.
//!
//! A [`DirectoryGate`] bounds how many batches are in flight against one
//! directory and, when configured, how many writes start per minute.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::config::DirectoryConfig;

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

/// Token bucket refilled at a fixed interval.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_rate: u64,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket of `capacity` tokens gaining `refill_rate` tokens every
    /// `refill_interval`.
    #[must_use]
    pub fn new(capacity: u64, refill_rate: u64, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_rate,
            refill_interval,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket allowing `writes_per_minute`, refilled every second.
    #[must_use]
    pub fn per_minute(writes_per_minute: u64) -> Self {
        let refill_rate = writes_per_minute.div_ceil(60).max(1);
        Self::new(writes_per_minute.max(1), refill_rate, Duration::from_secs(1))
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed();
        if elapsed < self.refill_interval {
            return;
        }
        let intervals = (elapsed.as_secs_f64() / self.refill_interval.as_secs_f64()) as u64;
        let added = intervals.saturating_mul(self.refill_rate);
        if added > 0 {
            state.tokens = state.tokens.saturating_add(added).min(self.capacity);
            state.last_refill = Instant::now();
        }
    }

    /// Take `count` tokens if available.
    pub async fn try_acquire_many(&self, count: u64) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens < count {
            return false;
        }
        state.tokens -= count;
        true
    }

    pub async fn try_acquire(&self) -> bool {
        self.try_acquire_many(1).await
    }

    /// Take one token, waiting for a refill if necessary.
    pub async fn acquire(&self) {
        while !self.try_acquire().await {
            trace!("Write budget exhausted, waiting for refill");
            tokio::time::sleep(self.refill_interval / 10).await;
        }
    }

    pub async fn available(&self) -> u64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }
}

/// Concurrency and rate limits for one directory.
#[derive(Debug, Clone)]
pub struct DirectoryGate {
    permits: Arc<Semaphore>,
    bucket: Option<Arc<TokenBucket>>,
}

impl DirectoryGate {
    #[must_use]
    pub fn new(max_concurrency: usize, writes_per_minute: Option<u32>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            bucket: writes_per_minute.map(|rpm| Arc::new(TokenBucket::per_minute(u64::from(rpm)))),
        }
    }

    #[must_use]
    pub fn from_config(config: &DirectoryConfig) -> Self {
        Self::new(config.max_concurrency, config.rate_limit_per_minute)
    }

    /// Wait for a batch slot. The slot is held until the permit is dropped.
    pub async fn enter(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).acquire_owned().await.ok()
    }

    /// Wait for write budget, if a rate limit is configured.
    pub async fn throttle(&self) {
        if let Some(bucket) = &self.bucket {
            bucket.acquire().await;
        }
    }

    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }
}
