use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::Result;

const SWEEP_EVERY_OPS: u64 = 512;

/// Snapshot of a fixed-window counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterValue {
    pub count: u64,
    /// Time left before the counter is logically reset.
    pub ttl: Duration,
}

/// Outcome of a sliding-window hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlidingHit {
    /// Entries in the window after this hit (the new one included if recorded).
    pub count: u64,
    pub recorded: bool,
    /// Time until the oldest retained entry leaves the window.
    pub reset_after: Duration,
}

/// Backing store for rate-limit counters.
///
/// Every method must be a single atomic round trip: concurrent dispatch calls
/// share this store and nothing else.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key`, setting its expiry to `window` only when the counter
    /// is created (or has expired).
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<CounterValue>;

    /// Current count of a live fixed-window counter.
    async fn get(&self, key: &str) -> Result<Option<u64>>;

    /// Time left before a live counter expires.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Ordered-set primitive: drop entries older than `window`, then record a
    /// new entry if fewer than `limit` remain.
    async fn sliding_hit(&self, key: &str, window: Duration, limit: u32) -> Result<SlidingHit>;

    /// Read a sliding window without recording anything.
    async fn sliding_peek(&self, key: &str, window: Duration) -> Result<Option<CounterValue>>;

    /// Delete every key matching `pred`; returns how many were removed.
    async fn remove_where(
        &self,
        pred: &(dyn for<'k> Fn(&'k str) -> bool + Send + Sync),
    ) -> Result<usize>;
}

#[derive(Debug)]
struct Counter {
    count: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct SlidingSet {
    hits: VecDeque<Instant>,
    window: Duration,
}

impl SlidingSet {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn reset_after(&self, now: Instant) -> Duration {
        self.hits
            .front()
            .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    counters: HashMap<String, Counter>,
    sliding: HashMap<String, SlidingSet>,
    ops: u64,
}

impl MemoryState {
    fn tick(&mut self, now: Instant) {
        self.ops += 1;
        if self.ops % SWEEP_EVERY_OPS != 0 {
            return;
        }
        self.counters.retain(|_, c| c.expires_at > now);
        self.sliding.retain(|_, s| {
            s.prune(now);
            !s.hits.is_empty()
        });
    }

    fn live_counter(&mut self, key: &str, now: Instant) -> Option<&mut Counter> {
        let expired = self
            .counters
            .get(key)
            .map(|c| c.expires_at <= now)
            .unwrap_or(false);
        if expired {
            self.counters.remove(key);
        }
        self.counters.get_mut(key)
    }
}

/// In-process counter store.
///
/// Expiry is lazy (checked on access) plus a periodic sweep, and uses the
/// tokio clock so paused-time tests see counters expire.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    state: Mutex<MemoryState>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let st = self.state.lock().await;
        st.counters.len() + st.sliding.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<CounterValue> {
        let now = Instant::now();
        let mut st = self.state.lock().await;
        st.tick(now);

        let value = match st.live_counter(key, now) {
            Some(counter) => {
                counter.count += 1;
                CounterValue {
                    count: counter.count,
                    ttl: counter.expires_at.saturating_duration_since(now),
                }
            }
            None => {
                st.counters.insert(
                    key.to_string(),
                    Counter {
                        count: 1,
                        expires_at: now + window,
                    },
                );
                CounterValue {
                    count: 1,
                    ttl: window,
                }
            }
        };
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let now = Instant::now();
        let mut st = self.state.lock().await;
        Ok(st.live_counter(key, now).map(|c| c.count))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let mut st = self.state.lock().await;
        Ok(st
            .live_counter(key, now)
            .map(|c| c.expires_at.saturating_duration_since(now)))
    }

    async fn sliding_hit(&self, key: &str, window: Duration, limit: u32) -> Result<SlidingHit> {
        let now = Instant::now();
        let mut st = self.state.lock().await;
        st.tick(now);

        let set = st.sliding.entry(key.to_string()).or_default();
        set.window = window;
        set.prune(now);

        let recorded = (set.hits.len() as u64) < u64::from(limit);
        if recorded {
            set.hits.push_back(now);
        }

        Ok(SlidingHit {
            count: set.hits.len() as u64,
            recorded,
            reset_after: set.reset_after(now),
        })
    }

    async fn sliding_peek(&self, key: &str, window: Duration) -> Result<Option<CounterValue>> {
        let now = Instant::now();
        let mut st = self.state.lock().await;
        let Some(set) = st.sliding.get_mut(key) else {
            return Ok(None);
        };
        set.window = window;
        set.prune(now);
        if set.hits.is_empty() {
            st.sliding.remove(key);
            return Ok(None);
        }
        Ok(Some(CounterValue {
            count: set.hits.len() as u64,
            ttl: set.reset_after(now),
        }))
    }

    async fn remove_where(
        &self,
        pred: &(dyn for<'k> Fn(&'k str) -> bool + Send + Sync),
    ) -> Result<usize> {
        let mut st = self.state.lock().await;
        let before = st.counters.len() + st.sliding.len();
        st.counters.retain(|k, _| !pred(k));
        st.sliding.retain(|k, _| !pred(k));
        Ok(before - (st.counters.len() + st.sliding.len()))
    }
}
