use log::debug;
use rand::Rng;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

/// Default number of keys a limiter remembers
pub const DEFAULT_TABLE_CAPACITY: usize = 500;

/// Per-key cooldown tracker.
///
/// Used both as an anti-spam throttle and as an explicit cooldown: recording a
/// key with a positive offset keeps it blocked for `offset + min_interval`.
/// The table never holds more than `capacity` keys; when full, a random entry
/// is evicted to make room.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    capacity: usize,
    table: HashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self::with_capacity(min_interval, DEFAULT_TABLE_CAPACITY)
    }

    pub fn with_capacity(min_interval: Duration, capacity: usize) -> Self {
        Self {
            min_interval,
            capacity: capacity.max(1),
            table: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// True if `key` was never recorded or its interval has fully elapsed
    pub fn is_ok(&self, key: &str) -> bool {
        self.is_ok_at(key, Instant::now())
    }

    pub fn is_ok_at(&self, key: &str, now: Instant) -> bool {
        match self.table.get(key) {
            None => true,
            // A future timestamp (recorded with an offset) saturates to zero
            Some(recorded) => now.saturating_duration_since(*recorded) > self.min_interval,
        }
    }

    /// Record `now + offset` against `key`
    pub fn update(&mut self, key: &str, offset: Duration) {
        self.update_at(key, Instant::now(), offset);
    }

    pub fn update_at(&mut self, key: &str, now: Instant, offset: Duration) {
        if !self.table.contains_key(key) && self.table.len() >= self.capacity {
            self.evict_random();
        }

        self.table.insert(key.to_string(), now + offset);
    }

    fn evict_random(&mut self) {
        let index = rand::rng().random_range(0..self.table.len());
        let victim = self.table.keys().nth(index).cloned();

        if let Some(victim) = victim {
            debug!("Rate limiter table full, evicting '{}'", victim);
            self.table.remove(&victim);
        }
    }
}
