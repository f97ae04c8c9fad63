use super::level::LEVELS;
use super::Level;
use serde::Deserialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

// counters per level; messages hashing to the same slot share a counter
const SLOTS: usize = 4096;

/// Flood control for repeated log messages.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Window after which every counter starts over.
    #[serde(with = "crate::config::duration_ms")]
    pub tick: Duration,
    /// Occurrences of a message passed per window.
    pub first: u64,
    /// After `first`, every `thereafter`-th occurrence is passed. Zero drops
    /// them all.
    pub thereafter: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            tick: Duration::from_secs(1),
            first: 100,
            thereafter: 100,
        }
    }
}

#[derive(Debug, Default)]
struct Counter {
    reset_at: AtomicI64,
    count: AtomicU64,
}

impl Counter {
    fn incr_check_reset(&self, now: i64, tick: i64) -> u64 {
        let reset_at = self.reset_at.load(Ordering::Acquire);
        if reset_at > now {
            return self.count.fetch_add(1, Ordering::AcqRel) + 1;
        }

        self.count.store(1, Ordering::Release);
        if self
            .reset_at
            .compare_exchange(reset_at, now + tick, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // another caller reset the window first
            return self.count.fetch_add(1, Ordering::AcqRel) + 1;
        }
        1
    }
}

/// Per (level, message) sampler in the manner of zap's sampling core.
///
/// Lock free: each check is a hash plus a few atomic operations on a fixed
/// counter table.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    origin: Instant,
    counters: Box<[Counter]>,
}

impl RateLimiter {
    /// Creates a limiter with all counters at zero.
    pub fn new(config: RateLimitConfig) -> Self {
        let counters = (0..LEVELS * SLOTS).map(|_| Counter::default()).collect();
        RateLimiter {
            config,
            origin: Instant::now(),
            counters,
        }
    }

    /// Counts one occurrence of `message` at `level` and reports whether it
    /// should be emitted.
    pub fn allow(&self, level: Level, message: &str) -> bool {
        self.check_at(level, message, Instant::now())
    }

    fn check_at(&self, level: Level, message: &str, now: Instant) -> bool {
        let slot = fnv32a(message) as usize % SLOTS;
        let counter = &self.counters[level.index() * SLOTS + slot];
        let now = now.saturating_duration_since(self.origin).as_nanos() as i64;
        let tick = self.config.tick.as_nanos() as i64;

        let n = counter.incr_check_reset(now, tick);
        if n <= self.config.first {
            return true;
        }
        self.config.thereafter != 0 && (n - self.config.first) % self.config.thereafter == 0
    }
}

fn fnv32a(s: &str) -> u32 {
    const OFFSET: u32 = 2_166_136_261;
    const PRIME: u32 = 16_777_619;
    s.bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(PRIME))
}
