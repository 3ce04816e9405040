// ── Manager configuration ──
//
// Plain runtime settings handed to the manager at construction time.
// The config crate builds this from files and environment; tests build
// it directly.

use std::time::Duration;

/// Exponential backoff between discovery attempts.
///
/// Attempt `n` (zero-based) waits `first × factor^n`, clamped to `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(2),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = if self.factor.is_finite() && self.factor >= 1.0 {
            self.factor
        } else {
            1.0
        };
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.first.as_secs_f64() * factor.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs).min(self.max)
    }
}

/// Knobs for discovery, enumeration and polling.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Bound on a single request/response exchange.
    pub request_timeout: Duration,
    /// Total tries per discovery command (first attempt included).
    pub discovery_attempts: u32,
    pub retry: RetryPolicy,
    /// Upper bound on records read during one enumeration.
    pub max_records: usize,
    /// Default cadence of the per-terminus polling loop.
    pub poll_interval: Duration,
    /// Consecutive failed reads before a terminus is marked unavailable.
    pub failure_threshold: u32,
    /// When set, a faulted terminus is re-enabled after this long.
    pub fault_cooldown: Option<Duration>,
    /// Capacity of the manager event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            discovery_attempts: 3,
            retry: RetryPolicy::default(),
            max_records: 1024,
            poll_interval: Duration::from_secs(1),
            failure_threshold: 3,
            fault_cooldown: None,
            event_capacity: 256,
        }
    }
}
