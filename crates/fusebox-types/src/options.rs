//! Breaker and group configuration.

use std::time::Duration;

/// Default shard fan-out for a service group.
pub const DEFAULT_SHARD_COUNT: usize = 4;

/// Immutable per-breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerOptions {
    /// Consecutive failures in Closed that trip the circuit to Open
    pub failure_threshold: u32,
    /// Minimum time spent Open before HalfOpen is considered
    pub reset_timeout: Duration,
    /// Probe calls admitted concurrently while HalfOpen
    pub half_open_retry_limit: u32,
    /// Upper bound on the health-check cadence; the effective period is
    /// `min(monitor_interval, reset_timeout / 2)`
    pub monitor_interval: Duration,
    /// Per-call deadline; `Duration::ZERO` disables the timeout
    pub service_timeout: Duration,
    /// Cap on in-flight calls per breaker instance; 0 disables the cap
    pub max_concurrent: usize,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_retry_limit: 1,
            monitor_interval: Duration::from_secs(30),
            service_timeout: Duration::from_secs(5),
            max_concurrent: 10_000,
        }
    }
}

impl BreakerOptions {
    /// Health-check period: `min(monitor_interval, reset_timeout / 2)`,
    /// so the Open → HalfOpen transition is observed promptly.
    pub fn effective_monitor_interval(&self) -> Duration {
        self.monitor_interval.min(self.reset_timeout / 2)
    }
}

/// Configuration for creating a sharded service group.
#[derive(Debug, Clone, Default)]
pub struct GroupConfig {
    /// Logical service name; shard keys are `{name}-{i}`
    pub name: String,
    /// Shard fan-out; `None` means [`DEFAULT_SHARD_COUNT`]
    pub shard_count: Option<usize>,
    /// Per-group override of the factory's base options
    pub options: Option<BreakerOptions>,
}

impl GroupConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), shard_count: None, options: None }
    }

    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = Some(shard_count);
        self
    }

    pub fn with_options(mut self, options: BreakerOptions) -> Self {
        self.options = Some(options);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let opts = BreakerOptions::default();
        assert_eq!(opts.failure_threshold, 5);
        assert_eq!(opts.reset_timeout, Duration::from_secs(60));
        assert_eq!(opts.half_open_retry_limit, 1);
        assert_eq!(opts.monitor_interval, Duration::from_secs(30));
        assert_eq!(opts.service_timeout, Duration::from_secs(5));
        assert_eq!(opts.max_concurrent, 10_000);
    }

    #[test]
    fn monitor_interval_is_capped_by_half_reset_timeout() {
        let opts = BreakerOptions {
            reset_timeout: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(30),
            ..Default::default()
        };
        assert_eq!(opts.effective_monitor_interval(), Duration::from_secs(5));

        let opts = BreakerOptions {
            reset_timeout: Duration::from_secs(120),
            monitor_interval: Duration::from_secs(30),
            ..Default::default()
        };
        assert_eq!(opts.effective_monitor_interval(), Duration::from_secs(30));
    }
}
