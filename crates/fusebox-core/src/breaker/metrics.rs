// Sliding-window metrics: bounded deques of time marks and response
// samples. f64 precision loss is acceptable for rate heuristics.
#![allow(
    clippy::cast_precision_loss,
    clippy::as_conversions,
    reason = "rates and averages are advisory, bounded well below 2^52"
)]

use fusebox_types::{MetricsSnapshot, WindowTotals};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Marks older than this are pruned from the minute window.
const MINUTE_WINDOW: Duration = Duration::from_secs(60);
/// Rates are computed over this trailing window.
const RATE_WINDOW: Duration = Duration::from_secs(5);
/// Response-time samples contributing to the rolling average.
const RESPONSE_SAMPLES: usize = 100;

#[derive(Default)]
struct WindowInner {
    request_marks: VecDeque<Instant>,
    success_marks: VecDeque<Instant>,
    error_marks: VecDeque<Instant>,
    response_times: VecDeque<Duration>,
}

impl WindowInner {
    fn prune(&mut self, now: Instant) {
        for marks in [&mut self.request_marks, &mut self.success_marks, &mut self.error_marks] {
            while marks.front().is_some_and(|t| now.duration_since(*t) > MINUTE_WINDOW) {
                marks.pop_front();
            }
        }
    }
}

fn count_within(marks: &VecDeque<Instant>, now: Instant, window: Duration) -> usize {
    marks.iter().rev().take_while(|t| now.duration_since(**t) <= window).count()
}

/// Per-breaker sliding-window metrics. Owned exclusively by its breaker;
/// external callers only ever see [`MetricsSnapshot`]s.
#[derive(Default)]
pub struct MetricsWindow {
    inner: Mutex<WindowInner>,
}

impl MetricsWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a call admitted.
    pub fn record_request_start(&self) {
        let mut inner = self.inner.lock();
        inner.request_marks.push_back(Instant::now());
    }

    /// Mark a successful outcome with its measured response time.
    pub fn record_success(&self, response_time: Duration) {
        let mut inner = self.inner.lock();
        inner.success_marks.push_back(Instant::now());
        inner.response_times.push_back(response_time);
        while inner.response_times.len() > RESPONSE_SAMPLES {
            inner.response_times.pop_front();
        }
    }

    /// Mark a failed outcome (thunk error or timeout).
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.error_marks.push_back(Instant::now());
    }

    /// Average of the retained response samples, in milliseconds.
    pub fn average_response_time_ms(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.response_times.is_empty() {
            return 0.0;
        }
        let total: Duration = inner.response_times.iter().sum();
        total.as_secs_f64() * 1000.0 / inner.response_times.len() as f64
    }

    /// Requests observed in the trailing minute.
    pub fn last_minute_requests(&self) -> u64 {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.prune(now);
        inner.request_marks.len() as u64
    }

    /// Prune the windows and compute a snapshot. `current_load` is the
    /// caller's in-flight count, which lives outside this window.
    pub fn snapshot(&self, current_load: u32) -> MetricsSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.prune(now);

        let rate_secs = RATE_WINDOW.as_secs_f64();
        MetricsSnapshot {
            request_rate: count_within(&inner.request_marks, now, RATE_WINDOW) as f64 / rate_secs,
            error_rate: count_within(&inner.error_marks, now, RATE_WINDOW) as f64 / rate_secs,
            average_response_time_ms: if inner.response_times.is_empty() {
                0.0
            } else {
                let total: Duration = inner.response_times.iter().sum();
                total.as_secs_f64() * 1000.0 / inner.response_times.len() as f64
            },
            current_load,
            last_minute: WindowTotals {
                total: inner.request_marks.len() as u64,
                success: inner.success_marks.len() as u64,
                failure: inner.error_marks.len() as u64,
            },
        }
    }
}

impl std::fmt::Debug for MetricsWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MetricsWindow")
            .field("requests", &inner.request_marks.len())
            .field("errors", &inner.error_marks.len())
            .field("samples", &inner.response_times.len())
            .finish()
    }
}
