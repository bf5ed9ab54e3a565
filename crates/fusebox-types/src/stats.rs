//! Persisted stats records and in-memory metrics snapshots.

use crate::state::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The record persisted in the coordination store, one per service key.
///
/// This is the wire contract between fleet members: a self-describing
/// JSON object whose absent optional fields deserialize to null/0, so a
/// peer running an older build can still read a newer record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitStats {
    /// Current circuit state
    #[serde(default)]
    pub state: CircuitState,
    /// Consecutive failures driving the threshold check; reset to 0 on
    /// entering Closed or HalfOpen
    #[serde(default)]
    pub failure_count: u32,
    /// When the most recent failure was recorded
    #[serde(default)]
    pub last_failure_time: Option<DateTime<Utc>>,
    /// When the most recent success was recorded
    #[serde(default)]
    pub last_success_time: Option<DateTime<Utc>>,
    /// When any field of this record was last written
    #[serde(default)]
    pub last_update_time: Option<DateTime<Utc>>,
    /// Message of the most recent failure
    #[serde(default)]
    pub last_error: Option<String>,
    /// Lifetime request count (monotonic)
    #[serde(default)]
    pub total_requests: u64,
    /// Lifetime success count (monotonic)
    #[serde(default)]
    pub successful_requests: u64,
    /// Lifetime failure count (monotonic)
    #[serde(default)]
    pub failed_requests: u64,
    /// In-flight calls at the reporting instance (advisory, present-value)
    #[serde(default)]
    pub current_load: u32,
    /// Rolling average response time in milliseconds (advisory)
    #[serde(default)]
    pub average_response_time_ms: f64,
    /// Requests observed in the reporting instance's last minute (advisory)
    #[serde(default)]
    pub last_minute_requests: u64,
}

impl CircuitStats {
    /// A fresh record for a key seen for the first time: Closed, zero
    /// counters, `last_success_time = now`.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            last_success_time: Some(now),
            last_update_time: Some(now),
            last_error: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            current_load: 0,
            average_response_time_ms: 0.0,
            last_minute_requests: 0,
        }
    }
}

/// Totals over the trailing 60-second window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WindowTotals {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
}

/// Point-in-time view of a breaker's in-memory metrics window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Requests per second over the last 5 seconds
    pub request_rate: f64,
    /// Errors per second over the last 5 seconds
    pub error_rate: f64,
    /// Average over the last ≤100 response-time samples, in milliseconds
    pub average_response_time_ms: f64,
    /// In-flight calls at snapshot time
    pub current_load: u32,
    /// Trailing-minute totals
    pub last_minute: WindowTotals,
}
