//! Breaker event kinds and payloads.

use crate::state::CircuitState;
use crate::stats::{CircuitStats, MetricsSnapshot};
use std::time::Duration;

/// The fixed set of event kinds a breaker publishes. Subscriber lists
/// are keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChange,
    CircuitOpen,
    Failure,
    Success,
    Timeout,
    Rejected,
    Metrics,
    HealthCheck,
    StateUpdate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateChange => "state_change",
            Self::CircuitOpen => "circuit_open",
            Self::Failure => "failure",
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
            Self::Metrics => "metrics",
            Self::HealthCheck => "health_check",
            Self::StateUpdate => "state_update",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payloads, tagged by kind.
#[derive(Debug, Clone)]
pub enum BreakerEvent {
    /// A persisted state transition; emitted after the store write succeeds
    StateChange { service: String, from: CircuitState, to: CircuitState },
    /// Edge-triggered when the circuit enters Open
    CircuitOpen { service: String, error: String },
    /// A counted execution failure
    Failure { service: String, error: String, stats: CircuitStats },
    /// A counted success with its measured response time
    Success { service: String, response_time: Duration, stats: CircuitStats },
    /// The per-call deadline elapsed
    Timeout { service: String, error: String, stats: CircuitStats },
    /// Admission rejection (open circuit or overload); no counters moved
    Rejected { service: String, error: String, stats: Option<CircuitStats> },
    /// Periodic metrics snapshot
    Metrics { service: String, snapshot: MetricsSnapshot },
    /// Periodic health-check observation
    HealthCheck { service: String, stats: CircuitStats },
    /// Forwarded from a store watch: another writer changed the record
    StateUpdate { service: String, stats: CircuitStats },
}

impl BreakerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StateChange { .. } => EventKind::StateChange,
            Self::CircuitOpen { .. } => EventKind::CircuitOpen,
            Self::Failure { .. } => EventKind::Failure,
            Self::Success { .. } => EventKind::Success,
            Self::Timeout { .. } => EventKind::Timeout,
            Self::Rejected { .. } => EventKind::Rejected,
            Self::Metrics { .. } => EventKind::Metrics,
            Self::HealthCheck { .. } => EventKind::HealthCheck,
            Self::StateUpdate { .. } => EventKind::StateUpdate,
        }
    }

    /// The service key the event concerns.
    pub fn service(&self) -> &str {
        match self {
            Self::StateChange { service, .. }
            | Self::CircuitOpen { service, .. }
            | Self::Failure { service, .. }
            | Self::Success { service, .. }
            | Self::Timeout { service, .. }
            | Self::Rejected { service, .. }
            | Self::Metrics { service, .. }
            | Self::HealthCheck { service, .. }
            | Self::StateUpdate { service, .. } => service,
        }
    }
}
