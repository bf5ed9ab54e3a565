//! Unified error types for fusebox operations.

use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by a caller-supplied service thunk.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the coordination store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend I/O failed (connection, read, write).
    #[error("Store I/O error: {0}")]
    Io(String),

    /// A stats record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The store has been closed; no further operations are accepted.
    #[error("Store is closed")]
    Closed,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by breaker, group and factory operations.
#[derive(Debug, Error)]
pub enum BreakerError {
    /// Rejected at admission: the circuit is open and the cool-down has
    /// not elapsed.
    #[error("Circuit '{service}' is open")]
    CircuitOpen { service: String },

    /// Rejected at admission: the in-flight cap is reached.
    #[error("Circuit '{service}' is overloaded (limit: {limit})")]
    Overloaded { service: String, limit: usize },

    /// The per-call deadline elapsed before the service responded.
    #[error("Service timeout")]
    ServiceTimeout { service: String, timeout: Duration },

    /// The service thunk itself failed; the original error is the source.
    #[error("Service call failed: {source}")]
    Service {
        #[source]
        source: BoxError,
    },

    /// No group is registered under this name.
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// Shard index outside the group's fan-out.
    #[error("Invalid shard {shard_id} for service '{service}' ({shard_count} shards)")]
    InvalidShard { service: String, shard_id: usize, shard_count: usize },

    /// A group with this name is already registered.
    #[error("Service group already exists: {0}")]
    AlreadyExists(String),

    /// Store failure surfaced from a registry or introspection path.
    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

impl BreakerError {
    /// True for admission rejections caused by an open circuit.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, BreakerError::CircuitOpen { .. })
    }

    /// The message recorded as `last_error` in the persisted stats: the
    /// wrapped error's own message for thunk failures, the display form
    /// otherwise.
    pub fn stats_message(&self) -> String {
        match self {
            BreakerError::Service { source } => source.to_string(),
            other => other.to_string(),
        }
    }
}

pub type BreakerResult<T> = Result<T, BreakerError>;
