//! Coordination store contract.
//!
//! The store is the external collaborator that makes the breaker
//! distributed: a watchable key/value mapping from service key to
//! [`CircuitStats`]. Concrete drivers (etcd, Redis, Consul) live outside
//! this crate; [`memory::MemoryStateStore`] is the in-tree
//! implementation used as the default and as the test double.

pub mod memory;

use async_trait::async_trait;
use fusebox_types::{CircuitStats, StoreResult};
use std::sync::Arc;

/// Namespace prefixed to every service key by store implementations.
pub const KEY_NAMESPACE: &str = "circuit-breaker/";

/// Callback invoked with the latest stats whenever a record changes.
/// Must not block: delivery happens on the mutating path.
pub type WatchCallback = Arc<dyn Fn(CircuitStats) + Send + Sync>;

/// Durable, watchable mapping from service key to stats record.
///
/// Keys passed in are bare service keys; implementations prepend
/// [`KEY_NAMESPACE`] when talking to the backend. Values are the
/// canonical JSON form of [`CircuitStats`] (see `fusebox-types`).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Point read. Returns `None` if the key has never been written.
    async fn get(&self, key: &str) -> StoreResult<Option<CircuitStats>>;

    /// Unconditional write.
    async fn put(&self, key: &str, stats: CircuitStats) -> StoreResult<()>;

    /// Read-modify-write that increments `failure_count`,
    /// `failed_requests` and `total_requests`, stamps
    /// `last_failure_time = now`, writes back and returns the new
    /// `failure_count`. A missing key materializes a fresh record with
    /// those counters at 1.
    ///
    /// Backends with compare-and-swap should loop on CAS so concurrent
    /// writers don't lose increments; last-writer-wins backends are
    /// acceptable, the count is advisory under cross-process contention.
    async fn increment_failure(&self, key: &str) -> StoreResult<u32>;

    /// Zeroes `failure_count`, clears `last_failure_time` and
    /// `last_error`. Monotonic lifetime totals are left untouched.
    async fn reset(&self, key: &str) -> StoreResult<()>;

    /// Register a callback fired with the post-mutation record on every
    /// change to `key`. Multiple callbacks per key are supported;
    /// delivery is at-least-once, best-effort ordered.
    async fn watch(&self, key: &str, callback: WatchCallback) -> StoreResult<()>;

    /// Release watchers and backend connections. Idempotent.
    async fn close(&self) -> StoreResult<()>;
}

/// The namespaced form of a service key as seen by the backend.
pub fn namespaced_key(key: &str) -> String {
    format!("{KEY_NAMESPACE}{key}")
}
