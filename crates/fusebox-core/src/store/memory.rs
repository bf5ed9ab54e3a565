//! In-memory state store.
//!
//! Backs tests and single-process deployments. Records are held as
//! their canonical JSON encoding so every access exercises the same
//! wire contract a networked driver would, and `increment_failure` is
//! atomic per key via the map's entry locking, which satisfies the
//! CAS-when-available requirement trivially.

use super::{namespaced_key, StateStore, WatchCallback};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use fusebox_types::{CircuitStats, StoreError, StoreResult};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct MemoryStateStore {
    /// Serialized records, keyed by namespaced service key
    records: DashMap<String, String>,
    /// Watch callbacks, keyed by bare service key
    watchers: DashMap<String, Vec<WatchCallback>>,
    closed: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn notify(&self, key: &str, stats: &CircuitStats) {
        // Clone the list out so no map guard is held while callbacks run.
        let callbacks: Vec<WatchCallback> = match self.watchers.get(key) {
            Some(list) => list.value().clone(),
            None => return,
        };
        for callback in callbacks {
            callback(stats.clone());
        }
    }

    /// Number of records currently held (test introspection).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl std::fmt::Debug for MemoryStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStateStore")
            .field("records", &self.records.len())
            .field("watched_keys", &self.watchers.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> StoreResult<Option<CircuitStats>> {
        self.ensure_open()?;
        match self.records.get(&namespaced_key(key)) {
            Some(raw) => Ok(Some(serde_json::from_str(raw.value())?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, stats: CircuitStats) -> StoreResult<()> {
        self.ensure_open()?;
        let encoded = serde_json::to_string(&stats)?;
        self.records.insert(namespaced_key(key), encoded);
        self.notify(key, &stats);
        Ok(())
    }

    async fn increment_failure(&self, key: &str) -> StoreResult<u32> {
        self.ensure_open()?;
        let now = Utc::now();

        // The entry guard is the per-key critical section: the decode,
        // mutate and re-encode all happen under it.
        let mut entry = self
            .records
            .entry(namespaced_key(key))
            .or_insert_with(|| {
                serde_json::to_string(&CircuitStats::fresh(now))
                    .unwrap_or_else(|_| "{}".to_string())
            });
        let mut stats: CircuitStats =
            serde_json::from_str(entry.value()).map_err(StoreError::from)?;

        stats.failure_count += 1;
        stats.failed_requests += 1;
        stats.total_requests += 1;
        stats.last_failure_time = Some(now);
        stats.last_update_time = Some(now);

        *entry.value_mut() = serde_json::to_string(&stats)?;
        let count = stats.failure_count;
        drop(entry);

        self.notify(key, &stats);
        Ok(count)
    }

    async fn reset(&self, key: &str) -> StoreResult<()> {
        self.ensure_open()?;
        let updated = {
            let mut entry = match self.records.get_mut(&namespaced_key(key)) {
                Some(entry) => entry,
                None => return Ok(()),
            };
            let mut stats: CircuitStats =
                serde_json::from_str(entry.value()).map_err(StoreError::from)?;
            stats.failure_count = 0;
            stats.last_failure_time = None;
            stats.last_error = None;
            stats.last_update_time = Some(Utc::now());
            *entry.value_mut() = serde_json::to_string(&stats)?;
            stats
        };
        self.notify(key, &updated);
        Ok(())
    }

    async fn watch(&self, key: &str, callback: WatchCallback) -> StoreResult<()> {
        self.ensure_open()?;
        self.watchers.entry(key.to_string()).or_default().push(callback);
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.watchers.clear();
        Ok(())
    }
}
