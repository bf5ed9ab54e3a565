//! Registry of named shard groups against one shared store.

use crate::breaker::dispatcher::{Listener, SubscriptionId};
use crate::breaker::CircuitBreaker;
use crate::group::{CallResult, ShardGroup};
use crate::store::StateStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fusebox_types::{
    BoxError, BreakerError, BreakerOptions, BreakerResult, CircuitState, EventKind, GroupConfig,
    DEFAULT_SHARD_COUNT,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// A listener attached through the factory, retained so cleanup can
/// detach it from every shard it was fanned out to.
struct ListenerRegistration {
    group: String,
    kind: EventKind,
    /// Subscription ids, index-aligned with the group's shards
    ids: Vec<SubscriptionId>,
}

/// Breaker counts by state across every registered group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FactorySummary {
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

/// Owns named [`ShardGroup`]s built against one shared [`StateStore`]
/// and a set of base options. Groups register listeners through the
/// factory so [`BreakerFactory::cleanup`] can detach them
/// deterministically before stopping the breakers.
pub struct BreakerFactory {
    store: Arc<dyn StateStore>,
    base_options: BreakerOptions,
    groups: DashMap<String, Arc<ShardGroup>>,
    registrations: Mutex<Vec<ListenerRegistration>>,
}

impl BreakerFactory {
    pub fn new(store: Arc<dyn StateStore>, base_options: BreakerOptions) -> Self {
        Self { store, base_options, groups: DashMap::new(), registrations: Mutex::new(Vec::new()) }
    }

    /// Create and register a group. Per-group options override the
    /// factory's base options; fails with `AlreadyExists` for a
    /// registered name.
    pub async fn create_group(&self, config: GroupConfig) -> BreakerResult<Arc<ShardGroup>> {
        if self.groups.contains_key(&config.name) {
            return Err(BreakerError::AlreadyExists(config.name));
        }

        let shard_count = config.shard_count.unwrap_or(DEFAULT_SHARD_COUNT);
        let options = config.options.unwrap_or_else(|| self.base_options.clone());
        let group =
            ShardGroup::new(config.name.clone(), shard_count, Arc::clone(&self.store), options)
                .await;

        match self.groups.entry(config.name.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&group));
                info!(service = %config.name, shard_count, "Service group created");
                Ok(group)
            },
            Entry::Occupied(_) => {
                // Lost a creation race; discard ours.
                group.stop();
                Err(BreakerError::AlreadyExists(config.name))
            },
        }
    }

    /// Attach each listener to every shard of the named group, retaining
    /// the subscriptions for removal at cleanup.
    pub fn add_listeners(
        &self,
        name: &str,
        listeners: Vec<(EventKind, Listener)>,
    ) -> BreakerResult<()> {
        let group = self.group(name).ok_or_else(|| BreakerError::UnknownService(name.into()))?;

        let mut registrations = self.registrations.lock();
        for (kind, listener) in listeners {
            let ids = group
                .breakers()
                .iter()
                .map(|breaker| breaker.subscribe(kind, Arc::clone(&listener)))
                .collect();
            registrations.push(ListenerRegistration { group: name.to_string(), kind, ids });
        }
        Ok(())
    }

    pub fn group(&self, name: &str) -> Option<Arc<ShardGroup>> {
        self.groups.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    pub fn services(&self) -> Vec<String> {
        self.groups.iter().map(|entry| entry.key().clone()).collect()
    }

    /// The resolved configuration of a registered group.
    pub fn config(&self, name: &str) -> Option<GroupConfig> {
        self.group(name).map(|group| GroupConfig {
            name: group.name().to_string(),
            shard_count: Some(group.shard_count()),
            options: Some(group.options().clone()),
        })
    }

    /// Bounds-checked breaker access across the registry.
    pub fn breaker(&self, name: &str, shard_id: usize) -> BreakerResult<Arc<CircuitBreaker>> {
        let group = self.group(name).ok_or_else(|| BreakerError::UnknownService(name.into()))?;
        group.breaker(shard_id).map(Arc::clone)
    }

    /// Execute on an explicit shard of a named group.
    pub async fn execute_on<T, F, Fut>(
        &self,
        name: &str,
        shard_id: usize,
        call: F,
    ) -> BreakerResult<CallResult<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        let group = self.group(name).ok_or_else(|| BreakerError::UnknownService(name.into()))?;
        group.execute_on(shard_id, call).await
    }

    /// Route a key within a named group, then execute there.
    pub async fn execute_with_key<T, F, Fut>(
        &self,
        name: &str,
        key: &str,
        call: F,
    ) -> BreakerResult<CallResult<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        let group = self.group(name).ok_or_else(|| BreakerError::UnknownService(name.into()))?;
        group.execute_with_key(key, call).await
    }

    /// Breaker counts by persisted state across all groups.
    pub async fn summary(&self) -> BreakerResult<FactorySummary> {
        let mut summary = FactorySummary::default();
        let groups: Vec<Arc<ShardGroup>> =
            self.groups.iter().map(|entry| Arc::clone(entry.value())).collect();
        for group in groups {
            for breaker in group.breakers() {
                match breaker.state().await? {
                    CircuitState::Closed => summary.closed += 1,
                    CircuitState::Open => summary.open += 1,
                    CircuitState::HalfOpen => summary.half_open += 1,
                }
            }
        }
        Ok(summary)
    }

    /// Detach all factory-attached listeners, stop every breaker and
    /// clear the registry. Idempotent and safe during shutdown.
    pub fn cleanup(&self) {
        let registrations = std::mem::take(&mut *self.registrations.lock());
        for registration in registrations {
            if let Some(group) = self.group(&registration.group) {
                for (breaker, id) in group.breakers().iter().zip(registration.ids) {
                    breaker.unsubscribe(registration.kind, id);
                }
            }
        }

        let names: Vec<String> = self.services();
        for name in &names {
            if let Some((_, group)) = self.groups.remove(name) {
                group.stop();
            }
        }
        if !names.is_empty() {
            debug!(groups = names.len(), "Factory cleaned up");
        }
    }
}

impl Drop for BreakerFactory {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for BreakerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerFactory").field("groups", &self.groups.len()).finish()
    }
}
