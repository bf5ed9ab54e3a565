//! # Fusebox Core
//!
//! A distributed circuit breaker. Each [`CircuitBreaker`] runs the
//! Closed → Open → HalfOpen state machine for one service key, with the
//! stats record persisted in a watchable coordination store so a fleet of
//! identically configured callers shares one view of downstream health.
//! Breakers compose into [`ShardGroup`]s with deterministic key routing,
//! and a [`BreakerFactory`] owns named groups against one shared store.
//!
//! ```no_run
//! use fusebox_core::{BreakerFactory, MemoryStateStore};
//! use fusebox_types::{BreakerOptions, GroupConfig};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStateStore::new());
//! let factory = BreakerFactory::new(store, BreakerOptions::default());
//!
//! factory.create_group(GroupConfig::new("payment").with_shard_count(4)).await?;
//!
//! let result = factory
//!     .execute_with_key("payment", "user-123", || async {
//!         Ok::<_, fusebox_types::BoxError>("charged")
//!     })
//!     .await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod factory;
pub mod group;
pub mod store;

pub use breaker::dispatcher::{EventDispatcher, Listener, SubscriptionId};
pub use breaker::metrics::MetricsWindow;
pub use breaker::CircuitBreaker;
pub use factory::{BreakerFactory, FactorySummary};
pub use group::{route_key, CallResult, ShardGroup};
pub use store::memory::MemoryStateStore;
pub use store::{StateStore, WatchCallback, KEY_NAMESPACE};

// Re-export the model crate so callers need only one dependency.
pub use fusebox_types as types;
