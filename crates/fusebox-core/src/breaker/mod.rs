//! Per-service-key circuit breaker.
//!
//! One `CircuitBreaker` runs the Closed → Open → HalfOpen machine for a
//! single service key. The stats record lives in the coordination
//! store; this instance is an observer and writer of it, never the sole
//! owner, so a fleet of identically configured breakers converges on
//! one view of the downstream's health.
//!
//! States:
//! - Closed: calls pass through, consecutive failures are counted
//! - Open: calls fail fast until the reset timeout elapses
//! - HalfOpen: a bounded number of probe calls decide recovery

pub mod dispatcher;
pub mod metrics;


use crate::store::StateStore;
use chrono::Utc;
use dashmap::DashMap;
use dispatcher::{EventDispatcher, Listener, SubscriptionId};
use fusebox_types::{
    BoxError, BreakerError, BreakerEvent, BreakerOptions, BreakerResult, CircuitState,
    CircuitStats, EventKind, MetricsSnapshot,
};
use metrics::MetricsWindow;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cadence of the in-memory metrics recomputation.
const METRICS_TICK: Duration = Duration::from_millis(100);

/// Circuit breaker for one service key.
pub struct CircuitBreaker {
    service_key: String,
    options: BreakerOptions,
    store: Arc<dyn StateStore>,
    dispatcher: EventDispatcher,
    metrics: MetricsWindow,
    /// In-flight calls; the key is the per-call request id and outcome
    /// accounting is keyed on its presence, so a late completion after a
    /// timeout has nothing left to account against.
    active_requests: DashMap<Uuid, Instant>,
    /// Last-known view of the persisted record, used when the store is
    /// unreachable. Never read while holding it across store I/O.
    cached_stats: RwLock<Option<CircuitStats>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    started: AtomicBool,
}

impl CircuitBreaker {
    /// Create a breaker for `service_key` against a shared store.
    /// Background loops start with [`CircuitBreaker::start`].
    pub fn new(
        service_key: impl Into<String>,
        store: Arc<dyn StateStore>,
        options: BreakerOptions,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        Arc::new(Self {
            service_key: service_key.into(),
            options,
            store,
            dispatcher: EventDispatcher::new(),
            metrics: MetricsWindow::new(),
            active_requests: DashMap::new(),
            cached_stats: RwLock::new(None),
            shutdown_tx,
            started: AtomicBool::new(false),
        })
    }

    /// Launch the health-check loop, the metrics tick and the store
    /// watch. Calling twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.register_store_watch().await;
        self.spawn_health_loop();
        self.spawn_metrics_loop();
    }

    /// Halt the background loops. Idempotent; persisted stats are left
    /// untouched.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn service_key(&self) -> &str {
        &self.service_key
    }

    pub fn options(&self) -> &BreakerOptions {
        &self.options
    }

    /// Pass-through read of the persisted stats record.
    pub async fn stats(&self) -> BreakerResult<Option<CircuitStats>> {
        Ok(self.store.get(&self.service_key).await?)
    }

    /// Snapshot of the in-memory metrics window.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.current_load())
    }

    /// The persisted circuit state; a missing record reads as Closed.
    pub async fn state(&self) -> BreakerResult<CircuitState> {
        Ok(self.store.get(&self.service_key).await?.map_or(CircuitState::Closed, |s| s.state))
    }

    /// Manual operator reset: clear the failure window in the store and
    /// force the circuit Closed.
    pub async fn reset(&self) -> BreakerResult<()> {
        self.store.reset(&self.service_key).await?;
        self.transition_to(CircuitState::Closed, None).await;
        info!(service = %self.service_key, "Circuit reset manually");
        Ok(())
    }

    /// Register an event listener. Delivery is synchronous; handlers
    /// must not block.
    pub fn subscribe(&self, kind: EventKind, listener: Listener) -> SubscriptionId {
        self.dispatcher.subscribe(kind, listener)
    }

    /// Detach a listener registered with [`CircuitBreaker::subscribe`].
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(kind, id)
    }

    /// Execute `call` under circuit protection. The sole admission path:
    /// checks the circuit state and in-flight caps, races the call
    /// against the service timeout, records the outcome in the store and
    /// emits events. The thunk's own error is re-raised (wrapped) after
    /// bookkeeping; admission rejections never invoke the thunk.
    pub async fn execute<T, F, Fut>(&self, call: F) -> BreakerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        let mut stats = self.load_or_init_stats().await;

        if stats.state == CircuitState::Open {
            if self.cooldown_elapsed(&stats) {
                self.transition_to(CircuitState::HalfOpen, None).await;
                stats = self.load_or_init_stats().await;
            }
            if stats.state == CircuitState::Open {
                let err = BreakerError::CircuitOpen { service: self.service_key.clone() };
                self.emit_rejected(&err, Some(stats));
                return Err(err);
            }
        }

        // HalfOpen is a trial window: only `half_open_retry_limit` probes
        // may be in flight at once.
        if stats.state == CircuitState::HalfOpen
            && self.active_requests.len() >= self.options.half_open_retry_limit as usize
        {
            let err = BreakerError::CircuitOpen { service: self.service_key.clone() };
            self.emit_rejected(&err, Some(stats));
            return Err(err);
        }

        if self.options.max_concurrent > 0
            && self.active_requests.len() >= self.options.max_concurrent
        {
            let err = BreakerError::Overloaded {
                service: self.service_key.clone(),
                limit: self.options.max_concurrent,
            };
            self.emit_rejected(&err, Some(stats));
            return Err(err);
        }

        let request_id = Uuid::new_v4();
        let started = Instant::now();
        self.active_requests.insert(request_id, started);
        self.metrics.record_request_start();

        let outcome = if self.options.service_timeout.is_zero() {
            Ok(call().await)
        } else {
            // The timeout drops (cancels) the thunk future on expiry.
            tokio::time::timeout(self.options.service_timeout, call()).await
        };

        match outcome {
            Ok(Ok(value)) => {
                self.on_success(request_id, started.elapsed()).await;
                Ok(value)
            },
            Ok(Err(source)) => {
                let err = BreakerError::Service { source };
                self.on_failure(request_id, &err, false).await;
                Err(err)
            },
            Err(_elapsed) => {
                let err = BreakerError::ServiceTimeout {
                    service: self.service_key.clone(),
                    timeout: self.options.service_timeout,
                };
                self.on_failure(request_id, &err, true).await;
                Err(err)
            },
        }
    }

    // ---- outcome recording -------------------------------------------------

    async fn on_success(&self, request_id: Uuid, response_time: Duration) {
        if !self.active_requests.contains_key(&request_id) {
            debug!(service = %self.service_key, "Late completion ignored");
            return;
        }
        self.metrics.record_success(response_time);

        let now = Utc::now();
        let mut stats = self.load_or_init_stats().await;
        let was_half_open = stats.state == CircuitState::HalfOpen;
        stats.successful_requests += 1;
        stats.total_requests += 1;
        stats.last_success_time = Some(now);
        stats.last_update_time = Some(now);
        stats.current_load = self.current_load().saturating_sub(1);
        stats.average_response_time_ms = self.metrics.average_response_time_ms();
        stats.last_minute_requests = self.metrics.last_minute_requests();
        self.persist(stats).await;

        self.active_requests.remove(&request_id);

        if was_half_open {
            self.transition_to(CircuitState::Closed, None).await;
        }

        let stats = self.current_view();
        self.dispatcher.emit(&BreakerEvent::Success {
            service: self.service_key.clone(),
            response_time,
            stats,
        });
        self.emit_metrics();
    }

    async fn on_failure(&self, request_id: Uuid, error: &BreakerError, timed_out: bool) {
        if !self.active_requests.contains_key(&request_id) {
            debug!(service = %self.service_key, "Late completion ignored");
            return;
        }
        self.metrics.record_failure();
        let message = error.stats_message();

        let failure_count = match self.store.increment_failure(&self.service_key).await {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    service = %self.service_key,
                    error = %e,
                    "Store increment failed, continuing on last-known view"
                );
                self.cached_stats.read().as_ref().map_or(1, |s| s.failure_count.saturating_add(1))
            },
        };

        // Record the error message and advisory fields; last-writer-wins
        // is acceptable here, the atomic part was the increment above.
        let mut stats = self.load_or_init_stats().await;
        let was_half_open = stats.state == CircuitState::HalfOpen;
        stats.last_error = Some(message.clone());
        stats.last_update_time = Some(Utc::now());
        stats.current_load = self.current_load().saturating_sub(1);
        stats.average_response_time_ms = self.metrics.average_response_time_ms();
        stats.last_minute_requests = self.metrics.last_minute_requests();
        self.persist(stats).await;

        self.active_requests.remove(&request_id);

        // Any failure while HalfOpen reopens; in Closed the threshold
        // decides.
        if was_half_open || failure_count >= self.options.failure_threshold {
            self.transition_to(CircuitState::Open, Some(&message)).await;
        }

        let stats = self.current_view();
        if timed_out {
            self.dispatcher.emit(&BreakerEvent::Timeout {
                service: self.service_key.clone(),
                error: message.clone(),
                stats: stats.clone(),
            });
        }
        self.dispatcher.emit(&BreakerEvent::Failure {
            service: self.service_key.clone(),
            error: message,
            stats,
        });
        self.emit_metrics();
    }

    // ---- transitions -------------------------------------------------------

    /// Persist a state transition. A no-op (and no event) if the record
    /// already holds the target state; the `state_change` emission only
    /// happens after the store write succeeds, so subscribers never
    /// observe a state that isn't persisted.
    async fn transition_to(&self, to: CircuitState, error: Option<&str>) {
        let mut stats = match self.store.get(&self.service_key).await {
            Ok(Some(stats)) => stats,
            Ok(None) => CircuitStats::fresh(Utc::now()),
            Err(e) => {
                warn!(
                    service = %self.service_key,
                    error = %e,
                    "Store read failed, state change skipped"
                );
                return;
            },
        };
        if stats.state == to {
            return;
        }
        let from = stats.state;
        let now = Utc::now();

        match to {
            CircuitState::Open => {
                stats.failure_count = self.options.failure_threshold;
                stats.last_failure_time = Some(now);
                if let Some(message) = error {
                    stats.last_error = Some(message.to_string());
                }
            },
            CircuitState::HalfOpen => {
                stats.failure_count = 0;
            },
            CircuitState::Closed => {
                stats.failure_count = 0;
                stats.last_success_time = Some(now);
            },
        }
        stats.state = to;
        stats.last_update_time = Some(now);

        match self.store.put(&self.service_key, stats.clone()).await {
            Ok(()) => {
                *self.cached_stats.write() = Some(stats.clone());
                info!(service = %self.service_key, %from, %to, "Circuit state change");
                self.dispatcher.emit(&BreakerEvent::StateChange {
                    service: self.service_key.clone(),
                    from,
                    to,
                });
                if to == CircuitState::Open {
                    self.dispatcher.emit(&BreakerEvent::CircuitOpen {
                        service: self.service_key.clone(),
                        error: stats.last_error.clone().unwrap_or_default(),
                    });
                }
            },
            Err(e) => {
                warn!(
                    service = %self.service_key,
                    error = %e,
                    "Store write failed, state change emission suppressed"
                );
            },
        }
    }

    fn cooldown_elapsed(&self, stats: &CircuitStats) -> bool {
        match stats.last_failure_time {
            Some(last_failure) => Utc::now()
                .signed_duration_since(last_failure)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= self.options.reset_timeout),
            // An Open record without a failure mark is malformed; let a
            // probe through rather than staying stuck.
            None => true,
        }
    }

    // ---- background loops --------------------------------------------------

    fn spawn_health_loop(self: &Arc<Self>) {
        let breaker = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = self.options.effective_monitor_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(period) => {
                        breaker.health_tick().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(service = %breaker.service_key, "Health-check loop shutting down");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_metrics_loop(self: &Arc<Self>) {
        let breaker = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(METRICS_TICK) => {
                        breaker.emit_metrics();
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
        });
    }

    /// One health-check pass: drive the time-based Open → HalfOpen
    /// transition independently of traffic, otherwise write back the
    /// advisory fields.
    async fn health_tick(&self) {
        let stats = match self.store.get(&self.service_key).await {
            Ok(Some(stats)) => stats,
            Ok(None) => return,
            Err(e) => {
                warn!(service = %self.service_key, error = %e, "Health check store read failed");
                return;
            },
        };

        if stats.state == CircuitState::Open && self.cooldown_elapsed(&stats) {
            self.transition_to(CircuitState::HalfOpen, None).await;
            return;
        }

        let mut stats = stats;
        stats.current_load = self.current_load();
        stats.average_response_time_ms = self.metrics.average_response_time_ms();
        stats.last_minute_requests = self.metrics.last_minute_requests();
        stats.last_update_time = Some(Utc::now());
        self.persist(stats.clone()).await;

        self.dispatcher
            .emit(&BreakerEvent::HealthCheck { service: self.service_key.clone(), stats });
    }

    async fn register_store_watch(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let callback: crate::store::WatchCallback = Arc::new(move |stats: CircuitStats| {
            if let Some(breaker) = weak.upgrade() {
                *breaker.cached_stats.write() = Some(stats.clone());
                breaker.dispatcher.emit(&BreakerEvent::StateUpdate {
                    service: breaker.service_key.clone(),
                    stats,
                });
            }
        });
        if let Err(e) = self.store.watch(&self.service_key, callback).await {
            warn!(service = %self.service_key, error = %e, "Store watch registration failed");
        }
    }

    // ---- helpers -----------------------------------------------------------

    async fn load_or_init_stats(&self) -> CircuitStats {
        match self.store.get(&self.service_key).await {
            Ok(Some(stats)) => {
                *self.cached_stats.write() = Some(stats.clone());
                stats
            },
            Ok(None) => {
                let fresh = CircuitStats::fresh(Utc::now());
                if let Err(e) = self.store.put(&self.service_key, fresh.clone()).await {
                    warn!(service = %self.service_key, error = %e, "Failed to materialize record");
                }
                *self.cached_stats.write() = Some(fresh.clone());
                fresh
            },
            Err(e) => {
                warn!(
                    service = %self.service_key,
                    error = %e,
                    "Store read failed, using last-known view"
                );
                let cached = self.cached_stats.read().clone();
                cached.unwrap_or_else(|| CircuitStats::fresh(Utc::now()))
            },
        }
    }

    async fn persist(&self, stats: CircuitStats) {
        match self.store.put(&self.service_key, stats.clone()).await {
            Ok(()) => {
                *self.cached_stats.write() = Some(stats);
            },
            Err(e) => {
                warn!(service = %self.service_key, error = %e, "Store write failed");
            },
        }
    }

    fn current_view(&self) -> CircuitStats {
        self.cached_stats.read().clone().unwrap_or_else(|| CircuitStats::fresh(Utc::now()))
    }

    fn current_load(&self) -> u32 {
        u32::try_from(self.active_requests.len()).unwrap_or(u32::MAX)
    }

    fn emit_rejected(&self, error: &BreakerError, stats: Option<CircuitStats>) {
        debug!(service = %self.service_key, error = %error, "Call rejected at admission");
        self.dispatcher.emit(&BreakerEvent::Rejected {
            service: self.service_key.clone(),
            error: error.to_string(),
            stats,
        });
    }

    fn emit_metrics(&self) {
        let snapshot = self.metrics.snapshot(self.current_load());
        self.dispatcher
            .emit(&BreakerEvent::Metrics { service: self.service_key.clone(), snapshot });
    }
}

impl Drop for CircuitBreaker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service_key", &self.service_key)
            .field("active_requests", &self.active_requests.len())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}
