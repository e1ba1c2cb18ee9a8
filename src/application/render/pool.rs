//! Fixed-size pool of reusable rendering environments.
//!
//! Concurrency beyond capacity is absorbed by queuing, never by creating
//! extra environments. Environments are retired one-for-one after a
//! configured number of uses; replacement construction happens in a tracked
//! background task so releases never stall behind it.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::environment::{EnvironmentFactory, RenderEnvironment};
use super::queue::WaitQueue;

const TARGET: &str = "vetrina::pool";

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Number of environments kept ready; the pool never grows beyond it.
    pub capacity: NonZeroU32,
    /// Usage ceiling after which an environment is retired and replaced.
    pub max_uses: NonZeroU32,
    /// Pause after each construction before the environment is handed out.
    pub settle_delay: Duration,
    /// Optional bound on how long an acquire may wait; `None` waits forever.
    pub acquire_timeout: Option<Duration>,
}

impl From<&crate::config::PoolConfigSettings> for PoolSettings {
    fn from(settings: &crate::config::PoolConfigSettings) -> Self {
        Self {
            capacity: settings.min_instances,
            max_uses: settings.max_uses,
            settle_delay: settings.settle_delay,
            acquire_timeout: settings.acquire_timeout,
        }
    }
}

/// Where a handle currently sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initializing,
    Idle,
    Acquired,
    Retiring,
    Disposed,
}

/// Bookkeeping attached to every pooled environment.
#[derive(Debug, Clone)]
pub struct HandleMeta {
    pub id: Uuid,
    pub usage_count: u32,
    pub created_at: OffsetDateTime,
    pub lifecycle: LifecycleState,
}

impl HandleMeta {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            usage_count: 0,
            created_at: OffsetDateTime::now_utc(),
            lifecycle: LifecycleState::Initializing,
        }
    }
}

struct PooledEnvironment {
    meta: HandleMeta,
    env: Box<dyn RenderEnvironment>,
}

/// An environment checked out by exactly one requester.
///
/// Ownership of the lease is the no-double-hand-out guarantee: the pooled
/// value leaves the queue and lives here until `release` takes it back.
pub struct LeasedEnvironment {
    inner: PooledEnvironment,
}

impl LeasedEnvironment {
    pub fn meta(&self) -> &HandleMeta {
        &self.inner.meta
    }

    pub fn environment(&mut self) -> &mut dyn RenderEnvironment {
        self.inner.env.as_mut()
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("rendering pool exhausted: no environment freed within {waited:?}")]
    PoolExhausted { waited: Duration },
    #[error("rendering pool is shut down")]
    Closed,
}

/// Point-in-time pool counters, exposed on the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolDiagnostics {
    pub capacity: u32,
    pub live: usize,
    pub idle: usize,
    pub waiting: usize,
}

struct PoolShared {
    settings: PoolSettings,
    factory: Arc<dyn EnvironmentFactory>,
    queue: WaitQueue<PooledEnvironment>,
    /// Serializes every construction. The underlying engines share
    /// process-global state while booting; parallel construction has produced
    /// corrupted shared style state, so ordering here is load-bearing.
    construction: tokio::sync::Mutex<()>,
    live: AtomicUsize,
}

impl PoolShared {
    /// Build one environment under the construction serializer, applying the
    /// settle delay before it becomes visible. Returns `None` on failure; the
    /// pool then legitimately runs below capacity.
    async fn construct(&self) -> Option<PooledEnvironment> {
        let _serialized = self.construction.lock().await;
        let meta = HandleMeta::new();
        match self.factory.create().await {
            Ok(env) => {
                tokio::time::sleep(self.settings.settle_delay).await;
                Some(PooledEnvironment { meta, env })
            }
            Err(error) => {
                counter!("vetrina_pool_construct_failures_total").increment(1);
                error!(
                    target: TARGET,
                    error = %error,
                    "failed to construct rendering environment"
                );
                None
            }
        }
    }

    /// Put a freshly constructed environment into circulation.
    fn commission(&self, mut pooled: PooledEnvironment) {
        pooled.meta.lifecycle = LifecycleState::Idle;
        let id = pooled.meta.id;
        match self.queue.enqueue(pooled) {
            Ok(()) => {
                let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
                gauge!("vetrina_pool_live").set(live as f64);
                info!(
                    target: TARGET,
                    environment = %id,
                    live,
                    "rendering environment ready"
                );
            }
            Err(mut rejected) => {
                // Pool shut down while this environment was being built.
                rejected.meta.lifecycle = LifecycleState::Disposed;
                tokio::spawn(async move { rejected.env.dispose().await });
                debug!(
                    target: TARGET,
                    environment = %id,
                    "discarded environment commissioned after shutdown"
                );
            }
        }
    }

    async fn decommission(&self, mut pooled: PooledEnvironment) {
        pooled.env.dispose().await;
        pooled.meta.lifecycle = LifecycleState::Disposed;
        let live = self.live.fetch_sub(1, Ordering::SeqCst) - 1;
        gauge!("vetrina_pool_live").set(live as f64);
    }
}

/// Owns every rendering environment and the waiting-queue discipline in
/// front of them.
pub struct EnvironmentPool {
    shared: Arc<PoolShared>,
    warmup: tokio::sync::OnceCell<()>,
    retirements: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl EnvironmentPool {
    pub fn new(settings: PoolSettings, factory: Arc<dyn EnvironmentFactory>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                settings,
                factory,
                queue: WaitQueue::new(),
                construction: tokio::sync::Mutex::new(()),
                live: AtomicUsize::new(0),
            }),
            warmup: tokio::sync::OnceCell::new(),
            retirements: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Warm the pool up to capacity. Idempotent; concurrent callers share one
    /// warm-up pass. Environments are built strictly one after another —
    /// see [`PoolShared::construction`].
    pub async fn init(&self) {
        self.warmup
            .get_or_init(|| async {
                let capacity = self.shared.settings.capacity.get();
                info!(target: TARGET, capacity, "warming rendering environment pool");
                for _ in 0..capacity {
                    if let Some(pooled) = self.shared.construct().await {
                        self.shared.commission(pooled);
                    }
                }
                let live = self.shared.live.load(Ordering::SeqCst);
                if live < capacity as usize {
                    warn!(
                        target: TARGET,
                        live,
                        capacity,
                        "pool warmed up below capacity; continuing degraded"
                    );
                } else {
                    info!(target: TARGET, live, "rendering environment pool ready");
                }
            })
            .await;
    }

    /// Check an environment out, suspending until one is free. With an
    /// acquire timeout configured, waits at most that long before failing
    /// with [`AcquireError::PoolExhausted`].
    pub async fn acquire(&self) -> Result<LeasedEnvironment, AcquireError> {
        let started = Instant::now();
        let dequeued = match self.shared.settings.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, self.shared.queue.dequeue())
                .await
                .map_err(|_| AcquireError::PoolExhausted { waited: limit })?,
            None => self.shared.queue.dequeue().await,
        };

        let mut pooled = dequeued.map_err(|_| AcquireError::Closed)?;
        pooled.meta.usage_count += 1;
        pooled.meta.lifecycle = LifecycleState::Acquired;

        histogram!("vetrina_pool_acquire_wait_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        gauge!("vetrina_pool_idle").set(self.shared.queue.idle_len() as f64);

        Ok(LeasedEnvironment { inner: pooled })
    }

    /// Return a lease. At or above the usage ceiling the environment is
    /// retired: disposal and one-for-one replacement run in a background
    /// task so other waiters never stall behind them.
    pub fn release(&self, lease: LeasedEnvironment) {
        let mut pooled = lease.inner;

        if pooled.meta.usage_count >= self.shared.settings.max_uses.get() {
            pooled.meta.lifecycle = LifecycleState::Retiring;
            counter!("vetrina_pool_retired_total").increment(1);
            info!(
                target: TARGET,
                environment = %pooled.meta.id,
                usage_count = pooled.meta.usage_count,
                "environment reached usage ceiling; retiring"
            );

            let shared = Arc::clone(&self.shared);
            let task = tokio::spawn(async move {
                shared.decommission(pooled).await;
                if let Some(replacement) = shared.construct().await {
                    shared.commission(replacement);
                }
            });
            self.track_retirement(task);
        } else {
            pooled.env.clear_state();
            pooled.meta.lifecycle = LifecycleState::Idle;
            if let Err(rejected) = self.shared.queue.enqueue(pooled) {
                // Released after shutdown closed the queue.
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move { shared.decommission(rejected).await });
            }
        }

        gauge!("vetrina_pool_idle").set(self.shared.queue.idle_len() as f64);
    }

    /// Await all retirement tasks spawned so far. Used by shutdown, and by
    /// tests that need retirement effects to be visible deterministically.
    pub async fn await_retirements(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.lock_retirements();
            guard.drain(..).collect()
        };
        for outcome in futures::future::join_all(tasks).await {
            if let Err(error) = outcome {
                warn!(target: TARGET, error = %error, "retirement task failed");
            }
        }
    }

    /// Dispose every idle environment and fail pending waiters. In-flight
    /// leases released after shutdown are disposed on return.
    pub async fn shutdown(&self) {
        self.await_retirements().await;
        let drained = self.shared.queue.close();
        info!(
            target: TARGET,
            disposing = drained.len(),
            "shutting down rendering environment pool"
        );
        for pooled in drained {
            self.shared.decommission(pooled).await;
        }
    }

    pub fn diagnostics(&self) -> PoolDiagnostics {
        PoolDiagnostics {
            capacity: self.shared.settings.capacity.get(),
            live: self.shared.live.load(Ordering::SeqCst),
            idle: self.shared.queue.idle_len(),
            waiting: self.shared.queue.waiter_len(),
        }
    }

    fn track_retirement(&self, task: JoinHandle<()>) {
        let mut guard = self.lock_retirements();
        // Completed handles are cheap to await later, but keep the list from
        // growing without bound on long-lived pools.
        guard.retain(|handle| !handle.is_finished());
        guard.push(task);
    }

    fn lock_retirements(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.retirements.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    target: TARGET,
                    lock_kind = "mutex.lock",
                    result = "poisoned_recovered",
                    "Recovered from poisoned retirement tracker lock"
                );
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::application::render::environment::{
        EnvironmentError, RequestState, Stability,
    };

    struct NoopEnvironment {
        serial: u32,
        cleared: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RenderEnvironment for NoopEnvironment {
        async fn inject_state(&mut self, _state: &RequestState) -> Result<(), EnvironmentError> {
            Ok(())
        }

        async fn set_route(&mut self, _route: &str) -> Result<(), EnvironmentError> {
            Ok(())
        }

        async fn wait_until_stable(&mut self, _timeout: Duration) -> Stability {
            Stability::Stable
        }

        async fn extract_styles(&mut self) -> Result<(), EnvironmentError> {
            Ok(())
        }

        async fn serialize(&mut self) -> Result<String, EnvironmentError> {
            Ok(format!("<html>env-{}</html>", self.serial))
        }

        fn clear_state(&mut self) {
            self.cleared.fetch_add(1, Ordering::SeqCst);
        }

        async fn dispose(&mut self) {}
    }

    struct CountingFactory {
        built: AtomicU32,
        cleared: Arc<AtomicUsize>,
        fail_on: Option<u32>,
        build_delay: Duration,
    }

    impl CountingFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                built: AtomicU32::new(0),
                cleared: Arc::new(AtomicUsize::new(0)),
                fail_on: None,
                build_delay: Duration::ZERO,
            })
        }

        fn failing_on(serial: u32) -> Arc<Self> {
            Arc::new(Self {
                built: AtomicU32::new(0),
                cleared: Arc::new(AtomicUsize::new(0)),
                fail_on: Some(serial),
                build_delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                built: AtomicU32::new(0),
                cleared: Arc::new(AtomicUsize::new(0)),
                fail_on: None,
                build_delay: delay,
            })
        }
    }

    #[async_trait]
    impl EnvironmentFactory for CountingFactory {
        async fn create(&self) -> Result<Box<dyn RenderEnvironment>, EnvironmentError> {
            let serial = self.built.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.build_delay.is_zero() {
                tokio::time::sleep(self.build_delay).await;
            }
            if self.fail_on == Some(serial) {
                return Err(EnvironmentError::Construction(format!(
                    "simulated failure building environment {serial}"
                )));
            }
            Ok(Box::new(NoopEnvironment {
                serial,
                cleared: Arc::clone(&self.cleared),
            }))
        }
    }

    fn settings(capacity: u32, max_uses: u32) -> PoolSettings {
        PoolSettings {
            capacity: NonZeroU32::new(capacity).expect("nonzero capacity"),
            max_uses: NonZeroU32::new(max_uses).expect("nonzero max uses"),
            settle_delay: Duration::ZERO,
            acquire_timeout: None,
        }
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let factory = CountingFactory::new();
        let pool = EnvironmentPool::new(settings(2, 50), factory.clone());

        pool.init().await;
        pool.init().await;

        assert_eq!(factory.built.load(Ordering::SeqCst), 2);
        let diagnostics = pool.diagnostics();
        assert_eq!(diagnostics.live, 2);
        assert_eq!(diagnostics.idle, 2);
    }

    #[tokio::test]
    async fn construction_failure_degrades_capacity() {
        let factory = CountingFactory::failing_on(2);
        let pool = EnvironmentPool::new(settings(3, 50), factory);

        pool.init().await;

        let diagnostics = pool.diagnostics();
        assert_eq!(diagnostics.capacity, 3);
        assert_eq!(diagnostics.live, 2);
    }

    #[tokio::test]
    async fn no_double_handout() {
        let pool = EnvironmentPool::new(settings(1, 50), CountingFactory::new());
        pool.init().await;

        let first = pool.acquire().await.expect("first acquire");

        // With the only environment leased, a second acquire must park.
        let second = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(second.is_err(), "second acquire resolved while leased");

        pool.release(first);
        let reacquired = pool.acquire().await.expect("reacquire after release");
        assert_eq!(reacquired.meta().usage_count, 2);
        pool.release(reacquired);
    }

    #[tokio::test]
    async fn fifo_fairness_across_three_acquires() {
        let pool = Arc::new(EnvironmentPool::new(settings(1, 50), CountingFactory::new()));
        pool.init().await;

        let holder = pool.acquire().await.expect("initial acquire");

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut joins = Vec::new();
        for label in 1..=3u32 {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            joins.push(tokio::spawn(async move {
                let lease = pool.acquire().await.expect("queued acquire");
                order.lock().expect("order lock").push(label);
                pool.release(lease);
            }));
            // Let each waiter register before the next is issued.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        pool.release(holder);
        for join in joins {
            join.await.expect("waiter join");
        }

        assert_eq!(*order.lock().expect("order lock"), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn retirement_replaces_exhausted_environment() {
        // The concrete scenario: capacity 2, max_uses 2, three concurrent
        // requesters.
        let factory = CountingFactory::new();
        let pool = Arc::new(EnvironmentPool::new(settings(2, 2), factory.clone()));
        pool.init().await;

        let first = pool.acquire().await.expect("first");
        let second = pool.acquire().await.expect("second");
        assert_eq!(first.meta().usage_count, 1);
        assert_eq!(second.meta().usage_count, 1);

        let third = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.acquire().await.expect("third resolves") }
        });
        tokio::task::yield_now().await;

        let first_id = first.meta().id;
        pool.release(first);
        let third = third.await.expect("third join");
        assert_eq!(third.meta().id, first_id);
        assert_eq!(third.meta().usage_count, 2);

        // Second use pushed it to the ceiling; releasing retires it.
        pool.release(third);
        pool.await_retirements().await;

        assert_eq!(factory.built.load(Ordering::SeqCst), 3);
        let diagnostics = pool.diagnostics();
        assert_eq!(diagnostics.live, 2);

        // The retired environment is gone for good: every further acquire
        // resolves to a different id.
        pool.release(second);
        for _ in 0..4 {
            let lease = pool.acquire().await.expect("post-retirement acquire");
            assert_ne!(lease.meta().id, first_id);
            pool.release(lease);
        }
        pool.await_retirements().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retirement_does_not_block_other_releases() {
        let factory = CountingFactory::slow(Duration::from_secs(5));
        let pool = Arc::new(EnvironmentPool::new(
            PoolSettings {
                capacity: NonZeroU32::new(2).expect("nonzero"),
                max_uses: NonZeroU32::new(1).expect("nonzero"),
                settle_delay: Duration::ZERO,
                acquire_timeout: None,
            },
            factory,
        ));
        pool.init().await;

        let doomed = pool.acquire().await.expect("doomed lease");
        let survivor = pool.acquire().await.expect("survivor lease");

        let waiter = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.acquire().await.expect("waiter resolves") }
        });
        tokio::task::yield_now().await;

        // Retiring `doomed` kicks off a 5s replacement build; the waiter must
        // not depend on it.
        pool.release(doomed);
        pool.release(survivor);

        let lease = tokio::time::timeout(Duration::from_millis(50), waiter)
            .await
            .expect("waiter resolved without waiting for replacement")
            .expect("waiter join");
        pool.release(lease);
        pool.await_retirements().await;
    }

    #[tokio::test]
    async fn acquire_timeout_reports_pool_exhausted() {
        let pool = EnvironmentPool::new(
            PoolSettings {
                capacity: NonZeroU32::new(1).expect("nonzero"),
                max_uses: NonZeroU32::new(50).expect("nonzero"),
                settle_delay: Duration::ZERO,
                acquire_timeout: Some(Duration::from_millis(10)),
            },
            CountingFactory::new(),
        );
        pool.init().await;

        let held = pool.acquire().await.expect("first acquire");
        let outcome = pool.acquire().await;
        assert!(matches!(
            outcome,
            Err(AcquireError::PoolExhausted { .. })
        ));

        // The timed-out waiter must not swallow the next release.
        pool.release(held);
        let lease = pool.acquire().await.expect("acquire after timeout");
        pool.release(lease);
    }

    #[tokio::test]
    async fn released_state_is_cleared_before_reuse() {
        let factory = CountingFactory::new();
        let pool = EnvironmentPool::new(settings(1, 50), factory.clone());
        pool.init().await;

        let lease = pool.acquire().await.expect("acquire");
        pool.release(lease);

        assert_eq!(factory.cleared.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_disposes_idle_environments() {
        let pool = EnvironmentPool::new(settings(2, 50), CountingFactory::new());
        pool.init().await;

        pool.shutdown().await;

        let diagnostics = pool.diagnostics();
        assert_eq!(diagnostics.live, 0);
        assert_eq!(diagnostics.idle, 0);
        assert!(matches!(pool.acquire().await, Err(AcquireError::Closed)));
    }

    #[tokio::test]
    async fn pool_size_invariant_holds_outside_replacement_window() {
        let pool = Arc::new(EnvironmentPool::new(settings(3, 50), CountingFactory::new()));
        pool.init().await;

        let check = |diag: PoolDiagnostics, leased: usize| {
            assert_eq!(diag.idle + leased, diag.capacity as usize);
        };

        check(pool.diagnostics(), 0);
        let one = pool.acquire().await.expect("one");
        check(pool.diagnostics(), 1);
        let two = pool.acquire().await.expect("two");
        check(pool.diagnostics(), 2);
        pool.release(one);
        check(pool.diagnostics(), 1);
        pool.release(two);
        check(pool.diagnostics(), 0);
    }
}
