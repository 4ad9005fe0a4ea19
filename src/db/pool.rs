//! Generic bounded object pool.
//!
//! The pool caches live, expensive resources (connections) and hands them out
//! one caller at a time:
//! - Resources are created lazily on demand, up to `max_size`, and optionally
//!   warmed up to `min_size`.
//! - A resource idle longer than `idle_check` is checked before it is handed
//!   out; a failed check destroys it and the caller gets a replacement.
//! - Releasing with a connection-fatal error destroys the resource. After
//!   `unavailable_after` consecutive fatal errors the pool flags itself
//!   unavailable and fires the unavailable callback; the next healthy release
//!   or successful check clears the flag and fires the recovered callback.
//! - `close()` is idempotent: exactly one caller tears the pool down.
//!
//! # Capacity
//!
//! A semaphore with `max_size` permits is held by every checked-out resource
//! and by every in-flight creation. A resource is pushed back to the idle
//! queue *before* its permit is released, and a new resource is only created
//! by a permit holder that found the idle queue empty under the queue lock, so
//! `outstanding + idle <= max_size` holds at every point.

use crate::config::PoolOptions;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Creates, checks and destroys the resources a pool manages.
#[async_trait]
pub trait ResourceManager: Send + Sync + 'static {
    type Resource: Send + 'static;

    /// Establish a new resource.
    async fn create(&self) -> DbResult<Self::Resource>;

    /// Check a resource that has been idle for a while.
    async fn check(&self, resource: &mut Self::Resource) -> DbResult<()>;

    /// Tear a resource down. Failures are the manager's to log.
    async fn destroy(&self, resource: Self::Resource);

    /// Whether `error` leaves the resource unusable.
    fn is_fatal(&self, error: &DbError) -> bool {
        error.is_connection_fatal()
    }
}

/// Health of a pooled resource.
///
/// `Unknown` means the resource's state is not known to be good: it is
/// checked before reuse, and destroyed when dropped without an explicit release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unknown,
    Broken,
}

/// Notification fired with the pool name.
pub type PoolCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub idle_check: Duration,
    pub unavailable_after: u32,
    /// Background recovery check interval; `None` disables the check task.
    pub recovery_interval: Option<Duration>,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, max_size: usize) -> Self {
        let defaults = PoolOptions::default();
        Self {
            name: name.into(),
            min_size: defaults.min_connections_or_default(),
            max_size: max_size.max(1),
            acquire_timeout: defaults.acquire_timeout_or_default(),
            idle_check: defaults.idle_check_or_default(),
            unavailable_after: defaults.unavailable_after_or_default(),
            recovery_interval: Some(defaults.recovery_interval_or_default()),
        }
    }

    /// Build a pool configuration from parsed pool options.
    pub fn from_options(name: impl Into<String>, options: &PoolOptions, is_sqlite: bool) -> Self {
        let max_size = options.max_connections_or_default(is_sqlite).max(1);
        Self {
            name: name.into(),
            min_size: options.min_connections_or_default().min(max_size),
            max_size,
            acquire_timeout: options.acquire_timeout_or_default(),
            idle_check: options.idle_check_or_default(),
            unavailable_after: options.unavailable_after_or_default(),
            recovery_interval: Some(options.recovery_interval_or_default()),
        }
    }

    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size.min(self.max_size);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_idle_check(mut self, threshold: Duration) -> Self {
        self.idle_check = threshold;
        self
    }

    pub fn with_unavailable_after(mut self, errors: u32) -> Self {
        self.unavailable_after = errors.max(1);
        self
    }

    pub fn with_recovery_interval(mut self, interval: Option<Duration>) -> Self {
        self.recovery_interval = interval;
        self
    }
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub destroyed: u64,
    pub acquisitions: u64,
    pub exhausted: u64,
    pub health_check_failures: u64,
    pub total_wait_ms: u64,
    /// Live resources: idle plus checked out plus being created
    pub live: usize,
    pub idle: usize,
    pub outstanding: usize,
}

#[derive(Debug, Default)]
struct AtomicPoolStats {
    created: AtomicU64,
    destroyed: AtomicU64,
    acquisitions: AtomicU64,
    exhausted: AtomicU64,
    health_check_failures: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl AtomicPoolStats {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_acquisition(&self, waited: Duration) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
    }
}

/// One live resource plus its bookkeeping.
#[derive(Debug)]
pub struct PooledResource<T> {
    value: T,
    created_at: Instant,
    last_acquired: Instant,
    last_returned: Instant,
    last_context: Option<u64>,
    health: HealthState,
}

impl<T> PooledResource<T> {
    fn new(value: T) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            last_acquired: now,
            last_returned: now,
            last_context: None,
            health: HealthState::Healthy,
        }
    }
}

struct PoolInner<M: ResourceManager> {
    config: PoolConfig,
    manager: M,
    idle: Mutex<VecDeque<PooledResource<M::Resource>>>,
    permits: Arc<Semaphore>,
    live: AtomicUsize,
    closed: AtomicBool,
    unavailable: AtomicBool,
    consecutive_fatal: AtomicU32,
    on_unavailable: Option<PoolCallback>,
    on_recovered: Option<PoolCallback>,
    stats: AtomicPoolStats,
    recovery_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<M: ResourceManager> PoolInner<M> {
    /// Idle queue lock; a poisoned queue is still structurally valid.
    fn idle(&self) -> MutexGuard<'_, VecDeque<PooledResource<M::Resource>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push a resource back to the idle queue, then release its permit.
    fn return_to_idle(
        &self,
        mut resource: PooledResource<M::Resource>,
        permit: OwnedSemaphorePermit,
    ) {
        resource.last_returned = Instant::now();
        resource.health = HealthState::Healthy;
        self.idle().push_back(resource);
        drop(permit);
        self.note_success();
    }

    async fn destroy(&self, resource: PooledResource<M::Resource>, permit: OwnedSemaphorePermit) {
        let slot = LiveSlot::held(self);
        self.manager.destroy(resource.value).await;
        drop(slot);
        drop(permit);
    }

    /// Account for a resource that no longer exists.
    fn forget_one(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        AtomicPoolStats::inc(&self.stats.destroyed);
    }

    fn note_success(&self) {
        self.consecutive_fatal.store(0, Ordering::Release);
        if self.unavailable.swap(false, Ordering::AcqRel) {
            info!(pool = %self.config.name, "Pool recovered");
            if let Some(cb) = &self.on_recovered {
                cb(&self.config.name);
            }
        }
    }

    fn note_fatal(self: &Arc<Self>, error: &DbError) {
        let count = self.consecutive_fatal.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(
            pool = %self.config.name,
            error = %error,
            consecutive = count,
            "Connection-fatal error, destroying resource"
        );
        if count >= self.config.unavailable_after
            && !self.closed.load(Ordering::Acquire)
            && !self.unavailable.swap(true, Ordering::AcqRel)
        {
            warn!(pool = %self.config.name, "Pool marked unavailable");
            if let Some(cb) = &self.on_unavailable {
                cb(&self.config.name);
            }
            self.spawn_recovery();
        }
    }

    fn spawn_recovery(self: &Arc<Self>) {
        let Some(interval) = self.config.recovery_interval else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let handle = runtime.spawn(Self::recovery_task(weak, interval));
        let mut guard = self.recovery_handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
        }
    }

    /// Check periodically until the pool recovers, closes, or is dropped.
    async fn recovery_task(weak: Weak<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.closed.load(Ordering::Acquire) || !inner.unavailable.load(Ordering::Acquire) {
                return;
            }
            if Self::check_health(&inner).await {
                return;
            }
        }
    }

    async fn check_health(inner: &Arc<Self>) -> bool {
        if inner.closed.load(Ordering::Acquire) {
            return false;
        }
        // At capacity: every slot is checked out, so a healthy release will recover it.
        let Ok(permit) = inner.permits.clone().try_acquire_owned() else {
            return false;
        };
        let mut guard = match Self::checkout(inner, permit, None, false).await {
            Ok(guard) => guard,
            Err(e) => {
                debug!(pool = %inner.config.name, error = %e, "Recovery check could not connect");
                return false;
            }
        };
        match inner.manager.check(&mut *guard).await {
            Ok(()) => {
                guard.release(None).await;
                true
            }
            Err(e) => {
                AtomicPoolStats::inc(&inner.stats.health_check_failures);
                guard.mark_broken();
                guard.release(Some(&e)).await;
                false
            }
        }
    }

    /// Turn a permit into a checked-out resource: reuse an idle one or create.
    async fn checkout(
        inner: &Arc<Self>,
        permit: OwnedSemaphorePermit,
        context: Option<u64>,
        check_stale: bool,
    ) -> DbResult<Pooled<M>> {
        loop {
            let candidate = {
                let mut idle = inner.idle();
                match idle.pop_back() {
                    Some(resource) => Ok(resource),
                    None => Err(LiveSlot::reserve(inner)),
                }
            };

            let (mut resource, mut slot) = match candidate {
                Ok(resource) => (resource, LiveSlot::held(inner)),
                Err(mut slot) => match inner.manager.create().await {
                    Ok(value) => {
                        AtomicPoolStats::inc(&inner.stats.created);
                        debug!(pool = %inner.config.name, "Created resource");
                        slot.exists = true;
                        (PooledResource::new(value), slot)
                    }
                    Err(e) => {
                        drop(slot);
                        drop(permit);
                        warn!(pool = %inner.config.name, error = %e, "Failed to create resource");
                        return Err(e);
                    }
                },
            };

            if check_stale && resource.last_returned.elapsed() >= inner.config.idle_check {
                resource.health = HealthState::Unknown;
                if let Err(e) = inner.manager.check(&mut resource.value).await {
                    AtomicPoolStats::inc(&inner.stats.health_check_failures);
                    debug!(
                        pool = %inner.config.name,
                        error = %e,
                        "Idle resource failed its check, replacing"
                    );
                    inner.manager.destroy(resource.value).await;
                    drop(slot);
                    continue;
                }
                resource.health = HealthState::Healthy;
            }

            slot.disarm();
            resource.last_acquired = Instant::now();
            resource.last_context = context;
            return Ok(Pooled {
                resource: Some(resource),
                permit: Some(permit),
                inner: Arc::clone(inner),
            });
        }
    }
}

/// One unit of `live` owned by an in-flight create, check or destroy.
///
/// Dropping an armed slot gives the unit back, so a cancelled future cannot
/// leave `live` counting a resource that no longer exists.
struct LiveSlot<'a, M: ResourceManager> {
    inner: &'a PoolInner<M>,
    /// A resource was created for this slot; its loss counts as destroyed
    exists: bool,
    armed: bool,
}

impl<'a, M: ResourceManager> LiveSlot<'a, M> {
    /// Reserve a new unit for a resource about to be created.
    fn reserve(inner: &'a PoolInner<M>) -> Self {
        inner.live.fetch_add(1, Ordering::AcqRel);
        Self {
            inner,
            exists: false,
            armed: true,
        }
    }

    /// Take over the unit of an existing resource.
    fn held(inner: &'a PoolInner<M>) -> Self {
        Self {
            inner,
            exists: true,
            armed: true,
        }
    }

    /// The resource survives; keep its unit.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<M: ResourceManager> Drop for LiveSlot<'_, M> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.exists {
            self.inner.forget_one();
        } else {
            self.inner.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Bounded pool of reusable resources. Cheap to clone; clones share the pool.
pub struct ObjectPool<M: ResourceManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ResourceManager> Clone for ObjectPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder wiring availability callbacks before the pool is shared.
pub struct ObjectPoolBuilder<M: ResourceManager> {
    config: PoolConfig,
    manager: M,
    on_unavailable: Option<PoolCallback>,
    on_recovered: Option<PoolCallback>,
}

impl<M: ResourceManager> ObjectPoolBuilder<M> {
    pub fn on_unavailable(mut self, cb: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_unavailable = Some(Arc::new(cb));
        self
    }

    pub fn on_recovered(mut self, cb: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_recovered = Some(Arc::new(cb));
        self
    }

    pub fn build(self) -> ObjectPool<M> {
        let max_size = self.config.max_size.max(1);
        ObjectPool {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(VecDeque::with_capacity(max_size)),
                config: self.config,
                manager: self.manager,
                live: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                unavailable: AtomicBool::new(false),
                consecutive_fatal: AtomicU32::new(0),
                on_unavailable: self.on_unavailable,
                on_recovered: self.on_recovered,
                stats: AtomicPoolStats::default(),
                recovery_handle: Mutex::new(None),
            }),
        }
    }
}

impl<M: ResourceManager> ObjectPool<M> {
    pub fn new(config: PoolConfig, manager: M) -> Self {
        Self::builder(config, manager).build()
    }

    pub fn builder(config: PoolConfig, manager: M) -> ObjectPoolBuilder<M> {
        ObjectPoolBuilder {
            config,
            manager,
            on_unavailable: None,
            on_recovered: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Acquire with the configured timeout.
    pub async fn acquire(&self) -> DbResult<Pooled<M>> {
        self.acquire_inner(None, self.inner.config.acquire_timeout, None)
            .await
    }

    /// Acquire on behalf of an execution context, recorded on the resource.
    pub async fn acquire_for(&self, context_id: u64) -> DbResult<Pooled<M>> {
        self.acquire_inner(Some(context_id), self.inner.config.acquire_timeout, None)
            .await
    }

    /// Acquire with a caller-supplied timeout.
    pub async fn acquire_timeout(&self, timeout: Duration) -> DbResult<Pooled<M>> {
        self.acquire_inner(None, timeout, None).await
    }

    /// Acquire, giving up with [`DbError::Cancelled`] when `token` fires.
    pub async fn acquire_with_cancel(&self, token: &CancellationToken) -> DbResult<Pooled<M>> {
        self.acquire_inner(None, self.inner.config.acquire_timeout, Some(token))
            .await
    }

    async fn acquire_inner(
        &self,
        context: Option<u64>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> DbResult<Pooled<M>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(DbError::pool_closed(&inner.config.name));
        }

        let start = Instant::now();
        let wait = tokio::time::timeout(timeout, inner.permits.clone().acquire_owned());
        let waited = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DbError::cancelled(&inner.config.name)),
                waited = wait => waited,
            },
            None => wait.await,
        };

        let permit = match waited {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DbError::pool_closed(&inner.config.name)),
            Err(_) => {
                AtomicPoolStats::inc(&inner.stats.exhausted);
                warn!(
                    pool = %inner.config.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Pool exhausted"
                );
                return Err(DbError::pool_exhausted(&inner.config.name, start.elapsed()));
            }
        };

        let guard = PoolInner::checkout(inner, permit, context, true).await?;
        inner.stats.record_acquisition(start.elapsed());
        Ok(guard)
    }

    /// Return a resource, destroying it when `error` is connection-fatal.
    pub async fn release(&self, resource: Pooled<M>, error: Option<&DbError>) {
        resource.release(error).await;
    }

    /// Check the pool's backend now; recovers the pool on success.
    pub async fn check_health(&self) -> bool {
        PoolInner::check_health(&self.inner).await
    }

    /// Create resources until `min_size` are idle. Returns how many were created.
    pub async fn warm_up(&self) -> usize {
        let inner = &self.inner;
        let mut created = 0;
        while inner.idle().len() < inner.config.min_size {
            let Ok(permit) = inner.permits.clone().try_acquire_owned() else {
                break;
            };
            let mut slot = LiveSlot::reserve(inner);
            match inner.manager.create().await {
                Ok(value) => {
                    AtomicPoolStats::inc(&inner.stats.created);
                    slot.disarm();
                    inner.idle().push_back(PooledResource::new(value));
                    drop(permit);
                    created += 1;
                }
                Err(e) => {
                    drop(slot);
                    warn!(pool = %inner.config.name, error = %e, "Warm-up stopped");
                    break;
                }
            }
        }
        created
    }

    pub fn is_available(&self) -> bool {
        !self.inner.unavailable.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }

    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let s = &self.inner.stats;
        let (live, idle) = {
            let idle = self.inner.idle();
            (self.inner.live.load(Ordering::Acquire), idle.len())
        };
        PoolStats {
            created: s.created.load(Ordering::Relaxed),
            destroyed: s.destroyed.load(Ordering::Relaxed),
            acquisitions: s.acquisitions.load(Ordering::Relaxed),
            exhausted: s.exhausted.load(Ordering::Relaxed),
            health_check_failures: s.health_check_failures.load(Ordering::Relaxed),
            total_wait_ms: s.total_wait_ms.load(Ordering::Relaxed),
            live,
            idle,
            outstanding: live.saturating_sub(idle),
        }
    }

    /// Drain and destroy idle resources; late releases are destroyed too.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.permits.close();
        {
            let mut handle = inner.recovery_handle.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }

        let drained: Vec<_> = inner.idle().drain(..).collect();
        let count = drained.len();
        for resource in drained {
            let slot = LiveSlot::held(inner);
            inner.manager.destroy(resource.value).await;
            drop(slot);
        }
        info!(pool = %inner.config.name, destroyed = count, "Pool closed");
    }
}

impl<M: ResourceManager> std::fmt::Debug for ObjectPool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.inner.config.name)
            .field("max_size", &self.inner.config.max_size)
            .field("live", &self.live_count())
            .field("available", &self.is_available())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A checked-out resource.
///
/// Prefer [`Pooled::release`]; dropping a healthy resource returns it to the
/// idle queue, while dropping one whose health is not `Healthy` destroys it.
pub struct Pooled<M: ResourceManager> {
    resource: Option<PooledResource<M::Resource>>,
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<PoolInner<M>>,
}

impl<M: ResourceManager> Pooled<M> {
    fn entry(&self) -> &PooledResource<M::Resource> {
        self.resource
            .as_ref()
            .expect("resource present until released")
    }

    pub fn pool_name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    pub fn health(&self) -> HealthState {
        self.entry().health
    }

    pub fn created_at(&self) -> Instant {
        self.entry().created_at
    }

    pub fn last_acquired(&self) -> Instant {
        self.entry().last_acquired
    }

    pub fn last_context(&self) -> Option<u64> {
        self.entry().last_context
    }

    pub fn set_health(&mut self, health: HealthState) {
        if let Some(resource) = self.resource.as_mut() {
            resource.health = health;
        }
    }

    /// Destroy instead of reuse on release.
    pub fn mark_broken(&mut self) {
        self.set_health(HealthState::Broken);
    }

    /// Give the resource back. A connection-fatal `error` or a `Broken`
    /// resource is destroyed; anything else goes back to the idle queue.
    pub async fn release(mut self, error: Option<&DbError>) {
        let (Some(resource), Some(permit)) = (self.resource.take(), self.permit.take()) else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let fatal = error.filter(|e| inner.manager.is_fatal(e));

        if let Some(e) = fatal {
            inner.note_fatal(e);
        }
        if fatal.is_some()
            || resource.health == HealthState::Broken
            || inner.closed.load(Ordering::Acquire)
        {
            inner.destroy(resource, permit).await;
        } else {
            inner.return_to_idle(resource, permit);
        }
    }
}

impl<M: ResourceManager> std::ops::Deref for Pooled<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        &self.entry().value
    }
}

impl<M: ResourceManager> std::ops::DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self
            .resource
            .as_mut()
            .expect("resource present until released")
            .value
    }
}

impl<M: ResourceManager> Drop for Pooled<M> {
    fn drop(&mut self) {
        let (Some(resource), Some(permit)) = (self.resource.take(), self.permit.take()) else {
            return;
        };
        let inner = Arc::clone(&self.inner);

        if resource.health == HealthState::Healthy && !inner.closed.load(Ordering::Acquire) {
            inner.return_to_idle(resource, permit);
            return;
        }

        // Destroying is async; without a runtime the resource is simply dropped.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    inner.destroy(resource, permit).await;
                });
            }
            Err(_) => {
                drop(resource);
                inner.forget_one();
                drop(permit);
            }
        }
    }
}

impl<M: ResourceManager> std::fmt::Debug for Pooled<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled")
            .field("pool", &self.inner.config.name)
            .field("health", &self.resource.as_ref().map(|r| r.health))
            .finish_non_exhaustive()
    }
}
