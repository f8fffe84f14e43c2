//! Pool bookkeeping, admission and eviction.

use std::{
    borrow::Cow,
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::Instant,
};

use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    sync::{futures::Notified, Mutex as AsyncMutex, Notify, OwnedMutexGuard, Semaphore},
};
use tracing::{debug, error, warn, Instrument};

use crate::{
    config::PoolConfig,
    error::SharedError,
    metrics::{PoolMetrics, PoolState},
    resource::Resource,
    strategy::AllocateRelease,
};

/// Identifier of a resource within its pool.
pub(crate) type ResourceId = u64;

/// Bounded pool of lazily allocated resources.
///
/// The pool limits the number of resources that hold live underlying state at the same time.
/// Resources are created with [`Pool::create`], and are allocated on first use. Allocated
/// resources stay allocated when returned to the pool, so that the next [`Resource::get`] call
/// doesn't have to allocate again. When a resource needs allocating and the pool is full, the
/// idle resource that was returned the longest time ago is released to make room.
///
/// Cloning the pool is cheap, and all clones share the same capacity.
pub struct Pool<S> {
    inner: Arc<PoolInner<S>>,
}

impl<S> Clone for Pool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for Pool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl<S: AllocateRelease> Pool<S> {
    /// Create a pool allowing at most `capacity` resources to be allocated at once.
    ///
    /// `label` is used to tag pool metrics and traces.
    pub fn new<L: Into<Cow<'static, str>>>(capacity: usize, label: Option<L>) -> Self {
        Self::with_metrics_interval(
            capacity,
            label.map_or(Cow::Borrowed("default"), Into::into),
            PoolConfig::default().metrics_interval,
        )
    }

    /// Create a pool from configuration.
    #[must_use]
    pub fn from_config(cfg: &PoolConfig) -> Self {
        Self::with_metrics_interval(
            cfg.capacity,
            cfg.name
                .clone()
                .map_or(Cow::Borrowed("default"), Cow::Owned),
            cfg.metrics_interval,
        )
    }

    fn with_metrics_interval(
        capacity: usize,
        name: Cow<'static, str>,
        interval: std::time::Duration,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            metrics: PoolMetrics::new(name.clone(), interval),
            name,
            capacity,
            admission: Semaphore::new(capacity),
            state: Mutex::new(Bookkeeping::default()),
            released: Notify::new(),
        });
        inner.update_metrics();
        Self { inner }
    }

    /// Create a new resource bound to this pool.
    ///
    /// The resource starts unallocated. `strategy` is only invoked by the pool, when the
    /// resource needs allocating or releasing.
    pub fn create(&self, strategy: S) -> Resource<S> {
        let strategy = Arc::new(AsyncMutex::new(strategy));
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.slots.insert(id, Slot::new(Arc::clone(&strategy)));
            id
        };
        Resource::new(Arc::clone(&self.inner), id, strategy)
    }
}

impl<S> Pool<S> {
    pub(crate) fn from_inner(inner: Arc<PoolInner<S>>) -> Self {
        Self { inner }
    }

    /// Maximum number of resources allowed to be allocated at once.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Pool name, as used in metrics and traces.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Snapshot of pool bookkeeping.
    #[must_use]
    pub fn state(&self) -> PoolState {
        self.inner.state()
    }
}

/// Shared pool internals.
pub(crate) struct PoolInner<S> {
    /// Pool name.
    pub(crate) name: Cow<'static, str>,
    /// Maximum number of resources allocated at once.
    capacity: usize,
    /// One permit per checked out resource.
    pub(crate) admission: Semaphore,
    /// Bookkeeping. Never held across a strategy call.
    state: Mutex<Bookkeeping<S>>,
    /// Woken every time a release finishes.
    released: Notify,
    /// Pool metrics.
    pub(crate) metrics: PoolMetrics,
}

/// Pool bookkeeping, guarded by the pool lock.
struct Bookkeeping<S> {
    /// All live resources of the pool, and idle resources whose handles were dropped.
    slots: HashMap<ResourceId, Slot<S>>,
    /// Idle allocated resources, keyed by the order in which they were returned.
    unused: BTreeMap<u64, ResourceId>,
    /// Number of checked out resources, including those being allocated.
    used: usize,
    /// Number of releases in progress.
    releasing: usize,
    /// Next resource identifier.
    next_id: ResourceId,
    /// Next key in `unused`.
    next_idle_seq: u64,
}

impl<S> Default for Bookkeeping<S> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            unused: BTreeMap::new(),
            used: 0,
            releasing: 0,
            next_id: 0,
            next_idle_seq: 0,
        }
    }
}

impl<S> Bookkeeping<S> {
    fn allocated(&self) -> usize {
        self.used + self.unused.len() + self.releasing
    }

    fn mark_idle(&mut self, id: ResourceId) {
        let seq = self.next_idle_seq;
        self.next_idle_seq += 1;
        slot_mut(&mut self.slots, id).idle_since = Some(seq);
        self.unused.insert(seq, id);
    }
}

/// Bookkeeping for a single resource.
struct Slot<S> {
    /// Allocation strategy. Its lock is held for the duration of every strategy call.
    strategy: Arc<AsyncMutex<S>>,
    /// Strategy holds live state, or is being allocated.
    allocated: bool,
    /// Allocation is in progress.
    allocating: bool,
    /// Time when the resource was handed out, if it is checked out.
    checked_out: Option<Instant>,
    /// Release instead of recycling on next put.
    release_on_put: bool,
    /// Release is in progress.
    releasing: bool,
    /// Key in [`Bookkeeping::unused`], if the resource is idle.
    idle_since: Option<u64>,
    /// Result of the last release.
    last_release_error: Option<SharedError>,
    /// All handles to the resource were dropped.
    detached: bool,
}

impl<S> Slot<S> {
    fn new(strategy: Arc<AsyncMutex<S>>) -> Self {
        Self {
            strategy,
            allocated: false,
            allocating: false,
            checked_out: None,
            release_on_put: false,
            releasing: false,
            idle_since: None,
            last_release_error: None,
            detached: false,
        }
    }

    /// Take the strategy lock of a resource that is allocated and not allocating.
    ///
    /// Nobody else can hold it in this state.
    fn lock_strategy(&self) -> OwnedMutexGuard<S> {
        match Arc::clone(&self.strategy).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => panic!("strategy of an allocated resource is locked by another task"),
        }
    }
}

fn slot_mut<S>(slots: &mut HashMap<ResourceId, Slot<S>>, id: ResourceId) -> &mut Slot<S> {
    match slots.get_mut(&id) {
        Some(slot) => slot,
        None => panic!("resource {id} is not registered in pool"),
    }
}

/// Next step of an allocation.
pub(crate) enum Prepared<'p, S> {
    /// Resource is marked as allocating, strategy may be invoked.
    Ready,
    /// Pool is full, this idle resource must be released first.
    Evict(ReleaseJob<S>),
    /// Pool is full with no idle resources, but some releases are in progress.
    Wait(Notified<'p>),
}

/// Outcome of returning a resource to the pool.
pub(crate) enum Returned<S> {
    /// Resource is idle and can be reused.
    Recycled,
    /// Resource was scheduled for release, which must now be run.
    Released(ReleaseJob<S>),
    /// Resource was released while checked out.
    Stale,
}

/// Outcome of a release request.
pub(crate) enum Releasing<S> {
    /// Resource is not allocated. Contains the result of the last release.
    NotAllocated(Option<SharedError>),
    /// Release must now be run.
    Started(ReleaseJob<S>),
    /// Resource is in use, and will be released when put back.
    Deferred,
}

impl<S> PoolInner<S> {
    pub(crate) fn state(&self) -> PoolState {
        let state = self.state.lock();
        PoolState {
            capacity: self.capacity,
            used: state.used,
            idle: state.unused.len(),
            releasing: state.releasing,
        }
    }

    /// Record pool state gauges, if enough time has passed since last recording.
    pub(crate) fn update_metrics(&self) {
        if self.metrics.state_due() {
            self.metrics.record_state(self.state());
        }
    }

    pub(crate) fn is_allocated(&self, id: ResourceId) -> bool {
        self.state
            .lock()
            .slots
            .get(&id)
            .is_some_and(|slot| slot.allocated && !slot.allocating)
    }

    pub(crate) fn is_checked_out(&self, id: ResourceId) -> bool {
        self.state
            .lock()
            .slots
            .get(&id)
            .is_some_and(|slot| slot.checked_out.is_some())
    }

    /// Resource holds no live state, and nothing is happening to it.
    pub(crate) fn is_dormant(&self, id: ResourceId) -> bool {
        self.state.lock().slots.get(&id).map_or(true, |slot| {
            !slot.allocated && !slot.releasing && slot.checked_out.is_none()
        })
    }

    /// Check out an already allocated resource.
    ///
    /// Caller must hold both the checkout gate and an admission permit.
    pub(crate) fn try_reuse(&self, id: ResourceId) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let slot = slot_mut(&mut state.slots, id);
        if !slot.allocated {
            return false;
        }
        if let Some(seq) = slot.idle_since.take() {
            state.unused.remove(&seq);
        }
        slot.checked_out = Some(Instant::now());
        state.used += 1;
        true
    }

    /// Finish an allocation started by [`PoolInner::prepare_allocation`].
    ///
    /// On failure, the admission permit is returned to the pool.
    pub(crate) fn finish_allocation(&self, id: ResourceId, ok: bool) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let slot = slot_mut(&mut state.slots, id);
            slot.allocating = false;
            if ok {
                slot.checked_out = Some(Instant::now());
                slot.last_release_error = None;
                return;
            }
            slot.allocated = false;
            slot.release_on_put = false;
            state.used -= 1;
        }
        self.admission.add_permits(1);
        self.released.notify_waiters();
    }

    /// Forget a resource whose last handle was dropped.
    ///
    /// Allocated resources stay in the pool as idle, until they are evicted.
    pub(crate) fn detach(&self, id: ResourceId) {
        let mut returned_permit = false;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(slot) = state.slots.get_mut(&id) else {
                return;
            };
            slot.release_on_put = false;
            if let Some(since) = slot.checked_out.take() {
                self.metrics.record_use(since);
                if slot.allocated {
                    debug!(pool = %self.name, resource = id, "dropped checked out resource");
                    state.used -= 1;
                    state.mark_idle(id);
                    returned_permit = true;
                }
            }
            let slot = slot_mut(&mut state.slots, id);
            if slot.allocated || slot.allocating {
                slot.detached = true;
            } else {
                state.slots.remove(&id);
            }
        }
        if returned_permit {
            self.admission.add_permits(1);
        }
    }
}

impl<S: AllocateRelease> PoolInner<S> {
    /// Make room for a new allocation, and mark resource as allocating.
    ///
    /// Must be called repeatedly until [`Prepared::Ready`] is returned.
    ///
    /// # Panics
    ///
    /// Panics if the pool is full, yet has no idle resources and no releases in progress. This
    /// means pool bookkeeping is corrupted.
    pub(crate) fn prepare_allocation(self: &Arc<Self>, id: ResourceId) -> Prepared<'_, S> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.allocated() >= self.capacity {
            if let Some((_, victim)) = state.unused.pop_first() {
                let slot = slot_mut(&mut state.slots, victim);
                slot.idle_since = None;
                slot.allocated = false;
                slot.releasing = true;
                let strategy = slot.lock_strategy();
                state.releasing += 1;
                self.metrics.record_eviction();
                debug!(pool = %self.name, resource = victim, "evicting idle resource");
                return Prepared::Evict(ReleaseJob {
                    pool: Arc::clone(self),
                    id: victim,
                    strategy,
                    returns_permit: false,
                });
            }
            if state.releasing > 0 {
                return Prepared::Wait(self.released.notified());
            }
            let allocated = state.allocated();
            drop(guard);
            panic!(
                "pool {} is full ({allocated} of {}) with no idle resource to evict",
                self.name, self.capacity
            );
        }
        let slot = slot_mut(&mut state.slots, id);
        slot.allocating = true;
        slot.allocated = true;
        state.used += 1;
        Prepared::Ready
    }

    /// Return a checked out resource to the pool.
    ///
    /// Checkout gate is not touched, and must be freed by the caller.
    ///
    /// # Panics
    ///
    /// Panics if the resource was not checked out.
    pub(crate) fn begin_put(self: &Arc<Self>, id: ResourceId) -> Returned<S> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let slot = slot_mut(&mut state.slots, id);
        let Some(since) = slot.checked_out.take() else {
            drop(guard);
            panic!("resource {id} was put without a matching get");
        };
        self.metrics.record_use(since);
        if !slot.allocated {
            slot.release_on_put = false;
            return Returned::Stale;
        }
        if slot.release_on_put {
            slot.release_on_put = false;
            slot.allocated = false;
            slot.releasing = true;
            let strategy = slot.lock_strategy();
            state.used -= 1;
            state.releasing += 1;
            return Returned::Released(ReleaseJob {
                pool: Arc::clone(self),
                id,
                strategy,
                returns_permit: true,
            });
        }
        state.used -= 1;
        state.mark_idle(id);
        drop(guard);
        self.admission.add_permits(1);
        Returned::Recycled
    }

    /// Start releasing a resource, whether it is idle or in use.
    pub(crate) fn begin_release(self: &Arc<Self>, id: ResourceId) -> Releasing<S> {
        let mut guard = self.state.lock();
        self.begin_release_locked(&mut guard, id)
    }

    /// Release a resource once it's put back, or right away if it's idle.
    pub(crate) fn schedule_release(self: &Arc<Self>, id: ResourceId) -> Releasing<S> {
        let mut guard = self.state.lock();
        let slot = slot_mut(&mut guard.slots, id);
        if !slot.allocated && !slot.allocating {
            return Releasing::NotAllocated(slot.last_release_error.clone());
        }
        if slot.checked_out.is_some() || slot.allocating {
            slot.release_on_put = true;
            return Releasing::Deferred;
        }
        self.begin_release_locked(&mut guard, id)
    }

    /// # Panics
    ///
    /// Panics if resource is being allocated.
    fn begin_release_locked(self: &Arc<Self>, state: &mut Bookkeeping<S>, id: ResourceId) -> Releasing<S> {
        let slot = slot_mut(&mut state.slots, id);
        if slot.allocating {
            panic!("resource {id} was released while being allocated");
        }
        if !slot.allocated {
            return Releasing::NotAllocated(slot.last_release_error.clone());
        }
        if let Some(seq) = slot.idle_since.take() {
            state.unused.remove(&seq);
        }
        slot.allocated = false;
        slot.release_on_put = false;
        slot.releasing = true;
        // Checkout stays in effect until the holder puts the resource back.
        let was_used = slot.checked_out.is_some();
        let strategy = slot.lock_strategy();
        if was_used {
            state.used -= 1;
        }
        state.releasing += 1;
        Releasing::Started(ReleaseJob {
            pool: Arc::clone(self),
            id,
            strategy,
            returns_permit: was_used,
        })
    }

    /// Finish bookkeeping for a release started earlier.
    fn finish_release(&self, id: ResourceId, error: Option<SharedError>) {
        {
            let mut state = self.state.lock();
            state.releasing -= 1;
            let forget = match state.slots.get_mut(&id) {
                Some(slot) => {
                    slot.releasing = false;
                    slot.last_release_error = error;
                    slot.detached && !slot.allocated && !slot.allocating
                }
                None => false,
            };
            if forget {
                state.slots.remove(&id);
            }
        }
        self.released.notify_waiters();
    }
}

/// Release of a single resource, with bookkeeping already updated.
///
/// Holds the strategy lock, so that the resource cannot be allocated again before the release
/// finishes.
#[must_use]
pub(crate) struct ReleaseJob<S> {
    pool: Arc<PoolInner<S>>,
    id: ResourceId,
    strategy: OwnedMutexGuard<S>,
    /// Resource was in use, and its admission permit must be returned afterwards.
    returns_permit: bool,
}

impl<S: AllocateRelease> ReleaseJob<S> {
    /// Run release in current task.
    pub(crate) async fn run(self) -> Result<(), SharedError> {
        let Self {
            pool,
            id,
            mut strategy,
            returns_permit,
        } = self;
        let started = Instant::now();
        let result = strategy
            .release()
            .await
            .map_err(|err| Arc::new(err) as SharedError);
        drop(strategy);
        pool.metrics.record_release(started, result.is_ok());
        match &result {
            Ok(()) => debug!(pool = %pool.name, resource = id, "resource released"),
            Err(err) => warn!(pool = %pool.name, resource = id, error = %err, "resource release failed"),
        }
        pool.finish_release(id, result.as_ref().err().cloned());
        if returns_permit {
            pool.admission.add_permits(1);
        }
        result
    }

    /// Run release to completion, even if the calling future is dropped.
    pub(crate) async fn run_detached(self) -> Result<(), SharedError> {
        match tokio::spawn(self.run().in_current_span()).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => Err(Arc::new(err)),
        }
    }

    /// Run release in background, without waiting for it.
    pub(crate) fn spawn(self) {
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.run().in_current_span());
            }
            Err(err) => {
                let Self {
                    pool,
                    id,
                    strategy,
                    returns_permit,
                } = self;
                error!(
                    pool = %pool.name,
                    resource = id,
                    error = %err,
                    "unable to release resource outside of async runtime"
                );
                drop(strategy);
                pool.finish_release(id, Some(Arc::new(err)));
                if returns_permit {
                    pool.admission.add_permits(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{Counters, Mock};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Pool created from configuration.
    #[test]
    fn pool_from_config() {
        let pool: Pool<Mock> = Pool::from_config(&PoolConfig::with_capacity(3).with_name("agents"));
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.name(), "agents");
        assert_eq!(pool.state(), PoolState { capacity: 3, ..Default::default() });
        assert!(!pool.state().is_saturated());

        let unnamed: Pool<Mock> = Pool::new(1, None::<&str>);
        assert_eq!(unnamed.name(), "default");
    }

    /// The idle resource returned the longest time ago is evicted first.
    #[tokio::test]
    async fn evicts_least_recently_returned() {
        let total = Counters::default();
        let pool = Pool::new(2, Some("lru"));
        let a = pool.create(Mock::new(&total));
        let b = pool.create(Mock::new(&total));
        let c = pool.create(Mock::new(&total));

        for res in [&a, &b, &a] {
            res.get_timeout(TIMEOUT).await.unwrap();
            res.put().await;
        }
        assert!(pool.state().is_saturated());

        c.get_timeout(TIMEOUT).await.unwrap();
        assert!(a.is_allocated());
        assert!(!b.is_allocated());
        assert!(c.is_allocated());
        assert_eq!(total.releases(), 1);
        c.put().await;
    }

    /// Allocation in a full pool waits for a release already in progress.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn allocation_waits_for_release_in_progress() {
        let total = Counters::default();
        let pool = Pool::new(1, Some("slow"));
        let a = pool.create(Mock::new(&total).with_release_delay(Duration::from_millis(100)));
        let b = pool.create(Mock::new(&total));
        a.get_timeout(TIMEOUT).await.unwrap();
        a.put().await;

        let releasing = tokio::spawn({
            let a = a.clone();
            async move { a.release().await }
        });
        while pool.state().releasing == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(pool.state().idle, 0);

        b.get_timeout(TIMEOUT).await.unwrap();
        assert_eq!(pool.state().releasing, 0);
        assert_eq!(pool.state().used, 1);
        assert_eq!(total.releases(), 1);
        releasing.await.unwrap().unwrap();
        b.put().await;
    }

    /// Handles of unallocated resources are forgotten right away.
    #[tokio::test]
    async fn dropped_resource_is_forgotten() {
        let pool = Pool::new(1, Some("drop"));
        let res = pool.create(Mock::default());
        let id = res.inner().id();
        drop(res);
        assert!(!pool.inner.state.lock().slots.contains_key(&id));
    }

    /// Dropping a checked out resource returns its pool slot.
    #[tokio::test]
    async fn dropped_checked_out_resource_frees_slot() {
        let pool = Pool::new(1, Some("drop"));
        let a = pool.create(Mock::default());
        a.get_timeout(TIMEOUT).await.unwrap();
        drop(a);
        assert_eq!(pool.state().used, 0);
        assert_eq!(pool.state().idle, 1);

        let b = pool.create(Mock::default());
        b.get_timeout(TIMEOUT).await.unwrap();
        assert_eq!(pool.state().allocated(), 1);
        assert!(pool.inner.state.lock().slots.len() == 1);
        b.put().await;
    }

    /// Many tasks sharing few resources never exceed pool capacity.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_use_stays_within_capacity() {
        const CAPACITY: usize = 3;
        let total = Counters::default();
        let pool = Pool::new(CAPACITY, Some("stress"));
        let resources: Vec<_> = (0..8)
            .map(|n| {
                pool.create(
                    Mock::new(&total)
                        .with_allocate_delay(Duration::from_millis(n % 3))
                        .with_release_delay(Duration::from_millis(n % 2)),
                )
            })
            .collect();

        let mut tasks = Vec::new();
        for task in 0..16_usize {
            let resources = resources.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..20_usize {
                    let res = &resources[(task * 7 + round * 3) % resources.len()];
                    let checkout = res.checkout_timeout(TIMEOUT).await.unwrap();
                    tokio::task::yield_now().await;
                    match (task + round) % 5 {
                        0 => checkout.release().await.unwrap(),
                        1 => {
                            checkout.schedule_release().await.unwrap();
                            checkout.put().await;
                        }
                        _ => checkout.put().await,
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let state = pool.state();
        assert!(total.max_live() <= CAPACITY);
        assert!(state.allocated() <= CAPACITY);
        assert_eq!(state.used, 0);
        assert_eq!(state.releasing, 0);
        assert_eq!(total.allocations() - total.releases(), state.idle);
    }
}
