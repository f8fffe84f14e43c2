//! Pooled resource handles.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{oneshot, Mutex as AsyncMutex, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn, Instrument};

use crate::{
    checkout::Checkout,
    error::Error,
    pool::{PoolInner, Prepared, Releasing, ResourceId, Returned},
    strategy::AllocateRelease,
    Pool,
};

/// Handle to a single pooled resource.
///
/// A resource is created once with [`Pool::create`], and then checked out and returned many times
/// with [`Resource::get`] and [`Resource::put`]. At most one caller can have the resource
/// checked out at a time; other callers of [`Resource::get`] wait for it to be put back.
///
/// Cloning the handle is cheap, and all clones refer to the same resource.
pub struct Resource<S> {
    inner: Arc<ResourceInner<S>>,
}

impl<S> Clone for Resource<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for Resource<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("pool", &self.inner.pool.name)
            .field("id", &self.inner.id())
            .field("allocated", &self.inner.pool.is_allocated(self.inner.id))
            .field("checked_out", &self.inner.pool.is_checked_out(self.inner.id))
            .finish()
    }
}

impl<S> Resource<S> {
    pub(crate) fn new(pool: Arc<PoolInner<S>>, id: ResourceId, strategy: Arc<AsyncMutex<S>>) -> Self {
        Self {
            inner: Arc::new(ResourceInner {
                pool,
                id,
                checkout: Semaphore::new(1),
                strategy,
            }),
        }
    }

    pub(crate) fn inner(&self) -> &ResourceInner<S> {
        &self.inner
    }

    /// Pool this resource belongs to.
    #[must_use]
    pub fn pool(&self) -> Pool<S> {
        Pool::from_inner(Arc::clone(&self.inner.pool))
    }

    /// Check whether underlying strategy currently holds live state.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.inner.pool.is_allocated(self.inner.id)
    }

    /// Check whether someone has this resource checked out.
    #[must_use]
    pub fn is_checked_out(&self) -> bool {
        self.inner.pool.is_checked_out(self.inner.id)
    }

    /// Check whether the resource is unallocated, not checked out, and has no release running.
    ///
    /// Once this returns `true`, the last release of the resource has fully completed.
    #[must_use]
    pub fn is_dormant(&self) -> bool {
        self.inner.pool.is_dormant(self.inner.id)
    }
}

impl<S: AllocateRelease> Resource<S> {
    /// Check out the resource for exclusive use, allocating it if necessary.
    ///
    /// Waits until the resource is not checked out by anyone else, and then until the pool has
    /// room for one more resource in use. Once both are acquired, `cancel` is no longer
    /// observed, and the call runs to completion.
    ///
    /// Every successful call must be paired with a call to [`Resource::put`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::CheckoutTimeout`] or [`Error::CapacityExceeded`] if cancelled while
    /// waiting, and [`Error::AllocationFailed`] if the allocation strategy returned an error.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.acquire(cancel.cancelled()).await
    }

    /// Check out the resource for exclusive use, waiting for a bounded time.
    ///
    /// Time spent in the allocation strategy is not counted against `timeout`.
    ///
    /// # Errors
    ///
    /// Same as [`Resource::get`], with `timeout` acting as the cancellation signal.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<(), Error> {
        self.acquire(tokio::time::sleep(timeout)).await
    }

    /// Instantly check out the resource, if it is already allocated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WouldBlock`] if the resource is checked out by someone else, the pool has
    /// no room, or the resource would need allocating.
    pub fn try_get(&self) -> Result<(), Error> {
        let pool = &self.inner.pool;
        let started = Instant::now();
        let _span = debug_span!("pool_try_acquire", pool = %pool.name, resource = self.inner.id)
            .entered();
        let gate = self
            .inner
            .checkout
            .try_acquire()
            .map_err(|_| Error::WouldBlock)?;
        let permit = pool.admission.try_acquire().map_err(|_| Error::WouldBlock)?;
        if !pool.try_reuse(self.inner.id) {
            return Err(Error::WouldBlock);
        }
        gate.forget();
        permit.forget();
        pool.metrics.record_wait(started);
        pool.update_metrics();
        Ok(())
    }

    /// Check out the resource, returning a guard which puts it back when dropped.
    ///
    /// # Errors
    ///
    /// Same as [`Resource::get`].
    pub async fn checkout(&self, cancel: &CancellationToken) -> Result<Checkout<S>, Error> {
        self.get(cancel).await?;
        Ok(Checkout::new(self.clone()))
    }

    /// Check out the resource, waiting for a bounded time, and return a guard which puts it back
    /// when dropped.
    ///
    /// # Errors
    ///
    /// Same as [`Resource::get_timeout`].
    pub async fn checkout_timeout(&self, timeout: Duration) -> Result<Checkout<S>, Error> {
        self.get_timeout(timeout).await?;
        Ok(Checkout::new(self.clone()))
    }

    /// Return the resource to the pool after use.
    ///
    /// The resource stays allocated and is ready for instant reuse, unless a release was
    /// scheduled with [`Resource::schedule_release`], in which case it is released now.
    ///
    /// # Panics
    ///
    /// Panics if the resource is not checked out.
    pub async fn put(&self) {
        if let Returned::Released(job) = self.inner.put() {
            // Outcome is kept as the last release error.
            let _ = job.run_detached().await;
        }
        self.inner.pool.update_metrics();
    }

    /// Release underlying state right away, whether the resource is in use or not.
    ///
    /// Meant for resources known to be unhealthy. If the resource is checked out, the holder
    /// still has to call [`Resource::put`], which will then do nothing but end the checkout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReleaseFailed`] if the strategy failed to release the resource. If the
    /// resource is not allocated, returns the outcome of the last release instead.
    ///
    /// # Panics
    ///
    /// Panics if the resource is being allocated.
    pub async fn release(&self) -> Result<(), Error> {
        let releasing = self.inner.pool.begin_release(self.inner.id);
        self.finish_release(releasing).await
    }

    /// Release the resource as soon as it is not in use.
    ///
    /// If the resource is checked out, it will be released when put back, and this call returns
    /// immediately. Otherwise it is released right away.
    ///
    /// # Errors
    ///
    /// Same as [`Resource::release`], including the outcome of the last release if the resource
    /// is not allocated. Deferred releases always return `Ok`.
    pub async fn schedule_release(&self) -> Result<(), Error> {
        let releasing = self.inner.pool.schedule_release(self.inner.id);
        self.finish_release(releasing).await
    }

    async fn finish_release(&self, releasing: Releasing<S>) -> Result<(), Error> {
        let result = match releasing {
            Releasing::NotAllocated(None) | Releasing::Deferred => Ok(()),
            Releasing::NotAllocated(Some(err)) => Err(err),
            Releasing::Started(job) => job.run_detached().await,
        };
        self.inner.pool.update_metrics();
        result.map_err(Error::ReleaseFailed)
    }

    async fn acquire<F>(&self, cancelled: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let pool = &self.inner.pool;
        let span = debug_span!("pool_acquire", pool = %pool.name, resource = self.inner.id);
        async move {
            let started = Instant::now();
            let mut cancelled = std::pin::pin!(cancelled);
            let gate = wait_permit(&self.inner.checkout, cancelled.as_mut())
                .await
                .ok_or(Error::CheckoutTimeout)?;
            let Some(permit) = wait_permit(&pool.admission, cancelled.as_mut()).await else {
                drop(gate);
                return Err(Error::CapacityExceeded);
            };
            // From here on, both are given back by put, or by a failed allocation.
            gate.forget();
            permit.forget();
            let result = if pool.try_reuse(self.inner.id) {
                trace!("reusing allocated resource");
                Ok(())
            } else {
                self.allocate_detached().await
            };
            pool.metrics.record_wait(started);
            pool.update_metrics();
            result
        }
        .instrument(span)
        .await
    }

    /// Allocate in a separate task, so that the allocation finishes even if the caller goes
    /// away.
    async fn allocate_detached(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(
            async move {
                let result = inner.allocate().await;
                if let Err(Ok(())) = tx.send(result) {
                    debug!("caller went away, returning allocated resource to pool");
                    if let Returned::Released(job) = inner.put() {
                        let _ = job.run().await;
                    }
                }
            }
            .in_current_span(),
        );
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::AllocationFailed("allocation task was aborted".into())),
        }
    }
}

/// Shared resource internals.
pub(crate) struct ResourceInner<S> {
    /// Owning pool.
    pool: Arc<PoolInner<S>>,
    /// Resource identifier in owning pool.
    id: ResourceId,
    /// Checkout gate, allowing one holder at a time.
    checkout: Semaphore,
    /// Allocation strategy. Shared with pool bookkeeping, for eviction.
    strategy: Arc<AsyncMutex<S>>,
}

impl<S: AllocateRelease> ResourceInner<S> {
    /// Allocate resource, evicting idle resources as needed.
    ///
    /// Caller must hold the checkout gate and an admission permit. On failure, both are
    /// returned.
    async fn allocate(&self) -> Result<(), Error> {
        loop {
            match self.pool.prepare_allocation(self.id) {
                Prepared::Ready => break,
                // Outcome is kept as the last release error of the evicted resource.
                Prepared::Evict(job) => {
                    let _ = job.run().await;
                }
                Prepared::Wait(released) => released.await,
            }
        }
        let started = Instant::now();
        let result = {
            // Waits for an earlier release of this same resource to finish.
            let mut strategy = self.strategy.lock().await;
            strategy.allocate().await
        };
        self.pool.metrics.record_allocate(started, result.is_ok());
        self.pool.finish_allocation(self.id, result.is_ok());
        match result {
            Ok(()) => {
                debug!("resource allocated");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "resource allocation failed");
                self.checkout.add_permits(1);
                Err(Error::AllocationFailed(Box::new(err)))
            }
        }
    }

    /// Return resource to the pool, and free the checkout gate.
    pub(crate) fn put(&self) -> Returned<S> {
        let returned = self.pool.begin_put(self.id);
        self.checkout.add_permits(1);
        returned
    }

    /// Return resource to the pool without waiting for a scheduled release.
    pub(crate) fn put_in_background(&self) {
        if let Returned::Released(job) = self.put() {
            job.spawn();
        }
        self.pool.update_metrics();
    }
}

impl<S> ResourceInner<S> {
    pub(crate) fn id(&self) -> ResourceId {
        self.id
    }
}

impl<S> Drop for ResourceInner<S> {
    fn drop(&mut self) {
        self.pool.detach(self.id);
    }
}

/// Take a semaphore permit, waiting until it is available or until cancelled.
async fn wait_permit<'s, F>(semaphore: &'s Semaphore, cancelled: Pin<&mut F>) -> Option<SemaphorePermit<'s>>
where
    F: Future<Output = ()>,
{
    if let Ok(permit) = semaphore.try_acquire() {
        return Some(permit);
    }
    tokio::select! {
        biased;
        permit = semaphore.acquire() => permit.ok(),
        () = cancelled => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        testing::{Counters, Mock},
        PoolState,
    };

    fn pool(capacity: usize) -> Pool<Mock> {
        Pool::new(capacity, Some("test"))
    }

    /// Get, put, get: the second checkout reuses the warm resource.
    #[tokio::test]
    async fn round_trip_keeps_resource_allocated() {
        let total = Counters::default();
        let pool = pool(2);
        let res = pool.create(Mock::new(&total));
        let cancel = CancellationToken::new();

        res.get(&cancel).await.unwrap();
        assert!(res.is_allocated());
        assert!(res.is_checked_out());
        res.put().await;
        assert!(res.is_allocated());
        assert!(!res.is_checked_out());
        assert_eq!(pool.state().idle, 1);

        res.get(&cancel).await.unwrap();
        assert_eq!(total.allocations(), 1);
        assert_eq!(pool.state().used, 1);
        assert_eq!(pool.state().idle, 0);
        res.put().await;
    }

    /// Put without a matching get is a programming error.
    #[tokio::test]
    #[should_panic(expected = "without a matching get")]
    async fn put_without_get_panics() {
        let pool = pool(1);
        let res = pool.create(Mock::default());
        res.put().await;
    }

    /// Second release is a no-op returning the stored outcome of the first.
    #[tokio::test]
    async fn release_is_idempotent() {
        let pool = pool(1);
        let mock = Mock::default().failing_release();
        let own = mock.own();
        let res = pool.create(mock);
        res.get_timeout(Duration::from_secs(1)).await.unwrap();
        res.put().await;

        let first = res.release().await.unwrap_err();
        assert!(matches!(first, Error::ReleaseFailed(_)));
        let second = res.release().await.unwrap_err();
        assert!(matches!(second, Error::ReleaseFailed(_)));
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(own.releases(), 1);
        assert!(!res.is_allocated());
        assert_eq!(pool.state(), PoolState { capacity: 1, ..Default::default() });
    }

    /// Capacity 1: getting B after A was returned evicts A first.
    #[tokio::test]
    async fn saturated_pool_evicts_idle_resource() {
        let total = Counters::default();
        let pool = pool(1);
        let a_mock = Mock::new(&total);
        let a_counters = a_mock.own();
        let a = pool.create(a_mock);
        let b = pool.create(Mock::new(&total));
        let cancel = CancellationToken::new();

        a.get(&cancel).await.unwrap();
        a.put().await;
        b.get(&cancel).await.unwrap();

        assert_eq!(a_counters.releases(), 1);
        assert!(!a.is_allocated());
        assert!(b.is_allocated());
        assert_eq!(total.allocations(), 2);
        assert_eq!(total.max_live(), 1);
        b.put().await;
    }

    /// Capacity 1 with A held: getting B gives up with `CapacityExceeded`.
    #[tokio::test]
    async fn cancelled_while_waiting_for_capacity() {
        let pool = pool(1);
        let a = pool.create(Mock::default());
        let b_mock = Mock::default();
        let b_counters = b_mock.own();
        let b = pool.create(b_mock);
        let cancel = CancellationToken::new();
        a.get(&cancel).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = b.get(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded));
        assert!(err.is_cancelled());
        assert!(!b.is_allocated());
        assert!(!b.is_checked_out());
        assert_eq!(b_counters.allocations(), 0);
        // Checkout gate of B was given back.
        a.put().await;
        b.get_timeout(Duration::from_secs(1)).await.unwrap();
        b.put().await;
    }

    /// Waiting for a resource someone else holds gives up with `CheckoutTimeout`.
    #[tokio::test]
    async fn cancelled_while_waiting_for_checkout() {
        let pool = pool(2);
        let a = pool.create(Mock::default());
        a.get_timeout(Duration::from_secs(1)).await.unwrap();
        let err = a.get_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::CheckoutTimeout));
        assert_eq!(pool.state().used, 1);
        a.put().await;
    }

    /// Two concurrent gets of the same resource are serialized.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_resource_gets_are_serialized() {
        let total = Counters::default();
        let pool = pool(2);
        let res = pool.create(Mock::new(&total).with_allocate_delay(Duration::from_millis(20)));
        res.get_timeout(Duration::from_secs(1)).await.unwrap();

        let second = tokio::spawn({
            let res = res.clone();
            async move {
                res.get_timeout(Duration::from_secs(5)).await.unwrap();
                let allocated = res.is_allocated();
                res.put().await;
                allocated
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());
        res.put().await;
        assert!(second.await.unwrap());
        assert_eq!(total.allocations(), 1);
    }

    /// Failed allocation gives back the admission permit and the checkout gate.
    #[tokio::test]
    async fn failed_allocation_returns_permit() {
        let pool = pool(1);
        let failing = Mock::default().failing_allocate();
        let switch = Arc::clone(&failing.fail_allocate);
        let a = pool.create(failing);
        let b = pool.create(Mock::default());

        let err = a.get_timeout(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::AllocationFailed(_)));
        assert!(!a.is_allocated());
        assert!(!a.is_checked_out());
        assert_eq!(pool.state(), PoolState { capacity: 1, ..Default::default() });

        b.get_timeout(Duration::from_secs(1)).await.unwrap();
        b.put().await;

        switch.store(false, Ordering::SeqCst);
        a.get_timeout(Duration::from_secs(1)).await.unwrap();
        assert!(a.is_allocated());
        assert!(!b.is_allocated());
        a.put().await;
    }

    /// Scheduled release of a checked out resource happens on put.
    #[tokio::test]
    async fn scheduled_release_waits_for_put() {
        let pool = pool(1);
        let mock = Mock::default();
        let own = mock.own();
        let res = pool.create(mock);
        res.get_timeout(Duration::from_secs(1)).await.unwrap();

        res.schedule_release().await.unwrap();
        assert!(res.is_allocated());
        assert!(!res.is_dormant());
        assert_eq!(own.releases(), 0);

        res.put().await;
        assert!(!res.is_allocated());
        assert!(res.is_dormant());
        assert_eq!(own.releases(), 1);
        assert_eq!(pool.state(), PoolState { capacity: 1, ..Default::default() });
    }

    /// Resource is not dormant until its release has finished.
    #[tokio::test]
    async fn dormant_after_release_completes() {
        let pool = pool(1);
        let res = pool.create(Mock::default().with_release_delay(Duration::from_millis(200)));
        assert!(res.is_dormant());
        res.get_timeout(Duration::from_secs(1)).await.unwrap();
        res.put().await;
        assert!(!res.is_dormant());

        let releasing = tokio::spawn({
            let res = res.clone();
            async move { res.release().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!res.is_allocated());
        assert!(!res.is_dormant());

        releasing.await.unwrap().unwrap();
        assert!(res.is_dormant());
    }

    /// Scheduled release of an idle resource happens right away.
    #[tokio::test]
    async fn scheduled_release_of_idle_resource() {
        let pool = pool(1);
        let mock = Mock::default().failing_release();
        let own = mock.own();
        let res = pool.create(mock);
        res.get_timeout(Duration::from_secs(1)).await.unwrap();
        res.put().await;

        let err = res.schedule_release().await.unwrap_err();
        assert!(matches!(err, Error::ReleaseFailed(_)));
        assert_eq!(own.releases(), 1);
        assert!(!res.is_allocated());
    }

    /// Releasing a checked out resource frees its pool slot, and put only ends the checkout.
    #[tokio::test]
    async fn release_while_checked_out() {
        let total = Counters::default();
        let pool = pool(1);
        let a = pool.create(Mock::new(&total));
        let b = pool.create(Mock::new(&total));
        a.get_timeout(Duration::from_secs(1)).await.unwrap();

        a.release().await.unwrap();
        assert!(!a.is_allocated());
        assert!(a.is_checked_out());
        assert_eq!(pool.state().used, 0);

        // Pool slot is free for another resource.
        b.get_timeout(Duration::from_secs(1)).await.unwrap();
        b.put().await;

        a.put().await;
        assert!(!a.is_checked_out());
        a.get_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(total.allocations(), 3);
        a.put().await;
    }

    /// Scheduling release of a resource released while checked out reports the stored outcome.
    #[tokio::test]
    async fn scheduled_release_after_release_while_checked_out() {
        let pool = pool(1);
        let mock = Mock::default().failing_release();
        let own = mock.own();
        let res = pool.create(mock);
        res.get_timeout(Duration::from_secs(1)).await.unwrap();

        let first = res.release().await.unwrap_err();
        assert!(matches!(first, Error::ReleaseFailed(_)));
        let scheduled = res.schedule_release().await.unwrap_err();
        assert!(matches!(scheduled, Error::ReleaseFailed(_)));
        assert_eq!(first.to_string(), scheduled.to_string());

        res.put().await;
        assert!(!res.is_checked_out());
        assert_eq!(own.releases(), 1);
        assert_eq!(pool.state(), PoolState { capacity: 1, ..Default::default() });
    }

    /// Releasing a resource while its allocation is in flight is a programming error.
    #[tokio::test]
    #[should_panic(expected = "released while being allocated")]
    async fn release_during_allocation_panics() {
        let pool = pool(1);
        let res = pool.create(Mock::default().with_allocate_delay(Duration::from_secs(1)));
        tokio::spawn({
            let res = res.clone();
            async move { res.get_timeout(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!res.is_allocated());
        let _ = res.release().await;
    }

    /// Non-blocking get only succeeds for warm resources.
    #[tokio::test]
    async fn try_get_requires_allocated_resource() {
        let pool = pool(1);
        let res = pool.create(Mock::default());
        assert!(matches!(res.try_get(), Err(Error::WouldBlock)));
        assert!(!res.is_checked_out());

        res.get_timeout(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(res.try_get(), Err(Error::WouldBlock)));
        res.put().await;

        res.try_get().unwrap();
        assert!(res.is_checked_out());
        res.put().await;
    }

    /// Dropping a checkout guard returns the resource to the pool.
    #[tokio::test]
    async fn checkout_guard_puts_on_drop() {
        let pool = pool(1);
        let res = pool.create(Mock::default());
        let cancel = CancellationToken::new();
        {
            let checkout = res.checkout(&cancel).await.unwrap();
            assert!(checkout.is_checked_out());
        }
        assert!(!res.is_checked_out());
        assert!(res.is_allocated());
        assert_eq!(pool.state().idle, 1);

        let checkout = res.checkout(&cancel).await.unwrap();
        checkout.release().await.unwrap();
        assert!(!res.is_allocated());
        assert!(!res.is_checked_out());
    }

    /// Allocation finishes even if the caller stops waiting for it.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_get_completes_allocation() {
        let pool = pool(1);
        let mock = Mock::default().with_allocate_delay(Duration::from_millis(100));
        let own = mock.own();
        let res = pool.create(mock);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), res.get(&CancellationToken::new()))
                .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(own.allocations(), 1);
        assert!(res.is_allocated());
        assert!(!res.is_checked_out());
        assert_eq!(pool.state().idle, 1);
        res.try_get().unwrap();
        res.put().await;
    }

    /// Dropping the last handle of an idle resource keeps it evictable.
    #[tokio::test]
    async fn dropped_idle_resource_is_evicted() {
        let total = Counters::default();
        let pool = pool(1);
        let a = pool.create(Mock::new(&total));
        a.get_timeout(Duration::from_secs(1)).await.unwrap();
        a.put().await;
        drop(a);
        assert_eq!(pool.state().idle, 1);

        let b = pool.create(Mock::new(&total));
        b.get_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(total.releases(), 1);
        assert_eq!(pool.state().idle, 0);
        b.put().await;
    }
}
