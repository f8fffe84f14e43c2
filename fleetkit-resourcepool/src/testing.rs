//! Mock allocation strategy for tests.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::AllocateRelease;

/// Counters shared by all mocks of a test.
#[derive(Clone, Debug, Default)]
pub(crate) struct Counters {
    allocations: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl Counters {
    pub(crate) fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub(crate) fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub(crate) fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

/// Strategy counting its calls, with configurable delays and failures.
#[derive(Debug, Default)]
pub(crate) struct Mock {
    /// Counters shared with other mocks.
    pub(crate) total: Counters,
    /// Counters of this mock only.
    pub(crate) own: Counters,
    pub(crate) allocate_delay: Duration,
    pub(crate) release_delay: Duration,
    pub(crate) fail_allocate: Arc<AtomicBool>,
    pub(crate) fail_release: bool,
    live: bool,
}

impl Mock {
    pub(crate) fn new(total: &Counters) -> Self {
        Self {
            total: total.clone(),
            ..Default::default()
        }
    }

    pub(crate) fn own(&self) -> Counters {
        self.own.clone()
    }

    pub(crate) fn with_allocate_delay(mut self, delay: Duration) -> Self {
        self.allocate_delay = delay;
        self
    }

    pub(crate) fn with_release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = delay;
        self
    }

    pub(crate) fn failing_allocate(self) -> Self {
        self.fail_allocate.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }
}

#[async_trait::async_trait]
impl AllocateRelease for Mock {
    type Error = io::Error;

    async fn allocate(&mut self) -> Result<(), Self::Error> {
        assert!(!self.live, "allocated twice without release");
        if !self.allocate_delay.is_zero() {
            tokio::time::sleep(self.allocate_delay).await;
        }
        if self.fail_allocate.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        self.live = true;
        for counters in [&self.total, &self.own] {
            counters.allocations.fetch_add(1, Ordering::SeqCst);
            let live = counters.live.fetch_add(1, Ordering::SeqCst) + 1;
            counters.max_live.fetch_max(live, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<(), Self::Error> {
        assert!(self.live, "released without allocation");
        self.live = false;
        for counters in [&self.total, &self.own] {
            counters.live.fetch_sub(1, Ordering::SeqCst);
            counters.releases.fetch_add(1, Ordering::SeqCst);
        }
        if !self.release_delay.is_zero() {
            tokio::time::sleep(self.release_delay).await;
        }
        if self.fail_release {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "hung up"));
        }
        Ok(())
    }
}
