use std::{
    borrow::Cow,
    sync::{Arc, LazyLock},
    time::{Duration, Instant},
};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram},
    Key, KeyValue, StringValue, Value,
};
use parking_lot::Mutex;

/// Central metrics singleton for resource pool metrics.
pub(crate) static POOL_METRICS: LazyLock<Arc<Metrics>> = LazyLock::new(|| Arc::new(Metrics::new()));

const KEY_POOL_NAME: Key = Key::from_static_str("fleetkit.pool.name");
const KEY_STATE: Key = Key::from_static_str("fleetkit.pool.resource.state");

/// Storage for pool metrics.
pub(crate) struct Metrics {
    /// The number of allocated resources that are currently in state described by the state
    /// attribute.
    pub(crate) res_count: Gauge<u64>,
    /// The maximum number of resources allowed to be allocated at once.
    pub(crate) res_max: Gauge<u64>,
    /// The time it took to obtain a ready resource.
    pub(crate) wait_time: Histogram<f64>,
    /// The time between checking out a resource and returning it to the pool.
    pub(crate) use_time: Histogram<f64>,
    /// Duration of allocation strategy calls.
    pub(crate) allocate_duration: Histogram<f64>,
    /// Duration of release strategy calls.
    pub(crate) release_duration: Histogram<f64>,
    /// Idle resources released to make room for others.
    pub(crate) evictions: Counter<u64>,
    /// Failed allocation strategy calls.
    pub(crate) allocate_errors: Counter<u64>,
    /// Failed release strategy calls.
    pub(crate) release_errors: Counter<u64>,
}

impl Metrics {
    /// Create new storage for pool metrics.
    ///
    /// You probably don't need this, as all pools use a central metrics singleton for storage.
    pub(crate) fn new() -> Self {
        let meter = global::meter("fleetkit-resourcepool");
        // fleetkit.pool.name (string)
        // fleetkit.pool.resource.state (used / idle / releasing)
        let res_count = meter
            .u64_gauge("fleetkit.pool.resource.count")
            .with_description("The number of allocated resources that are currently in state described by the state attribute.")
            .build();
        let res_max = meter
            .u64_gauge("fleetkit.pool.resource.max")
            .with_description("The maximum number of resources allowed to be allocated at once.")
            .build();
        let wait_time = meter
            .f64_histogram("fleetkit.pool.resource.wait_time")
            .with_unit("s")
            .with_description("The time it took to obtain a ready resource from the pool.")
            .build();
        let use_time = meter
            .f64_histogram("fleetkit.pool.resource.use_time")
            .with_unit("s")
            .with_description("The time between checking out a resource and returning it to the pool.")
            .build();
        let allocate_duration = meter
            .f64_histogram("fleetkit.pool.resource.allocate.duration")
            .with_unit("s")
            .with_description("Duration of resource allocation.")
            .build();
        let release_duration = meter
            .f64_histogram("fleetkit.pool.resource.release.duration")
            .with_unit("s")
            .with_description("Duration of resource release.")
            .build();
        let evictions = meter
            .u64_counter("fleetkit.pool.resource.evictions")
            .with_description("Idle resources released to make room for other resources.")
            .build();
        let allocate_errors = meter
            .u64_counter("fleetkit.pool.resource.allocate.errors")
            .with_description("Failed resource allocations.")
            .build();
        let release_errors = meter
            .u64_counter("fleetkit.pool.resource.release.errors")
            .with_description("Failed resource releases.")
            .build();
        Metrics {
            res_count,
            res_max,
            wait_time,
            use_time,
            allocate_duration,
            release_duration,
            evictions,
            allocate_errors,
            release_errors,
        }
    }

    pub(crate) fn record_state(&self, label: &[KeyValue; 1], state: PoolState) {
        self.res_max.record(state.capacity as u64, label);
        for (status, count) in [
            ("used", state.used),
            ("idle", state.idle),
            ("releasing", state.releasing),
        ] {
            self.res_count
                .record(count as u64, &status_kv(label[0].clone(), status));
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

pub(crate) fn pool_kv(name: Cow<'static, str>) -> [KeyValue; 1] {
    [KeyValue::new(KEY_POOL_NAME, name)]
}

pub(crate) fn status_kv(name: KeyValue, status: &'static str) -> [KeyValue; 2] {
    [
        name,
        KeyValue::new(KEY_STATE, Value::String(StringValue::from(status))),
    ]
}

/// Per-pool handle to the metrics singleton.
pub(crate) struct PoolMetrics {
    /// Premade label used to record metrics.
    pub(crate) label: [KeyValue; 1],
    /// Linked metrics storage.
    pub(crate) metrics: Arc<Metrics>,
    /// Minimum time between two recordings of pool state.
    interval: Duration,
    /// Time of last gathering of pool state.
    last_gathered_at: Mutex<Option<Instant>>,
}

impl PoolMetrics {
    pub(crate) fn new(name: Cow<'static, str>, interval: Duration) -> Self {
        Self {
            label: pool_kv(name),
            metrics: Arc::clone(&POOL_METRICS),
            interval,
            last_gathered_at: Mutex::new(None),
        }
    }

    /// Check whether pool state is due to be recorded, and mark it as recorded if so.
    pub(crate) fn state_due(&self) -> bool {
        let mut last_gathered_at = self.last_gathered_at.lock();
        match *last_gathered_at {
            Some(at) if at.elapsed() < self.interval => false,
            _ => {
                *last_gathered_at = Some(Instant::now());
                true
            }
        }
    }

    pub(crate) fn record_state(&self, state: PoolState) {
        self.metrics.record_state(&self.label, state);
    }

    pub(crate) fn record_wait(&self, since: Instant) {
        self.metrics
            .wait_time
            .record(since.elapsed().as_secs_f64(), &self.label);
    }

    pub(crate) fn record_use(&self, since: Instant) {
        self.metrics
            .use_time
            .record(since.elapsed().as_secs_f64(), &self.label);
    }

    pub(crate) fn record_allocate(&self, since: Instant, ok: bool) {
        self.metrics
            .allocate_duration
            .record(since.elapsed().as_secs_f64(), &self.label);
        if !ok {
            self.metrics.allocate_errors.add(1, &self.label);
        }
    }

    pub(crate) fn record_release(&self, since: Instant, ok: bool) {
        self.metrics
            .release_duration
            .record(since.elapsed().as_secs_f64(), &self.label);
        if !ok {
            self.metrics.release_errors.add(1, &self.label);
        }
    }

    pub(crate) fn record_eviction(&self) {
        self.metrics.evictions.add(1, &self.label);
    }
}

/// Snapshot of pool bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolState {
    /// Maximum number of resources allowed to be allocated at once.
    pub capacity: usize,
    /// Allocated resources currently checked out.
    pub used: usize,
    /// Allocated resources not checked out by anyone.
    pub idle: usize,
    /// Resources whose release is in progress.
    pub releasing: usize,
}

impl PoolState {
    /// Number of resources counted against pool capacity.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.used + self.idle + self.releasing
    }

    /// Check whether a new allocation would require an eviction first.
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.allocated() >= self.capacity
    }
}
