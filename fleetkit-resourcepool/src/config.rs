//! Pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource pool configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of resources allowed to be allocated at once.
    #[serde(default = "PoolConfig::default_capacity", alias = "max")]
    pub capacity: usize,
    /// Pool name used in metrics and traces.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "label")]
    pub name: Option<String>,
    /// Minimum time between two recordings of pool state gauges.
    #[serde(
        default = "PoolConfig::default_metrics_interval",
        with = "humantime_serde"
    )]
    pub metrics_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
            name: None,
            metrics_interval: Self::default_metrics_interval(),
        }
    }
}

impl PoolConfig {
    /// Create configuration for a pool of given capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Set pool name.
    #[must_use]
    pub fn with_name(mut self, name: impl ToString) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Default value for [`Self::capacity`].
    #[must_use]
    #[inline]
    fn default_capacity() -> usize {
        16
    }

    /// Default value for [`Self::metrics_interval`].
    #[must_use]
    #[inline]
    fn default_metrics_interval() -> Duration {
        Duration::from_secs(15)
    }
}
