//! Agent configuration structures.

use std::collections::HashMap;

use fleetkit_resourcepool::PoolConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{logging::LoggingConfig, peer::PeerPoolConfig};

/// Root container for agent configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct FleetConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Pooled connections to other agents.
    #[serde(default)]
    pub peers: PeerPoolConfig,
    /// Additional named pools, for application-defined resources.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub pools: HashMap<String, PoolConfig>,
}

impl FleetConfig {
    /// Create builder for agent configuration.
    pub fn builder() -> FleetConfigBuilder {
        FleetConfigBuilder::new()
    }

    /// Configuration of a named pool, with pool name filled in if absent.
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<PoolConfig> {
        let mut cfg = self.pools.get(name)?.clone();
        if cfg.name.is_none() {
            cfg = cfg.with_name(name);
        }
        Some(cfg)
    }
}

/// Top-level agent configuration error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FleetConfigError {
    /// Configuration builder error
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

/// Builder for agent configuration.
#[must_use]
pub struct FleetConfigBuilder {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl FleetConfigBuilder {
    /// Alternative method to construct an agent configuration builder.
    pub fn new() -> Self {
        Self {
            builder: config::Config::builder(),
        }
    }

    /// Try to build configuration object from preconfigured sources.
    ///
    /// This method will do all the I/O necessary to load the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if some configuration loading was unsuccessful.
    pub fn build(self) -> Result<FleetConfig, FleetConfigError> {
        self.builder.build()?.try_deserialize().map_err(Into::into)
    }

    /// Add a custom object implementing [`Source`] trait as a source of agent configuration.
    ///
    /// [`Source`]: config::Source
    pub fn with_source<T>(mut self, source: T) -> Self
    where
        T: config::Source + Send + Sync + 'static,
    {
        self.builder = self.builder.add_source(source);
        self
    }

    /// Add file as a source of agent configuration.
    ///
    /// Format is detected from file extension.
    pub fn with_file(self, name: impl AsRef<str>) -> Self {
        self.with_source(config::File::with_name(name.as_ref()))
    }

    /// Add environment variables as a source of agent configuration.
    ///
    /// Nested keys are separated by double underscores, e.g. `AGENT_PEERS__CONNECT_TIMEOUT` with
    /// prefix `AGENT`.
    pub fn with_env(self, prefix: impl AsRef<str>) -> Self {
        self.with_source(
            config::Environment::with_prefix(prefix.as_ref())
                .prefix_separator("_")
                .separator("__"),
        )
    }
}

impl Default for FleetConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
