#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(missing_docs)]

mod config;
mod logging;
mod peer;
mod util;

pub use fleetkit_resourcepool as resourcepool;

pub use self::{
    config::{FleetConfig, FleetConfigBuilder, FleetConfigError},
    logging::{
        LogDirectory, LogFormat, LogMetadata, LogOutput, LogQueue, LogRotation, LogSink,
        LoggingConfig, LoggingError, LoggingLevel,
    },
    peer::{PeerConnection, PeerConnector, PeerError, PeerPool, PeerPoolConfig},
};
