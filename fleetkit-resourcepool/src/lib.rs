#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

mod checkout;
mod config;
pub mod error;
mod metrics;
mod pool;
mod resource;
mod strategy;
#[cfg(test)]
mod testing;

pub use crate::{
    checkout::Checkout,
    config::PoolConfig,
    error::Error,
    metrics::PoolState,
    pool::Pool,
    resource::Resource,
    strategy::AllocateRelease,
};
