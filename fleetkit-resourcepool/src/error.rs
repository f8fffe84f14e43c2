//! Error types and error support code.

use std::sync::Arc;

/// Boxed error returned by an allocation strategy.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Release error, shared between every caller that observes it.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Error type used by resource pools.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Cancelled while waiting for exclusive use of the resource.
    #[error("timed out waiting for exclusive use of resource")]
    CheckoutTimeout,
    /// Cancelled while waiting for a free pool slot.
    #[error("pool capacity exceeded")]
    CapacityExceeded,
    /// Call would block, and non-blocking operation was requested.
    #[error("acquisition from pool would block execution")]
    WouldBlock,
    /// Allocation strategy failed to allocate the resource.
    #[error("resource allocation failed: {0}")]
    AllocationFailed(#[source] BoxError),
    /// Allocation strategy failed to release the resource.
    ///
    /// Kept by the resource and returned again until it is allocated anew.
    #[error("resource release failed: {0}")]
    ReleaseFailed(#[source] SharedError),
}

impl Error {
    /// Check whether the pool gave up waiting before any resource state was touched.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::CheckoutTimeout | Self::CapacityExceeded)
    }
}
