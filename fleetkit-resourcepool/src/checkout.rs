//! Scoped checkout of a pooled resource.

use std::ops::Deref;

use crate::{error::Error, resource::Resource, strategy::AllocateRelease};

/// Checked out resource.
///
/// Puts the resource back into the pool when dropped. A release scheduled while the resource
/// was checked out then runs in the background; use [`Checkout::put`] to wait for it instead.
#[must_use = "resource is returned to the pool as soon as the checkout is dropped"]
pub struct Checkout<S: AllocateRelease> {
    /// Checked out resource.
    resource: Resource<S>,
    /// Resource was already returned to the pool.
    returned: bool,
}

impl<S: AllocateRelease> Checkout<S> {
    pub(crate) fn new(resource: Resource<S>) -> Self {
        Self {
            resource,
            returned: false,
        }
    }

    /// Return the resource to the pool, waiting for a scheduled release to finish.
    pub async fn put(mut self) {
        self.returned = true;
        self.resource.put().await;
    }

    /// Release the resource and end the checkout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReleaseFailed`] if the strategy failed to release the resource.
    pub async fn release(mut self) -> Result<(), Error> {
        self.returned = true;
        let result = self.resource.release().await;
        self.resource.put().await;
        result
    }
}

impl<S: AllocateRelease> Deref for Checkout<S> {
    type Target = Resource<S>;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

impl<S: AllocateRelease> AsRef<Resource<S>> for Checkout<S> {
    fn as_ref(&self) -> &Resource<S> {
        &self.resource
    }
}

impl<S: AllocateRelease> std::fmt::Debug for Checkout<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkout")
            .field("resource", &self.resource)
            .field("returned", &self.returned)
            .finish()
    }
}

impl<S: AllocateRelease> Drop for Checkout<S> {
    fn drop(&mut self) {
        if !self.returned {
            self.resource.inner().put_in_background();
        }
    }
}
