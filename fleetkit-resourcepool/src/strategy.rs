//! Allocation strategy supplied by pool users.

/// Establishes and tears down the live state behind a pooled resource.
///
/// The pool guarantees that calls alternate: [`allocate`] is never called twice without a
/// [`release`] in between, and the two never run concurrently for the same resource. Both calls
/// are made without holding any pool-wide lock, so they are free to perform slow network I/O.
///
/// [`allocate`]: AllocateRelease::allocate
/// [`release`]: AllocateRelease::release
#[async_trait::async_trait]
pub trait AllocateRelease: Send + 'static {
    /// Error type returned by the strategy.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Establish live state, e.g. open a network connection.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the resource could not be allocated. The pool reverts the resource to
    /// unallocated state and passes the error on to the caller of `get`.
    async fn allocate(&mut self) -> Result<(), Self::Error>;

    /// Tear down live state, e.g. close a network connection.
    ///
    /// # Errors
    ///
    /// Returns `Err` if teardown was unclean. The resource is considered released regardless.
    async fn release(&mut self) -> Result<(), Self::Error>;
}

#[async_trait::async_trait]
impl<T> AllocateRelease for Box<T>
where
    T: AllocateRelease + ?Sized,
{
    type Error = T::Error;

    async fn allocate(&mut self) -> Result<(), Self::Error> {
        (**self).allocate().await
    }

    async fn release(&mut self) -> Result<(), Self::Error> {
        (**self).release().await
    }
}
