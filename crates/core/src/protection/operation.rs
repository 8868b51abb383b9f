//! The protected operation capability

use std::future::Future;

use genguard_domain::DownstreamError;

/// A downstream call that may be invoked once per retry attempt
///
/// Implemented for any `Fn() -> impl Future<Output = Result<T, DownstreamError>>`
/// that can be moved to another task, so closures work directly:
///
/// ```
/// use genguard_core::Operation;
/// use genguard_domain::DownstreamError;
///
/// fn assert_operation<T, O: Operation<T>>(_op: &O) {}
///
/// let op = || async { Ok::<_, DownstreamError>("generated text".to_string()) };
/// assert_operation(&op);
/// ```
pub trait Operation<T>: Send + Sync + 'static {
    /// Future returned by one invocation
    type Future: Future<Output = Result<T, DownstreamError>> + Send + 'static;

    /// Start one attempt
    fn invoke(&self) -> Self::Future;
}

impl<T, F, Fut> Operation<T> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, DownstreamError>> + Send + 'static,
{
    type Future = Fut;

    fn invoke(&self) -> Self::Future {
        self()
    }
}
