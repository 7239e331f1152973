use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{ApplicationCall, BoxError};

/// The single entry point of the framework, executed once per call.
///
/// Returning `Err` leaves the response to the caller: an uncommitted response becomes a
/// `500`, a committed one is aborted.
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    async fn execute(&self, call: &mut dyn ApplicationCall) -> Result<(), BoxError>;
}

/// a closure holder which acts as a [`Pipeline`]
pub struct FnPipeline<F> {
    f: F,
}

impl<F> fmt::Debug for FnPipeline<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPipeline").finish_non_exhaustive()
    }
}

/// Adapts `f` into a [`Pipeline`].
///
/// ```
/// use futures::FutureExt;
/// use micro_pipeline::{BoxError, OutgoingContent, pipeline_fn, respond};
///
/// let pipeline = pipeline_fn(|call| {
///     async move {
///         respond(call, OutgoingContent::text("hello")).await?;
///         Ok::<_, BoxError>(())
///     }
///     .boxed()
/// });
/// # let _ = pipeline;
/// ```
pub fn pipeline_fn<F>(f: F) -> FnPipeline<F>
where
    F: for<'c> Fn(&'c mut dyn ApplicationCall) -> BoxFuture<'c, Result<(), BoxError>> + Send + Sync + 'static,
{
    FnPipeline { f }
}

#[async_trait]
impl<F> Pipeline for FnPipeline<F>
where
    F: for<'c> Fn(&'c mut dyn ApplicationCall) -> BoxFuture<'c, Result<(), BoxError>> + Send + Sync + 'static,
{
    async fn execute(&self, call: &mut dyn ApplicationCall) -> Result<(), BoxError> {
        (self.f)(call).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn assert_is_pipeline<P: Pipeline>(_pipeline: &P) {
        // no op
    }

    #[test]
    fn closure_is_pipeline() {
        let pipeline = pipeline_fn(|call| {
            async move {
                call.cancellation().cancel();
                Ok(())
            }
            .boxed()
        });
        assert_is_pipeline(&pipeline);
    }
}
