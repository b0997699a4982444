//! Utilities used in [`netcheck`][`crate`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::AbortHandle;
use tracing::trace;

/// Aborts a task on drop.
///
/// Handed out by actors to their client handles, so that dropping the last handle tears
/// down the actor task.
#[derive(Debug)]
pub(crate) struct CancelOnDrop {
    task_name: &'static str,
    handle: AbortHandle,
}

impl CancelOnDrop {
    pub(crate) fn new(task_name: &'static str, handle: AbortHandle) -> Self {
        Self { task_name, handle }
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.handle.abort();
        trace!("{}: canceled", self.task_name);
    }
}

/// Resolves to pending if the inner is `None`.
#[derive(Debug)]
pub(crate) struct MaybeFuture<T> {
    /// Future to be polled.
    pub inner: Option<T>,
}

// NOTE: explicit implementation to bypass derive unnecessary bounds
impl<T> Default for MaybeFuture<T> {
    fn default() -> Self {
        MaybeFuture { inner: None }
    }
}

impl<T: Future + Unpin> Future for MaybeFuture<T> {
    type Output = T::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.inner {
            Some(ref mut t) => Pin::new(t).poll(cx),
            None => Poll::Pending,
        }
    }
}
