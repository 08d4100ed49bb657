//! Thin wrappers over `tokio` primitives, isolated behind this module so that the rest of the
//! crate (`cmap`, `sdam`) depends on `runtime` rather than importing `tokio` directly, leaving a
//! seam open for an alternate async runtime in the future.

mod interval;
mod join_handle;
mod worker_handle;

use std::{future::Future, time::Duration};

pub(crate) use interval::Interval;
pub(crate) use join_handle::AsyncJoinHandle;
pub(crate) use worker_handle::{WorkerHandle, WorkerHandleListener};

use crate::error::{Error, ErrorKind, Result};

/// Spawns a long-lived background task (a Monitor, Populator, or Pool worker) and returns a
/// handle to it.
pub(crate) fn spawn<F>(fut: F) -> AsyncJoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    AsyncJoinHandle::new(tokio::task::spawn(fut))
}

/// Runs `fut`, failing with an `Io` timeout error if it does not complete within `duration`.
pub(crate) async fn timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    timeout_with(duration, fut, Error::network_timeout).await
}

/// Like [`timeout`], but builds the timeout error with `on_timeout` instead of the generic
/// network timeout, for callers (like a pool check-out) with a more specific error to report.
pub(crate) async fn timeout_with<F, T>(
    duration: Duration,
    fut: F,
    on_timeout: impl FnOnce() -> Error,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if duration.is_zero() {
        return fut.await;
    }

    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

/// Constructs a new `Interval` that first fires immediately, then every `period`.
pub(crate) fn interval(period: Duration) -> Interval {
    Interval::new(period)
}

/// Sleeps for `duration`. Used by the populator's retry backoff and the Push Monitor's
/// between-reply idle wait.
pub(crate) async fn delay_for(duration: Duration) {
    tokio::time::sleep(duration).await;
}

pub(crate) fn io_error(kind: std::io::ErrorKind, message: impl Into<String>) -> Error {
    ErrorKind::Io(std::sync::Arc::new(std::io::Error::new(kind, message.into()))).into()
}
