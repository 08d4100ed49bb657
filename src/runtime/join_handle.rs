use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::error::{Error, ErrorKind, Result};

/// Wraps a `tokio::task::JoinHandle`, turning a task panic/cancellation into this crate's
/// `Error` type rather than `tokio`'s `JoinError`.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T> {
    handle: tokio::task::JoinHandle<T>,
}

impl<T> AsyncJoinHandle<T> {
    pub(super) fn new(handle: tokio::task::JoinHandle<T>) -> Self {
        Self { handle }
    }

    pub(crate) fn abort(&self) {
        self.handle.abort();
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.handle).poll(cx).map(|result| {
            result.map_err(|e| {
                ErrorKind::Internal {
                    message: format!("background task failed: {}", e),
                }
                .into()
            })
        })
    }
}
