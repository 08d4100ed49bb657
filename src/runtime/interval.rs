use std::time::{Duration, Instant};

/// A wrapper around `tokio::time::Interval` used by the Monitor and the Pool's background
/// populator. Unlike `tokio::time::interval`, `tick` returns the `Instant` it fired at so
/// callers can compute elapsed time without a second syscall.
pub(crate) struct Interval {
    inner: tokio::time::Interval,
}

impl Interval {
    pub(super) fn new(period: Duration) -> Self {
        Self {
            inner: tokio::time::interval(period),
        }
    }

    pub(crate) async fn tick(&mut self) -> Instant {
        self.inner.tick().await.into()
    }
}
