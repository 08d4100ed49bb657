use tokio::sync::mpsc;

/// A reference-counted liveness token for a background worker task (a Pool worker, a Monitor).
/// Once every clone of the `WorkerHandle` has been dropped, the corresponding
/// `WorkerHandleListener` observes the channel close and the worker's main loop exits, rather
/// than waiting on an explicit shutdown message.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    _sender: mpsc::Sender<()>,
}

/// Paired with a `WorkerHandle`; lives inside the worker task and is polled (non-blockingly, or
/// via `wait_for_all_handle_drops` inside a `select!`) to detect when every handle has gone away.
#[derive(Debug)]
pub(crate) struct WorkerHandleListener {
    receiver: mpsc::Receiver<()>,
}

impl WorkerHandleListener {
    /// Constructs a new handle/listener pair.
    pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
        let (sender, receiver) = mpsc::channel(1);
        (WorkerHandle { _sender: sender }, WorkerHandleListener { receiver })
    }

    /// Resolves once every `WorkerHandle` cloned from this listener's pair has been dropped.
    /// Intended to be raced against other branches in a `tokio::select!`.
    pub(crate) async fn wait_for_all_handle_drops(&mut self) {
        self.receiver.recv().await;
    }

    /// Non-blocking check for whether any handle is still alive.
    pub(crate) fn is_alive(&mut self) -> bool {
        !matches!(self.receiver.try_recv(), Err(mpsc::error::TryRecvError::Disconnected))
    }

    #[cfg(test)]
    pub(crate) fn new_mocked() -> WorkerHandle {
        let (handle, _listener) = Self::channel();
        handle
    }
}
