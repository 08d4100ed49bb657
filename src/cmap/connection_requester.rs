//! The check-out side-channel into a pool worker: a request/reply pair over an unbounded
//! `mpsc` sender and a `oneshot` reply, as opposed to [`PoolManager`](super::manager::PoolManager)'s
//! fire-and-forget management messages.

use tokio::sync::{mpsc, oneshot};

use super::conn::Connection;
use crate::{
    error::{Error, Result},
    runtime::{AsyncJoinHandle, WorkerHandle},
};

/// Returns a new requester/receiver pair. `handle` is cloned into the requester so that, as long
/// as at least one `ConnectionRequester` is alive, the worker keeps running.
pub(super) fn channel(handle: WorkerHandle) -> (ConnectionRequester, ConnectionRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        ConnectionRequester {
            sender,
            _handle: handle,
        },
        ConnectionRequestReceiver { receiver },
    )
}

/// A cloneable handle for requesting connections from the pool that owns the other end.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionRequester {
    sender: mpsc::UnboundedSender<oneshot::Sender<ConnectionRequestResult>>,
    _handle: WorkerHandle,
}

impl ConnectionRequester {
    /// Requests a connection. Resolves once the worker either hands back a pooled connection,
    /// starts establishing a new one, or rejects the request because the pool was cleared.
    pub(super) async fn request(&self) -> ConnectionRequestResult {
        let (sender, receiver) = oneshot::channel();

        // Only errors if the receiver end is gone, which can't happen: we hold a `WorkerHandle`
        // keeping the worker (and thus the receiver loop) alive.
        self.sender.send(sender).ok();

        receiver.await.unwrap_or_else(|_| {
            ConnectionRequestResult::PoolCleared(Error::internal(
                "connection pool worker stopped before responding to a check-out request",
            ))
        })
    }
}

#[derive(Debug)]
pub(super) struct ConnectionRequestReceiver {
    receiver: mpsc::UnboundedReceiver<oneshot::Sender<ConnectionRequestResult>>,
}

impl ConnectionRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<ConnectionRequest> {
        self.receiver
            .recv()
            .await
            .map(|sender| ConnectionRequest { sender })
    }
}

/// A single pending check-out request, received by the worker but not yet fulfilled.
#[derive(Debug)]
pub(super) struct ConnectionRequest {
    sender: oneshot::Sender<ConnectionRequestResult>,
}

impl ConnectionRequest {
    /// Fulfills the request. If the caller already gave up (e.g. hit `waitQueueTimeoutMS` and
    /// dropped the receiving end), `result` is handed back so the worker can recover a pooled
    /// connection rather than leak it.
    pub(super) fn fulfill(
        self,
        result: ConnectionRequestResult,
    ) -> std::result::Result<(), ConnectionRequestResult> {
        self.sender.send(result)
    }
}

#[derive(Debug)]
pub(super) enum ConnectionRequestResult {
    /// A connection already established and simply popped off `available`.
    Pooled(Box<Connection>),

    /// A new connection being established; await the handle to obtain it.
    Establishing(AsyncJoinHandle<Result<Connection>>),

    /// The request was rejected because the pool was, or became, unable to service it. Carries
    /// the error that caused the rejection (the pool-cleared cause, or a pool-closed/new-pool
    /// error).
    PoolCleared(Error),
}
