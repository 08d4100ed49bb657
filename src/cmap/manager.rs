//! The management side-channel into a running [`ConnectionPoolWorker`](super::worker::ConnectionPoolWorker):
//! check-in, clear, ready, and connection-establishment outcomes. Kept as a separate unbounded
//! channel from [`ConnectionRequester`](super::connection_requester::ConnectionRequester) so that
//! these never queue up behind an in-progress check-out.

use tokio::sync::mpsc;

use super::conn::{Connection, DroppedConnectionState};
use crate::error::Error;

#[derive(Debug)]
pub(super) enum PoolManagementRequest {
    /// A checked-out connection was dropped (or explicitly checked in) and should be returned to
    /// `available`, closed, or discarded depending on its state.
    CheckIn(DroppedConnectionState),

    /// A freshly established connection created to satisfy `minPoolSize`, to be placed directly
    /// into `available` rather than handed to a waiting caller.
    Populate(Box<Connection>),

    /// The pool should be cleared: its generation bumped and, outside load-balanced mode, paused.
    Clear { cause: Error },

    /// The pool should (re)transition to `Ready`.
    MarkAsReady,

    /// A connection establishment attempt failed; the pool's pending count should be decremented.
    HandleConnectionFailed,

    /// A connection establishment attempt begun by `check_out` succeeded; the pool's pending
    /// count should be decremented (the connection itself was already handed to its caller, so
    /// there's nothing further to do with it here).
    HandleConnectionSucceeded,
}

/// A cloneable handle used to send management requests into a pool worker. Every [`Connection`]
/// checked out of a pool holds one, attached so it can check itself back in on drop.
///
/// [`Connection`]: super::conn::Connection
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    pub(super) fn new() -> (PoolManager, ManagementRequestReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, ManagementRequestReceiver { receiver })
    }

    /// Checks a dropped connection's state back in with its pool. A send failure means the
    /// worker is already gone, in which case there's nothing left to do; the connection's socket
    /// is simply dropped along with `state`.
    pub(crate) fn check_in(&self, state: DroppedConnectionState) {
        let _ = self.sender.send(PoolManagementRequest::CheckIn(state));
    }

    pub(super) fn populate_connection(&self, connection: Connection) {
        let _ = self.sender.send(PoolManagementRequest::Populate(Box::new(connection)));
    }

    pub(crate) fn clear(&self, cause: Error) {
        let _ = self.sender.send(PoolManagementRequest::Clear { cause });
    }

    pub(crate) fn mark_as_ready(&self) {
        let _ = self.sender.send(PoolManagementRequest::MarkAsReady);
    }

    pub(super) fn handle_connection_failed(&self) {
        let _ = self.sender.send(PoolManagementRequest::HandleConnectionFailed);
    }

    pub(super) fn handle_connection_succeeded(&self) {
        let _ = self.sender.send(PoolManagementRequest::HandleConnectionSucceeded);
    }
}

#[derive(Debug)]
pub(super) struct ManagementRequestReceiver {
    receiver: mpsc::UnboundedReceiver<PoolManagementRequest>,
}

impl ManagementRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<PoolManagementRequest> {
        self.receiver.recv().await
    }
}
