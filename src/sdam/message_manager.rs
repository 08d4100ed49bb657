//! Wakes a blocked server selection as soon as any Monitor's next scan might help, rather than
//! making it sit out the full `server_selection_timeout`.

use std::time::Duration;

use tokio::sync::broadcast::{self, Receiver, Sender};

/// A single broadcast channel used to ask every Monitor to check its server immediately. There is
/// deliberately no second "topology changed" channel here: a caller that wants to wait for the
/// topology to change again can already do that natively with
/// [`tokio::sync::watch::Receiver::changed`] on the snapshot it holds, which covers that case
/// without a redundant broadcast.
#[derive(Clone, Debug)]
pub(crate) struct TopologyMessageManager {
    topology_check_requester: Sender<()>,
}

impl TopologyMessageManager {
    pub(super) fn new() -> Self {
        let (topology_check_requester, _) = broadcast::channel(1);
        Self {
            topology_check_requester,
        }
    }

    /// Called by a server selection operation when it fails to select a server, so that every
    /// Monitor re-checks its server right away instead of waiting out its heartbeat interval.
    pub(super) fn request_topology_check(&self) {
        let _: Result<_, _> = self.topology_check_requester.send(());
    }

    pub(super) fn subscribe(&self) -> TopologyMessageSubscriber {
        TopologyMessageSubscriber::new(self.topology_check_requester.subscribe())
    }
}

pub(crate) struct TopologyMessageSubscriber {
    receiver: Receiver<()>,
}

impl TopologyMessageSubscriber {
    fn new(receiver: Receiver<()>) -> Self {
        Self { receiver }
    }

    /// Waits for either `timeout` to elapse or a check request to arrive. Returns `true` if a
    /// request was received, `false` on timeout.
    pub(crate) async fn wait_for_request(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.receiver.recv()).await.is_ok()
    }
}
