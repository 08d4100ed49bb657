//! Publishes a pool's generation to any interested subscriber (currently used only by tests and,
//! eventually, by a `Server`'s cursor/transaction pinning logic) without requiring a lock shared
//! with the pool worker itself.

use tokio::sync::watch;

/// Creates a publisher/subscriber pair seeded with generation `0`.
pub(super) fn channel() -> (PoolGenerationPublisher, PoolGenerationSubscriber) {
    let (sender, receiver) = watch::channel(0u32);
    (PoolGenerationPublisher { sender }, PoolGenerationSubscriber { receiver })
}

#[derive(Debug)]
pub(super) struct PoolGenerationPublisher {
    sender: watch::Sender<u32>,
}

impl PoolGenerationPublisher {
    pub(super) fn publish(&self, generation: u32) {
        // An error here means every subscriber was dropped, which is fine; nothing to notify.
        let _ = self.sender.send(generation);
    }
}

/// A cheaply cloneable read-only view onto a pool's current generation.
#[derive(Clone, Debug)]
pub(crate) struct PoolGenerationSubscriber {
    receiver: watch::Receiver<u32>,
}

impl PoolGenerationSubscriber {
    pub(crate) fn generation(&self) -> u32 {
        *self.receiver.borrow()
    }
}
