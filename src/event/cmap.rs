//! Events and the handler trait for connection pool/connection lifecycle monitoring.

use std::sync::Arc;

pub use crate::options::ConnectionPoolOptions;
use crate::options::ServerAddress;

/// Emitted when a connection pool is created.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolCreatedEvent {
    /// The address of the server that the pool's connections connect to.
    pub address: ServerAddress,
}

/// Emitted when a connection pool becomes ready to hand out connections.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolReadyEvent {
    /// The address of the server that the pool's connections connect to.
    pub address: ServerAddress,
}

/// Emitted when a connection pool is cleared, bumping its generation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolClearedEvent {
    /// The address of the server that the pool's connections connect to.
    pub address: ServerAddress,
}

/// Emitted when a connection pool is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolClosedEvent {
    /// The address of the server that the pool's connections connect to.
    pub address: ServerAddress,
}

/// Emitted when a connection is created, before it is handshaked.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCreatedEvent {
    /// The address of the server the connection connects to.
    pub address: ServerAddress,

    /// The driver-assigned id of the connection, unique within its pool.
    pub connection_id: u32,
}

/// Emitted once a connection has completed its handshake (and authentication, if configured)
/// and is ready to be checked out.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionReadyEvent {
    /// The address of the server the connection connects to.
    pub address: ServerAddress,

    /// The driver-assigned id of the connection.
    pub connection_id: u32,
}

/// The reason a connection was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The connection's generation is older than its pool's current generation.
    Stale,

    /// The connection sat idle for longer than the pool's `max_idle_time`.
    Idle,

    /// An error occurred while using the connection.
    Error,

    /// The connection was dropped by its caller mid-use without being checked back in.
    Dropped,

    /// The pool the connection belonged to was closed.
    PoolClosed,
}

/// Emitted immediately before a connection's socket is dropped.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The address of the server the connection was connected to.
    pub address: ServerAddress,

    /// The driver-assigned id of the connection.
    pub connection_id: u32,

    /// Why the connection was closed.
    pub reason: ConnectionClosedReason,
}

/// Emitted when a caller begins trying to check out a connection.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckoutStartedEvent {
    /// The address of the server a connection would be checked out from.
    pub address: ServerAddress,
}

/// The reason a connection checkout failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionCheckoutFailedReason {
    /// `wait_queue_timeout` elapsed before a connection became available.
    Timeout,

    /// Establishing a new connection (handshake/auth) failed.
    ConnectionError,

    /// The pool was closed or paused at the time of the request.
    PoolClosed,
}

/// Emitted when a connection checkout could not be satisfied.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckoutFailedEvent {
    /// The address of the server a connection would have connected to.
    pub address: ServerAddress,

    /// Why the checkout failed.
    pub reason: ConnectionCheckoutFailedReason,
}

/// Emitted when a connection is successfully checked out of its pool.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckedOutEvent {
    /// The address of the server the connection is connected to.
    pub address: ServerAddress,

    /// The driver-assigned id of the connection.
    pub connection_id: u32,
}

/// Emitted when a connection is returned to its pool.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckedInEvent {
    /// The address of the server the connection is connected to.
    pub address: ServerAddress,

    /// The driver-assigned id of the connection.
    pub connection_id: u32,
}

/// Observes the lifecycle of connection pools and the connections within them. Every method
/// defaults to a no-op, so an application can override only the events it cares about.
pub trait CmapEventHandler: Send + Sync {
    /// A pool was created.
    fn handle_pool_created_event(&self, _event: PoolCreatedEvent) {}

    /// A pool transitioned from `Paused` to `Ready`.
    fn handle_pool_ready_event(&self, _event: PoolReadyEvent) {}

    /// A pool was cleared, bumping its generation.
    fn handle_pool_cleared_event(&self, _event: PoolClearedEvent) {}

    /// A pool was closed.
    fn handle_pool_closed_event(&self, _event: PoolClosedEvent) {}

    /// A connection was created.
    fn handle_connection_created_event(&self, _event: ConnectionCreatedEvent) {}

    /// A connection finished its handshake and became usable.
    fn handle_connection_ready_event(&self, _event: ConnectionReadyEvent) {}

    /// A connection was closed.
    fn handle_connection_closed_event(&self, _event: ConnectionClosedEvent) {}

    /// A checkout attempt began.
    fn handle_connection_checkout_started_event(&self, _event: ConnectionCheckoutStartedEvent) {}

    /// A checkout attempt failed.
    fn handle_connection_checkout_failed_event(&self, _event: ConnectionCheckoutFailedEvent) {}

    /// A connection was checked out.
    fn handle_connection_checked_out_event(&self, _event: ConnectionCheckedOutEvent) {}

    /// A connection was checked back in.
    fn handle_connection_checked_in_event(&self, _event: ConnectionCheckedInEvent) {}
}

/// The union of all CMAP event payloads, so a single `CmapEventEmitter::emit_event` call can be
/// generic over which kind of event it publishes. Internal; application code never sees this, it
/// only implements [`CmapEventHandler`].
#[derive(Clone, Debug)]
pub(crate) enum CmapEvent {
    PoolCreated(PoolCreatedEvent),
    PoolReady(PoolReadyEvent),
    PoolCleared(PoolClearedEvent),
    PoolClosed(PoolClosedEvent),
    ConnectionCreated(ConnectionCreatedEvent),
    ConnectionReady(ConnectionReadyEvent),
    ConnectionClosed(ConnectionClosedEvent),
    ConnectionCheckoutStarted(ConnectionCheckoutStartedEvent),
    ConnectionCheckoutFailed(ConnectionCheckoutFailedEvent),
    ConnectionCheckedOut(ConnectionCheckedOutEvent),
    ConnectionCheckedIn(ConnectionCheckedInEvent),
}

macro_rules! cmap_event_boilerplate {
    ($(($variant:ident, $ty:ty, $dispatch:ident)),+ $(,)?) => {
        $(
            impl From<$ty> for CmapEvent {
                fn from(event: $ty) -> Self {
                    CmapEvent::$variant(event)
                }
            }
        )+

        impl CmapEvent {
            fn dispatch(self, handler: &dyn CmapEventHandler) {
                match self {
                    $(CmapEvent::$variant(event) => handler.$dispatch(event),)+
                }
            }
        }
    };
}

cmap_event_boilerplate!(
    (PoolCreated, PoolCreatedEvent, handle_pool_created_event),
    (PoolReady, PoolReadyEvent, handle_pool_ready_event),
    (PoolCleared, PoolClearedEvent, handle_pool_cleared_event),
    (PoolClosed, PoolClosedEvent, handle_pool_closed_event),
    (ConnectionCreated, ConnectionCreatedEvent, handle_connection_created_event),
    (ConnectionReady, ConnectionReadyEvent, handle_connection_ready_event),
    (ConnectionClosed, ConnectionClosedEvent, handle_connection_closed_event),
    (
        ConnectionCheckoutStarted,
        ConnectionCheckoutStartedEvent,
        handle_connection_checkout_started_event
    ),
    (
        ConnectionCheckoutFailed,
        ConnectionCheckoutFailedEvent,
        handle_connection_checkout_failed_event
    ),
    (ConnectionCheckedOut, ConnectionCheckedOutEvent, handle_connection_checked_out_event),
    (ConnectionCheckedIn, ConnectionCheckedInEvent, handle_connection_checked_in_event),
);

/// Fans a CMAP event out to the pool's configured handler (if any) and, when the
/// `tracing-unstable` feature is enabled, to the internal [`TracingEventHandler`]. Registration is
/// additive: both destinations receive every event, matching the reference driver's support for
/// more than one registered listener.
///
/// [`TracingEventHandler`]: crate::event::tracing_handler::TracingEventHandler
#[derive(Clone)]
pub(crate) struct CmapEventEmitter {
    handler: Option<Arc<dyn CmapEventHandler>>,
}

impl CmapEventEmitter {
    pub(crate) fn new(handler: Option<Arc<dyn CmapEventHandler>>) -> Self {
        Self { handler }
    }

    /// `f` is only invoked if at least one destination is listening, so event construction (which
    /// may format a message) is skipped entirely when nobody's watching and tracing is compiled
    /// out.
    pub(crate) fn emit_event(&self, f: impl FnOnce() -> CmapEvent) {
        if self.handler.is_none() && !cfg!(feature = "tracing-unstable") {
            return;
        }

        let event = f();

        #[cfg(feature = "tracing-unstable")]
        event.clone().dispatch(&crate::event::tracing_handler::TracingEventHandler);

        if let Some(handler) = &self.handler {
            event.dispatch(handler.as_ref());
        }
    }
}
