//! Events and the handler trait for Server Discovery and Monitoring (topology/server lifecycle).

use std::sync::Arc;
use std::time::Duration;

use crate::{
    options::ServerAddress,
    sdam::description::server::{ServerDescription as InternalServerDescription, ServerType},
};

/// A public, read-only snapshot of a server description, suitable for handing to an event
/// handler without exposing this crate's internal representation (which folds the hello reply
/// and any monitoring error into a single `Result`).
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescription {
    /// The address of the server this description is for.
    pub address: ServerAddress,

    /// The type the server was most recently observed to be.
    pub server_type: ServerType,

    /// The server's most recently measured round-trip time, if it has ever been reached
    /// successfully.
    pub average_round_trip_time: Option<Duration>,
}

impl From<&InternalServerDescription> for ServerDescription {
    fn from(desc: &InternalServerDescription) -> Self {
        Self {
            address: desc.address.clone(),
            server_type: desc.server_type,
            average_round_trip_time: desc.average_round_trip_time_ms.map(Duration::from_secs_f64),
        }
    }
}

/// Published when a server's description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The server's previous description.
    pub previous_description: ServerDescription,

    /// The server's new description.
    pub new_description: ServerDescription,
}

/// Published when a server is added to a topology and its Monitor starts.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,
}

/// Published when a server is removed from a topology and its Monitor stops.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,
}

/// Published whenever a topology update alters any server description or the topology's
/// aggregate fields, whether or not the topology's `kind` itself changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The descriptions of every server known prior to this update.
    pub previous_description: Vec<ServerDescription>,

    /// The descriptions of every server known after this update.
    pub new_description: Vec<ServerDescription>,
}

/// Published when a topology is first initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {}

/// Published when a topology is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyClosedEvent {}

/// Published when a Monitor begins a `hello`/legacy hello scan.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server being probed.
    pub server_address: ServerAddress,

    /// Whether this heartbeat is an awaitable (Push Monitor) `hello` rather than a fresh,
    /// one-shot probe.
    pub awaited: bool,

    /// The driver-assigned id of the monitoring connection used for this scan, so handlers can
    /// correlate repeated scans on the same socket.
    pub driver_connection_id: u32,
}

/// Published when a Monitor's scan succeeds.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// How long the scan took.
    pub duration: Duration,

    /// The address of the server that was probed.
    pub server_address: ServerAddress,

    /// Whether this heartbeat was an awaitable (Push Monitor) `hello`.
    pub awaited: bool,

    /// The driver-assigned id of the monitoring connection used for this scan.
    pub driver_connection_id: u32,
}

/// Published when a Monitor's scan fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// How long the failed scan took before it failed.
    pub duration: Duration,

    /// A description of what went wrong.
    pub message: String,

    /// The address of the server that was probed.
    pub server_address: ServerAddress,

    /// Whether this heartbeat was an awaitable (Push Monitor) `hello`.
    pub awaited: bool,

    /// The driver-assigned id of the monitoring connection used for this scan.
    pub driver_connection_id: u32,
}

/// Observes the lifecycle of servers and the topology they belong to. Every method defaults to
/// a no-op, so an application can override only the events it cares about.
pub trait SdamEventHandler: Send + Sync {
    /// A server's description changed.
    fn handle_server_description_changed_event(&self, _event: ServerDescriptionChangedEvent) {}

    /// A server was added to the topology.
    fn handle_server_opening_event(&self, _event: ServerOpeningEvent) {}

    /// A server was removed from the topology.
    fn handle_server_closed_event(&self, _event: ServerClosedEvent) {}

    /// The topology's description changed.
    fn handle_topology_description_changed_event(&self, _event: TopologyDescriptionChangedEvent) {}

    /// The topology was initialized.
    fn handle_topology_opening_event(&self, _event: TopologyOpeningEvent) {}

    /// The topology was closed.
    fn handle_topology_closed_event(&self, _event: TopologyClosedEvent) {}

    /// A heartbeat scan started.
    fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {}

    /// A heartbeat scan succeeded.
    fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {}

    /// A heartbeat scan failed.
    fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {}
}

/// The union of all SDAM event payloads, so a single `SdamEventEmitter::emit_event` call can be
/// generic over which kind of event it publishes. Internal; application code never sees this, it
/// only implements [`SdamEventHandler`].
#[derive(Clone, Debug)]
pub(crate) enum SdamEvent {
    ServerDescriptionChanged(ServerDescriptionChangedEvent),
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    TopologyDescriptionChanged(TopologyDescriptionChangedEvent),
    TopologyOpening(TopologyOpeningEvent),
    TopologyClosed(TopologyClosedEvent),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

macro_rules! sdam_event_boilerplate {
    ($(($variant:ident, $ty:ty, $dispatch:ident)),+ $(,)?) => {
        $(
            impl From<$ty> for SdamEvent {
                fn from(event: $ty) -> Self {
                    SdamEvent::$variant(event)
                }
            }
        )+

        impl SdamEvent {
            fn dispatch(self, handler: &dyn SdamEventHandler) {
                match self {
                    $(SdamEvent::$variant(event) => handler.$dispatch(event),)+
                }
            }
        }
    };
}

sdam_event_boilerplate!(
    (
        ServerDescriptionChanged,
        ServerDescriptionChangedEvent,
        handle_server_description_changed_event
    ),
    (ServerOpening, ServerOpeningEvent, handle_server_opening_event),
    (ServerClosed, ServerClosedEvent, handle_server_closed_event),
    (
        TopologyDescriptionChanged,
        TopologyDescriptionChangedEvent,
        handle_topology_description_changed_event
    ),
    (TopologyOpening, TopologyOpeningEvent, handle_topology_opening_event),
    (TopologyClosed, TopologyClosedEvent, handle_topology_closed_event),
    (
        ServerHeartbeatStarted,
        ServerHeartbeatStartedEvent,
        handle_server_heartbeat_started_event
    ),
    (
        ServerHeartbeatSucceeded,
        ServerHeartbeatSucceededEvent,
        handle_server_heartbeat_succeeded_event
    ),
    (
        ServerHeartbeatFailed,
        ServerHeartbeatFailedEvent,
        handle_server_heartbeat_failed_event
    ),
);

/// Fans an SDAM event out to the topology's configured handler (if any) and, when the
/// `tracing-unstable` feature is enabled, to the internal [`TracingEventHandler`].
///
/// [`TracingEventHandler`]: crate::event::tracing_handler::TracingEventHandler
#[derive(Clone)]
pub(crate) struct SdamEventEmitter {
    handler: Option<Arc<dyn SdamEventHandler>>,
}

impl SdamEventEmitter {
    pub(crate) fn new(handler: Option<Arc<dyn SdamEventHandler>>) -> Self {
        Self { handler }
    }

    /// `f` is only invoked if at least one destination is listening.
    pub(crate) fn emit_event(&self, f: impl FnOnce() -> SdamEvent) {
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
