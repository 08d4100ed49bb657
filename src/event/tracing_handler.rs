//! An internal event handler that mirrors every CMAP/SDAM event as a `tracing` event, so
//! operators get structured logs even if they never register a custom handler. Only compiled in
//! when the `tracing-unstable` feature is enabled.

use super::{cmap::*, sdam::*};

const CMAP_TARGET: &str = "mongodb_core::cmap";
const SDAM_TARGET: &str = "mongodb_core::sdam";

pub(crate) struct TracingEventHandler;

impl CmapEventHandler for TracingEventHandler {
    fn handle_pool_created_event(&self, event: PoolCreatedEvent) {
        tracing::debug!(target: CMAP_TARGET, address = %event.address, "connection pool created");
    }

    fn handle_pool_ready_event(&self, event: PoolReadyEvent) {
        tracing::debug!(target: CMAP_TARGET, address = %event.address, "connection pool ready");
    }

    fn handle_pool_cleared_event(&self, event: PoolClearedEvent) {
        tracing::debug!(target: CMAP_TARGET, address = %event.address, "connection pool cleared");
    }

    fn handle_pool_closed_event(&self, event: PoolClosedEvent) {
        tracing::debug!(target: CMAP_TARGET, address = %event.address, "connection pool closed");
    }

    fn handle_connection_created_event(&self, event: ConnectionCreatedEvent) {
        tracing::trace!(target: CMAP_TARGET, address = %event.address, id = event.connection_id, "connection created");
    }

    fn handle_connection_ready_event(&self, event: ConnectionReadyEvent) {
        tracing::trace!(target: CMAP_TARGET, address = %event.address, id = event.connection_id, "connection ready");
    }

    fn handle_connection_closed_event(&self, event: ConnectionClosedEvent) {
        tracing::debug!(target: CMAP_TARGET, address = %event.address, id = event.connection_id, reason = ?event.reason, "connection closed");
    }

    fn handle_connection_checkout_started_event(&self, event: ConnectionCheckoutStartedEvent) {
        tracing::trace!(target: CMAP_TARGET, address = %event.address, "checkout started");
    }

    fn handle_connection_checkout_failed_event(&self, event: ConnectionCheckoutFailedEvent) {
        tracing::warn!(target: CMAP_TARGET, address = %event.address, reason = ?event.reason, "checkout failed");
    }

    fn handle_connection_checked_out_event(&self, event: ConnectionCheckedOutEvent) {
        tracing::trace!(target: CMAP_TARGET, address = %event.address, id = event.connection_id, "connection checked out");
    }

    fn handle_connection_checked_in_event(&self, event: ConnectionCheckedInEvent) {
        tracing::trace!(target: CMAP_TARGET, address = %event.address, id = event.connection_id, "connection checked in");
    }
}

impl SdamEventHandler for TracingEventHandler {
    fn handle_server_description_changed_event(&self, event: ServerDescriptionChangedEvent) {
        tracing::debug!(
            target: SDAM_TARGET,
            address = %event.address,
            previous = ?event.previous_description.server_type,
            new = ?event.new_description.server_type,
            "server description changed"
        );
    }

    fn handle_server_opening_event(&self, event: ServerOpeningEvent) {
        tracing::debug!(target: SDAM_TARGET, address = %event.address, "server added to topology");
    }

    fn handle_server_closed_event(&self, event: ServerClosedEvent) {
        tracing::debug!(target: SDAM_TARGET, address = %event.address, "server removed from topology");
    }

    fn handle_topology_description_changed_event(&self, event: TopologyDescriptionChangedEvent) {
        tracing::debug!(
            target: SDAM_TARGET,
            previous_server_count = event.previous_description.len(),
            new_server_count = event.new_description.len(),
            "topology description changed"
        );
    }

    fn handle_topology_opening_event(&self, _event: TopologyOpeningEvent) {
        tracing::debug!(target: SDAM_TARGET, "topology opened");
    }

    fn handle_topology_closed_event(&self, _event: TopologyClosedEvent) {
        tracing::debug!(target: SDAM_TARGET, "topology closed");
    }

    fn handle_server_heartbeat_started_event(&self, event: ServerHeartbeatStartedEvent) {
        tracing::trace!(target: SDAM_TARGET, address = %event.server_address, awaited = event.awaited, "heartbeat started");
    }

    fn handle_server_heartbeat_succeeded_event(&self, event: ServerHeartbeatSucceededEvent) {
        tracing::trace!(
            target: SDAM_TARGET,
            address = %event.server_address,
            awaited = event.awaited,
            duration_ms = event.duration.as_millis() as u64,
            "heartbeat succeeded"
        );
    }

    fn handle_server_heartbeat_failed_event(&self, event: ServerHeartbeatFailedEvent) {
        tracing::warn!(
            target: SDAM_TARGET,
            address = %event.server_address,
            awaited = event.awaited,
            error = %event.message,
            "heartbeat failed"
        );
    }
}
