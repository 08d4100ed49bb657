//! The pool's background task: owns every mutable field of a [`ConnectionPool`](super::ConnectionPool)
//! exclusively and is driven entirely by messages arriving over
//! [`ConnectionRequestReceiver`](super::connection_requester::ConnectionRequestReceiver) and
//! [`ManagementRequestReceiver`](super::manager::ManagementRequestReceiver), plus a periodic
//! maintenance tick. No field here is ever touched from outside this task.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use super::{
    conn::{Connection, ConnectionGeneration, DroppedConnectionState},
    connection_requester::{self, ConnectionRequest, ConnectionRequestReceiver, ConnectionRequestResult},
    establish::ConnectionEstablisher,
    manager::{ManagementRequestReceiver, PoolManagementRequest, PoolManager},
    status::{self, PoolGenerationPublisher, PoolGenerationSubscriber},
    StreamConnector,
};
use crate::{
    error::Error,
    event::cmap::{
        CmapEventEmitter,
        ConnectionClosedReason,
        ConnectionCreatedEvent,
        ConnectionReadyEvent,
        PoolClearedEvent,
        PoolClosedEvent,
        PoolReadyEvent,
    },
    options::{ConnectionPoolOptions, ServerAddress},
    runtime::{self, WorkerHandleListener},
};

const DEFAULT_MAX_POOL_SIZE: u32 = 100;
const MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// The pool states from CMAP: `Closed` isn't modeled explicitly since this worker simply stops
/// running (and its handles become unusable) once every external handle is dropped.
enum PoolState {
    /// Before the first `ready()` call; check-outs are rejected rather than queued.
    New,
    /// Cleared (or never yet readied); check-outs are rejected with the pause cause.
    Paused(Error),
    /// Operational: check-outs are serviced, and the populator tries to reach `min_pool_size`.
    Ready,
}

enum PoolTask {
    HandleManagementRequest(PoolManagementRequest),
    CheckOut(ConnectionRequest),
    Maintenance,
}

pub(crate) struct ConnectionPoolWorker {
    address: ServerAddress,
    state: PoolState,
    load_balanced: bool,

    /// Includes connections checked out, pending establishment, and available.
    total_connection_count: u32,
    pending_connection_count: u32,
    next_connection_id: u32,
    generation: u32,

    available_connections: VecDeque<Connection>,

    connector: Arc<dyn StreamConnector>,
    establisher: ConnectionEstablisher,
    event_emitter: CmapEventEmitter,

    maintenance_frequency: Duration,
    max_idle_time: Option<Duration>,
    min_pool_size: Option<u32>,
    max_pool_size: u32,
    max_connecting: u32,

    handle_listener: WorkerHandleListener,
    request_receiver: ConnectionRequestReceiver,
    wait_queue: VecDeque<ConnectionRequest>,
    management_receiver: ManagementRequestReceiver,
    generation_publisher: PoolGenerationPublisher,
    manager: PoolManager,
}

impl ConnectionPoolWorker {
    /// Spawns the worker task and returns the handles callers use to talk to it.
    pub(super) fn start(
        address: ServerAddress,
        connector: Arc<dyn StreamConnector>,
        establisher: ConnectionEstablisher,
        event_emitter: CmapEventEmitter,
        options: Option<ConnectionPoolOptions>,
    ) -> (
        PoolManager,
        connection_requester::ConnectionRequester,
        PoolGenerationSubscriber,
    ) {
        let mut max_idle_time = options.as_ref().and_then(|o| o.max_idle_time);
        if max_idle_time == Some(Duration::from_millis(0)) {
            max_idle_time = None;
        }

        let max_pool_size = options
            .as_ref()
            .map(|o| o.max_pool_size_or_unlimited())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let max_connecting = options
            .as_ref()
            .map(|o| o.max_connecting_or_default())
            .unwrap_or(2);
        let min_pool_size = options.as_ref().and_then(|o| o.min_pool_size);
        let load_balanced = options
            .as_ref()
            .and_then(|o| o.load_balanced)
            .unwrap_or(false);

        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (requester, request_receiver) = connection_requester::channel(handle);
        let (manager, management_receiver) = PoolManager::new();
        let (generation_publisher, generation_subscriber) = status::channel();

        // Load-balanced pools have no monitor clearing them on startup, so they start Ready.
        let state = if load_balanced { PoolState::Ready } else { PoolState::New };

        let worker = ConnectionPoolWorker {
            address,
            state,
            load_balanced,
            total_connection_count: 0,
            pending_connection_count: 0,
            next_connection_id: 1,
            generation: 0,
            available_connections: VecDeque::new(),
            connector,
            establisher,
            event_emitter,
            maintenance_frequency: MAINTENANCE_FREQUENCY,
            max_idle_time,
            min_pool_size,
            max_pool_size,
            max_connecting,
            handle_listener,
            request_receiver,
            wait_queue: VecDeque::new(),
            management_receiver,
            generation_publisher,
            manager: manager.clone(),
        };

        runtime::spawn(worker.execute());

        (manager, requester, generation_subscriber)
    }

    /// The worker's main loop. Runs until every external handle (`PoolManager`/
    /// `ConnectionRequester`) has been dropped, at which point the pool closes: its available
    /// connections are dropped and a `PoolClosedEvent` is published.
    async fn execute(mut self) {
        let mut maintenance_interval = runtime::interval(self.maintenance_frequency);

        loop {
            let task = tokio::select! {
                // Biased so check-in/clear/ready are always drained ahead of new check-outs, and
                // pool teardown is noticed promptly.
                biased;

                Some(request) = self.management_receiver.recv() => {
                    PoolTask::HandleManagementRequest(request)
                }
                _ = self.handle_listener.wait_for_all_handle_drops() => break,
                Some(request) = self.request_receiver.recv() => PoolTask::CheckOut(request),
                _ = maintenance_interval.tick() => PoolTask::Maintenance,
                else => break,
            };

            match task {
                PoolTask::CheckOut(request) => self.handle_check_out(request),
                PoolTask::HandleManagementRequest(request) => self.handle_management_request(request),
                PoolTask::Maintenance => self.perform_maintenance(),
            }

            if self.can_service_check_out() {
                if let Some(request) = self.wait_queue.pop_front() {
                    self.check_out(request);
                }
            }
        }

        while let Some(connection) = self.available_connections.pop_front() {
            connection.close_and_drop(ConnectionClosedReason::PoolClosed);
        }

        self.event_emitter.emit_event(|| {
            PoolClosedEvent {
                address: self.address.clone(),
            }
            .into()
        });
    }

    fn handle_check_out(&mut self, request: ConnectionRequest) {
        match &self.state {
            PoolState::Ready => self.wait_queue.push_back(request),
            PoolState::Paused(e) => {
                let _ = request.fulfill(ConnectionRequestResult::PoolCleared(e.clone()));
            }
            PoolState::New => {
                let _ = request.fulfill(ConnectionRequestResult::PoolCleared(Error::internal(
                    "check-out attempted from a pool that has not been marked ready",
                )));
            }
        }
    }

    fn handle_management_request(&mut self, request: PoolManagementRequest) {
        match request {
            PoolManagementRequest::CheckIn(state) => self.check_in(state),
            PoolManagementRequest::Populate(mut conn) => {
                self.pending_connection_count -= 1;
                conn.mark_as_available();
                self.available_connections.push_back(*conn);
            }
            PoolManagementRequest::Clear { cause } => self.clear(cause),
            PoolManagementRequest::MarkAsReady => self.mark_as_ready(),
            PoolManagementRequest::HandleConnectionFailed => {
                self.total_connection_count -= 1;
                self.pending_connection_count -= 1;
            }
            PoolManagementRequest::HandleConnectionSucceeded => {
                self.pending_connection_count -= 1;
            }
        }
    }

    fn below_max_connections(&self) -> bool {
        self.max_pool_size == 0 || self.total_connection_count < self.max_pool_size
    }

    fn can_service_check_out(&self) -> bool {
        if !matches!(self.state, PoolState::Ready) {
            return false;
        }
        !self.available_connections.is_empty()
            || (self.below_max_connections() && self.pending_connection_count < self.max_connecting)
    }

    fn check_out(&mut self, request: ConnectionRequest) {
        while let Some(mut conn) = self.available_connections.pop_back() {
            if conn.generation.is_stale(self.generation) {
                self.close_connection(conn, ConnectionClosedReason::Stale);
                continue;
            }
            if conn.is_idle(self.max_idle_time) {
                self.close_connection(conn, ConnectionClosedReason::Idle);
                continue;
            }

            conn.mark_as_in_use(self.manager.clone());
            if let Err(result) = request.fulfill(ConnectionRequestResult::Pooled(Box::new(conn))) {
                // The caller stopped listening (hit waitQueueTimeoutMS); recover the connection
                // rather than leak it.
                let ConnectionRequestResult::Pooled(mut conn) = result else {
                    unreachable!("fulfill only ever returns the value it was given");
                };
                conn.mark_as_available();
                self.available_connections.push_back(*conn);
            }
            return;
        }

        if !self.below_max_connections() {
            self.wait_queue.push_front(request);
            return;
        }

        let connector = self.connector.clone();
        let establisher = self.establisher.clone();
        let manager = self.manager.clone();
        let event_emitter = self.event_emitter.clone();
        let address = self.address.clone();
        let id = self.next_connection_id;
        let generation = ConnectionGeneration {
            generation: self.generation,
            service_id: None,
        };
        self.next_connection_id += 1;
        self.total_connection_count += 1;
        self.pending_connection_count += 1;

        event_emitter.emit_event(|| {
            ConnectionCreatedEvent {
                address: address.clone(),
                connection_id: id,
            }
            .into()
        });

        let handle = runtime::spawn(async move {
            let mut result = establish_connection(
                connector, establisher, address, id, generation, &manager, event_emitter,
            )
            .await;

            match result {
                Ok(ref mut conn) => {
                    conn.mark_as_in_use(manager.clone());
                    manager.handle_connection_succeeded();
                }
                Err(_) => manager.handle_connection_failed(),
            }

            result
        });

        // If nobody's listening anymore (the caller hit waitQueueTimeoutMS), the connection
        // still finishes establishing; once it's checked out it attaches its own pool manager, so
        // its eventual `Drop` checks it back in on its own.
        let _ = request.fulfill(ConnectionRequestResult::Establishing(handle));
    }

    fn check_in(&mut self, state: DroppedConnectionState) {
        self.event_emitter.emit_event(|| {
            crate::event::cmap::ConnectionCheckedInEvent {
                address: state.address.clone(),
                connection_id: state.id,
            }
            .into()
        });

        let closed = state.closed;
        let interrupted = state.interrupted;

        let Some(mut conn) = state.into_connection(self.manager.clone()) else {
            self.total_connection_count -= 1;
            return;
        };
        conn.mark_as_available();

        if closed {
            self.close_connection(conn, ConnectionClosedReason::Error);
        } else if interrupted {
            self.close_connection(conn, ConnectionClosedReason::Stale);
        } else if conn.generation.is_stale(self.generation) {
            self.close_connection(conn, ConnectionClosedReason::Stale);
        } else {
            self.available_connections.push_back(conn);
        }
    }

    fn clear(&mut self, cause: Error) {
        self.generation += 1;
        self.generation_publisher.publish(self.generation);

        let was_ready = !self.load_balanced && matches!(self.state, PoolState::Ready);
        if !self.load_balanced {
            self.state = PoolState::Paused(cause.clone());
        }

        if was_ready || self.load_balanced {
            self.event_emitter.emit_event(|| {
                PoolClearedEvent {
                    address: self.address.clone(),
                }
                .into()
            });
        }

        if !self.load_balanced {
            for request in self.wait_queue.drain(..) {
                let _ = request.fulfill(ConnectionRequestResult::PoolCleared(cause.clone()));
            }
        }
    }

    fn mark_as_ready(&mut self) {
        if matches!(self.state, PoolState::Ready) {
            return;
        }
        self.state = PoolState::Ready;
        self.event_emitter.emit_event(|| {
            PoolReadyEvent {
                address: self.address.clone(),
            }
            .into()
        });
    }

    fn close_connection(&mut self, connection: Connection, reason: ConnectionClosedReason) {
        self.total_connection_count -= 1;
        let event = connection.close_and_drop(reason);
        self.event_emitter.emit_event(|| event.into());
    }

    fn perform_maintenance(&mut self) {
        self.remove_perished_connections();
        if matches!(self.state, PoolState::Ready) {
            self.ensure_min_connections();
        }
    }

    fn remove_perished_connections(&mut self) {
        while let Some(connection) = self.available_connections.pop_front() {
            if connection.generation.is_stale(self.generation) {
                self.close_connection(connection, ConnectionClosedReason::Stale);
            } else if connection.is_idle(self.max_idle_time) {
                self.close_connection(connection, ConnectionClosedReason::Idle);
            } else {
                self.available_connections.push_front(connection);
                // Connections are pushed to the back when returned, so everything behind this
                // one is at least as fresh; no need to keep scanning.
                break;
            }
        }
    }

    fn ensure_min_connections(&mut self) {
        let Some(min_pool_size) = self.min_pool_size else {
            return;
        };

        while self.total_connection_count < min_pool_size && self.pending_connection_count < self.max_connecting {
            let connector = self.connector.clone();
            let establisher = self.establisher.clone();
            let manager = self.manager.clone();
            let event_emitter = self.event_emitter.clone();
            let address = self.address.clone();
            let id = self.next_connection_id;
            let generation = ConnectionGeneration {
                generation: self.generation,
                service_id: None,
            };
            self.next_connection_id += 1;
            self.total_connection_count += 1;
            self.pending_connection_count += 1;

            event_emitter.emit_event(|| {
                ConnectionCreatedEvent {
                    address: address.clone(),
                    connection_id: id,
                }
                .into()
            });

            runtime::spawn(async move {
                let result = establish_connection(
                    connector, establisher, address, id, generation, &manager, event_emitter,
                )
                .await;

                match result {
                    Ok(conn) => manager.populate_connection(conn),
                    Err(_) => manager.handle_connection_failed(),
                }
            });
        }
    }
}

/// Dials, handshakes, and (if a credential is configured) authenticates a brand-new connection,
/// publishing `ConnectionReadyEvent`/`ConnectionClosedEvent` as appropriate along the way. Shared
/// between `check_out`'s on-demand establishment and the populator's `ensure_min_connections`.
async fn establish_connection(
    connector: Arc<dyn StreamConnector>,
    establisher: ConnectionEstablisher,
    address: ServerAddress,
    id: u32,
    generation: ConnectionGeneration,
    manager: &PoolManager,
    event_emitter: CmapEventEmitter,
) -> Result<Connection, Error> {
    let result = async {
        let stream = connector.connect(&address).await?;
        let mut conn = Connection::new(id, address.clone(), generation, stream);
        establisher.establish_connection(&mut conn).await?;
        Ok(conn)
    }
    .await;

    match result {
        Ok(conn) => {
            event_emitter.emit_event(|| {
                ConnectionReadyEvent {
                    address,
                    connection_id: id,
                }
                .into()
            });
            Ok(conn)
        }
        Err(e) => {
            event_emitter.emit_event(|| {
                crate::event::cmap::ConnectionClosedEvent {
                    address,
                    connection_id: id,
                    reason: ConnectionClosedReason::Error,
                }
                .into()
            });
            manager.clear(e.clone());
            Err(e)
        }
    }
}
