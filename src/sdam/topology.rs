//! The Topology (§4.F): the actor that owns the live `TopologyDescription`, starts and stops a
//! [`Monitor`](super::monitor::Monitor) and [`ConnectionPool`] per server, and answers server
//! selection requests (§4.G) against a cheaply-cloneable, always-current snapshot.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    cmap::{establish::EstablisherOptions, Authenticator, ConnectionPool, ConnectionEstablisher, StreamConnector},
    error::{Error, Result},
    event::sdam::{
        SdamEvent,
        SdamEventEmitter,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    options::{ClientOptions, ServerAddress},
    runtime::{self, WorkerHandle, WorkerHandleListener},
    sdam::{
        description::server::ServerDescription,
        message_manager::TopologyMessageManager,
        monitor::{Monitor, MonitorOptions},
        TopologyDescription,
    },
    selection_criteria::SelectionCriteria,
};

/// A request sent into the running [`TopologyWorker`].
enum UpdateMessage {
    /// A Monitor observed a new server description.
    Update {
        server_description: ServerDescription,
        reply: oneshot::Sender<bool>,
    },

    /// A Monitor's scan failed; its server should be marked `Unknown` and its pool cleared.
    MonitorError {
        address: ServerAddress,
        error: Error,
        reply: oneshot::Sender<bool>,
    },

    /// A Monitor wants the last-known description for its own server, to decide on retry policy
    /// and the awaitable `hello`'s `topologyVersion`.
    ServerDescription {
        address: ServerAddress,
        reply: oneshot::Sender<Option<ServerDescription>>,
    },
}

/// A cloneable handle Monitors use to push their scan results into the [`TopologyWorker`].
#[derive(Clone)]
pub(crate) struct TopologyUpdater {
    sender: mpsc::UnboundedSender<UpdateMessage>,
}

impl TopologyUpdater {
    /// Applies `server_description`. Returns whether the topology's aggregate description
    /// changed as a result.
    pub(crate) async fn update(&self, server_description: ServerDescription) -> bool {
        let (reply, receiver) = oneshot::channel();
        if self
            .sender
            .send(UpdateMessage::Update {
                server_description,
                reply,
            })
            .is_err()
        {
            return false;
        }
        receiver.await.unwrap_or(false)
    }

    /// Records that a Monitor's scan of `address` failed with `error`.
    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        let (reply, receiver) = oneshot::channel();
        if self
            .sender
            .send(UpdateMessage::MonitorError {
                address,
                error,
                reply,
            })
            .is_err()
        {
            return false;
        }
        receiver.await.unwrap_or(false)
    }

    /// The last-known description for `address`, or `None` if it's no longer part of the
    /// topology (or the topology has already shut down).
    pub(crate) async fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        let (reply, receiver) = oneshot::channel();
        if self
            .sender
            .send(UpdateMessage::ServerDescription {
                address: address.clone(),
                reply,
            })
            .is_err()
        {
            return None;
        }
        receiver.await.ok().flatten()
    }
}

/// A single server's worker-owned resources: its pool and the handle keeping its Monitor alive.
struct ServerState {
    pool: ConnectionPool,
    _monitor_handle: WorkerHandle,
}

/// A point-in-time, cheaply-cloneable view of the topology, handed to server selection callers
/// and published on every change via a `tokio::sync::watch` channel.
#[derive(Clone)]
pub(crate) struct TopologySnapshot(Arc<SnapshotInner>);

struct SnapshotInner {
    description: TopologyDescription,
    pools: HashMap<ServerAddress, ConnectionPool>,
}

impl TopologySnapshot {
    pub(crate) fn description(&self) -> &TopologyDescription {
        &self.0.description
    }

    fn pool(&self, address: &ServerAddress) -> Option<&ConnectionPool> {
        self.0.pools.get(address)
    }
}

/// A server chosen by [`Topology::select_server`], paired with a handle to its pool.
pub(crate) struct SelectedServer {
    pub(crate) address: ServerAddress,
    pub(crate) pool: ConnectionPool,
}

/// The actor owning the live `TopologyDescription` and one `ConnectionPool`/`Monitor` pair per
/// server. All mutation happens serially inside [`TopologyWorker::run`]; every other part of the
/// crate only ever holds a [`Topology`] handle.
struct TopologyWorker {
    description: TopologyDescription,
    servers: HashMap<ServerAddress, ServerState>,
    connector: Arc<dyn StreamConnector>,
    establisher: ConnectionEstablisher,
    pool_options: Option<crate::options::ConnectionPoolOptions>,
    monitor_options: MonitorOptions,
    message_manager: TopologyMessageManager,
    sdam_event_emitter: SdamEventEmitter,
    snapshot_publisher: watch::Sender<TopologySnapshot>,
    update_receiver: mpsc::UnboundedReceiver<UpdateMessage>,
    update_sender: mpsc::UnboundedSender<UpdateMessage>,
    handle_listener: WorkerHandleListener,
}

impl TopologyWorker {
    fn start_server(&mut self, address: ServerAddress) {
        let pool = ConnectionPool::new(
            address.clone(),
            self.connector.clone(),
            self.establisher.clone(),
            self.pool_options.clone(),
        );

        let monitor_handle = Monitor::start(
            address.clone(),
            self.connector.clone(),
            self.establisher.clone(),
            self.monitor_options.clone(),
            TopologyUpdater {
                sender: self.update_sender(),
            },
            self.message_manager.subscribe(),
            self.sdam_event_emitter.clone(),
        );

        self.servers.insert(
            address.clone(),
            ServerState {
                pool,
                _monitor_handle: monitor_handle,
            },
        );

        self.emit(|| SdamEvent::ServerOpening(ServerOpeningEvent { address }));
    }

    fn stop_server(&mut self, address: &ServerAddress) {
        if self.servers.remove(address).is_some() {
            self.emit(|| {
                SdamEvent::ServerClosed(ServerClosedEvent {
                    address: address.clone(),
                })
            });
        }
    }

    /// Starts a Monitor/pool for every address newly present in `description`, and stops them for
    /// every address no longer present.
    fn sync_servers(&mut self) {
        let current: HashSet<ServerAddress> = self.description.addresses().cloned().collect();
        let existing: HashSet<ServerAddress> = self.servers.keys().cloned().collect();

        for address in current.difference(&existing) {
            self.start_server(address.clone());
        }

        let removed: Vec<ServerAddress> = existing.difference(&current).cloned().collect();
        for address in &removed {
            self.stop_server(address);
        }
    }

    /// Clears or readies a server's pool to match its just-updated description, per the
    /// CMAP/SDAM interaction rule: a server that became unreachable clears its pool (handled by
    /// the caller, which has the triggering error in hand); a server that's newly available is
    /// marked ready so check-outs can proceed.
    fn sync_pool_readiness(&self, address: &ServerAddress) {
        let available = self
            .description
            .servers()
            .find(|s| &s.address == address)
            .map(|s| s.is_available())
            .unwrap_or(false);

        if available {
            if let Some(server) = self.servers.get(address) {
                server.pool.mark_as_ready();
            }
        }
    }

    fn apply_update(&mut self, server_description: ServerDescription) -> bool {
        let address = server_description.address.clone();
        if !self.servers.contains_key(&address) {
            return false;
        }

        let previous_for_address = self
            .description
            .servers()
            .find(|s| s.address == address)
            .cloned();
        let previous_all: Vec<ServerDescription> = self.description.servers().cloned().collect();

        if let Err(e) = self.description.update(server_description.clone()) {
            tracing::warn!(
                target: "mongodb_core::sdam",
                error = %e,
                address = %address,
                "failed to apply server description update"
            );
            return false;
        }

        if let Some(previous) = previous_for_address {
            if previous != server_description {
                self.emit(|| {
                    SdamEvent::ServerDescriptionChanged(ServerDescriptionChangedEvent {
                        address: address.clone(),
                        previous_description: (&previous).into(),
                        new_description: (&server_description).into(),
                    })
                });
            }
        }

        self.sync_servers();
        self.sync_pool_readiness(&address);

        let new_all: Vec<ServerDescription> = self.description.servers().cloned().collect();
        let changed = previous_all != new_all;

        if changed {
            self.emit(|| {
                SdamEvent::TopologyDescriptionChanged(TopologyDescriptionChangedEvent {
                    previous_description: previous_all.iter().map(Into::into).collect(),
                    new_description: new_all.iter().map(Into::into).collect(),
                })
            });
            self.publish_snapshot();
        }

        changed
    }

    fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        if let Some(server) = self.servers.get(&address) {
            server.pool.clear(error.clone());
        }

        let server_description = ServerDescription::new_from_error(address, error);
        self.apply_update(server_description)
    }

    fn publish_snapshot(&self) {
        let pools = self
            .servers
            .iter()
            .map(|(address, state)| (address.clone(), state.pool.clone()))
            .collect();

        let snapshot = TopologySnapshot(Arc::new(SnapshotInner {
            description: self.description.clone(),
            pools,
        }));

        let _ = self.snapshot_publisher.send(snapshot);
    }

    fn handle_message(&mut self, message: UpdateMessage) {
        match message {
            UpdateMessage::Update {
                server_description,
                reply,
            } => {
                let changed = self.apply_update(server_description);
                let _ = reply.send(changed);
            }
            UpdateMessage::MonitorError {
                address,
                error,
                reply,
            } => {
                let changed = self.handle_monitor_error(address, error);
                let _ = reply.send(changed);
            }
            UpdateMessage::ServerDescription { address, reply } => {
                let description = self
                    .description
                    .servers()
                    .find(|s| s.address == address)
                    .cloned();
                let _ = reply.send(description);
            }
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.handle_listener.wait_for_all_handle_drops() => break,
                message = self.update_receiver.recv() => {
                    match message {
                        Some(message) => self.handle_message(message),
                        None => break,
                    }
                }
            }
        }

        self.emit(|| SdamEvent::TopologyClosed(TopologyClosedEvent {}));
    }

    fn emit(&self, f: impl FnOnce() -> SdamEvent) {
        self.sdam_event_emitter.emit_event(f);
    }

    fn update_sender(&self) -> mpsc::UnboundedSender<UpdateMessage> {
        self.update_sender.clone()
    }
}

/// A handle to a running [`TopologyWorker`]. Cheap to clone; the worker shuts down (stopping
/// every Monitor and dropping every pool handle it owns) once every clone has been dropped.
#[derive(Clone)]
pub(crate) struct Topology {
    updater: TopologyUpdater,
    snapshot_subscriber: watch::Receiver<TopologySnapshot>,
    message_manager: TopologyMessageManager,
    server_selection_timeout: Duration,
    _handle: WorkerHandle,
}

impl Topology {
    /// Builds the initial topology from `options`'s seed list and spawns its worker, along with
    /// one `ConnectionPool`/`Monitor` pair per seed server.
    pub(crate) fn new(
        options: &ClientOptions,
        connector: Arc<dyn StreamConnector>,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Self {
        let description = TopologyDescription::new(options);

        let establisher = ConnectionEstablisher::new(
            EstablisherOptions {
                app_name: options.app_name.clone(),
                server_api: options.server_api.clone(),
                load_balanced: options.load_balanced.unwrap_or(false),
                credential: options.pool_options.credential.clone(),
            },
            authenticator,
        );

        let monitor_options = MonitorOptions {
            server_api: options.server_api.clone(),
            load_balanced: options.load_balanced.unwrap_or(false),
            heartbeat_freq: options.server_selection_options.heartbeat_freq,
        };

        let sdam_event_emitter =
            SdamEventEmitter::new(options.server_selection_options.sdam_event_handler.clone());
        let message_manager = TopologyMessageManager::new();
        let (update_sender, update_receiver) = mpsc::unbounded_channel();
        let (handle, handle_listener) = WorkerHandleListener::channel();

        // Seed the snapshot channel with an empty topology; `sync_servers` populates the real
        // pools/monitors immediately below and republishes before anyone can observe the gap.
        let (snapshot_publisher, snapshot_subscriber) = watch::channel(TopologySnapshot(Arc::new(SnapshotInner {
            description: description.clone(),
            pools: HashMap::new(),
        })));

        let updater = TopologyUpdater {
            sender: update_sender.clone(),
        };

        let mut worker = TopologyWorker {
            description,
            servers: HashMap::new(),
            connector,
            establisher,
            pool_options: Some(options.pool_options.clone()),
            monitor_options,
            message_manager: message_manager.clone(),
            sdam_event_emitter: sdam_event_emitter.clone(),
            snapshot_publisher,
            update_receiver,
            update_sender,
            handle_listener,
        };

        worker.emit(|| SdamEvent::TopologyOpening(TopologyOpeningEvent {}));
        worker.sync_servers();
        worker.publish_snapshot();

        runtime::spawn(worker.run());

        Self {
            updater,
            snapshot_subscriber,
            message_manager,
            server_selection_timeout: options.server_selection_options.server_selection_timeout,
            _handle: handle,
        }
    }

    /// Applies a fresh server description from outside the ordinary Monitor flow (e.g. a
    /// handshake reply observed on an application connection, per the SDAM spec's "update the
    /// topology from every hello the driver ever sees" rule). Returns whether the topology's
    /// aggregate description changed.
    pub(crate) async fn update(&self, server_description: ServerDescription) -> bool {
        self.updater.update(server_description).await
    }

    /// The last-known description for `address`, if it's still part of the topology.
    pub(crate) async fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        self.updater.server_description(address).await
    }

    /// Selects a server matching `criteria`, retrying against fresh topology snapshots until one
    /// is found or `server_selection_timeout` elapses (§4.G, §5 "Suspension points").
    pub(crate) async fn select_server(&self, criteria: &SelectionCriteria) -> Result<SelectedServer> {
        let deadline = Instant::now() + self.server_selection_timeout;
        let mut snapshot_subscriber = self.snapshot_subscriber.clone();

        loop {
            let snapshot = snapshot_subscriber.borrow_and_update().clone();

            if let Some(message) = snapshot.description().compatibility_error() {
                return Err(Error::server_selection_error(message.clone()));
            }

            if let Some(selected) = snapshot.description().select_server(criteria)? {
                if let Some(pool) = snapshot.pool(&selected.address) {
                    return Ok(SelectedServer {
                        address: selected.address.clone(),
                        pool: pool.clone(),
                    });
                }
            }

            // Nothing suitable in this snapshot; ask every Monitor to recheck immediately rather
            // than wait out the full heartbeat interval, then wait for either a topology change
            // or the deadline.
            self.message_manager.request_topology_check();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::server_selection_error(format!(
                    "server selection timed out after {}ms",
                    self.server_selection_timeout.as_millis()
                )));
            }

            let _ = runtime::timeout(remaining, async {
                snapshot_subscriber
                    .changed()
                    .await
                    .map_err(|_| Error::internal("topology shut down during server selection".to_string()))
            })
            .await;
        }
    }
}
