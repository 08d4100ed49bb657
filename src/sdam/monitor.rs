//! The Monitor (§4.C) and the awaitable-`hello` Push Monitor (§4.D): a dedicated background task
//! per server that keeps its `ServerDescription` current by periodically (or, once the server
//! supports it, continuously) running `hello` over its own monitoring connection.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    cmap::{
        conn::ConnectionGeneration,
        Connection,
        ConnectionEstablisher,
        StreamConnector,
    },
    error::Result,
    event::sdam::{
        SdamEvent,
        SdamEventEmitter,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, run_awaitable_hello, run_hello, AwaitableHelloOptions, HelloReply},
    options::{ServerAddress, ServerApi},
    runtime::{self, WorkerHandle, WorkerHandleListener},
    sdam::{description::server::ServerDescription, message_manager::TopologyMessageSubscriber, TopologyUpdater},
};

/// The default interval between heartbeats, per the SDAM spec.
pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// A heartbeat is never retried or requested sooner than this, regardless of how often server
/// selection asks for a fresh check.
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// Options a Monitor needs that would otherwise require holding onto the entire `ClientOptions`.
#[derive(Clone)]
pub(crate) struct MonitorOptions {
    pub(crate) server_api: Option<ServerApi>,
    pub(crate) load_balanced: bool,
    pub(crate) heartbeat_freq: Duration,
}

/// Runs `hello` against one server on a dedicated connection, on a timer, pushing every result to
/// the [`TopologyUpdater`]. Once a server confirms it supports the awaitable protocol
/// (`topologyVersion` present in its reply), subsequent scans switch to streaming mode: the
/// server is asked to hold the connection open and push a new reply as soon as its state changes
/// (`maxAwaitTimeMS`), rather than being polled on a fixed interval (§4.D).
pub(crate) struct Monitor {
    address: ServerAddress,
    connector: Arc<dyn StreamConnector>,
    establisher: ConnectionEstablisher,
    options: MonitorOptions,
    topology_updater: TopologyUpdater,
    check_requests: TopologyMessageSubscriber,
    sdam_event_emitter: SdamEventEmitter,
    handle_listener: WorkerHandleListener,
    connection: Option<Connection>,
    streaming: bool,
    next_connection_id: u32,
}

impl Monitor {
    /// Spawns a Monitor for `address` and returns the [`WorkerHandle`] that keeps it alive: once
    /// every clone of the handle is dropped (the server was removed from the topology, or the
    /// topology itself shut down), the Monitor's loop exits on its next iteration.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        address: ServerAddress,
        connector: Arc<dyn StreamConnector>,
        establisher: ConnectionEstablisher,
        options: MonitorOptions,
        topology_updater: TopologyUpdater,
        check_requests: TopologyMessageSubscriber,
        sdam_event_emitter: SdamEventEmitter,
    ) -> WorkerHandle {
        let (handle, handle_listener) = WorkerHandleListener::channel();

        let monitor = Self {
            address,
            connector,
            establisher,
            options,
            topology_updater,
            check_requests,
            sdam_event_emitter,
            handle_listener,
            connection: None,
            streaming: false,
            next_connection_id: 1,
        };

        runtime::spawn(monitor.run());

        handle
    }

    async fn run(mut self) {
        while self.handle_listener.is_alive() {
            self.run_scan().await;

            if self.streaming {
                // The server itself paces replies via `maxAwaitTimeMS`; looping straight back
                // into `run_scan` keeps reading them without an artificial extra delay.
                continue;
            }

            runtime::delay_for(MIN_HEARTBEAT_FREQUENCY).await;
            let remaining = self
                .options
                .heartbeat_freq
                .saturating_sub(MIN_HEARTBEAT_FREQUENCY);

            tokio::select! {
                _ = self.handle_listener.wait_for_all_handle_drops() => break,
                _ = self.check_requests.wait_for_request(remaining) => {}
            }
        }
    }

    /// Runs one scan (a fresh polling `hello`, a retried one, or one streamed reply), publishing
    /// its outcome to the topology.
    async fn run_scan(&mut self) {
        let driver_connection_id = self.connection.as_ref().map(|c| c.id).unwrap_or(0);
        let awaited = self.streaming;

        self.emit(|| {
            SdamEvent::ServerHeartbeatStarted(ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
                awaited,
                driver_connection_id,
            })
        });

        let start = Instant::now();
        let outcome = if self.streaming {
            self.read_streamed_reply().await
        } else {
            self.scan_with_retry().await
        };

        match outcome {
            Ok(Some((reply, more_to_come))) => {
                let duration = start.elapsed();
                self.emit(|| {
                    SdamEvent::ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent {
                        duration,
                        server_address: self.address.clone(),
                        awaited,
                        driver_connection_id,
                    })
                });

                self.streaming = more_to_come;
                if self.connection.as_ref().map(|c| c.is_closed()).unwrap_or(false) {
                    self.connection = None;
                }

                let existing_rtt = self
                    .topology_updater
                    .server_description(&self.address)
                    .await
                    .and_then(|d| d.average_round_trip_time_ms);

                let description = ServerDescription::new_from_hello_reply(
                    self.address.clone(),
                    reply,
                    duration.as_secs_f64() * 1000.0,
                    existing_rtt,
                );
                self.topology_updater.update(description).await;
            }
            // The streamed connection stopped streaming without an error; fall back to polling.
            Ok(None) => {
                self.streaming = false;
            }
            Err(e) => {
                let duration = start.elapsed();
                self.emit(|| {
                    SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                        duration,
                        message: e.to_string(),
                        server_address: self.address.clone(),
                        awaited,
                        driver_connection_id,
                    })
                });

                self.connection = None;
                self.streaming = false;
                self.topology_updater
                    .handle_monitor_error(self.address.clone(), e)
                    .await;
            }
        }
    }

    /// Sends a fresh `hello`. If it fails with a network error and the server was previously
    /// known to be available, retries once immediately rather than waiting for the next
    /// scheduled scan, per §4.C's retry-once-then-`Unknown` rule.
    async fn scan_with_retry(&mut self) -> Result<Option<(HelloReply, bool)>> {
        match self.scan_once().await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                let previously_available = self
                    .topology_updater
                    .server_description(&self.address)
                    .await
                    .map(|d| d.is_available())
                    .unwrap_or(false);

                if e.is_network_error() && previously_available {
                    self.connection = None;
                    Ok(Some(self.scan_once().await?))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Runs one `hello` (establishing a new monitoring connection first if needed), requesting
    /// the awaitable protocol when the server's last known `topologyVersion` makes that possible.
    async fn scan_once(&mut self) -> Result<(HelloReply, bool)> {
        if self.connection.is_none() {
            let reply = self.connect().await?;
            return Ok((reply, false));
        }

        let topology_version = self
            .topology_updater
            .server_description(&self.address)
            .await
            .and_then(|d| d.topology_version());

        let conn = self.connection.as_mut().expect("checked above");

        match topology_version {
            Some(topology_version) => {
                let command = hello_command(
                    self.options.server_api.as_ref(),
                    Some(self.options.load_balanced),
                    None,
                    Some(AwaitableHelloOptions {
                        topology_version,
                        max_await_time: self.options.heartbeat_freq,
                    }),
                );
                run_awaitable_hello(conn, command).await
            }
            None => {
                let command =
                    hello_command(self.options.server_api.as_ref(), Some(self.options.load_balanced), None, None);
                let reply = run_hello(conn, command).await?;
                Ok((reply, false))
            }
        }
    }

    /// Reads the next pushed reply on a connection already left open via `moreToCome`.
    async fn read_streamed_reply(&mut self) -> Result<Option<(HelloReply, bool)>> {
        let conn = match self.connection.as_mut() {
            Some(conn) => conn,
            None => return Ok(None),
        };

        let address = conn.address.clone();
        match conn.read_streamed_reply().await? {
            Some(raw) => {
                let command_response = raw.body()?;
                let more_to_come = !conn.is_closed();
                Ok(Some((
                    HelloReply {
                        server_address: address,
                        command_response,
                    },
                    more_to_come,
                )))
            }
            None => Ok(None),
        }
    }

    /// Dials and handshakes a fresh monitoring connection, recording its handshake `hello` as the
    /// scan's result.
    async fn connect(&mut self) -> Result<HelloReply> {
        let stream = self.connector.connect(&self.address).await?;
        let id = self.next_connection_id;
        self.next_connection_id += 1;

        let mut conn = Connection::new(
            id,
            self.address.clone(),
            ConnectionGeneration {
                generation: 0,
                service_id: None,
            },
            stream,
        );

        let reply = self.establisher.establish_monitoring_connection(&mut conn).await?;
        self.connection = Some(conn);
        Ok(reply)
    }

    fn emit(&self, f: impl FnOnce() -> SdamEvent) {
        self.sdam_event_emitter.emit_event(f);
    }
}
