//! The Connection Pool (§4.B): a per-server set of Wire Connections, owned and served by a
//! dedicated background task rather than a shared lock. See [`worker`] for the task itself and
//! [`ConnectionPool`] for the handle applications (and the SDAM layer) hold onto it.

pub(crate) mod conn;
mod connection_requester;
pub(crate) mod establish;
mod manager;
#[cfg(test)]
mod pool_test;
mod status;
mod worker;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

pub(crate) use conn::{AsyncStream, Command, Connection, RawCommandResponse, StreamDescription};
pub(crate) use establish::{Authenticator, ConnectionEstablisher, EstablisherOptions};
pub(crate) use manager::PoolManager;
pub(crate) use status::PoolGenerationSubscriber;

use connection_requester::{ConnectionRequester, ConnectionRequestResult};
use worker::ConnectionPoolWorker;

use crate::{
    error::{Error, Result},
    event::cmap::{CmapEventEmitter, ConnectionCheckoutFailedReason, ConnectionCheckoutStartedEvent},
    options::{ConnectionPoolOptions, ServerAddress},
    runtime,
};

/// Dials `address` and returns a connected, not-yet-handshaken byte stream.
///
/// Transport-level concerns (TCP, TLS, DNS resolution, connect-timeout enforcement) are the
/// caller's responsibility, per this crate's Non-goals; this trait is the seam a caller plugs a
/// concrete transport into. A `tokio::net::TcpStream` wrapped to honor `connect_timeout` is the
/// typical implementation.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Establishes a new transport-level connection to `address`.
    async fn connect(&self, address: &ServerAddress) -> Result<Box<dyn AsyncStream>>;
}

/// A handle to a running connection pool for one server's address.
///
/// Cloning a `ConnectionPool` is cheap and shares the same underlying worker task; the pool
/// itself is torn down only once every clone (and every `Connection` checked out of it) has been
/// dropped.
#[derive(Clone)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    requester: ConnectionRequester,
    generation_subscriber: PoolGenerationSubscriber,
    event_emitter: CmapEventEmitter,
    wait_queue_timeout: Option<Duration>,
}

impl ConnectionPool {
    /// Creates a new pool and spawns its worker task. The pool starts in the `New` state (or
    /// `Ready`, for load-balanced pools) and must be explicitly [`mark_as_ready`](Self::mark_as_ready)d
    /// before it will service check-outs, mirroring the Monitor's role of readying a pool once it
    /// has confirmed the server is reachable.
    pub(crate) fn new(
        address: ServerAddress,
        connector: Arc<dyn StreamConnector>,
        establisher: ConnectionEstablisher,
        options: Option<ConnectionPoolOptions>,
    ) -> Self {
        let event_handler = options.as_ref().and_then(|o| o.cmap_event_handler.clone());
        let wait_queue_timeout = options
            .as_ref()
            .and_then(|o| o.wait_queue_timeout)
            .or(Some(Duration::from_millis(10_000)));
        let event_emitter = CmapEventEmitter::new(event_handler);

        let (manager, requester, generation_subscriber) = ConnectionPoolWorker::start(
            address.clone(),
            connector,
            establisher,
            event_emitter.clone(),
            options,
        );

        event_emitter.emit_event(|| {
            crate::event::cmap::PoolCreatedEvent {
                address: address.clone(),
            }
            .into()
        });

        Self {
            address,
            manager,
            requester,
            generation_subscriber,
            event_emitter,
            wait_queue_timeout,
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The pool's current generation, bumped on every [`clear`](Self::clear).
    pub(crate) fn generation(&self) -> u32 {
        self.generation_subscriber.generation()
    }

    /// Checks out a connection, waiting up to `wait_queue_timeout` for one to become available.
    /// Fails with `WaitQueueTimeout`, `PoolClosed`, or `PoolPaused` (wrapping the clear's cause)
    /// per §4.B's check-out algorithm.
    pub(crate) async fn check_out(&self) -> Result<Connection> {
        self.event_emitter.emit_event(|| {
            ConnectionCheckoutStartedEvent {
                address: self.address.clone(),
            }
            .into()
        });

        let result = match self.wait_queue_timeout {
            Some(timeout) if !timeout.is_zero() => {
                runtime::timeout_with(timeout, self.request(), || {
                    Error::wait_queue_timeout_error(&self.address)
                })
                .await
            }
            _ => self.request().await,
        };

        match result {
            Ok(conn) => {
                self.event_emitter.emit_event(|| conn.checked_out_event().into());
                Ok(conn)
            }
            Err(e) => {
                let reason = match e.kind.as_ref() {
                    crate::error::ErrorKind::WaitQueueTimeout { .. } => {
                        ConnectionCheckoutFailedReason::Timeout
                    }
                    crate::error::ErrorKind::Io(_) => ConnectionCheckoutFailedReason::ConnectionError,
                    _ => ConnectionCheckoutFailedReason::PoolClosed,
                };
                self.event_emitter.emit_event(|| {
                    crate::event::cmap::ConnectionCheckoutFailedEvent {
                        address: self.address.clone(),
                        reason,
                    }
                    .into()
                });
                Err(e)
            }
        }
    }

    async fn request(&self) -> Result<Connection> {
        match self.requester.request().await {
            ConnectionRequestResult::Pooled(conn) => Ok(*conn),
            ConnectionRequestResult::Establishing(handle) => handle.await?,
            ConnectionRequestResult::PoolCleared(cause) => {
                Err(Error::pool_cleared_error(&self.address, &cause))
            }
        }
    }

    /// Clears the pool: bumps its generation and, outside load-balanced mode, pauses it until
    /// [`mark_as_ready`](Self::mark_as_ready) is next called. Connections of the prior generation
    /// are discarded as they're checked in or popped off `available`, never reused.
    pub(crate) fn clear(&self, cause: Error) {
        self.manager.clear(cause);
    }

    /// Transitions the pool to `Ready`, allowing check-outs and the populator to proceed.
    pub(crate) fn mark_as_ready(&self) {
        self.manager.mark_as_ready();
    }
}
