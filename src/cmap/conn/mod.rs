//! A single wire-protocol connection: framing, handshake results, and the one-at-a-time
//! round-trip discipline described for the Wire Connection component.

mod command;
mod stream_description;
#[cfg(test)]
mod test;
mod wire;

use std::time::{Duration, Instant};

use bson::Document;
use tokio::io::{AsyncRead, AsyncWrite};

use self::wire::Message;
use crate::{
    bson_util,
    cmap::PoolManager,
    error::{ErrorKind, Result},
    event::cmap::{
        ConnectionCheckedInEvent,
        ConnectionCheckedOutEvent,
        ConnectionClosedEvent,
        ConnectionClosedReason,
    },
    options::ServerAddress,
};

pub(crate) use command::{Command, RawCommandResponse};
pub(crate) use stream_description::StreamDescription;

/// A connected, `Unpin + Send` byte stream. The crate is generic over the transport; TLS
/// handshaking and DNS resolution are a caller concern (see the crate's Non-goals).
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Snapshot of a connection's pool generation at the time it was created, used to detect
/// staleness at check-in/check-out without needing to consult the pool itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConnectionGeneration {
    pub(crate) generation: u32,
    pub(crate) service_id: Option<bson::oid::ObjectId>,
}

impl ConnectionGeneration {
    /// Whether a connection stamped with this generation is older than its pool's current one
    /// and should be discarded rather than reused.
    pub(crate) fn is_stale(&self, current_pool_generation: u32) -> bool {
        self.generation < current_pool_generation
    }
}

/// A single wire-protocol connection to one server.
///
/// Admits at most one in-flight request/response pair; callers needing concurrency use separate
/// connections. A read aborted mid-message (or any framing error) permanently closes the
/// connection rather than leaving it partially read.
pub(crate) struct Connection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: ConnectionGeneration,
    pub(crate) stream_description: Option<StreamDescription>,

    /// Prevents this connection from being discarded on a generation bump (transactions/cursors).
    pub(crate) pinned: bool,

    /// Set when a concurrent `clear(interruptInUseConnections: true)` targeted this checked-out
    /// connection; the next check-in destroys it instead of returning it to `available`.
    interrupted: bool,

    closed: bool,
    stream: Option<Box<dyn AsyncStream>>,
    pool_manager: Option<PoolManager>,

    /// When this connection was last returned to `available`, used to evict it once it has sat
    /// idle longer than `maxIdleTimeMS`. `None` while the connection is checked out.
    available_since: Option<Instant>,
}

impl Connection {
    pub(crate) fn new(
        id: u32,
        address: ServerAddress,
        generation: ConnectionGeneration,
        stream: Box<dyn AsyncStream>,
    ) -> Self {
        Self {
            id,
            address,
            generation,
            stream_description: None,
            pinned: false,
            interrupted: false,
            closed: false,
            stream: Some(stream),
            pool_manager: None,
            available_since: None,
        }
    }

    /// Attaches the pool manager this connection should check itself back in with on drop. Left
    /// unset for monitoring connections, which are never pooled.
    pub(crate) fn set_pool_manager(&mut self, manager: PoolManager) {
        self.pool_manager = Some(manager);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn has_errored(&self) -> bool {
        self.closed
    }

    /// Marks this connection as checked out: clears its idle timestamp and attaches the pool
    /// manager it should report back to on drop.
    pub(crate) fn mark_as_in_use(&mut self, manager: PoolManager) {
        self.available_since = None;
        self.pool_manager = Some(manager);
    }

    /// Marks this connection as available, starting its idle clock.
    pub(crate) fn mark_as_available(&mut self) {
        self.available_since = Some(Instant::now());
    }

    /// Whether this connection has been sitting in `available` longer than `max_idle_time`.
    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        match (self.available_since, max_idle_time) {
            (Some(since), Some(max_idle_time)) => since.elapsed() >= max_idle_time,
            _ => false,
        }
    }

    pub(crate) fn checked_out_event(&self) -> ConnectionCheckedOutEvent {
        ConnectionCheckedOutEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    pub(crate) fn checked_in_event(&self) -> ConnectionCheckedInEvent {
        ConnectionCheckedInEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    /// Consumes this connection, closing its socket and returning the event describing why.
    pub(crate) fn close_and_drop(mut self, reason: ConnectionClosedReason) -> ConnectionClosedEvent {
        self.closed = true;
        self.pool_manager = None;
        let event = closed_event(self.address.clone(), self.id, reason);
        drop(self);
        event
    }

    pub(crate) fn mark_interrupted(&mut self) {
        self.interrupted = true;
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupted
    }

    fn check_max_message_size(&self, body_len: usize) -> Result<()> {
        let (max_bson, max_message) = match &self.stream_description {
            Some(sd) => (sd.max_bson_object_size, sd.max_message_size_bytes as i64),
            None => (
                stream_description::DEFAULT_MAX_BSON_OBJECT_SIZE,
                stream_description::DEFAULT_MAX_MESSAGE_SIZE_BYTES as i64,
            ),
        };

        if body_len as i64 > max_bson {
            return Err(ErrorKind::DocumentTooLarge {
                message: format!(
                    "command document of {} bytes exceeds this server's maximum BSON object \
                     size of {} bytes",
                    body_len, max_bson
                ),
            }
            .into());
        }

        if body_len as i64 + 64 > max_message {
            return Err(ErrorKind::DocumentTooLarge {
                message: format!(
                    "command message of {} bytes exceeds this server's maximum message size of \
                     {} bytes",
                    body_len, max_message
                ),
            }
            .into());
        }

        Ok(())
    }

    /// Sends `command` and returns the server's reply. The size of `command`'s body is checked
    /// against the server's advertised limits before anything is written to the socket.
    pub(crate) async fn send_command(&mut self, command: Command) -> Result<RawCommandResponse> {
        let (doc, _more_to_come) = self.send_command_inner(command).await?;
        Ok(RawCommandResponse::new(doc))
    }

    /// Sends `command` without waiting for (or expecting) a reply, for unacknowledged writes
    /// (`writeConcern: { w: 0 }`). Per §4.A's `dispatchOneWay`, this still enforces the size
    /// checks a normal round trip would, so an oversized unacknowledged write fails the same way
    /// before anything reaches the socket.
    pub(crate) async fn dispatch_one_way(&mut self, command: Command) -> Result<()> {
        if self.closed {
            return Err(ErrorKind::InvalidResponse {
                message: "attempted to use a closed connection".to_string(),
            }
            .into());
        }

        let body_len = bson_util::to_document_bytes(&command.body)?.len();
        self.check_max_message_size(body_len)?;

        let request_id = wire::next_request_id();
        let message = Message::with_command(command, Some(request_id));

        let stream = self
            .stream
            .as_mut()
            .expect("stream only ever taken on drop");

        if let Err(e) = message.write_to(stream).await {
            self.closed = true;
            return Err(e);
        }

        Ok(())
    }

    /// Sends `command` (expected to set `exhaust_allowed`) and returns both the reply and
    /// whether the server set `moreToCome` on it, i.e. whether this connection is now in the
    /// awaitable-`hello` streaming mode that [`Connection::read_streamed_reply`] continues.
    pub(crate) async fn send_awaitable_hello(
        &mut self,
        command: Command,
    ) -> Result<(RawCommandResponse, bool)> {
        let (doc, more_to_come) = self.send_command_inner(command).await?;
        Ok((RawCommandResponse::new(doc), more_to_come))
    }

    async fn send_command_inner(&mut self, command: Command) -> Result<(Document, bool)> {
        if self.closed {
            return Err(ErrorKind::InvalidResponse {
                message: "attempted to use a closed connection".to_string(),
            }
            .into());
        }

        let body_len = bson_util::to_document_bytes(&command.body)?.len();
        self.check_max_message_size(body_len)?;

        let request_id = wire::next_request_id();
        let use_legacy_query = self.stream_description.is_none() && !command.exhaust_allowed;

        let stream = self
            .stream
            .as_mut()
            .expect("stream only ever taken on drop");

        let (doc, more_to_come) = if use_legacy_query {
            let mut query = wire::Query::with_document(&command.target_db, command.body.clone());
            query.request_id = Some(request_id);

            if let Err(e) = query.write_to(stream).await {
                self.closed = true;
                return Err(e);
            }

            let legacy_reply = match wire::Reply::read_from(stream).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.closed = true;
                    return Err(e);
                }
            };

            if legacy_reply.response_to != request_id {
                self.closed = true;
                return Err(unexpected_response(legacy_reply.response_to, request_id));
            }

            let doc = legacy_reply.documents.into_iter().next().ok_or_else(|| {
                ErrorKind::InvalidResponse {
                    message: "no response received from server".to_string(),
                }
            })?;
            (doc, false)
        } else {
            let message = Message::with_command(command, Some(request_id));

            if let Err(e) = message.write_to(stream).await {
                self.closed = true;
                return Err(e);
            }

            let reply = match Message::read_from(stream).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.closed = true;
                    return Err(e);
                }
            };

            if reply.response_to != request_id {
                self.closed = true;
                return Err(unexpected_response(reply.response_to, request_id));
            }

            let more_to_come = reply.more_to_come();
            (reply.single_document_response()?, more_to_come)
        };

        Ok((doc, more_to_come))
    }

    /// Reads one more streamed reply on a connection left open via `moreToCome` (the Push
    /// Monitor protocol). Returns `None` once the server stops streaming.
    pub(crate) async fn read_streamed_reply(&mut self) -> Result<Option<RawCommandResponse>> {
        let stream = self
            .stream
            .as_mut()
            .expect("stream only ever taken on drop");

        let reply = match Message::read_from(stream).await {
            Ok(reply) => reply,
            Err(e) => {
                self.closed = true;
                return Err(e);
            }
        };

        let more_to_come = reply.more_to_come();
        let doc = reply.single_document_response()?;

        if !more_to_come {
            self.closed = true;
        }

        Ok(Some(RawCommandResponse::new(doc)))
    }
}

fn unexpected_response(response_to: i32, expected: i32) -> crate::error::Error {
    ErrorKind::InvalidResponse {
        message: format!(
            "Got response for request ID {} but expected {}",
            response_to, expected
        ),
    }
    .into()
}

/// Builds the event published just before a connection's socket is dropped, so pool/Drop code
/// doesn't have to repeat the field list.
pub(crate) fn closed_event(
    address: ServerAddress,
    connection_id: u32,
    reason: ConnectionClosedReason,
) -> ConnectionClosedEvent {
    ConnectionClosedEvent {
        address,
        connection_id,
        reason,
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(manager) = self.pool_manager.take() {
            manager.check_in(DroppedConnectionState {
                id: self.id,
                address: self.address.clone(),
                generation: self.generation,
                pinned: self.pinned,
                interrupted: self.interrupted,
                closed: self.closed,
                stream: self.stream.take(),
            });
        }
    }
}

/// The pieces of a [`Connection`] needed to finish checking it in, carried out of `Drop`
/// (which can't `.await`) into the pool worker's message loop.
pub(crate) struct DroppedConnectionState {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: ConnectionGeneration,
    pub(crate) pinned: bool,
    pub(crate) interrupted: bool,
    pub(crate) closed: bool,
    pub(crate) stream: Option<Box<dyn AsyncStream>>,
}

impl DroppedConnectionState {
    /// Reconstructs a usable `Connection` from a previously checked-in state (used by the pool
    /// worker when handing a connection back out without re-establishing it).
    pub(crate) fn into_connection(self, pool_manager: PoolManager) -> Option<Connection> {
        let stream = self.stream?;
        Some(Connection {
            id: self.id,
            address: self.address,
            generation: self.generation,
            stream_description: None,
            pinned: self.pinned,
            interrupted: false,
            closed: false,
            stream: Some(stream),
            pool_manager: Some(pool_manager),
            available_since: None,
        })
    }
}
