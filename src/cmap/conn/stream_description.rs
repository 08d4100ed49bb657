//! A connection's view of the server it's talking to, derived from the handshake's `hello`
//! reply. Distinct from [`crate::sdam::description::server::ServerDescription`]: this is
//! per-connection and only carries the fields operations need to stay within the server's
//! advertised limits.

use crate::{hello::HelloReply, sdam::description::server::ServerType};

/// The maximum size of a single BSON document, used when the server hasn't reported one yet
/// (i.e. before the handshake completes).
pub(crate) const DEFAULT_MAX_BSON_OBJECT_SIZE: i64 = 16 * 1024 * 1024;
/// The maximum size of an entire wire protocol message, used before the handshake completes.
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;
/// The default maximum number of documents this crate will allow in a single write batch when
/// the server hasn't advertised its own limit.
pub(crate) const DEFAULT_MAX_WRITE_BATCH_SIZE: i64 = 100_000;

#[derive(Debug, Clone)]
pub(crate) struct StreamDescription {
    pub(crate) server_type: ServerType,
    pub(crate) max_bson_object_size: i64,
    pub(crate) max_message_size_bytes: i32,
    pub(crate) max_write_batch_size: i64,
    pub(crate) max_wire_version: Option<i32>,
    pub(crate) min_wire_version: Option<i32>,
    pub(crate) compressors: Vec<String>,
    pub(crate) service_id: Option<bson::oid::ObjectId>,
}

impl StreamDescription {
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;

        Self {
            server_type: response.server_type(),
            max_bson_object_size: response.max_bson_object_size,
            max_message_size_bytes: response.max_message_size_bytes,
            max_write_batch_size: response
                .max_write_batch_size
                .unwrap_or(DEFAULT_MAX_WRITE_BATCH_SIZE),
            max_wire_version: response.max_wire_version,
            min_wire_version: response.min_wire_version,
            compressors: response.compressors.clone().unwrap_or_default(),
            service_id: response.service_id,
        }
    }

    /// Whether the server at the other end of this connection understands write commands
    /// (`insert`/`update`/`delete`) rather than requiring legacy OP_QUERY-based writes.
    pub(crate) fn supports_write_commands(&self) -> bool {
        self.max_wire_version.unwrap_or(0) >= 2
    }
}

impl Default for StreamDescription {
    fn default() -> Self {
        Self {
            server_type: ServerType::Unknown,
            max_bson_object_size: DEFAULT_MAX_BSON_OBJECT_SIZE,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE_BYTES,
            max_write_batch_size: DEFAULT_MAX_WRITE_BATCH_SIZE,
            max_wire_version: None,
            min_wire_version: None,
            compressors: Vec::new(),
            service_id: None,
        }
    }
}
