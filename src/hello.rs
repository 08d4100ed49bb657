//! Construction and execution of the `hello`/legacy `hello` handshake command used to discover
//! and monitor servers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    cmap::{Command, Connection},
    error::Result,
    options::{ServerAddress, ServerApi},
    sdam::description::server::{ServerType, TopologyVersion},
    selection_criteria::TagSet,
};

/// The legacy version of the `hello` command which was deprecated in MongoDB 5.0. To limit
/// usages of the legacy name in the codebase, this constant should be used wherever possible.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

/// Options used to request the server hold the connection open (`moreToCome`) until the
/// topology version changes, rather than replying immediately.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AwaitableHelloOptions {
    pub(crate) topology_version: TopologyVersion,
    pub(crate) max_await_time: Duration,
}

/// Construct a `hello` or legacy `hello` command, depending on the circumstances.
///
/// If an API version is provided or `load_balanced` is true, `hello` will be used. If the
/// server previously indicated `helloOk: true`, `hello` will also be used. Otherwise, legacy
/// hello is used, and if it's unknown whether the server supports `hello`, the command also
/// contains `helloOk: true` so that the server can inform us for next time.
pub(crate) fn hello_command(
    server_api: Option<&ServerApi>,
    load_balanced: Option<bool>,
    hello_ok: Option<bool>,
    awaitable_options: Option<AwaitableHelloOptions>,
) -> Command {
    let (mut body, command_name) = if server_api.is_some()
        || matches!(load_balanced, Some(true))
        || matches!(hello_ok, Some(true))
    {
        (bson::doc! { "hello": 1 }, "hello")
    } else {
        let mut body = bson::doc! { LEGACY_HELLO_COMMAND_NAME: 1 };
        if hello_ok.is_none() {
            body.insert("helloOk", true);
        }
        (body, LEGACY_HELLO_COMMAND_NAME)
    };

    if let Some(opts) = awaitable_options {
        body.insert(
            "topologyVersion",
            bson::to_bson(&opts.topology_version).unwrap_or(bson::Bson::Null),
        );
        body.insert(
            "maxAwaitTimeMS",
            opts.max_await_time.as_millis().min(i64::MAX as u128) as i64,
        );
    }

    let mut command = Command::new(command_name.to_string(), "admin".to_string(), body);
    if let Some(server_api) = server_api {
        command.set_server_api(server_api);
    }
    command.exhaust_allowed = awaitable_options.is_some();
    command
}

/// Execute a `hello` or legacy `hello` command over the given connection.
pub(crate) async fn run_hello(conn: &mut Connection, command: Command) -> Result<HelloReply> {
    let raw_response = conn.send_command(command).await?;
    let command_response: HelloCommandResponse = raw_response.body()?;

    Ok(HelloReply {
        server_address: conn.address.clone(),
        command_response,
    })
}

/// Executes an awaitable `hello` (`command` must have `exhaust_allowed` set), returning the
/// parsed reply along with whether the server left the connection in the `moreToCome` streaming
/// state. A caller that receives `true` should continue reading via
/// [`Connection::read_streamed_reply`] rather than sending a new request.
pub(crate) async fn run_awaitable_hello(
    conn: &mut Connection,
    command: Command,
) -> Result<(HelloReply, bool)> {
    let (raw_response, more_to_come) = conn.send_awaitable_hello(command).await?;
    let command_response: HelloCommandResponse = raw_response.body()?;

    Ok((
        HelloReply {
            server_address: conn.address.clone(),
            command_response,
        },
        more_to_come,
    ))
}

/// The parsed result of a `hello` call against a specific server, tagged with the address it
/// came from.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
}

/// The response to a `hello` command.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/reference/command/hello/) for
/// more details.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// mongos instance, or a standalone mongod.
    pub is_writable_primary: Option<bool>,

    /// Legacy name for `is_writable_primary`.
    #[serde(rename = "ismaster")]
    pub is_master: Option<bool>,

    /// Whether the server supports using `hello` for monitoring instead of legacy hello.
    pub hello_ok: Option<bool>,

    /// The list of all hosts in the replica set.
    pub hosts: Option<Vec<String>>,

    /// The list of all passives in the replica set.
    pub passives: Option<Vec<String>>,

    /// The list of all arbiters in the replica set.
    pub arbiters: Option<Vec<String>>,

    /// An optional message; contains the value "isdbgrid" when returned from a mongos.
    pub msg: Option<String>,

    /// The canonical address of the server that returned this response.
    pub me: Option<String>,

    #[serde(rename = "compression")]
    /// The list of compressors the server is willing to use.
    pub compressors: Option<Vec<String>>,

    /// The current replica set config version.
    pub set_version: Option<i32>,

    /// The name of the current replica set.
    pub set_name: Option<String>,

    /// Whether the server is hidden.
    pub hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub arbiter_only: Option<bool>,

    #[serde(rename = "isreplicaset")]
    /// Whether the server is an uninitialized member of a replica set.
    pub is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write operation.
    pub last_write: Option<LastWrite>,

    /// The minimum wire version the server supports.
    pub min_wire_version: Option<i32>,

    /// The maximum wire version the server supports.
    pub max_wire_version: Option<i32>,

    /// User-defined tags for a replica set member.
    pub tags: Option<TagSet>,

    /// A unique identifier for each election.
    pub election_id: Option<bson::oid::ObjectId>,

    /// The address of the current primary member of the replica set.
    pub primary: Option<String>,

    /// The maximum permitted size of a BSON object, in bytes.
    #[serde(default = "default_max_bson_object_size")]
    pub max_bson_object_size: i64,

    /// The maximum number of write operations permitted in a single write batch.
    pub max_write_batch_size: Option<i64>,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub service_id: Option<bson::oid::ObjectId>,

    /// Used to detect changes on the server that should trigger a new monitoring check, for
    /// use with the awaitable protocol.
    pub topology_version: Option<TopologyVersion>,

    /// The maximum permitted size of a wire protocol message, in bytes.
    #[serde(default = "default_max_message_size_bytes")]
    pub max_message_size_bytes: i32,

    /// The server-generated id for the connection this command was run on. Present on server
    /// versions 4.2+.
    pub connection_id: Option<i64>,

    /// The SASL mechanisms available for the user named in the handshake's `saslSupportedMechs`
    /// field, used to negotiate an authentication mechanism when none was explicitly configured.
    pub sasl_supported_mechs: Option<Vec<String>>,
}

fn default_max_bson_object_size() -> i64 {
    16 * 1024 * 1024
}

fn default_max_message_size_bytes() -> i32 {
    48 * 1024 * 1024
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

/// Optime and date information about a server's most recent write.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    pub(crate) last_write_date: bson::DateTime,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn server_type_mongos() {
        let mut resp = HelloCommandResponse::default();
        resp.msg = Some("isdbgrid".to_string());
        assert_eq!(resp.server_type(), ServerType::Mongos);
    }

    #[test]
    fn server_type_rs_primary() {
        let mut resp = HelloCommandResponse::default();
        resp.set_name = Some("rs0".to_string());
        resp.is_writable_primary = Some(true);
        assert_eq!(resp.server_type(), ServerType::RsPrimary);
    }

    #[test]
    fn server_type_rs_secondary() {
        let mut resp = HelloCommandResponse::default();
        resp.set_name = Some("rs0".to_string());
        resp.secondary = Some(true);
        assert_eq!(resp.server_type(), ServerType::RsSecondary);
    }

    #[test]
    fn server_type_standalone() {
        let resp = HelloCommandResponse::default();
        assert_eq!(resp.server_type(), ServerType::Standalone);
    }

    #[test]
    fn hello_command_uses_modern_name_with_server_api() {
        let api = ServerApi::builder()
            .version(crate::options::ServerApiVersion::V1)
            .build();
        let command = hello_command(Some(&api), None, None, None);
        assert_eq!(command.name, "hello");
    }

    #[test]
    fn hello_command_uses_legacy_name_by_default() {
        let command = hello_command(None, None, None, None);
        assert_eq!(command.name, LEGACY_HELLO_COMMAND_NAME);
        assert!(command.body.get_bool("helloOk").unwrap_or(false));
    }
}
