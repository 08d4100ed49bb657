//! Per-server state, as described by the Server Discovery and Monitoring spec.

use std::time::Duration;

use bson::{doc, oid::ObjectId, Bson};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, ErrorKind, Result},
    hello::{HelloCommandResponse, HelloReply},
    options::ServerAddress,
    selection_criteria::TagSet,
};

const DRIVER_MIN_DB_VERSION: &str = "4.0";
const DRIVER_MIN_WIRE_VERSION: i32 = 7;
const DRIVER_MAX_WIRE_VERSION: i32 = 25;

/// The possible types of servers that the driver can connect to.
#[derive(Debug, Deserialize, Clone, Copy, Eq, PartialEq, Serialize, Default)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica-set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A non-data-bearing node in a replica set which can participate in elections.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[serde(rename = "RSOther")]
    RsOther,

    /// A member of an uninitialized replica set, or one that has been removed from the config.
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A load-balancing proxy between the driver and the deployment.
    LoadBalancer,

    /// A server the driver hasn't communicated with yet, or can't connect to.
    #[serde(alias = "PossiblePrimary")]
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// The `topologyVersion` field included in `hello` and legacy hello responses, used to detect
/// whether a server has a newer view of its own state than the one the driver is holding.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TopologyVersion {
    pub(crate) process_id: ObjectId,
    pub(crate) counter: i64,
}

impl TopologyVersion {
    pub(crate) fn is_more_recent_than(&self, existing: TopologyVersion) -> bool {
        self.process_id != existing.process_id || self.counter > existing.counter
    }
}

impl From<TopologyVersion> for Bson {
    fn from(tv: TopologyVersion) -> Self {
        Bson::Document(doc! {
            "processId": tv.process_id,
            "counter": tv.counter,
        })
    }
}

/// An immutable snapshot of the most up-to-date information known about a single server.
///
/// SDAM requires representing three distinct states for a server: never contacted, contacted
/// successfully, and contacted unsuccessfully. Rather than adding separate `Option` fields for
/// the reply and the error (which would allow both or neither to be populated simultaneously),
/// both are folded into a single `Result<Option<HelloReply>>`, which makes the invalid
/// combinations unrepresentable.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ServerDescription {
    /// The address of this server.
    pub(crate) address: ServerAddress,

    /// The type of this server.
    pub(crate) server_type: ServerType,

    /// The round-trip time of this server's most recent successful `hello` call, exponentially
    /// averaged with prior measurements.
    pub(crate) average_round_trip_time_ms: Option<f64>,

    #[serde(serialize_with = "crate::bson_util::serialize_result_error_as_string")]
    pub(crate) reply: Result<Option<HelloReply>>,
}

fn hello_command_eq(a: &HelloCommandResponse, b: &HelloCommandResponse) -> bool {
    a.server_type() == b.server_type()
        && a.min_wire_version == b.min_wire_version
        && a.max_wire_version == b.max_wire_version
        && a.me == b.me
        && a.hosts == b.hosts
        && a.passives == b.passives
        && a.arbiters == b.arbiters
        && a.tags == b.tags
        && a.set_name == b.set_name
        && a.set_version == b.set_version
        && a.election_id == b.election_id
        && a.primary == b.primary
        && a.logical_session_timeout_minutes == b.logical_session_timeout_minutes
        && a.topology_version == b.topology_version
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (self.reply.as_ref(), other.reply.as_ref()) {
            (Ok(self_reply), Ok(other_reply)) => {
                let a = self_reply.as_ref().map(|r| &r.command_response);
                let b = other_reply.as_ref().map(|r| &r.command_response);

                match (a, b) {
                    (Some(a), Some(b)) => hello_command_eq(a, b),
                    (None, None) => true,
                    _ => false,
                }
            }
            (Err(self_err), Err(other_err)) => {
                match (self_err.kind.as_ref(), other_err.kind.as_ref()) {
                    (ErrorKind::Command(a), ErrorKind::Command(b)) => a.code == b.code,
                    _ => self_err.to_string() == other_err.to_string(),
                }
            }
            _ => false,
        }
    }
}

impl ServerDescription {
    /// Creates a new, as-yet-uncontacted description for `address`.
    pub(crate) fn new(address: ServerAddress) -> Self {
        Self {
            address: ServerAddress {
                host: address.host.to_lowercase(),
                port: address.port,
            },
            server_type: ServerType::default(),
            average_round_trip_time_ms: None,
            reply: Ok(None),
        }
    }

    /// Creates a description from a successful `hello` reply, folding the new round-trip time
    /// into `existing_rtt_ms` via the SDAM exponentially-weighted moving average (`alpha =
    /// 0.2`).
    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        round_trip_time_ms: f64,
        existing_rtt_ms: Option<f64>,
    ) -> Self {
        let mut description = Self::new(address);
        description.average_round_trip_time_ms = Some(match existing_rtt_ms {
            Some(existing) => 0.2 * round_trip_time_ms + 0.8 * existing,
            None => round_trip_time_ms,
        });

        description.server_type = reply.command_response.server_type();

        if let Some(ref mut hosts) = reply.command_response.hosts {
            for host in hosts.iter_mut() {
                *host = host.to_lowercase();
            }
        }
        if let Some(ref mut passives) = reply.command_response.passives {
            for host in passives.iter_mut() {
                *host = host.to_lowercase();
            }
        }
        if let Some(ref mut arbiters) = reply.command_response.arbiters {
            for host in arbiters.iter_mut() {
                *host = host.to_lowercase();
            }
        }
        if let Some(ref mut me) = reply.command_response.me {
            *me = me.to_lowercase();
        }

        description.reply = Ok(Some(reply));
        description
    }

    /// Creates a description recording that the most recent attempt to reach this server
    /// failed with `error`.
    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        let mut description = Self::new(address);
        description.average_round_trip_time_ms = None;
        description.reply = Err(error);
        description
    }

    /// Whether this server is "available", as defined by the server selection spec.
    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        if let Ok(Some(ref reply)) = self.reply {
            let min_wire_version = reply.command_response.min_wire_version.unwrap_or(0);

            if min_wire_version > DRIVER_MAX_WIRE_VERSION {
                return Some(format!(
                    "Server at {} requires wire version {}, but this driver only supports up to \
                     {}",
                    self.address, min_wire_version, DRIVER_MAX_WIRE_VERSION,
                ));
            }

            let max_wire_version = reply.command_response.max_wire_version.unwrap_or(0);

            if max_wire_version < DRIVER_MIN_WIRE_VERSION {
                return Some(format!(
                    "Server at {} reports wire version {}, but this driver requires at least {} \
                     (MongoDB {}).",
                    self.address, max_wire_version, DRIVER_MIN_WIRE_VERSION, DRIVER_MIN_DB_VERSION,
                ));
            }
        }

        None
    }

    pub(crate) fn set_name(&self) -> Result<Option<String>> {
        Ok(self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_name.clone()))
    }

    pub(crate) fn known_hosts(&self) -> Result<Vec<String>> {
        let reply = self.reply.as_ref().map_err(Clone::clone)?;

        let hosts = reply.as_ref().into_iter().flat_map(|reply| {
            let hosts = reply.command_response.hosts.as_ref();
            let passives = reply.command_response.passives.as_ref();
            let arbiters = reply.command_response.arbiters.as_ref();

            hosts
                .into_iter()
                .flatten()
                .chain(passives.into_iter().flatten())
                .chain(arbiters.into_iter().flatten())
                .cloned()
        });

        Ok(hosts.collect())
    }

    pub(crate) fn invalid_me(&self) -> Result<bool> {
        if let Some(ref reply) = self.reply.as_ref().map_err(Clone::clone)? {
            if let Some(ref me) = reply.command_response.me {
                return Ok(&self.address.to_string() != me);
            }
        }

        Ok(false)
    }

    pub(crate) fn set_version(&self) -> Result<Option<i32>> {
        Ok(self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_version))
    }

    pub(crate) fn election_id(&self) -> Result<Option<ObjectId>> {
        Ok(self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.election_id))
    }

    pub(crate) fn max_wire_version(&self) -> Result<Option<i32>> {
        Ok(self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.max_wire_version))
    }

    pub(crate) fn last_write_date(&self) -> Result<Option<bson::DateTime>> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply
                .command_response
                .last_write
                .as_ref()
                .map(|write| write.last_write_date)),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn logical_session_timeout(&self) -> Result<Option<Duration>> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply
                .command_response
                .logical_session_timeout_minutes
                .map(|timeout| Duration::from_secs(timeout as u64 * 60))),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.reply {
            Ok(None) => None,
            Ok(Some(ref reply)) => reply.command_response.topology_version,
            Err(ref e) => e.topology_version(),
        }
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let reply = match self.reply.as_ref() {
            Ok(Some(ref reply)) => reply,
            _ => return false,
        };

        let server_tags = match reply.command_response.tags {
            Some(ref tags) => tags,
            None => return false,
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn address() -> ServerAddress {
        ServerAddress::parse("localhost:27017").unwrap()
    }

    #[test]
    fn new_server_is_unknown_and_unavailable() {
        let desc = ServerDescription::new(address());
        assert_eq!(desc.server_type, ServerType::Unknown);
        assert!(!desc.is_available());
    }

    #[test]
    fn rtt_averaging_applies_ewma() {
        let reply = HelloReply {
            server_address: address(),
            command_response: HelloCommandResponse::default(),
        };

        let first = ServerDescription::new_from_hello_reply(address(), reply.clone(), 100.0, None);
        assert_eq!(first.average_round_trip_time_ms, Some(100.0));

        let second = ServerDescription::new_from_hello_reply(address(), reply, 0.0, Some(100.0));
        assert_eq!(second.average_round_trip_time_ms, Some(80.0));
    }

    #[test]
    fn error_description_has_no_rtt() {
        let err = Error::internal("boom".to_string());
        let desc = ServerDescription::new_from_error(address(), err);
        assert!(desc.average_round_trip_time_ms.is_none());
        assert!(desc.reply.is_err());
    }

    #[test]
    fn hostnames_are_normalized_to_lowercase() {
        let mut response = HelloCommandResponse::default();
        response.hosts = Some(vec!["Other.Example.COM:27018".to_string()]);
        let reply = HelloReply {
            server_address: address(),
            command_response: response,
        };

        let desc = ServerDescription::new_from_hello_reply(address(), reply, 1.0, None);
        assert_eq!(
            desc.known_hosts().unwrap(),
            vec!["other.example.com:27018".to_string()]
        );
    }
}
