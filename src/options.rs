//! Types used to specify options to the connection pool, server selection, and handshake.
//!
//! Most of the options structs in this module use the [`typed-builder`](https://crates.io/crates/typed-builder)
//! crate to derive a type-safe builder API on them.

use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, ErrorKind, Result},
    event::{cmap::CmapEventHandler, sdam::SdamEventHandler},
    selection_criteria::SelectionCriteria,
};

const DEFAULT_PORT: u16 = 27017;

/// The address of a MongoDB server, stored in canonical lowercased form.
#[derive(Clone, Debug, Eq, Serialize)]
#[non_exhaustive]
pub struct ServerAddress {
    /// The hostname or IP address where the MongoDB server can be found.
    pub host: String,

    /// The TCP port that the MongoDB server is listening on. The default is 27017.
    pub port: Option<u16>,
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port.unwrap_or(DEFAULT_PORT) == other.port.unwrap_or(DEFAULT_PORT)
    }
}

impl Hash for ServerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.unwrap_or(DEFAULT_PORT).hash(state);
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| <D::Error as serde::de::Error>::custom(format!("{}", e)))
    }
}

impl ServerAddress {
    /// Parses a `host[:port]` string into a `ServerAddress`, lowercasing the host.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');

        let hostname = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("invalid server address: \"{}\"", address),
                }
                .into())
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| ErrorKind::InvalidArgument {
                    message: format!("port must be a valid 16-bit unsigned integer, got: {}", part),
                })?;
                if port == 0 {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!("invalid server address: \"{}\"; port must be non-zero", address),
                    }
                    .into());
                }
                if parts.next().is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!("address \"{}\" contains more than one unescaped ':'", address),
                    }
                    .into());
                }
                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress {
            host: hostname.to_lowercase(),
            port,
        })
    }

    pub(crate) fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

impl Display for ServerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port.unwrap_or(DEFAULT_PORT))
    }
}

/// The server API version to declare in the handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ServerApiVersion {
    /// API version 1.
    #[serde(rename = "1")]
    V1,
}

impl Display for ServerApiVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "1"),
        }
    }
}

/// Options used to declare a stable server API.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct ServerApi {
    /// The declared API version.
    #[serde(rename = "apiVersion")]
    pub version: ServerApiVersion,

    /// Whether the server should reject commands not part of the declared API version.
    #[builder(default)]
    #[serde(rename = "apiStrict")]
    pub strict: Option<bool>,

    /// Whether the server should return errors for deprecated-from-API-version functionality.
    #[builder(default)]
    #[serde(rename = "apiDeprecationErrors")]
    pub deprecation_errors: Option<bool>,
}

/// The SASL mechanism used to authenticate a connection. Selection among these (when not
/// explicitly configured) happens during the handshake (§4.A); the cryptographic exchange itself
/// is reached through the crate's `Authenticator` trait seam and is not implemented here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// `SCRAM-SHA-1`.
    #[serde(rename = "SCRAM-SHA-1")]
    ScramSha1,

    /// `SCRAM-SHA-256`.
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,

    /// The legacy `MONGODB-CR` mechanism, only negotiated against servers with
    /// `maxWireVersion <= 2`.
    #[serde(rename = "MONGODB-CR")]
    MongoDbCr,
}

impl Display for AuthMechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScramSha1 => write!(f, "SCRAM-SHA-1"),
            Self::ScramSha256 => write!(f, "SCRAM-SHA-256"),
            Self::MongoDbCr => write!(f, "MONGODB-CR"),
        }
    }
}

/// The credential used to authenticate every connection a pool establishes.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with.
    pub username: Option<String>,

    /// The password to authenticate with.
    pub password: Option<String>,

    /// The database to authenticate against. Defaults to `admin` if not supplied.
    pub source: Option<String>,

    /// The mechanism to use. If omitted, one is negotiated per §4.A during the handshake.
    pub mechanism: Option<AuthMechanism>,
}

impl Credential {
    pub(crate) fn source_or_default(&self) -> &str {
        self.source.as_deref().unwrap_or("admin")
    }
}

/// Options controlling the lifecycle and sizing of a [`ConnectionPool`](crate::cmap::ConnectionPool).
#[derive(Clone, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ConnectionPoolOptions {
    /// The minimum number of connections the pool tries to maintain.
    pub min_pool_size: Option<u32>,

    /// The maximum number of connections the pool will hand out simultaneously. `0` (or `None`)
    /// means unlimited.
    pub max_pool_size: Option<u32>,

    /// How long a connection may sit idle in the pool before it is closed.
    pub max_idle_time: Option<Duration>,

    /// How long a check-out request waits for a connection before failing.
    #[builder(default = Some(Duration::from_millis(10_000)))]
    pub wait_queue_timeout: Option<Duration>,

    /// The timeout used when establishing the TCP connection itself.
    pub connect_timeout: Option<Duration>,

    /// The timeout used for each socket read/write.
    pub socket_timeout: Option<Duration>,

    /// The application name reported during the handshake.
    pub app_name: Option<String>,

    /// The maximum number of connections this pool will establish concurrently.
    #[builder(default = Some(2))]
    pub max_connecting: Option<u32>,

    /// Whether this pool's connections go through a load balancer, in which case the pool stays
    /// `Ready` across a `clear()` instead of pausing.
    pub load_balanced: Option<bool>,

    /// The credential to authenticate every connection in this pool with.
    pub credential: Option<Credential>,

    /// Handler invoked for CMAP lifecycle events.
    pub cmap_event_handler: Option<Arc<dyn CmapEventHandler>>,
}

impl ConnectionPoolOptions {
    pub(crate) fn max_pool_size_or_unlimited(&self) -> u32 {
        self.max_pool_size.unwrap_or(100)
    }

    pub(crate) fn max_connecting_or_default(&self) -> u32 {
        self.max_connecting.unwrap_or(2)
    }
}

impl std::fmt::Debug for ConnectionPoolOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolOptions")
            .field("min_pool_size", &self.min_pool_size)
            .field("max_pool_size", &self.max_pool_size)
            .field("max_idle_time", &self.max_idle_time)
            .field("wait_queue_timeout", &self.wait_queue_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("socket_timeout", &self.socket_timeout)
            .field("app_name", &self.app_name)
            .field("max_connecting", &self.max_connecting)
            .field("load_balanced", &self.load_balanced)
            .finish()
    }
}

/// Options governing server monitoring and selection, shared by every server in a topology.
#[derive(Clone, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ServerSelectionOptions {
    /// How often a server is actively probed with `hello`.
    #[builder(default = Duration::from_millis(10_000))]
    pub heartbeat_freq: Duration,

    /// How long server selection waits for a matching server before failing.
    #[builder(default = Duration::from_millis(30_000))]
    pub server_selection_timeout: Duration,

    /// The RTT window, relative to the fastest candidate, within which servers are considered
    /// equally preferable.
    #[builder(default = Duration::from_millis(15))]
    pub local_threshold: Duration,

    /// Handler invoked for SDAM lifecycle events.
    pub sdam_event_handler: Option<Arc<dyn SdamEventHandler>>,
}

/// Top-level options gluing pool, selection, and handshake configuration together; exists
/// primarily for tests and for downstream crates assembling a full runtime out of this crate's
/// components.
#[derive(Clone, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial seed list of servers.
    pub hosts: Vec<ServerAddress>,

    /// The application name reported during the handshake.
    pub app_name: Option<String>,

    /// The declared stable API, if any.
    pub server_api: Option<ServerApi>,

    /// Whether this client connects through a load balancer.
    pub load_balanced: Option<bool>,

    /// The default read preference / selection criteria for operations.
    pub selection_criteria: Option<SelectionCriteria>,

    /// Connection pool options.
    pub pool_options: ConnectionPoolOptions,

    /// Server selection / monitoring options.
    pub server_selection_options: ServerSelectionOptions,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let addr = ServerAddress::parse("Example.COM:27018").unwrap();
        assert_eq!(addr.host, "example.com");
        assert_eq!(addr.port, Some(27018));
    }

    #[test]
    fn parses_host_only() {
        let addr = ServerAddress::parse("localhost").unwrap();
        assert_eq!(addr.port, None);
        assert_eq!(addr.port_or_default(), 27017);
    }

    #[test]
    fn rejects_zero_port() {
        assert!(ServerAddress::parse("localhost:0").is_err());
    }

    #[test]
    fn rejects_malformed_address() {
        assert!(ServerAddress::parse("a:b:c").is_err());
    }

    #[test]
    fn equality_ignores_explicit_default_port() {
        let a = ServerAddress::parse("localhost").unwrap();
        let b = ServerAddress::parse("localhost:27017").unwrap();
        assert_eq!(a, b);
    }
}
