//! Contains the `Error` and `Result` types used throughout this crate.

use std::{
    collections::HashSet,
    fmt::{self, Debug},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::options::ServerAddress;

const NOTWRITABLEPRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];
const SHUTTING_DOWN_CODES: [i32; 2] = [11600, 91];
const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const RETRYABLE_WRITE_CODES: [i32; 12] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262,
];

/// Retryable write error label. A higher layer may add this label to an error that is
/// write-retryable; this crate only exposes the label constant and the classification helpers,
/// it does not perform retries itself.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Transient transaction error label.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// The result type for all fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in this crate. The inner [`ErrorKind`] is boxed to keep `Result<T>`
/// small, since some variants embed whole documents or nested errors.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
    pub(crate) wire_version: Option<i32>,
    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let mut labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        if let Some(wc) = kind.get_write_concern_error() {
            labels.extend(wc.labels.clone());
        }
        Self {
            kind: Box::new(kind),
            labels,
            wire_version: None,
            source: None,
        }
    }

    /// Creates the error returned when an operation cannot proceed because the pool backing the
    /// server the operation was routed to has been cleared by a concurrent failure.
    pub fn pool_cleared_error(address: &ServerAddress, cause: &Error) -> Self {
        ErrorKind::ConnectionPoolCleared {
            message: format!(
                "Connection pool for {} cleared because another operation failed with: {}",
                address, cause
            ),
        }
        .into()
    }

    /// Creates an `AuthenticationError` for the given mechanism with the provided reason.
    pub fn authentication_error(mechanism_name: &str, reason: &str) -> Self {
        ErrorKind::Authentication {
            message: format!("{} failure: {}", mechanism_name, reason),
        }
        .into()
    }

    pub(crate) fn invalid_authentication_response(mechanism_name: &str) -> Error {
        Error::authentication_error(mechanism_name, "invalid server response")
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    /// Constructs a generic network timeout error.
    pub fn network_timeout() -> Error {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    /// Constructs an `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn server_selection_error(message: impl Into<String>) -> Error {
        ErrorKind::ServerSelection {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn pool_closed_error(address: &ServerAddress) -> Error {
        ErrorKind::PoolClosed {
            address: address.clone(),
        }
        .into()
    }

    pub(crate) fn pool_paused_error(address: &ServerAddress) -> Error {
        ErrorKind::PoolPaused {
            address: address.clone(),
        }
        .into()
    }

    pub(crate) fn wait_queue_timeout_error(address: &ServerAddress) -> Error {
        ErrorKind::WaitQueueTimeout {
            address: address.clone(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    /// Whether this error is a "not writable primary" / "node is recovering" style state-change
    /// error, which, per SDAM, should trigger a pool clear and mark the originating server
    /// Unknown.
    pub fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_notwritableprimary()
    }

    fn sdam_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(ref err) => Some(err.code),
            ErrorKind::Write(WriteFailure::WriteConcernError(ref err)) => Some(err.code),
            _ => None,
        }
    }

    pub(crate) fn is_recovering(&self) -> bool {
        match self.sdam_code() {
            Some(code) => RECOVERING_CODES.contains(&code),
            None => {
                matches!(self.kind.as_ref(), ErrorKind::Command(ref err) if err.message.contains("not master or secondary"))
            }
        }
    }

    pub(crate) fn is_notwritableprimary(&self) -> bool {
        match self.sdam_code() {
            Some(code) => NOTWRITABLEPRIMARY_CODES.contains(&code),
            None => {
                matches!(self.kind.as_ref(), ErrorKind::Command(ref err) if err.message.contains("not master"))
            }
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        matches!(self.sdam_code(), Some(code) if SHUTTING_DOWN_CODES.contains(&code))
    }

    /// Whether this error is an authentication failure.
    pub fn is_auth_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Authentication { .. })
    }

    /// Whether this error is a server-selection timeout/failure.
    pub fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ServerSelection { .. })
    }

    /// Whether a "RetryableWriteError" label should be added to this error, following the same
    /// wire-version-sensitive rule the reference driver uses: above wire version 8 only network
    /// errors qualify, otherwise certain server codes qualify as well.
    pub fn should_add_retryable_write_label(&self, max_wire_version: i32) -> bool {
        if max_wire_version > 8 {
            return self.is_network_error();
        }
        if self.is_network_error() {
            return true;
        }
        match self.sdam_code() {
            Some(code) => RETRYABLE_WRITE_CODES.contains(&code),
            None => false,
        }
    }

    /// Returns the labels attached to this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels().contains(label.as_ref())
    }

    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        self.labels.insert(label.as_ref().to_string());
    }

    pub(crate) fn with_source(mut self, source: Error) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Whether this error is a non-timeout IO error or a pool-cleared error — the driver-visible
    /// definition of "network error".
    pub fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    pub(crate) fn is_non_timeout_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() != std::io::ErrorKind::TimedOut)
    }

    /// Extracts the `topologyVersion` embedded in a command error, if any, so that SDAM can
    /// determine whether a state-change error actually represents newer information than what
    /// is already known about the originating server.
    pub(crate) fn topology_version(
        &self,
    ) -> Option<crate::sdam::description::server::TopologyVersion> {
        match self.kind.as_ref() {
            ErrorKind::Command(c) => c.topology_version,
            _ => None,
        }
    }

    /// Whether this error came from the server itself, as opposed to locally (network,
    /// client-side validation, etc).
    pub fn is_server_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Authentication { .. } | ErrorKind::BulkWrite(_) | ErrorKind::Command(_) | ErrorKind::Write(_)
        )
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, None::<Option<String>>)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(err)).into()
    }
}

impl From<bson::de::Error> for Error {
    fn from(err: bson::de::Error) -> Self {
        ErrorKind::BsonDeserialization(err).into()
    }
}

impl From<bson::ser::Error> for Error {
    fn from(err: bson::ser::Error) -> Self {
        ErrorKind::BsonSerialization(err).into()
    }
}

/// The type of error that occurred.
///
/// Note: not all of the boundary error names listed in the external interface are top-level
/// variants here; several (`PoolClosed`, `ConnectionCheckOutTimeout`, `MaxMessageSize`,
/// `MaxBSONSize`) have dedicated variants while others (`AuthUnauthorized`, `SocketError`,
/// `SocketTimeout`) are represented via existing variants plus the `is_*` predicate methods
/// above, matching how the reference driver folds related conditions into a single variant with
/// classification helpers rather than one variant per taxonomy entry.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// An error occurred while authenticating a connection.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(bson::ser::Error),

    /// An error occurred when trying to execute a write operation consisting of multiple writes.
    #[error("An error occurred when trying to execute a write operation: {0:?}")]
    BulkWrite(BulkWriteFailure),

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// An error occurred during DNS resolution. This crate does not perform DNS resolution
    /// itself; the variant exists so a caller-supplied resolver has somewhere to report into.
    #[error("An error occurred during DNS resolution: {message}")]
    #[non_exhaustive]
    DnsResolve { message: String },

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The connection pool for a server was cleared during operation execution due to a
    /// concurrent error, causing the operation to fail.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String },

    /// An operation was attempted against a pool that has been closed.
    #[error("Attempted to check out a connection from closed connection pool for {address}")]
    #[non_exhaustive]
    PoolClosed { address: ServerAddress },

    /// An operation was attempted against a pool that is currently paused.
    #[error("Attempted to check out a connection from paused connection pool for {address}")]
    #[non_exhaustive]
    PoolPaused { address: ServerAddress },

    /// Timed out while waiting for a connection to become available.
    #[error("Timed out while checking out a connection from connection pool for {address}")]
    #[non_exhaustive]
    WaitQueueTimeout { address: ServerAddress },

    /// The server returned an invalid reply to a database operation.
    #[error("The server returned an invalid reply to a database operation: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// No server could be selected that satisfied the given criteria within the allotted time.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// A serialized document, or the overall message containing it, exceeded a server-advertised
    /// size limit; this is raised before any socket write occurs.
    #[error("{message}")]
    #[non_exhaustive]
    DocumentTooLarge { message: String },

    /// An error occurred when trying to execute a write operation.
    #[error("An error occurred when trying to execute a write operation: {0:?}")]
    Write(WriteFailure),

    /// The server does not support the requested operation given its wire version.
    #[error("The server does not support a database operation: {message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    /// The application name provided was too long.
    #[error("Application name must be at most 128 bytes, got {len}")]
    InvalidApplicationName { len: usize },

    /// A write requiring a primary was attempted against a non-primary server.
    #[error("Not writable primary")]
    NotWritablePrimary,
}

impl ErrorKind {
    fn get_write_concern_error(&self) -> Option<&WriteConcernError> {
        match self {
            ErrorKind::BulkWrite(BulkWriteFailure {
                write_concern_error,
                ..
            }) => write_concern_error.as_ref(),
            ErrorKind::Write(WriteFailure::WriteConcernError(err)) => Some(err),
            _ => None,
        }
    }
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// Used to detect whether the server that returned this error has a newer view of its own
    /// state than the one most recently recorded for it, for use with the awaitable `hello`
    /// protocol.
    #[serde(default)]
    pub(crate) topology_version: Option<crate::sdam::description::server::TopologyVersion>,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// A write concern related error.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// Labels categorizing the error.
    #[serde(rename = "errorLabels", default)]
    pub(crate) labels: Vec<String>,
}

/// A write error that is not the result of a write concern failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct WriteError {
    /// Identifies the type of write error.
    pub code: i32,

    /// The name associated with the error code, if the server returned one.
    #[serde(rename = "codeName", default)]
    pub code_name: Option<String>,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,
}

/// A single write error from a bulk write, tagged with the index of the document it applies to.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct BulkWriteError {
    /// Index into the list of operations that this error corresponds to.
    #[serde(default)]
    pub index: usize,

    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code, if the server returned one.
    #[serde(rename = "codeName", default)]
    pub code_name: Option<String>,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,
}

/// The aggregated result of a bulk write that encountered at least one failure.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct BulkWriteFailure {
    /// The per-document errors that occurred, if any were not write-concern related.
    pub write_errors: Option<Vec<BulkWriteError>>,

    /// The write concern error that occurred, if any.
    pub write_concern_error: Option<WriteConcernError>,
}

impl BulkWriteFailure {
    pub(crate) fn new() -> Self {
        Default::default()
    }
}

/// An error that occurred when trying to execute a single write operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum WriteFailure {
    /// An error that occurred due to not being able to satisfy a write concern.
    WriteConcernError(WriteConcernError),

    /// An error that occurred during a write operation that wasn't due to being unable to
    /// satisfy a write concern.
    WriteError(WriteError),
}

impl WriteFailure {
    pub(crate) fn from_bulk_failure(bulk: BulkWriteFailure) -> Result<Self> {
        if let Some(bulk_write_error) = bulk.write_errors.and_then(|es| es.into_iter().next()) {
            Ok(WriteFailure::WriteError(WriteError {
                code: bulk_write_error.code,
                code_name: bulk_write_error.code_name,
                message: bulk_write_error.message,
            }))
        } else if let Some(wc_error) = bulk.write_concern_error {
            Ok(WriteFailure::WriteConcernError(wc_error))
        } else {
            Err(ErrorKind::InvalidResponse {
                message: "error missing write errors and write concern errors".to_string(),
            }
            .into())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn network_errors_are_classified_correctly() {
        let err: Error = ErrorKind::Io(Arc::new(std::io::ErrorKind::ConnectionReset.into())).into();
        assert!(err.is_network_error());
        assert!(err.is_non_timeout_network_error());
    }

    #[test]
    fn retryable_write_label_above_wire_8_requires_network_error() {
        let err: Error = ErrorKind::Command(CommandError {
            code: 11600,
            code_name: "InterruptedAtShutdown".to_string(),
            message: "shutting down".to_string(),
            topology_version: None,
        })
        .into();
        assert!(!err.should_add_retryable_write_label(9));
        assert!(err.should_add_retryable_write_label(6));
    }

    #[test]
    fn labels_round_trip() {
        let mut err: Error = ErrorKind::InvalidArgument {
            message: "bad".to_string(),
        }
        .into();
        assert!(!err.contains_label(RETRYABLE_WRITE_ERROR));
        err.add_label(RETRYABLE_WRITE_ERROR);
        assert!(err.contains_label(RETRYABLE_WRITE_ERROR));
    }
}
