//! A command ready to be serialized onto a `Connection`, and the raw reply read back from one.

use bson::{Bson, Document};
use serde::de::DeserializeOwned;

use crate::{
    error::{CommandError, ErrorKind, Result},
    options::ServerApi,
    selection_criteria::ReadPreference,
};

/// A database command, identified by name and target database, along with its body.
#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    /// Whether this command may leave the connection in the `moreToCome` streaming state
    /// (set for the awaitable `hello` used by the Push Monitor).
    pub(crate) exhaust_allowed: bool,
}

impl Command {
    pub(crate) fn new(name: String, target_db: String, body: Document) -> Self {
        Self {
            name,
            target_db,
            body,
            exhaust_allowed: false,
        }
    }

    /// Merges the declared stable API fields into this command's body.
    pub(crate) fn set_server_api(&mut self, server_api: &ServerApi) {
        self.body.insert("apiVersion", server_api.version.to_string());
        if let Some(strict) = server_api.strict {
            self.body.insert("apiStrict", strict);
        }
        if let Some(deprecation_errors) = server_api.deprecation_errors {
            self.body.insert("apiDeprecationErrors", deprecation_errors);
        }
    }

    /// Attaches a `$readPreference` field describing how this command should be routed.
    pub(crate) fn set_read_preference(&mut self, read_pref: ReadPreference) {
        self.body
            .insert("$readPreference", read_pref.into_document());
    }
}

fn command_succeeded(doc: &Document) -> bool {
    match doc.get("ok") {
        Some(Bson::Double(ok)) => *ok != 0.0,
        Some(Bson::Int32(ok)) => *ok != 0,
        Some(Bson::Int64(ok)) => *ok != 0,
        Some(Bson::Boolean(ok)) => *ok,
        _ => true,
    }
}

/// The raw BSON document returned by the server in response to a `Command`.
#[derive(Debug, Clone)]
pub(crate) struct RawCommandResponse {
    pub(crate) raw_doc: Document,
}

impl RawCommandResponse {
    pub(crate) fn new(raw_doc: Document) -> Self {
        Self { raw_doc }
    }

    /// Deserializes this response into `T`, unless the server reported the command as failed,
    /// in which case this returns the corresponding `ErrorKind::Command`.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        if !command_succeeded(&self.raw_doc) {
            let command_error: CommandError = bson::from_document(self.raw_doc.clone())?;
            return Err(ErrorKind::Command(command_error).into());
        }

        Ok(bson::from_document(self.raw_doc.clone())?)
    }
}
