//! Write Operation Core (§4.H): batched bulk insert/update/delete, with ordered/unordered
//! semantics and result merging, executed either as a modern write command or, for servers that
//! predate them, as one legacy write per document.

#[cfg(test)]
mod test;

use bson::{doc, Bson, Document};

use crate::{
    bson_util,
    cmap::{Command, Connection, StreamDescription},
    concern::{Acknowledgment, WriteConcern},
    error::{BulkWriteError, Error, ErrorKind, Result, WriteConcernError},
    sdam::ServerType,
};

/// The kind of write a [`WriteOperation`] performs. Determines both the write command name and
/// the array field that carries its per-document specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOperationKind {
    Insert,
    Update,
    Delete,
}

impl WriteOperationKind {
    fn command_name(self) -> &'static str {
        match self {
            WriteOperationKind::Insert => "insert",
            WriteOperationKind::Update => "update",
            WriteOperationKind::Delete => "delete",
        }
    }

    fn documents_field(self) -> &'static str {
        match self {
            WriteOperationKind::Insert => "documents",
            WriteOperationKind::Update => "updates",
            WriteOperationKind::Delete => "deletes",
        }
    }
}

/// The outcome of executing a [`WriteOperation`]: how many documents the server (or, for w=0,
/// the client's own bookkeeping) counts as written, plus any per-document errors collected along
/// the way. A non-empty `errors` does not necessarily mean `written_count` is zero — an
/// unordered write reports both the documents that succeeded and the ones that didn't.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct WriteOperationResult {
    pub(crate) written_count: u64,
    pub(crate) errors: Vec<BulkWriteError>,
    pub(crate) write_concern_error: Option<WriteConcernError>,
}

impl WriteOperationResult {
    fn merge(&mut self, mut other: Self, index_offset: usize) {
        self.written_count += other.written_count;
        for error in &mut other.errors {
            error.index += index_offset;
        }
        self.errors.append(&mut other.errors);
        if self.write_concern_error.is_none() {
            self.write_concern_error = other.write_concern_error;
        }
    }

    /// Whether this result should be surfaced to the caller as an `Err`, per §4.H's "surface the
    /// error" rule for ordered writes and the aggregated-result rule for unordered ones.
    pub(crate) fn into_result(self) -> Result<Self> {
        if self.errors.is_empty() && self.write_concern_error.is_none() {
            return Ok(self);
        }

        Err(ErrorKind::BulkWrite(crate::error::BulkWriteFailure {
            write_errors: if self.errors.is_empty() {
                None
            } else {
                Some(self.errors.clone())
            },
            write_concern_error: self.write_concern_error.clone(),
        })
        .into())
    }
}

/// A batched bulk write: a sequence of per-document specs (insert documents, or `{q, u, multi?}`
/// / `{q, limit}` update/delete specs) sharing one namespace, write concern, and ordering (§3
/// Data Model, §4.H).
#[derive(Debug, Clone)]
pub(crate) struct WriteOperation {
    pub(crate) kind: WriteOperationKind,
    pub(crate) db: String,
    pub(crate) coll: String,
    pub(crate) documents: Vec<Document>,
    pub(crate) write_concern: Option<WriteConcern>,
    pub(crate) ordered: bool,
}

impl WriteOperation {
    pub(crate) fn new(
        kind: WriteOperationKind,
        db: impl Into<String>,
        coll: impl Into<String>,
        documents: Vec<Document>,
        write_concern: Option<WriteConcern>,
        ordered: bool,
    ) -> Self {
        Self {
            kind,
            db: db.into(),
            coll: coll.into(),
            documents,
            write_concern,
            ordered,
        }
    }

    /// Merges `other` into `self` in place, per §4.H. Only permitted when `db`, `coll`, and
    /// `opKind` all match.
    pub(crate) fn merge(&mut self, mut other: WriteOperation) -> Result<()> {
        if self.db != other.db || self.coll != other.coll || self.kind != other.kind {
            return Err(Error::invalid_argument(
                "cannot merge write operations with different db/coll/opKind",
            ));
        }

        self.documents.append(&mut other.documents);
        Ok(())
    }

    /// Splits `self.documents` into `n` near-equal partitions, the last absorbing any remainder.
    /// Fails if `n` exceeds the number of documents (§4.H).
    pub(crate) fn batch(&self, n: usize) -> Result<Vec<WriteOperation>> {
        if n == 0 {
            return Err(Error::invalid_argument("batch count must be at least 1"));
        }

        if n > self.documents.len() {
            return Err(Error::invalid_argument(format!(
                "cannot split {} documents into {} batches",
                self.documents.len(),
                n
            )));
        }

        let total = self.documents.len();
        let base_size = total / n;
        let remainder = total % n;

        let mut batches = Vec::with_capacity(n);
        let mut start = 0;
        for i in 0..n {
            // Every partition but the last gets `base_size`; the last absorbs the remainder on
            // top of its own share, per §4.H ("the last partition absorbs any remainder").
            let extra = if i + 1 == n { remainder } else { 0 };
            let end = start + base_size + extra;
            batches.push(WriteOperation {
                kind: self.kind,
                db: self.db.clone(),
                coll: self.coll.clone(),
                documents: self.documents[start..end].to_vec(),
                write_concern: self.write_concern.clone(),
                ordered: self.ordered,
            });
            start = end;
        }

        Ok(batches)
    }

    /// Standalones, mongoses, and replica set primaries all accept writes directly; anything
    /// else (a secondary, arbiter, or a server whose type isn't known yet) does not.
    fn is_writable(server_type: ServerType) -> bool {
        matches!(
            server_type,
            ServerType::Standalone
                | ServerType::Mongos
                | ServerType::RsPrimary
                | ServerType::LoadBalancer
        )
    }

    fn requested_w0(&self) -> bool {
        matches!(
            self.write_concern.as_ref().and_then(|wc| wc.w.as_ref()),
            Some(Acknowledgment::Nodes(0))
        )
    }

    fn command_body(&self, documents: &[Document]) -> Result<Document> {
        let array: Vec<Bson> = documents.iter().cloned().map(Bson::Document).collect();
        let mut body = doc! {
            self.kind.command_name(): self.coll.clone(),
            self.kind.documents_field(): array,
            "ordered": self.ordered,
        };

        if let Some(write_concern) = &self.write_concern {
            if !write_concern.is_empty() {
                write_concern.validate()?;
                body.insert("writeConcern", bson::to_bson(write_concern)?);
            }
        }

        Ok(body)
    }

    /// Fails with [`ErrorKind::DocumentTooLarge`] before any socket write if any single document
    /// exceeds the server's `maxBsonObjectSize`, or the whole batch's encoded size exceeds its
    /// `maxMessageSize` (§4.A "Size enforcement", §8 property 7/S7).
    fn check_sizes(&self, stream_description: &StreamDescription) -> Result<()> {
        let mut total = 0usize;

        for doc in &self.documents {
            let size = bson_util::to_document_bytes(doc)?.len();
            if size as i64 > stream_description.max_bson_object_size {
                return Err(ErrorKind::DocumentTooLarge {
                    message: format!(
                        "document of {} bytes exceeds this server's maximum BSON object size of \
                         {} bytes",
                        size, stream_description.max_bson_object_size
                    ),
                }
                .into());
            }
            total += size;
        }

        if total as i64 > stream_description.max_message_size_bytes as i64 {
            return Err(ErrorKind::DocumentTooLarge {
                message: format!(
                    "write batch of {} bytes exceeds this server's maximum message size of {} \
                     bytes",
                    total, stream_description.max_message_size_bytes
                ),
            }
            .into());
        }

        Ok(())
    }

    /// Executes this operation on `conn`, automatically splitting into multiple commands (modern
    /// path) or messages (legacy path) as the server's advertised limits and this crate's
    /// §4.H semantics require. Fails immediately with `NotWritablePrimary` if `conn`'s server
    /// isn't writable (a secondary, arbiter, or other non-primary replica set member).
    pub(crate) async fn execute(&self, conn: &mut Connection) -> Result<WriteOperationResult> {
        if self.documents.is_empty() {
            return Ok(WriteOperationResult::default());
        }

        let stream_description = conn
            .stream_description
            .clone()
            .unwrap_or_default();

        if !Self::is_writable(stream_description.server_type) {
            return Err(ErrorKind::NotWritablePrimary.into());
        }

        self.check_sizes(&stream_description)?;

        let result = if stream_description.supports_write_commands() {
            self.execute_write_commands(conn, &stream_description).await?
        } else {
            self.execute_legacy(conn).await?
        };

        // §4.H: ordered writes surface the first error as an Err; unordered writes return the
        // aggregated result, per-document errors included, as Ok.
        if self.ordered {
            result.into_result()
        } else {
            Ok(result)
        }
    }

    async fn execute_write_commands(
        &self,
        conn: &mut Connection,
        stream_description: &StreamDescription,
    ) -> Result<WriteOperationResult> {
        let max_batch_size = stream_description.max_write_batch_size.max(1) as usize;
        let unacknowledged = self.requested_w0();

        let mut result = WriteOperationResult::default();
        let mut offset = 0usize;

        for chunk in self.documents.chunks(max_batch_size) {
            let body = self.command_body(chunk)?;
            let command = Command::new(
                self.kind.command_name().to_string(),
                self.db.clone(),
                body,
            );

            if unacknowledged {
                conn.dispatch_one_way(command).await?;
                // §4.H: "writtenCount is reported as 0" for w=0, since no acknowledgement means
                // the client never learns how many documents actually landed.
                offset += chunk.len();
                continue;
            }

            let reply = conn.send_command(command).await?;
            let response: WriteCommandResponse = reply.body()?;
            let chunk_result = WriteOperationResult {
                written_count: response.n,
                errors: response.write_errors.unwrap_or_default(),
                write_concern_error: response.write_concern_error,
            };

            let chunk_failed = !chunk_result.errors.is_empty() || chunk_result.write_concern_error.is_some();
            result.merge(chunk_result, offset);
            offset += chunk.len();

            if self.ordered && chunk_failed {
                break;
            }
        }

        Ok(result)
    }

    /// One `insert`/`update`/`delete` write-command call per document, each optionally followed
    /// by a `getLastError`, mirroring the legacy OP_INSERT/OP_UPDATE/OP_DELETE-plus-getLastError
    /// protocol for servers that predate write commands (wireVersion < 2). This crate's Wire
    /// Connection layer only frames OP_MSG/OP_QUERY (no supported server still speaks the legacy
    /// insert/update/delete opcodes), so the legacy path is expressed in terms of the same
    /// command-protocol framing used elsewhere, which has identical observable semantics: one
    /// message per document, ordered semantics enforced by stopping on the first acknowledged
    /// error.
    async fn execute_legacy(&self, conn: &mut Connection) -> Result<WriteOperationResult> {
        let unacknowledged = self.requested_w0();
        let mut result = WriteOperationResult::default();

        for (index, document) in self.documents.iter().enumerate() {
            let body = self.command_body(std::slice::from_ref(document))?;
            let command = Command::new(self.kind.command_name().to_string(), self.db.clone(), body);

            if unacknowledged {
                conn.dispatch_one_way(command).await?;
                continue;
            }

            conn.dispatch_one_way(command).await?;

            let get_last_error = Command::new(
                "getLastError".to_string(),
                self.db.clone(),
                doc! { "getLastError": 1 },
            );
            let reply = conn.send_command(get_last_error).await?;
            let response: LegacyGetLastErrorResponse = reply.body()?;

            if let Some(err) = response.err {
                result.errors.push(BulkWriteError {
                    index,
                    code: response.code.unwrap_or(0),
                    code_name: None,
                    message: err,
                });

                if self.ordered {
                    break;
                }
            } else {
                result.written_count += response.n.unwrap_or(1);
            }
        }

        Ok(result)
    }
}

#[derive(Debug, serde::Deserialize)]
struct WriteCommandResponse {
    n: u64,
    #[serde(rename = "writeErrors")]
    write_errors: Option<Vec<BulkWriteError>>,
    #[serde(rename = "writeConcernError")]
    write_concern_error: Option<WriteConcernError>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct LegacyGetLastErrorResponse {
    #[serde(default)]
    n: Option<u64>,
    #[serde(default)]
    err: Option<String>,
    #[serde(default)]
    code: Option<i32>,
}
