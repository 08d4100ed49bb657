//! Small serde helpers for BSON-adjacent types that don't have a natural `Serialize` impl of
//! their own, plus the buffered read/write helpers the wire layer uses to frame BSON documents
//! over an async stream.

use std::time::Duration;

use bson::Document;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ErrorKind, Result};

/// Serializes a `Result<T>` by writing the `Display` representation of the error in place of
/// the value when it's an `Err`. Used to make [`crate::sdam::description::server::ServerDescription`]
/// serializable for diagnostics/tests despite embedding an [`Error`] directly.
pub(crate) fn serialize_result_error_as_string<S: Serializer, T: Serialize>(
    val: &Result<T>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    val.as_ref()
        .map_err(Error::to_string)
        .serialize(serializer)
}

/// Serializes `doc` to its raw BSON bytes. Used both to write a document to the wire and to
/// measure its size against a server's advertised limits before writing anything at all.
pub(crate) fn to_document_bytes(doc: &Document) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    doc.to_writer(&mut buf)?;
    Ok(buf)
}

/// Reads one length-prefixed BSON document from `reader`, returning it along with the number of
/// bytes consumed (the document's own encoded length, header included). A BSON document begins
/// with its own total length as an `int32`, so the length can be read first and used to size a
/// single buffered read rather than decoding incrementally off the socket.
pub(crate) async fn read_document<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
) -> Result<(Document, usize)> {
    let length = reader.read_i32_le().await?;
    if length < 5 {
        return Err(ErrorKind::InvalidResponse {
            message: format!("invalid BSON document length: {}", length),
        }
        .into());
    }

    let mut buf = vec![0u8; length as usize];
    buf[0..4].copy_from_slice(&length.to_le_bytes());
    reader.read_exact(&mut buf[4..]).await?;

    let doc = Document::from_reader(&mut std::io::Cursor::new(&buf))?;
    Ok((doc, length as usize))
}

/// Serializes a millisecond [`Duration`] (e.g. a write concern's `wtimeout`) the way the server
/// expects: as a bare integer, or omitted entirely when absent.
pub(crate) fn serialize_duration_as_i64_millis<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) => serializer.serialize_i64(duration.as_millis() as i64),
        None => serializer.serialize_none(),
    }
}

/// The inverse of [`serialize_duration_as_i64_millis`].
pub(crate) fn deserialize_duration_from_u64_millis<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}

/// Writes a length-prefixed BSON document to `writer`.
pub(crate) async fn write_document<W: AsyncWrite + Unpin + Send>(
    writer: &mut W,
    doc: &Document,
) -> Result<()> {
    let bytes = to_document_bytes(doc)?;
    writer.write_all(&bytes).await?;
    Ok(())
}
