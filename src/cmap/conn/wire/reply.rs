//! Legacy OP_QUERY/OP_REPLY framing, used only for the first handshake message against servers
//! that predate wire version 6 (streaming `hello` / stable API support).

use bitflags::bitflags;
use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    util,
};
use crate::{bson_util, error::Result};

bitflags! {
    pub(crate) struct ResponseFlags: u32 {
        const CURSOR_NOT_FOUND   = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const QUERY_FAILURE      = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const AWAIT_CAPABLE      = 0b_0000_0000_0000_0000_0000_0000_0000_1000;
    }
}

/// A legacy OP_QUERY request, used solely to send the first `isMaster`/`hello` on a new
/// connection to a server that may not understand OP_MSG yet.
#[derive(Debug)]
pub(crate) struct Query {
    pub(crate) request_id: Option<i32>,
    pub(crate) full_collection_name: String,
    pub(crate) number_to_return: i32,
    pub(crate) query: Document,
}

impl Query {
    pub(crate) fn with_document(target_db: &str, query: Document) -> Self {
        Self {
            request_id: None,
            full_collection_name: format!("{}.$cmd", target_db),
            number_to_return: -1,
            query,
        }
    }

    pub(crate) async fn write_to<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> Result<()> {
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes()); // flags
        body.extend_from_slice(self.full_collection_name.as_bytes());
        body.push(0);
        body.extend_from_slice(&0i32.to_le_bytes()); // numberToSkip
        body.extend_from_slice(&self.number_to_return.to_le_bytes());
        body.extend_from_slice(&bson_util::to_document_bytes(&self.query)?);

        let header = Header {
            length: (Header::LENGTH + body.len()) as i32,
            request_id: self.request_id.unwrap_or_else(util::next_request_id),
            response_to: 0,
            op_code: OpCode::Query,
        };

        header.write_to(writer).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// A legacy OP_REPLY, as returned in response to a `Query`.
#[derive(Debug)]
pub(crate) struct Reply {
    pub(crate) response_to: i32,
    pub(crate) flags: ResponseFlags,
    pub(crate) documents: Vec<Document>,
}

impl Reply {
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let header = Header::read_from(reader).await?;
        let mut remaining = header.length - Header::LENGTH as i32;

        let flags = ResponseFlags::from_bits_truncate(reader.read_u32_le().await?);
        remaining -= std::mem::size_of::<u32>() as i32;

        reader.read_i64_le().await?; // cursor id, unused
        remaining -= std::mem::size_of::<i64>() as i32;
        reader.read_i32_le().await?; // starting from, unused
        remaining -= std::mem::size_of::<i32>() as i32;
        let number_returned = reader.read_i32_le().await?;
        remaining -= std::mem::size_of::<i32>() as i32;

        let mut documents = Vec::with_capacity(number_returned.max(0) as usize);
        while remaining > 0 {
            let (doc, consumed) = bson_util::read_document(reader).await?;
            remaining -= consumed as i32;
            documents.push(doc);
        }

        Ok(Self {
            response_to: header.response_to,
            flags,
            documents,
        })
    }
}
