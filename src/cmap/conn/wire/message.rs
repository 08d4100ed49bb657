//! OP_MSG framing: the current request/response carrier for the wire protocol.

use bitflags::bitflags;
use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    util,
};
use crate::{
    bson_util,
    cmap::conn::command::Command,
    error::{ErrorKind, Result},
};

bitflags! {
    /// Bitwise flags for an OP_MSG, immediately following the header.
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0001_0000_0000_0000_0000_0000_0000;
    }
}

/// A section of an OP_MSG body: either a single BSON document (payload type 0) or an identified
/// sequence of documents (payload type 1).
#[derive(Debug)]
pub(crate) enum MessageSection {
    Document(Document),
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

/// An OP_MSG request or reply.
#[derive(Debug)]
pub(crate) struct Message {
    pub(crate) request_id: Option<i32>,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) sections: Vec<MessageSection>,
    pub(crate) checksum: Option<u32>,
}

impl Message {
    /// Builds the OP_MSG request for `command`, inserting `$db` per the wire protocol.
    pub(crate) fn with_command(mut command: Command, request_id: Option<i32>) -> Self {
        command.body.insert("$db", command.target_db.clone());

        let mut flags = MessageFlags::empty();
        if command.exhaust_allowed {
            flags.insert(MessageFlags::EXHAUST_ALLOWED);
        }

        Self {
            request_id,
            response_to: 0,
            flags,
            sections: vec![MessageSection::Document(command.body)],
            checksum: None,
        }
    }

    /// Whether the server indicated more replies will follow on this same connection without a
    /// further request (the awaitable `hello`/Push Monitor streaming protocol).
    pub(crate) fn more_to_come(&self) -> bool {
        self.flags.contains(MessageFlags::MORE_TO_COME)
    }

    /// Returns the single document carried by this message's first section, which is the shape
    /// every command reply takes.
    pub(crate) fn single_document_response(self) -> Result<Document> {
        self.sections
            .into_iter()
            .next()
            .map(|section| match section {
                MessageSection::Document(doc) => doc,
                MessageSection::Sequence { documents, .. } => {
                    documents.into_iter().next().unwrap_or_default()
                }
            })
            .ok_or_else(|| {
                ErrorKind::InvalidResponse {
                    message: "no response received from server".into(),
                }
                .into()
            })
    }

    pub(crate) async fn write_to<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> Result<()> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.flags.bits().to_le_bytes());

        for section in &self.sections {
            match section {
                MessageSection::Document(doc) => {
                    body.push(0);
                    body.extend_from_slice(&bson_util::to_document_bytes(doc)?);
                }
                MessageSection::Sequence {
                    identifier,
                    documents,
                } => {
                    body.push(1);
                    let mut seq = Vec::new();
                    seq.extend_from_slice(identifier.as_bytes());
                    seq.push(0);
                    for doc in documents {
                        seq.extend_from_slice(&bson_util::to_document_bytes(doc)?);
                    }
                    let size = (seq.len() + std::mem::size_of::<i32>()) as i32;
                    body.extend_from_slice(&size.to_le_bytes());
                    body.extend_from_slice(&seq);
                }
            }
        }

        if let Some(checksum) = self.checksum {
            body.extend_from_slice(&checksum.to_le_bytes());
        }

        let header = Header {
            length: (Header::LENGTH + body.len()) as i32,
            request_id: self.request_id.unwrap_or_else(util::next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;

        Ok(())
    }

    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let header = Header::read_from(reader).await?;
        let mut remaining = header.length - Header::LENGTH as i32;

        let flags = MessageFlags::from_bits_truncate(reader.read_u32_le().await?);
        remaining -= std::mem::size_of::<u32>() as i32;

        let checksum_present = flags.contains(MessageFlags::CHECKSUM_PRESENT);
        let trailer = if checksum_present { 4 } else { 0 };

        let mut sections = Vec::new();
        while remaining - trailer > 0 {
            let payload_type = reader.read_u8().await?;
            remaining -= 1;

            match payload_type {
                0 => {
                    let (doc, consumed) = bson_util::read_document(reader).await?;
                    remaining -= consumed as i32;
                    sections.push(MessageSection::Document(doc));
                }
                1 => {
                    let size = reader.read_i32_le().await?;
                    let mut section_remaining = size - std::mem::size_of::<i32>() as i32;
                    remaining -= std::mem::size_of::<i32>() as i32;

                    let mut identifier_bytes = Vec::new();
                    loop {
                        let b = reader.read_u8().await?;
                        section_remaining -= 1;
                        if b == 0 {
                            break;
                        }
                        identifier_bytes.push(b);
                    }
                    remaining -= (identifier_bytes.len() + 1) as i32;

                    let identifier = String::from_utf8(identifier_bytes).map_err(|e| {
                        ErrorKind::InvalidResponse {
                            message: format!("invalid identifier in document sequence: {}", e),
                        }
                    })?;

                    let mut documents = Vec::new();
                    while section_remaining > 0 {
                        let (doc, consumed) = bson_util::read_document(reader).await?;
                        section_remaining -= consumed as i32;
                        remaining -= consumed as i32;
                        documents.push(doc);
                    }

                    sections.push(MessageSection::Sequence {
                        identifier,
                        documents,
                    });
                }
                other => {
                    return Err(ErrorKind::InvalidResponse {
                        message: format!("unrecognized OP_MSG payload type: {}", other),
                    }
                    .into());
                }
            }
        }

        let checksum = if checksum_present {
            Some(reader.read_u32_le().await?)
        } else {
            None
        };

        Ok(Self {
            request_id: Some(header.request_id),
            response_to: header.response_to,
            flags,
            sections,
            checksum,
        })
    }
}
