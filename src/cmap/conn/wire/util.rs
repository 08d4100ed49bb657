use std::sync::atomic::{AtomicI32, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// Returns a fresh, process-wide unique request id for tagging an outgoing message.
pub(crate) fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Serializes `string` to bytes and writes them to `writer` with a null terminator appended.
pub(crate) async fn write_cstring<W: AsyncWrite + Unpin + Send>(
    writer: &mut W,
    string: &str,
) -> Result<()> {
    writer.write_all(string.as_bytes()).await?;
    writer.write_all(&[0]).await?;
    Ok(())
}
