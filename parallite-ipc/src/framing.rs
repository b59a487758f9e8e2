//! Length-prefixed binary framing
//!
//! Every byte stream in the system carries the same frame shape: a 4-byte
//! unsigned big-endian payload length followed by exactly that many payload
//! bytes. Reads loop until the full frame is consumed; writes go out as one
//! coordinated buffer so frames from different tasks never interleave on a
//! shared stream.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::IpcError;

/// Size of the length prefix on every frame.
pub const LEN_PREFIX_BYTES: usize = 4;

/// Default ceiling on frame payload size: 10 MiB.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Read one frame from `reader`.
///
/// Returns `Ok(None)` on a clean end of stream (EOF before the first length
/// byte). A length prefix above `max_payload` is rejected before any payload
/// allocation. EOF inside the header or payload is a [`IpcError::Truncated`]
/// error.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Option<Bytes>, IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_PREFIX_BYTES];
    let mut filled = 0;
    while filled < LEN_PREFIX_BYTES {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(IpcError::Truncated(format!(
                "eof after {filled} of {LEN_PREFIX_BYTES} header bytes"
            )));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_payload {
        return Err(IpcError::FrameTooLarge {
            len,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            IpcError::Truncated(format!("eof inside {len}-byte payload"))
        } else {
            IpcError::Io(e)
        }
    })?;
    Ok(Some(Bytes::from(payload)))
}

/// Write one frame to `writer`.
///
/// The length prefix and payload are assembled into a single buffer and
/// written with one `write_all`, so a frame is atomic at the call site.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| IpcError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut buf = BytesMut::with_capacity(LEN_PREFIX_BYTES + payload.len());
    buf.put_u32(len);
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
