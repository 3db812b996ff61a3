//! Length-prefixed MessagePack framing for hook connections.
//!
//! ```text
//! +----------------+---------------------------------+
//! | len: u16 (BE)  | MessagePack map {Type, Data, ID} |
//! +----------------+---------------------------------+
//! ```
//!
//! A declared length above the configured cap is rejected before any of the
//! payload is read.

use crate::error::FrameError;
use crate::event::Message;
use bytes::{BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 2;

/// Encode `msg` into a complete frame (prefix + payload).
pub fn encode_frame(msg: &Message, max_len: usize) -> Result<BytesMut, FrameError> {
    let payload = rmp_serde::to_vec_named(msg)?;
    let len = payload.len();
    if len > max_len || len > u16::MAX as usize {
        return Err(FrameError::TooLong { len, max: max_len });
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + len);
    frame.put_u16(len as u16);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one frame payload (without the prefix).
pub fn decode_payload(payload: &[u8]) -> Result<Message, FrameError> {
    Ok(rmp_serde::from_slice(payload)?)
}

/// Read exactly one message, failing if it does not arrive within `timeout`.
pub async fn read_message<R>(
    reader: &mut R,
    timeout: Duration,
    max_len: usize,
) -> Result<Message, FrameError>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, read_frame(reader, max_len))
        .await
        .map_err(|_| FrameError::Timeout(timeout))?
}

async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Message, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await? as usize;
    if len > max_len {
        return Err(FrameError::TooLong { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_payload(&payload)
}

/// Write one message, failing if the write does not complete within `timeout`.
pub async fn write_message<W>(
    writer: &mut W,
    timeout: Duration,
    msg: &Message,
    max_len: usize,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg, max_len)?;

    tokio::time::timeout(timeout, async {
        writer.write_all(&frame).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| FrameError::Timeout(timeout))??;

    Ok(())
}
