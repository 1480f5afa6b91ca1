//! Counter wire format
//!
//! A counter frame is the raw 8-byte big-endian encoding of a u64. No
//! length prefix, no framing beyond the fixed width.

use std::io;

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encode a counter value as its wire representation.
pub fn encode_counter(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Decode a counter frame back into a value.
pub fn decode_counter(frame: [u8; 8]) -> u64 {
    u64::from_be_bytes(frame)
}

/// Write one counter frame and flush it out.
pub async fn write_counter<W>(writer: &mut W, value: u64) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_counter(value)).await?;
    writer.flush().await
}

/// Read exactly one counter frame. Anything short of 8 bytes is an error.
pub async fn read_counter<R>(reader: &mut R) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut frame = [0u8; 8];
    reader.read_exact(&mut frame).await?;
    Ok(decode_counter(frame))
}
