// Frame codec for the work and result channels.
//
// Wire format: [u32 big-endian length][JSON payload]
// JSON rather than a binary format because packets carry arbitrary
// `serde_json::Value` trees, which need a self-describing encoding to decode.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::errors::{PoolError, Result};

/// Serialize `message` into a single frame payload
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| PoolError::serialization("json", e))
}

/// Deserialize one frame payload
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| PoolError::serialization("json", e))
}

/// Fail with a channel error if `message` would not fit in one frame
pub fn ensure_fits<T: Serialize>(message: &T, max_bytes: usize) -> Result<()> {
    let len = encode(message)?.len();
    if len > max_bytes {
        return Err(too_large(len, max_bytes));
    }
    Ok(())
}

fn too_large(len: usize, max_bytes: usize) -> PoolError {
    PoolError::channel("frame", format!("message too large: {len} bytes (max {max_bytes})"))
}

/// Write one message as a length-prefixed frame
pub async fn write_message<W, T>(io: &mut W, message: &T, max_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
    T: Serialize,
{
    let payload = encode(message)?;
    write_length_prefixed(io, &payload, max_bytes).await
}

/// Read one message.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
pub async fn read_message<R, T>(io: &mut R, max_bytes: usize) -> Result<Option<T>>
where
    R: AsyncRead + Unpin + Send,
    T: DeserializeOwned,
{
    match read_length_prefixed(io, max_bytes).await? {
        Some(payload) => decode(&payload).map(Some),
        None => Ok(None),
    }
}

async fn read_length_prefixed<R>(io: &mut R, max_bytes: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut len_buf = [0u8; 4];
    match io.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(PoolError::io("reading frame header", e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_bytes {
        return Err(too_large(len, max_bytes));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf)
        .await
        .map_err(|e| PoolError::io("reading frame body", e))?;
    Ok(Some(buf))
}

async fn write_length_prefixed<W>(io: &mut W, data: &[u8], max_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    if data.len() > max_bytes {
        return Err(too_large(data.len(), max_bytes));
    }
    let len = u32::try_from(data.len()).map_err(|_| {
        PoolError::channel(
            "frame",
            format!("payload exceeds u32::MAX: {} bytes", data.len()),
        )
    })?;
    io.write_all(&len.to_be_bytes())
        .await
        .map_err(|e| PoolError::io("writing frame header", e))?;
    io.write_all(data)
        .await
        .map_err(|e| PoolError::io("writing frame body", e))?;
    io.flush()
        .await
        .map_err(|e| PoolError::io("flushing frame", e))?;
    Ok(())
}
