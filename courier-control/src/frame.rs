//! Length-prefixed bincode frames: a 4-byte big-endian length, then the
//! payload.

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ControlError, Result};

/// Largest request the server reads.
pub const MAX_REQUEST_SIZE: u32 = 1_000_000;

/// Largest response the client reads; job listings can be long.
pub const MAX_RESPONSE_SIZE: u32 = 10_000_000;

pub async fn read_frame<S, T>(stream: &mut S, max: u32) -> Result<T>
where
    S: AsyncRead + Unpin + Send,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ControlError::ConnectionClosed
        } else {
            ControlError::Io(e)
        }
    })?;

    let size = u32::from_be_bytes(len_buf);
    if size > max {
        return Err(ControlError::FrameTooLarge { size, max });
    }

    let mut payload = vec![0u8; size as usize];
    stream.read_exact(&mut payload).await?;

    let (value, _) = bincode::serde::decode_from_slice(&payload, bincode::config::legacy())?;
    Ok(value)
}

pub async fn write_frame<S, T>(stream: &mut S, value: &T) -> Result<()>
where
    S: AsyncWrite + Unpin + Send,
    T: Serialize + Sync,
{
    let payload = bincode::serde::encode_to_vec(value, bincode::config::legacy())?;
    let size = u32::try_from(payload.len())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    stream.write_all(&size.to_be_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;

    Ok(())
}
