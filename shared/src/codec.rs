//! Envelope encoding and stream framing.
//!
//! An encoded envelope is the bincode form of [`Envelope`]. On a byte stream
//! each encoded envelope is preceded by its length as a big-endian `u32`.
//! There is no compression at this layer.

use crate::Envelope;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest encoded envelope accepted on a stream.
pub const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(envelope)?)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}

pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode(envelope)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            len: bytes.len(),
            max: MAX_FRAME_LEN,
        });
    }

    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    decode(&bytes).map(Some)
}
