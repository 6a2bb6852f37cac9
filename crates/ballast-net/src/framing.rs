//! Length-prefixed postcard frames.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes
//! of postcard-encoded [`MigrationMessage`]. Frames are read and written
//! over any tokio byte stream, which covers iroh's QUIC streams and
//! in-memory duplex pipes alike.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetError;
use crate::message::MigrationMessage;

/// Maximum frame size: 64 MiB. Chunks are a few MiB at most.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Write one frame.
pub async fn write_frame<W>(send: &mut W, message: &MigrationMessage) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload =
        postcard::to_allocvec(message).map_err(|e| NetError::Serialization(e.to_string()))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(NetError::Serialization(format!(
            "message too large: {} bytes (max {MAX_MESSAGE_SIZE})",
            payload.len()
        )));
    }

    // Length prefix (4 bytes big-endian).
    send.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    send.write_all(&payload).await?;
    send.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `None` if the peer closed the stream cleanly on a frame
/// boundary. A close mid-frame is [`NetError::StreamClosed`].
pub async fn read_frame<R>(recv: &mut R) -> Result<Option<MigrationMessage>, NetError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = recv.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(NetError::StreamClosed)
            };
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(NetError::Serialization(format!(
            "message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"
        )));
    }

    let mut payload = vec![0u8; len];
    match recv.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(NetError::StreamClosed);
        }
        Err(e) => return Err(NetError::Io(e)),
    }

    let message =
        postcard::from_bytes(&payload).map_err(|e| NetError::Serialization(e.to_string()))?;
    Ok(Some(message))
}
