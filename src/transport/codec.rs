//! Length-prefixed message framing
//!
//! ```text
//! +--------+--------+--------+--------+----------------+
//! |        Length (4B, big endian)    |   Message      |
//! +--------+--------+--------+--------+----------------+
//! ```

use super::TransportError;
use crate::protocol::MAX_MESSAGE_SIZE;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Write one message and flush it
pub async fn write_message<W>(writer: &mut W, message: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if message.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge(message.len()));
    }

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + message.len());
    buf.extend_from_slice(&(message.len() as u32).to_be_bytes());
    buf.extend_from_slice(message);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// messages; a close in the middle of a message is an error.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_LEN {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(TransportError::Closed);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge(len));
    }

    let mut message = vec![0u8; len];
    reader.read_exact(&mut message).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::Closed
        } else {
            TransportError::Io(e)
        }
    })?;

    Ok(Some(message))
}
