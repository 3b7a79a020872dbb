//! Frame encoding/decoding for the tunnel protocol
//!
//! One frame per transport message, encoded with the session's layer stack.
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+
//! |  Type  |           Stream ID (4B)          |   Length (2B)   |
//! +--------+--------+--------+--------+--------+--------+--------+
//! |                          Payload                             |
//! +--------+--------+--------+--------+--------+--------+--------+
//! ```

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 7;

/// Maximum payload size
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Data frame
    Data = 0x00,
    /// Stream open request, payload is `host:port`
    StreamOpen = 0x01,
    /// Stream close
    StreamClose = 0x02,
    /// Ping (keepalive)
    Ping = 0x03,
    /// Pong (keepalive response)
    Pong = 0x04,
    /// Go away (connection closing)
    GoAway = 0x05,
    /// Receive credit returned to the sender, payload is a `u32` increment
    WindowUpdate = 0x06,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Data),
            0x01 => Ok(FrameType::StreamOpen),
            0x02 => Ok(FrameType::StreamClose),
            0x03 => Ok(FrameType::Ping),
            0x04 => Ok(FrameType::Pong),
            0x05 => Ok(FrameType::GoAway),
            0x06 => Ok(FrameType::WindowUpdate),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Stream ID (0 for connection-level frames)
    pub stream_id: u32,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a new data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    /// Create a stream open frame
    pub fn stream_open(stream_id: u32, destination: &str) -> Self {
        Self {
            frame_type: FrameType::StreamOpen,
            stream_id,
            payload: Bytes::copy_from_slice(destination.as_bytes()),
        }
    }

    /// Create a stream close frame
    pub fn stream_close(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::StreamClose,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a ping frame
    pub fn ping(data: u64) -> Self {
        Self {
            frame_type: FrameType::Ping,
            stream_id: 0,
            payload: Bytes::copy_from_slice(&data.to_be_bytes()),
        }
    }

    /// Create a pong frame
    pub fn pong(data: u64) -> Self {
        Self {
            frame_type: FrameType::Pong,
            stream_id: 0,
            payload: Bytes::copy_from_slice(&data.to_be_bytes()),
        }
    }

    /// Create a go-away frame
    pub fn go_away() -> Self {
        Self {
            frame_type: FrameType::GoAway,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    /// Create a window update frame
    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        Self {
            frame_type: FrameType::WindowUpdate,
            stream_id,
            payload: Bytes::copy_from_slice(&increment.to_be_bytes()),
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.put_u16(payload_len as u16);
        buf.extend_from_slice(&self.payload);

        Ok(buf)
    }

    /// Decode exactly one frame from a message
    pub fn decode(mut buf: &[u8]) -> Result<Self, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TunnelError::InvalidFrame(format!(
                "Short frame: {} bytes",
                buf.len()
            )));
        }

        let frame_type = FrameType::try_from(buf.get_u8())?;
        let stream_id = buf.get_u32();
        let payload_len = buf.get_u16() as usize;

        if buf.len() != payload_len {
            return Err(TunnelError::InvalidFrame(format!(
                "Payload length {} does not match {} remaining bytes",
                payload_len,
                buf.len()
            )));
        }

        Ok(Self {
            frame_type,
            stream_id,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = Frame::data(0x0102_0304, Bytes::from_static(b"Hello, World!"));
        let encoded = original.encode().unwrap();

        assert_eq!(encoded.len(), original.encoded_size());
        assert_eq!(&encoded[..7], &[0x00, 1, 2, 3, 4, 0, 13]);
        assert_eq!(Frame::decode(&encoded).unwrap(), original);
    }

    #[test]
    fn test_stream_open_frame() {
        let frame = Frame::stream_open(1, "example.com:443");

        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.frame_type, FrameType::StreamOpen);
        assert_eq!(decoded.stream_id, 1);
        assert_eq!(&decoded.payload[..], b"example.com:443");
    }

    #[test]
    fn test_window_update_frame() {
        let encoded = Frame::window_update(3, 0x0004_0000).encode().unwrap();
        assert_eq!(&encoded[..], &[0x06, 0, 0, 0, 3, 0, 4, 0, 4, 0, 0]);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert!(Frame::decode(&[0x00, 0, 0, 0]).is_err());
        assert!(Frame::decode(&[0x09, 0, 0, 0, 1, 0, 0]).is_err());
        // Declares 2 payload bytes, carries 3
        assert!(Frame::decode(&[0x00, 0, 0, 0, 1, 0, 2, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_oversize_payload() {
        let frame = Frame::data(1, Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]));
        assert!(matches!(
            frame.encode(),
            Err(TunnelError::FrameTooLarge(_, MAX_PAYLOAD_SIZE))
        ));
    }
}
