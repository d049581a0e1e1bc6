//! Message framing for the wire protocol.
//!
//! Frames are length-prefixed: a fixed header of payload length, frame type
//! and CRC32 checksum, followed by the payload bytes. The decoder consumes a
//! growable buffer incrementally, returning `None` until a complete frame has
//! been received, which is what the reactor's non-blocking read loop needs.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::ProtocolError;

/// Maximum frame size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Frame header size (4 bytes length + 1 byte type + 4 bytes checksum).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Type of frame being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Request frame.
    Request = 0x01,
    /// Response frame.
    Response = 0x02,
    /// Error response frame.
    Error = 0x03,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::Error),
            _ => Err(ProtocolError::InvalidFrame(format!(
                "unknown frame type: {value:#x}"
            ))),
        }
    }
}

/// A frame in the wire protocol.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Type of this frame.
    pub frame_type: FrameType,
    /// Frame payload.
    pub payload: Bytes,
    /// CRC32 checksum of the payload.
    pub checksum: u32,
}

impl Frame {
    /// Create a new frame, computing the payload checksum.
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        let checksum = crc32fast::hash(&payload);
        Self {
            frame_type,
            payload,
            checksum,
        }
    }

    /// Verify the payload against the carried checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the checksum does not match.
    pub fn verify_checksum(&self) -> Result<(), ProtocolError> {
        let actual = crc32fast::hash(&self.payload);
        if self.checksum != actual {
            return Err(ProtocolError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }
}

/// Codec for encoding/decoding frames.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Attempt to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` until a complete frame has been buffered.
    ///
    /// # Errors
    ///
    /// Returns an error on an oversized frame, an unknown frame type, or a
    /// checksum mismatch.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Parse the header without consuming it.
        let mut header = &buf[..FRAME_HEADER_SIZE];
        let payload_len = header.get_u32() as usize;
        let frame_type_byte = header.get_u8();
        let checksum = header.get_u32();

        if payload_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }

        let frame_len = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let frame_type = FrameType::try_from(frame_type_byte)?;

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let frame = Frame {
            frame_type,
            payload,
            checksum,
        };
        frame.verify_checksum()?;

        Ok(Some(frame))
    }

    /// Encode a frame onto the back of `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload exceeds the maximum frame size.
    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload_len = frame.payload.len();
        if payload_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }

        buf.reserve(FRAME_HEADER_SIZE + payload_len);

        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(payload_len as u32);
        buf.put_u8(frame.frame_type as u8);
        buf.put_u32(frame.checksum);
        buf.put(frame.payload.clone());

        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = Frame::new(FrameType::Request, Bytes::from("Hello, World!"));

        codec.encode(&frame, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.frame_type, frame.frame_type);
        assert_eq!(decoded.payload, frame.payload);
        assert_eq!(decoded.checksum, frame.checksum);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        // Full header, truncated payload.
        buf.put_u32(100);
        buf.put_u8(FrameType::Request as u8);
        buf.put_u32(0);
        buf.put_slice(b"short");

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(&Frame::new(FrameType::Request, Bytes::from("one")), &mut buf)
            .unwrap();
        codec
            .encode(
                &Frame::new(FrameType::Response, Bytes::from("two")),
                &mut buf,
            )
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload, Bytes::from("one"));
        assert_eq!(second.payload, Bytes::from("two"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_checksum_mismatch() {
        let codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let payload = b"Hello, World!";
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(payload.len() as u32);
        buf.put_u8(FrameType::Request as u8);
        buf.put_u32(12345); // wrong checksum
        buf.put_slice(payload);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let codec = FrameCodec::new().with_max_frame_size(8);
        let mut buf = BytesMut::new();

        let frame = Frame::new(FrameType::Request, Bytes::from("way past the limit"));
        assert!(matches!(
            codec.encode(&frame, &mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));

        buf.put_u32(1024);
        buf.put_u8(FrameType::Request as u8);
        buf.put_u32(0);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
