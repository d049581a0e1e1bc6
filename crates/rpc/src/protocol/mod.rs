//! Wire protocol: frame layout and call envelopes.

pub mod envelope;
pub mod frame;

pub use envelope::{ErrorCode, ErrorInfo, RequestEnvelope, ResponseEnvelope};
pub use frame::{Frame, FrameCodec, FrameType, MAX_FRAME_SIZE};

use thiserror::Error;

/// Protocol-level errors raised while encoding or decoding frames and
/// envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Invalid frame received.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame too large.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Checksum mismatch.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Envelope (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(String),
}
