//! Frame header codec.

use super::{Packet, HEADER_SIZE};
use crate::error::{NetError, NetResult};
use bytes::{Buf, Bytes};

/// Largest frame accepted by default (16MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Describes how frames are delimited on the wire.
///
/// `length_of` is called exactly once per frame with exactly `header_size`
/// bytes, even when the header arrived split across several reads.
pub trait PacketCodec: Send + Sync + 'static {
    /// Fixed size of the frame header.
    fn header_size(&self) -> usize;

    /// Decode the total frame length (header included) from a header.
    fn length_of(&self, header: &[u8]) -> NetResult<usize>;

    /// Build a read-mode packet over a received payload.
    fn make_packet(&self, payload: Bytes) -> Packet {
        Packet::from_payload(payload)
    }
}

/// The reference `[u32 LE length][payload]` format.
#[derive(Debug, Clone)]
pub struct LengthPrefixCodec {
    max_frame_size: usize,
}

impl Default for LengthPrefixCodec {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl LengthPrefixCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject frames announcing more than `max_frame_size` bytes.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl PacketCodec for LengthPrefixCodec {
    fn header_size(&self) -> usize {
        HEADER_SIZE
    }

    fn length_of(&self, header: &[u8]) -> NetResult<usize> {
        if header.len() != HEADER_SIZE {
            return Err(NetError::framing(format!(
                "header of {} bytes, expected {HEADER_SIZE}",
                header.len()
            )));
        }

        let length = (&header[..]).get_u32_le() as usize;
        if length < HEADER_SIZE {
            return Err(NetError::framing(format!(
                "frame length {length} is smaller than the {HEADER_SIZE} byte header"
            )));
        }
        if length > self.max_frame_size {
            return Err(NetError::framing(format!(
                "frame of length {length} exceeds maximum {}",
                self.max_frame_size
            )));
        }
        Ok(length)
    }
}
