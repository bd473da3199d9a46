//! Packets and the length-prefixed frame format.
//!
//! A [`Packet`] is a one-directional cursor over a byte buffer. Write-mode
//! packets reserve a 4-byte little-endian length at offset 0 which is stamped
//! with the total frame size when the buffer is requested. Read-mode packets
//! wrap a payload whose length was already taken off the wire.
//!
//! ## Frame Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 LE total length  | payload (length - 4 bytes) |
//! +----------------------+----------------------------+
//! ```

mod codec;
mod primitive;

pub use codec::{LengthPrefixCodec, PacketCodec, DEFAULT_MAX_FRAME_SIZE};
pub use primitive::{Decode, Encode, WireType, WireValue};

use crate::error::PacketError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length header in the reference frame format.
pub const HEADER_SIZE: usize = 4;

/// Direction a packet was created for. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketMode {
    Read,
    Write,
}

#[derive(Debug)]
enum Body {
    Write {
        buf: BytesMut,
        /// Frame length last stamped into the header.
        stamped: Option<usize>,
    },
    Read {
        data: Bytes,
        cursor: Bytes,
    },
}

/// A framed message being built or consumed.
#[derive(Debug)]
pub struct Packet {
    mode: PacketMode,
    /// `None` once disposed.
    body: Option<Body>,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet {
    /// Create an empty write-mode packet with the length header reserved.
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(0);
        Self {
            mode: PacketMode::Write,
            body: Some(Body::Write { buf, stamped: None }),
        }
    }

    /// Create a read-mode packet over a payload (header already stripped).
    pub fn from_payload(payload: impl Into<Bytes>) -> Self {
        let data = payload.into();
        Self {
            mode: PacketMode::Read,
            body: Some(Body::Read {
                cursor: data.clone(),
                data,
            }),
        }
    }

    pub fn mode(&self) -> PacketMode {
        self.mode
    }

    /// Current buffer length. Includes the header for write-mode packets.
    pub fn size(&self) -> usize {
        match &self.body {
            Some(Body::Write { buf, .. }) => buf.len(),
            Some(Body::Read { data, .. }) => data.len(),
            None => 0,
        }
    }

    /// Offset of the read or write cursor.
    pub fn position(&self) -> usize {
        match &self.body {
            Some(Body::Write { buf, .. }) => buf.len(),
            Some(Body::Read { data, cursor }) => data.len() - cursor.len(),
            None => 0,
        }
    }

    /// Bytes left to read. Always 0 for write-mode packets.
    pub fn remaining(&self) -> usize {
        match &self.body {
            Some(Body::Read { cursor, .. }) => cursor.len(),
            _ => 0,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.body.is_none()
    }

    /// Append a value.
    pub fn write<T: Encode>(&mut self, value: T) -> Result<(), PacketError> {
        value.encode(self.write_buf()?)
    }

    /// Append a dynamically typed value.
    pub fn write_value(&mut self, value: &WireValue) -> Result<(), PacketError> {
        value.encode(self.write_buf()?)
    }

    /// Read the next value.
    pub fn read<T: Decode>(&mut self) -> Result<T, PacketError> {
        T::decode(self.read_cursor()?)
    }

    /// Read `count` consecutive values. Byte arrays are copied in bulk.
    pub fn read_array<T: Decode>(&mut self, count: usize) -> Result<Vec<T>, PacketError> {
        T::decode_many(self.read_cursor()?, count)
    }

    /// Read the next value as the given wire type.
    pub fn read_value(&mut self, ty: WireType) -> Result<WireValue, PacketError> {
        WireValue::decode(ty, self.read_cursor()?)
    }

    /// The packet buffer.
    ///
    /// For write-mode packets this is the complete frame: the header is
    /// stamped with the current size the first time the buffer is requested
    /// after a write, not on every write.
    pub fn buffer(&mut self) -> Result<&[u8], PacketError> {
        match self.body.as_mut() {
            Some(Body::Write { buf, stamped }) => {
                stamp(buf, stamped);
                Ok(&buf[..])
            }
            Some(Body::Read { data, .. }) => Ok(&data[..]),
            None => Err(PacketError::Disposed),
        }
    }

    /// Message bytes without the length header.
    pub fn payload(&self) -> Result<&[u8], PacketError> {
        match &self.body {
            Some(Body::Write { buf, .. }) => Ok(&buf[HEADER_SIZE..]),
            Some(Body::Read { data, .. }) => Ok(&data[..]),
            None => Err(PacketError::Disposed),
        }
    }

    /// Finalize a write-mode packet into a frame ready for the socket.
    pub fn into_frame(mut self) -> Result<Bytes, PacketError> {
        match self.body.take() {
            Some(Body::Write { mut buf, mut stamped }) => {
                stamp(&mut buf, &mut stamped);
                Ok(buf.freeze())
            }
            Some(Body::Read { .. }) => Err(PacketError::WrongMode {
                expected: PacketMode::Write,
                actual: PacketMode::Read,
            }),
            None => Err(PacketError::Disposed),
        }
    }

    /// Release the backing memory. Disposing twice is a no-op.
    pub fn dispose(&mut self) {
        self.body = None;
    }

    /// Split a buffer of concatenated frames into read-mode packets.
    ///
    /// Stops at a zero length, at a length smaller than the header, or at a
    /// frame that is not completely present. Bytes after the stopping point
    /// are left to the caller.
    pub fn split(buffer: &[u8]) -> Vec<Packet> {
        let mut packets = Vec::new();
        let mut rest = buffer;

        while rest.len() >= HEADER_SIZE {
            let length = (&rest[..HEADER_SIZE]).get_u32_le() as usize;
            if length < HEADER_SIZE || length > rest.len() {
                break;
            }
            packets.push(Packet::from_payload(Bytes::copy_from_slice(
                &rest[HEADER_SIZE..length],
            )));
            rest = &rest[length..];
        }

        packets
    }

    fn write_buf(&mut self) -> Result<&mut BytesMut, PacketError> {
        match self.body.as_mut() {
            Some(Body::Write { buf, .. }) => Ok(buf),
            Some(Body::Read { .. }) => Err(PacketError::WrongMode {
                expected: PacketMode::Write,
                actual: PacketMode::Read,
            }),
            None => Err(PacketError::Disposed),
        }
    }

    fn read_cursor(&mut self) -> Result<&mut Bytes, PacketError> {
        match self.body.as_mut() {
            Some(Body::Read { cursor, .. }) => Ok(cursor),
            Some(Body::Write { .. }) => Err(PacketError::WrongMode {
                expected: PacketMode::Read,
                actual: PacketMode::Write,
            }),
            None => Err(PacketError::Disposed),
        }
    }
}

fn stamp(buf: &mut BytesMut, stamped: &mut Option<usize>) {
    let len = buf.len();
    if *stamped != Some(len) {
        buf[..HEADER_SIZE].copy_from_slice(&(len as u32).to_le_bytes());
        *stamped = Some(len);
    }
}
