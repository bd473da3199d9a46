//! Wire encodings for the values a packet can carry.
//!
//! Integers are fixed-width little-endian, booleans are one byte, and byte
//! runs / strings carry a `u16` little-endian count followed by the raw bytes.
//! The set of encodable types is closed: [`Encode`] and [`Decode`] are sealed,
//! so asking for a type without a wire encoding fails to compile.

use crate::error::PacketError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Tag naming one of the supported wire encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    U8,
    I8,
    Bool,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    Bytes,
    Str,
}

/// A dynamically typed wire value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    U8(u8),
    I8(i8),
    Bool(bool),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    Bytes(Bytes),
    Str(String),
}

impl WireValue {
    /// The wire type this value encodes as.
    pub fn wire_type(&self) -> WireType {
        match self {
            WireValue::U8(_) => WireType::U8,
            WireValue::I8(_) => WireType::I8,
            WireValue::Bool(_) => WireType::Bool,
            WireValue::U16(_) => WireType::U16,
            WireValue::I16(_) => WireType::I16,
            WireValue::U32(_) => WireType::U32,
            WireValue::I32(_) => WireType::I32,
            WireValue::U64(_) => WireType::U64,
            WireValue::I64(_) => WireType::I64,
            WireValue::Bytes(_) => WireType::Bytes,
            WireValue::Str(_) => WireType::Str,
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
        match self {
            WireValue::U8(v) => v.encode(buf),
            WireValue::I8(v) => v.encode(buf),
            WireValue::Bool(v) => v.encode(buf),
            WireValue::U16(v) => v.encode(buf),
            WireValue::I16(v) => v.encode(buf),
            WireValue::U32(v) => v.encode(buf),
            WireValue::I32(v) => v.encode(buf),
            WireValue::U64(v) => v.encode(buf),
            WireValue::I64(v) => v.encode(buf),
            WireValue::Bytes(v) => put_run(buf, v),
            WireValue::Str(v) => v.as_str().encode(buf),
        }
    }

    pub(crate) fn decode(ty: WireType, buf: &mut Bytes) -> Result<Self, PacketError> {
        Ok(match ty {
            WireType::U8 => WireValue::U8(u8::decode(buf)?),
            WireType::I8 => WireValue::I8(i8::decode(buf)?),
            WireType::Bool => WireValue::Bool(bool::decode(buf)?),
            WireType::U16 => WireValue::U16(u16::decode(buf)?),
            WireType::I16 => WireValue::I16(i16::decode(buf)?),
            WireType::U32 => WireValue::U32(u32::decode(buf)?),
            WireType::I32 => WireValue::I32(i32::decode(buf)?),
            WireType::U64 => WireValue::U64(u64::decode(buf)?),
            WireType::I64 => WireValue::I64(i64::decode(buf)?),
            WireType::Bytes => WireValue::Bytes(Bytes::decode(buf)?),
            WireType::Str => WireValue::Str(String::decode(buf)?),
        })
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A value that can be written into a write-mode packet.
pub trait Encode: sealed::Sealed {
    const WIRE: WireType;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), PacketError>;
}

/// A value that can be read from a read-mode packet.
pub trait Decode: Sized + sealed::Sealed {
    const WIRE: WireType;

    fn decode(buf: &mut Bytes) -> Result<Self, PacketError>;

    /// Reads `count` consecutive values.
    fn decode_many(buf: &mut Bytes, count: usize) -> Result<Vec<Self>, PacketError> {
        let mut values = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            values.push(Self::decode(buf)?);
        }
        Ok(values)
    }
}

fn ensure(buf: &Bytes, needed: usize) -> Result<(), PacketError> {
    if buf.remaining() < needed {
        return Err(PacketError::Underflow {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn put_run(buf: &mut BytesMut, data: &[u8]) -> Result<(), PacketError> {
    let len = u16::try_from(data.len()).map_err(|_| PacketError::TooLong(data.len()))?;
    buf.put_u16_le(len);
    buf.put_slice(data);
    Ok(())
}

fn take_run(buf: &mut Bytes) -> Result<Bytes, PacketError> {
    ensure(buf, 2)?;
    let len = buf.get_u16_le() as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

macro_rules! impl_fixed {
    ($($ty:ty => $wire:ident, $put:ident, $get:ident;)*) => {$(
        impl sealed::Sealed for $ty {}

        impl Encode for $ty {
            const WIRE: WireType = WireType::$wire;

            fn encode(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
                buf.$put(*self);
                Ok(())
            }
        }

        impl Decode for $ty {
            const WIRE: WireType = WireType::$wire;

            fn decode(buf: &mut Bytes) -> Result<Self, PacketError> {
                ensure(buf, std::mem::size_of::<$ty>())?;
                Ok(buf.$get())
            }
        }
    )*};
}

impl_fixed! {
    i8 => I8, put_i8, get_i8;
    u16 => U16, put_u16_le, get_u16_le;
    i16 => I16, put_i16_le, get_i16_le;
    u32 => U32, put_u32_le, get_u32_le;
    i32 => I32, put_i32_le, get_i32_le;
    u64 => U64, put_u64_le, get_u64_le;
    i64 => I64, put_i64_le, get_i64_le;
}

impl sealed::Sealed for u8 {}

impl Encode for u8 {
    const WIRE: WireType = WireType::U8;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
        buf.put_u8(*self);
        Ok(())
    }
}

impl Decode for u8 {
    const WIRE: WireType = WireType::U8;

    fn decode(buf: &mut Bytes) -> Result<Self, PacketError> {
        ensure(buf, 1)?;
        Ok(buf.get_u8())
    }

    // Byte arrays are a single bulk copy.
    fn decode_many(buf: &mut Bytes, count: usize) -> Result<Vec<Self>, PacketError> {
        ensure(buf, count)?;
        Ok(buf.split_to(count).to_vec())
    }
}

impl sealed::Sealed for bool {}

impl Encode for bool {
    const WIRE: WireType = WireType::Bool;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
        buf.put_u8(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    const WIRE: WireType = WireType::Bool;

    fn decode(buf: &mut Bytes) -> Result<Self, PacketError> {
        ensure(buf, 1)?;
        Ok(buf.get_u8() != 0)
    }
}

impl sealed::Sealed for &str {}

impl Encode for &str {
    const WIRE: WireType = WireType::Str;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
        if !self.is_ascii() {
            return Err(PacketError::NonAscii);
        }
        put_run(buf, self.as_bytes())
    }
}

impl sealed::Sealed for String {}

impl Encode for String {
    const WIRE: WireType = WireType::Str;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
        self.as_str().encode(buf)
    }
}

impl Decode for String {
    const WIRE: WireType = WireType::Str;

    fn decode(buf: &mut Bytes) -> Result<Self, PacketError> {
        let run = take_run(buf)?;
        if !run.is_ascii() {
            return Err(PacketError::NonAscii);
        }
        // ASCII is always valid UTF-8.
        Ok(run.iter().map(|&b| b as char).collect())
    }
}

impl sealed::Sealed for &[u8] {}

impl Encode for &[u8] {
    const WIRE: WireType = WireType::Bytes;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
        put_run(buf, self)
    }
}

impl sealed::Sealed for Vec<u8> {}

impl Encode for Vec<u8> {
    const WIRE: WireType = WireType::Bytes;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
        put_run(buf, self)
    }
}

impl Decode for Vec<u8> {
    const WIRE: WireType = WireType::Bytes;

    fn decode(buf: &mut Bytes) -> Result<Self, PacketError> {
        Ok(take_run(buf)?.to_vec())
    }
}

impl sealed::Sealed for Bytes {}

impl Encode for Bytes {
    const WIRE: WireType = WireType::Bytes;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
        put_run(buf, self)
    }
}

impl Decode for Bytes {
    const WIRE: WireType = WireType::Bytes;

    fn decode(buf: &mut Bytes) -> Result<Self, PacketError> {
        take_run(buf)
    }
}
