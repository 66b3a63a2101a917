//! Bounds-checked binary reading and little-endian writing for the on-disk formats.
//!
//! Every read names what it is reading, so a short buffer produces an error like "not enough bytes for TOC entry
//! offset" instead of a bare index failure.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not enough bytes for {what}: needed {needed} at offset {offset}, {available} available")]
pub struct Truncated {
    pub what: &'static str,
    pub offset: usize,
    pub needed: usize,
    pub available: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{len} bytes is too long for a length-prefixed string")]
pub struct StringTooLong {
    pub len: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

macro_rules! checked_read {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, what: &'static str) -> Result<$ty, Truncated> {
            let bytes = self.read_array::<{ std::mem::size_of::<$ty>() }>(what)?;
            Ok(match self.order {
                ByteOrder::Little => <$ty>::from_le_bytes(bytes),
                ByteOrder::Big => <$ty>::from_be_bytes(bytes),
            })
        }
    };
}

/// Cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    position: usize,
    order: ByteOrder,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> ByteReader<'a> {
        ByteReader::with_order(data, ByteOrder::Little)
    }

    pub fn with_order(data: &'a [u8], order: ByteOrder) -> ByteReader<'a> {
        ByteReader {
            data,
            position: 0,
            order,
        }
    }

    pub fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn read_bytes(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], Truncated> {
        if len > self.remaining() {
            return Err(Truncated {
                what,
                offset: self.position,
                needed: len,
                available: self.remaining(),
            });
        }

        let bytes = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], Truncated> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N, what)?);
        Ok(out)
    }

    checked_read!(read_u16, u16);
    checked_read!(read_u32, u32);
    checked_read!(read_u64, u64);
    checked_read!(read_i64, i64);

    /// Read a `u16` length followed by that many bytes.
    pub fn read_string(&mut self, what: &'static str) -> Result<&'a [u8], Truncated> {
        let len = self.read_u16(what)?;
        self.read_bytes(len as usize, what)
    }
}

/// Little-endian output buffer, the counterpart of [ByteReader].
#[derive(Debug, Clone, Default)]
pub struct ByteWriter {
    buffer: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> ByteWriter {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), StringTooLong> {
        let len = u16::try_from(value.len()).map_err(|_| StringTooLong { len: value.len() })?;
        self.write_u16(len);
        self.write_bytes(value.as_bytes());
        Ok(())
    }

    /// Overwrite a `u32` written earlier, e.g. a header field whose value is only known at the end.
    ///
    /// Panics if `at..at + 4` is out of bounds, which would mean the caller lost track of its own layout.
    pub fn patch_u32(&mut self, at: usize, value: u32) {
        self.buffer[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}
