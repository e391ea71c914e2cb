// Mon Feb 9 2026 - Alex

//! Nibble-length-prefixed variable-width integers used throughout the
//! compact exception tables. The low four bits of the first byte select one
//! of 16 length codes (a unary run of trailing one bits); the encoded value
//! occupies the remaining bits of a 1-4 byte little-endian field, or a full
//! u32 after a 5-byte marker.

use crate::memory::{Address, ByteImage, MemoryError};

pub const LENGTH_TABLE: [usize; 16] = [1, 2, 1, 3, 1, 2, 1, 4, 1, 2, 1, 3, 1, 2, 1, 5];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedInt {
    pub value: u32,
    /// Total encoded width in bytes, 1 through 5.
    pub width: usize,
}

pub fn read_compressed_int(
    image: &dyn ByteImage,
    addr: Address,
) -> Result<CompressedInt, MemoryError> {
    let first = image.read_u8(addr)?;
    let width = LENGTH_TABLE[(first & 0x0F) as usize];
    if width == 5 {
        let value = image.read_u32(addr + 1)?;
        return Ok(CompressedInt { value, width });
    }

    let bytes = image.read_bytes(addr, width)?;
    let mut raw: u32 = 0;
    for (i, b) in bytes.iter().enumerate() {
        raw |= u32::from(*b) << (8 * i);
    }
    Ok(CompressedInt { value: raw >> width, width })
}

/// Smallest encoding of `value`.
pub fn encode_compressed_int(value: u32) -> Vec<u8> {
    for width in 1..=4usize {
        if value < 1u32 << (7 * width) {
            return encode_with_width(value, width);
        }
    }
    encode_with_width(value, 5)
}

/// Encodes `value` at an explicit width; panics if it does not fit. Only
/// meaningful widths are 1-5.
pub fn encode_with_width(value: u32, width: usize) -> Vec<u8> {
    assert!((1..=5).contains(&width));
    if width == 5 {
        let mut out = vec![0x0F];
        out.extend_from_slice(&value.to_le_bytes());
        return out;
    }
    assert!(value < 1u32 << (7 * width), "value does not fit in width {}", width);
    // Low `width` bits are a run of width-1 ones closed by a zero.
    let marker = (1u32 << (width - 1)) - 1;
    let raw = (value << width) | marker;
    raw.to_le_bytes()[..width].to_vec()
}

/// Cursor over consecutive compact-table fields.
pub struct CompressedReader<'a> {
    image: &'a dyn ByteImage,
    pos: Address,
}

impl<'a> CompressedReader<'a> {
    pub fn new(image: &'a dyn ByteImage, start: Address) -> Self {
        Self { image, pos: start }
    }

    pub fn position(&self) -> Address {
        self.pos
    }

    pub fn read_compressed(&mut self) -> Result<u32, MemoryError> {
        let ci = read_compressed_int(self.image, self.pos)?;
        self.pos = self.pos + ci.width as u64;
        Ok(ci.value)
    }

    pub fn read_u8(&mut self) -> Result<u8, MemoryError> {
        let value = self.image.read_u8(self.pos)?;
        self.pos = self.pos + 1;
        Ok(value)
    }

    /// 32-bit image-base displacement field, resolved to an address. Zero
    /// stays the null address.
    pub fn read_disp(&mut self) -> Result<Address, MemoryError> {
        let raw = self.image.read_u32(self.pos)?;
        self.pos = self.pos + 4;
        if raw == 0 {
            Ok(Address::zero())
        } else {
            Ok(self.image.base() + u64::from(raw))
        }
    }
}
