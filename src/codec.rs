// Wed Feb 4 2026 - Alex

use crate::arch::TargetArch;
use crate::memory::{Address, ByteImage};

/// Converts between encoded in-structure offset fields and absolute
/// addresses. 32-bit targets store absolute pointers; 64-bit targets store
/// 32-bit displacements from the image base. Selected once per target and
/// threaded through every decode so no structure special-cases the
/// architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetCodec {
    Absolute { ptr_size: usize },
    ImageRelative { base: Address },
}

impl OffsetCodec {
    pub fn for_image(image: &dyn ByteImage) -> Self {
        Self::for_target(image.arch(), image.base())
    }

    pub fn for_target(arch: TargetArch, base: Address) -> Self {
        if arch.uses_relative_offsets() {
            OffsetCodec::ImageRelative { base }
        } else {
            OffsetCodec::Absolute { ptr_size: arch.pointer_size() }
        }
    }

    /// Width in bytes of an offset field under this encoding.
    pub fn offset_width(&self) -> usize {
        match self {
            OffsetCodec::Absolute { ptr_size } => *ptr_size,
            OffsetCodec::ImageRelative { .. } => 4,
        }
    }

    pub fn encode(&self, addr: Address) -> u64 {
        match self {
            OffsetCodec::Absolute { .. } => addr.as_u64(),
            OffsetCodec::ImageRelative { base } => addr.as_u64().wrapping_sub(base.as_u64()),
        }
    }

    pub fn resolve(&self, offset: u64) -> Address {
        match self {
            OffsetCodec::Absolute { .. } => Address::new(offset),
            OffsetCodec::ImageRelative { base } => {
                Address::new(base.as_u64().wrapping_add(offset))
            }
        }
    }

    /// Reads an offset field at `addr` and resolves it. A zero field decodes
    /// to the null address under both encodings.
    pub fn read_offset(
        &self,
        image: &dyn ByteImage,
        addr: Address,
    ) -> Result<Address, crate::memory::MemoryError> {
        match self {
            OffsetCodec::Absolute { .. } => image.read_ptr(addr),
            OffsetCodec::ImageRelative { .. } => {
                let raw = image.read_u32(addr)? as u64;
                if raw == 0 {
                    Ok(Address::zero())
                } else {
                    Ok(self.resolve(raw))
                }
            }
        }
    }

    /// The exact bytes an offset field referencing `addr` holds on disk.
    /// Used to build search patterns for structures that embed it.
    pub fn encoded_bytes(&self, addr: Address, arch: TargetArch) -> Vec<u8> {
        crate::arch::uint_bytes(self.encode(addr), self.offset_width(), arch.endianness())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_round_trip() {
        let codec = OffsetCodec::for_target(TargetArch::X86, Address::new(0x400000));
        assert_eq!(codec.offset_width(), 4);
        let addr = Address::new(0x401234);
        assert_eq!(codec.resolve(codec.encode(addr)), addr);
        assert_eq!(codec.encode(addr), 0x401234);
    }

    #[test]
    fn test_relative_round_trip() {
        let codec = OffsetCodec::for_target(TargetArch::X64, Address::new(0x140000000));
        assert_eq!(codec.offset_width(), 4);
        let addr = Address::new(0x140001234);
        assert_eq!(codec.encode(addr), 0x1234);
        assert_eq!(codec.resolve(codec.encode(addr)), addr);
    }

    #[test]
    fn test_encoded_bytes() {
        let codec = OffsetCodec::for_target(TargetArch::X64, Address::new(0x140000000));
        let bytes = codec.encoded_bytes(Address::new(0x140001234), TargetArch::X64);
        assert_eq!(bytes, vec![0x34, 0x12, 0x00, 0x00]);
    }
}
