// Tue Feb 3 2026 - Alex

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Endianness {
    Little,
    Big,
}

/// Target architecture facts the recovery engine needs: pointer width,
/// byte order, and whether RTTI/EH offsets are image-relative displacements
/// instead of absolute pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TargetArch {
    X86,
    X64,
}

impl TargetArch {
    pub fn pointer_size(&self) -> usize {
        match self {
            TargetArch::X86 => 4,
            TargetArch::X64 => 8,
        }
    }

    pub fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    /// MSVC switched to 32-bit image-relative displacements for every
    /// RTTI/EH cross-reference on 64-bit targets.
    pub fn uses_relative_offsets(&self) -> bool {
        matches!(self, TargetArch::X64)
    }
}

pub fn read_uint(bytes: &[u8], endianness: Endianness) -> u64 {
    let mut value = 0u64;
    match endianness {
        Endianness::Little => {
            for (i, b) in bytes.iter().enumerate() {
                value |= (*b as u64) << (8 * i);
            }
        }
        Endianness::Big => {
            for b in bytes {
                value = (value << 8) | *b as u64;
            }
        }
    }
    value
}

pub fn uint_bytes(value: u64, width: usize, endianness: Endianness) -> Vec<u8> {
    let mut out = Vec::with_capacity(width);
    match endianness {
        Endianness::Little => {
            for i in 0..width {
                out.push((value >> (8 * i)) as u8);
            }
        }
        Endianness::Big => {
            for i in (0..width).rev() {
                out.push((value >> (8 * i)) as u8);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_sizes() {
        assert_eq!(TargetArch::X86.pointer_size(), 4);
        assert_eq!(TargetArch::X64.pointer_size(), 8);
        assert!(!TargetArch::X86.uses_relative_offsets());
        assert!(TargetArch::X64.uses_relative_offsets());
    }

    #[test]
    fn test_uint_round_trip() {
        let bytes = uint_bytes(0xDEADBEEF, 4, Endianness::Little);
        assert_eq!(bytes, vec![0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(read_uint(&bytes, Endianness::Little), 0xDEADBEEF);

        let bytes = uint_bytes(0xDEADBEEF, 4, Endianness::Big);
        assert_eq!(bytes, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(read_uint(&bytes, Endianness::Big), 0xDEADBEEF);
    }
}
