// Tue Feb 3 2026 - Alex

use crate::arch::{read_uint, TargetArch};
use crate::memory::{Address, AddressRange, MemoryError, Section, SectionSemantics};

/// Random-access view over the bytes of one loaded target image.
///
/// The engine only ever reads through this trait; it never mutates the
/// image. Typed reads honor the target's endianness and pointer width.
pub trait ByteImage: Send + Sync {
    /// Image base load address.
    fn base(&self) -> Address;

    fn arch(&self) -> TargetArch;

    fn read_bytes(&self, addr: Address, len: usize) -> Result<Vec<u8>, MemoryError>;

    fn sections(&self) -> &[Section];

    /// Address range of the platform exception directory, when the target
    /// uses table-based unwinding.
    fn exception_directory(&self) -> Option<AddressRange> {
        None
    }

    fn read_u8(&self, addr: Address) -> Result<u8, MemoryError> {
        Ok(self.read_bytes(addr, 1)?[0])
    }

    fn read_u16(&self, addr: Address) -> Result<u16, MemoryError> {
        let bytes = self.read_bytes(addr, 2)?;
        Ok(read_uint(&bytes, self.arch().endianness()) as u16)
    }

    fn read_u32(&self, addr: Address) -> Result<u32, MemoryError> {
        let bytes = self.read_bytes(addr, 4)?;
        Ok(read_uint(&bytes, self.arch().endianness()) as u32)
    }

    fn read_u64(&self, addr: Address) -> Result<u64, MemoryError> {
        let bytes = self.read_bytes(addr, 8)?;
        Ok(read_uint(&bytes, self.arch().endianness()))
    }

    fn read_i32(&self, addr: Address) -> Result<i32, MemoryError> {
        Ok(self.read_u32(addr)? as i32)
    }

    fn read_ptr(&self, addr: Address) -> Result<Address, MemoryError> {
        let width = self.arch().pointer_size();
        let bytes = self.read_bytes(addr, width)?;
        Ok(Address::new(read_uint(&bytes, self.arch().endianness())))
    }

    /// Reads a NUL-terminated ASCII string, rejecting unterminated or
    /// non-ASCII data.
    fn read_c_string(&self, addr: Address, max_len: usize) -> Result<String, MemoryError> {
        let mut out = Vec::new();
        let mut cursor = addr;
        // Chunked so short strings near a section end still resolve.
        while out.len() < max_len {
            let want = (max_len - out.len()).min(0x100);
            let chunk = match self.read_bytes(cursor, want) {
                Ok(chunk) => chunk,
                Err(_) if want > 1 => self.read_bytes(cursor, 1)?,
                Err(e) => return Err(e),
            };
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                if !out.is_ascii() {
                    return Err(MemoryError::InvalidString { address: addr });
                }
                return String::from_utf8(out)
                    .map_err(|_| MemoryError::InvalidString { address: addr });
            }
            cursor = cursor + chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        Err(MemoryError::UnterminatedString { address: addr, max_len })
    }
}

/// Data sections (read-only and read-write) in image order.
pub fn data_sections(image: &dyn ByteImage) -> Vec<&Section> {
    image.sections().iter().filter(|s| s.is_data()).collect()
}

pub fn sections_at(image: &dyn ByteImage, addr: Address) -> Vec<&Section> {
    image
        .sections()
        .iter()
        .filter(|s| s.contains(addr))
        .collect()
}

pub fn is_data_address(image: &dyn ByteImage, addr: Address) -> bool {
    sections_at(image, addr).iter().any(|s| s.is_data())
}

pub fn is_code_address(image: &dyn ByteImage, addr: Address) -> bool {
    sections_at(image, addr)
        .iter()
        .any(|s| s.semantics == SectionSemantics::ReadOnlyCode)
}
