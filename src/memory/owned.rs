// Tue Feb 3 2026 - Alex

use crate::arch::{uint_bytes, TargetArch};
use crate::memory::{
    Address, AddressRange, ByteImage, MemoryError, Section, SectionSemantics,
};

/// Image backed by an owned, contiguous byte buffer starting at the base
/// address. Holes between sections read as zero bytes.
pub struct OwnedImage {
    base: Address,
    arch: TargetArch,
    data: Vec<u8>,
    sections: Vec<Section>,
    exception_directory: Option<AddressRange>,
}

impl OwnedImage {
    pub fn builder(base: Address, arch: TargetArch) -> OwnedImageBuilder {
        OwnedImageBuilder::new(base, arch)
    }

    pub fn end(&self) -> Address {
        self.base + self.data.len() as u64
    }

    fn offset_of(&self, addr: Address) -> Option<usize> {
        if addr < self.base {
            return None;
        }
        let offset = (addr - self.base) as usize;
        (offset <= self.data.len()).then_some(offset)
    }
}

impl ByteImage for OwnedImage {
    fn base(&self) -> Address {
        self.base
    }

    fn arch(&self) -> TargetArch {
        self.arch
    }

    fn read_bytes(&self, addr: Address, len: usize) -> Result<Vec<u8>, MemoryError> {
        let start = self
            .offset_of(addr)
            .ok_or(MemoryError::OutOfBounds { address: addr, len })?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(MemoryError::OutOfBounds { address: addr, len })?;
        Ok(self.data[start..end].to_vec())
    }

    fn sections(&self) -> &[Section] {
        &self.sections
    }

    fn exception_directory(&self) -> Option<AddressRange> {
        self.exception_directory
    }
}

/// Builder for in-memory images. Used by tests to lay out synthetic MSVC
/// metadata and by callers that already hold a flat image dump.
pub struct OwnedImageBuilder {
    base: Address,
    arch: TargetArch,
    data: Vec<u8>,
    sections: Vec<Section>,
    exception_directory: Option<AddressRange>,
}

impl OwnedImageBuilder {
    pub fn new(base: Address, arch: TargetArch) -> Self {
        Self {
            base,
            arch,
            data: Vec::new(),
            sections: Vec::new(),
            exception_directory: None,
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn arch(&self) -> TargetArch {
        self.arch
    }

    pub fn section(mut self, name: &str, range: AddressRange, semantics: SectionSemantics) -> Self {
        self.reserve(range.end);
        self.sections.push(Section::new(name, range, semantics));
        self
    }

    pub fn exception_directory(mut self, range: AddressRange) -> Self {
        self.exception_directory = Some(range);
        self
    }

    fn reserve(&mut self, end: Address) {
        let needed = (end - self.base) as usize;
        if needed > self.data.len() {
            self.data.resize(needed, 0);
        }
    }

    pub fn write_bytes(&mut self, addr: Address, bytes: &[u8]) -> &mut Self {
        self.reserve(addr + bytes.len() as u64);
        let offset = (addr - self.base) as usize;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self
    }

    pub fn write_u8(&mut self, addr: Address, value: u8) -> &mut Self {
        self.write_bytes(addr, &[value])
    }

    pub fn write_u16(&mut self, addr: Address, value: u16) -> &mut Self {
        let bytes = uint_bytes(value as u64, 2, self.arch.endianness());
        self.write_bytes(addr, &bytes)
    }

    pub fn write_u32(&mut self, addr: Address, value: u32) -> &mut Self {
        let bytes = uint_bytes(value as u64, 4, self.arch.endianness());
        self.write_bytes(addr, &bytes)
    }

    pub fn write_i32(&mut self, addr: Address, value: i32) -> &mut Self {
        self.write_u32(addr, value as u32)
    }

    pub fn write_u64(&mut self, addr: Address, value: u64) -> &mut Self {
        let bytes = uint_bytes(value, 8, self.arch.endianness());
        self.write_bytes(addr, &bytes)
    }

    pub fn write_ptr(&mut self, addr: Address, value: Address) -> &mut Self {
        let bytes = uint_bytes(
            value.as_u64(),
            self.arch.pointer_size(),
            self.arch.endianness(),
        );
        self.write_bytes(addr, &bytes)
    }

    pub fn write_c_string(&mut self, addr: Address, value: &str) -> &mut Self {
        self.write_bytes(addr, value.as_bytes());
        self.write_u8(addr + value.len() as u64, 0)
    }

    pub fn build(self) -> OwnedImage {
        OwnedImage {
            base: self.base,
            arch: self.arch,
            data: self.data,
            sections: self.sections,
            exception_directory: self.exception_directory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_reads() {
        let base = Address::new(0x140000000);
        let mut builder = OwnedImage::builder(base, TargetArch::X64).section(
            ".rdata",
            AddressRange::with_size(base, 0x100),
            SectionSemantics::ReadOnlyData,
        );
        builder.write_u32(base, 0x11223344);
        builder.write_ptr(base + 8, Address::new(0x140001000));
        builder.write_c_string(base + 0x20, ".?AVFoo@@");
        let image = builder.build();

        assert_eq!(image.read_u32(base).unwrap(), 0x11223344);
        assert_eq!(image.read_u16(base).unwrap(), 0x3344);
        assert_eq!(image.read_ptr(base + 8).unwrap(), Address::new(0x140001000));
        assert_eq!(image.read_c_string(base + 0x20, 64).unwrap(), ".?AVFoo@@");
        assert!(image.read_bytes(base + 0x100, 1).is_err());
        assert!(image.read_bytes(base - 1, 1).is_err());
    }

    #[test]
    fn test_unterminated_string() {
        let base = Address::new(0x1000);
        let mut builder = OwnedImage::builder(base, TargetArch::X86).section(
            ".data",
            AddressRange::with_size(base, 0x10),
            SectionSemantics::ReadWriteData,
        );
        builder.write_bytes(base, &[b'A'; 0x10]);
        let image = builder.build();
        assert!(matches!(
            image.read_c_string(base, 8),
            Err(MemoryError::UnterminatedString { .. })
        ));
    }
}
