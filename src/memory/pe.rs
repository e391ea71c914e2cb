// Wed Feb 4 2026 - Alex

use crate::arch::TargetArch;
use crate::memory::{
    Address, AddressRange, ByteImage, MemoryError, OwnedImage, Section, SectionSemantics,
};
use goblin::pe::section_table::{
    IMAGE_SCN_CNT_CODE, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_WRITE,
};
use goblin::pe::PE;
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// PE-backed image: sections mapped at their virtual addresses, with the
/// exception directory exposed for table-based unwinding targets.
pub struct PeImage {
    inner: OwnedImage,
    path: PathBuf,
}

impl PeImage {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, MemoryError> {
        let file = File::open(path.as_ref())?;
        let mapping = unsafe { Mmap::map(&file)? };
        let inner = Self::parse(&mapping)?;
        Ok(Self {
            inner,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn parse_bytes(data: &[u8]) -> Result<Self, MemoryError> {
        Ok(Self {
            inner: Self::parse(data)?,
            path: PathBuf::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(data: &[u8]) -> Result<OwnedImage, MemoryError> {
        let pe = PE::parse(data)
            .map_err(|e| MemoryError::BinaryParse(format!("failed to parse PE: {}", e)))?;

        let arch = match pe.header.coff_header.machine {
            goblin::pe::header::COFF_MACHINE_X86 => TargetArch::X86,
            goblin::pe::header::COFF_MACHINE_X86_64 => TargetArch::X64,
            other => {
                return Err(MemoryError::BinaryParse(format!(
                    "unsupported machine type 0x{:x}",
                    other
                )))
            }
        };

        let base = Address::new(pe.image_base as u64);
        let mut builder = OwnedImage::builder(base, arch);

        let mut sections = Vec::new();
        let mut writes: Vec<(Address, Vec<u8>)> = Vec::new();
        for section in &pe.sections {
            let name = section.name().unwrap_or("").to_string();
            let va = base + section.virtual_address as u64;
            let vsize = section.virtual_size.max(section.size_of_raw_data) as u64;
            let range = AddressRange::with_size(va, vsize);
            sections.push(Section::new(&name, range, Self::semantics(section.characteristics)));

            let file_start = section.pointer_to_raw_data as usize;
            let file_len = (section.size_of_raw_data as usize).min(vsize as usize);
            if file_len > 0 && file_start + file_len <= data.len() {
                writes.push((va, data[file_start..file_start + file_len].to_vec()));
            }
        }

        for section in sections {
            builder = builder.section(&section.name, section.range, section.semantics);
        }
        for (va, bytes) in writes {
            builder.write_bytes(va, &bytes);
        }

        if let Some(optional) = pe.header.optional_header {
            if let Some(dir) = optional.data_directories.get_exception_table() {
                if dir.size > 0 {
                    builder = builder.exception_directory(AddressRange::with_size(
                        base + dir.virtual_address as u64,
                        dir.size as u64,
                    ));
                }
            }
        }

        Ok(builder.build())
    }

    fn semantics(characteristics: u32) -> SectionSemantics {
        if characteristics & (IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE) != 0 {
            SectionSemantics::ReadOnlyCode
        } else if characteristics & IMAGE_SCN_MEM_WRITE != 0 {
            SectionSemantics::ReadWriteData
        } else {
            SectionSemantics::ReadOnlyData
        }
    }
}

impl ByteImage for PeImage {
    fn base(&self) -> Address {
        self.inner.base()
    }

    fn arch(&self) -> TargetArch {
        self.inner.arch()
    }

    fn read_bytes(&self, addr: Address, len: usize) -> Result<Vec<u8>, MemoryError> {
        self.inner.read_bytes(addr, len)
    }

    fn sections(&self) -> &[Section] {
        self.inner.sections()
    }

    fn exception_directory(&self) -> Option<AddressRange> {
        self.inner.exception_directory()
    }
}
