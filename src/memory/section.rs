// Tue Feb 3 2026 - Alex

use crate::memory::Address;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AddressRange {
    pub start: Address,
    pub end: Address,
}

impl AddressRange {
    pub fn new(start: Address, end: Address) -> Self {
        Self { start, end }
    }

    pub fn with_size(start: Address, size: u64) -> Self {
        Self { start, end: start + size }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SectionSemantics {
    ReadOnlyData,
    ReadWriteData,
    ReadOnlyCode,
    External,
}

impl SectionSemantics {
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            SectionSemantics::ReadOnlyData | SectionSemantics::ReadWriteData
        )
    }

    pub fn is_code(&self) -> bool {
        matches!(self, SectionSemantics::ReadOnlyCode)
    }
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub range: AddressRange,
    pub semantics: SectionSemantics,
}

impl Section {
    pub fn new(name: &str, range: AddressRange, semantics: SectionSemantics) -> Self {
        Self {
            name: name.to_string(),
            range,
            semantics,
        }
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.range.contains(addr)
    }

    pub fn is_data(&self) -> bool {
        self.semantics.is_data()
    }

    pub fn is_code(&self) -> bool {
        self.semantics.is_code()
    }
}
