// Wed Feb 4 2026 - Alex

//! Declarative byte layouts for the MSVC ABI structures. Each structure
//! module declares one static field table; field offsets, total fixed size,
//! and scan alignment all derive from it plus the target's offset width, so
//! the same table serves both pointer-width and image-relative targets.

use crate::arch::TargetArch;
use crate::codec::OffsetCodec;

/// Widths resolved for one target. Built once per session.
#[derive(Debug, Clone, Copy)]
pub struct LayoutEnv {
    pub arch: TargetArch,
    pub codec: OffsetCodec,
}

impl LayoutEnv {
    pub fn new(arch: TargetArch, codec: OffsetCodec) -> Self {
        Self { arch, codec }
    }

    pub fn ptr_width(&self) -> usize {
        self.arch.pointer_size()
    }

    pub fn offset_width(&self) -> usize {
        self.codec.offset_width()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Unsigned integer of a fixed byte width.
    UInt(usize),
    /// Signed integer of a fixed byte width.
    Int(usize),
    /// Cross-reference field, width set by the offset codec.
    Offset,
    /// Raw pointer-width field (never image-relative).
    Ptr,
    /// Fixed run of raw bytes.
    Bytes(usize),
    /// Embedded fixed-layout sub-structure.
    Embedded(&'static StructLayout),
    /// Trailing variable-length array; element width per kind. Must be the
    /// last field of its structure.
    Trailing(&'static FieldKind),
}

impl FieldKind {
    /// Byte width under `env`. A trailing field reports its element width.
    pub fn width(&self, env: &LayoutEnv) -> usize {
        match self {
            FieldKind::UInt(w) | FieldKind::Int(w) | FieldKind::Bytes(w) => *w,
            FieldKind::Offset => env.offset_width(),
            FieldKind::Ptr => env.ptr_width(),
            FieldKind::Embedded(layout) => layout.fixed_size(env),
            FieldKind::Trailing(element) => element.width(env),
        }
    }

    pub fn is_trailing(&self) -> bool {
        matches!(self, FieldKind::Trailing(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldDef {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StructLayout {
    pub name: &'static str,
    pub fields: &'static [FieldDef],
}

impl StructLayout {
    pub const fn new(name: &'static str, fields: &'static [FieldDef]) -> Self {
        Self { name, fields }
    }

    /// Offset of field `index` from the structure start. Indexes are the
    /// per-structure `FIELD_*` constants, so this never sees an out-of-range
    /// value at runtime.
    pub fn offset_of(&self, index: usize, env: &LayoutEnv) -> usize {
        self.fields[..index]
            .iter()
            .map(|f| f.kind.width(env))
            .sum()
    }

    pub fn field(&self, index: usize) -> &FieldDef {
        &self.fields[index]
    }

    /// Size of the fixed prefix, excluding any trailing array.
    pub fn fixed_size(&self, env: &LayoutEnv) -> usize {
        self.fields
            .iter()
            .filter(|f| !f.kind.is_trailing())
            .map(|f| f.kind.width(env))
            .sum()
    }

    /// Scan alignment is the first field's width.
    pub fn alignment(&self, env: &LayoutEnv) -> u64 {
        self.fields
            .first()
            .map(|f| f.kind.width(env) as u64)
            .unwrap_or(1)
    }

    /// Layout well-formedness: at most one trailing field, in last position.
    pub fn is_well_formed(&self) -> bool {
        self.fields
            .iter()
            .enumerate()
            .all(|(i, f)| !f.kind.is_trailing() || i == self.fields.len() - 1)
    }
}
