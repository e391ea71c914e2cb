// Fri Feb 6 2026 - Alex

use crate::layout::{FieldDef, FieldKind, StructLayout};
use crate::memory::Address;
use crate::session::{Rejection, Session};
use crate::structs::{ClassHierarchyDescriptor, TypeDescriptor};
use bitflags::bitflags;
use std::sync::Arc;

/// Member-pointer displacement triple: member offset, vbtable offset, and
/// displacement inside the vbtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Pmd {
    pub mdisp: i32,
    pub pdisp: i32,
    pub vdisp: i32,
}

pub(crate) static PMD_LAYOUT: StructLayout = StructLayout::new(
    "Pmd",
    &[
        FieldDef::new("mdisp", FieldKind::Int(4)),
        FieldDef::new("pdisp", FieldKind::Int(4)),
        FieldDef::new("vdisp", FieldKind::Int(4)),
    ],
);

impl Pmd {
    pub(crate) fn read(
        session: &Session,
        structure: &'static str,
        address: Address,
    ) -> Result<Self, Rejection> {
        let image = session.image();
        let read = |off: u64| {
            image
                .read_i32(address + off)
                .map_err(|e| Rejection::unreadable(structure, address, e))
        };
        Ok(Self { mdisp: read(0)?, pdisp: read(4)?, vdisp: read(8)? })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BcdAttributes: u32 {
        const NOT_VISIBLE            = 0x0000_0001;
        const AMBIGUOUS              = 0x0000_0002;
        const PRIV_OR_PROT_BASE      = 0x0000_0004;
        const PRIV_OR_PROT_IN_COMP_OBJ = 0x0000_0008;
        const VBASE_OF_CONTAINING_OBJ = 0x0000_0010;
        const NON_POLYMORPHIC        = 0x0000_0020;
        const HAS_HIERARCHY_DESCRIPTOR = 0x0000_0040;
    }
}

static LAYOUT: StructLayout = StructLayout::new(
    "BaseClassDescriptor",
    &[
        FieldDef::new("pTypeDescriptor", FieldKind::Offset),
        FieldDef::new("numContainedBases", FieldKind::UInt(4)),
        FieldDef::new("where", FieldKind::Embedded(&PMD_LAYOUT)),
        FieldDef::new("attributes", FieldKind::UInt(4)),
        FieldDef::new("pClassDescriptor", FieldKind::Offset),
    ],
);

const FIELD_NUM_CONTAINED: usize = 1;
const FIELD_WHERE: usize = 2;
const FIELD_ATTRIBUTES: usize = 3;
const FIELD_CLASS_DESCRIPTOR: usize = 4;

/// One flattened entry of a class's base-class array.
#[derive(Debug)]
pub struct BaseClassDescriptor {
    pub address: Address,
    pub type_descriptor: Arc<TypeDescriptor>,
    pub num_contained_bases: u32,
    pub displacement: Pmd,
    pub attributes: BcdAttributes,
    /// Address of the nested hierarchy descriptor when the attribute flag
    /// carries one. Kept as an address rather than a built instance: the
    /// first array entry's nested descriptor is the owning descriptor
    /// itself, which is still mid-construction when this entry decodes.
    pub class_hierarchy_descriptor: Option<Address>,
}

impl BaseClassDescriptor {
    pub fn is_virtual(&self) -> bool {
        self.attributes.contains(BcdAttributes::VBASE_OF_CONTAINING_OBJ)
    }

    /// Resolves the nested hierarchy descriptor through the session cache.
    pub fn nested_hierarchy(
        &self,
        session: &Session,
    ) -> Option<Result<Arc<ClassHierarchyDescriptor>, Rejection>> {
        self.class_hierarchy_descriptor
            .map(|addr| ClassHierarchyDescriptor::build(session, addr))
    }

    pub fn build(session: &Session, address: Address) -> Result<Arc<Self>, Rejection> {
        session
            .base_class_descriptors
            .get_or_build(address, || Self::decode(session, address))
    }

    fn decode(session: &Session, address: Address) -> Result<Self, Rejection> {
        let env = session.env();
        let image = session.image();
        if !address.is_aligned(LAYOUT.alignment(env)) {
            return Err(Rejection::Misaligned { structure: LAYOUT.name, address });
        }

        let td_address = session
            .codec()
            .read_offset(image, address)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        let type_descriptor = TypeDescriptor::build(session, td_address)?;

        let num_contained_bases = image
            .read_u32(address + LAYOUT.offset_of(FIELD_NUM_CONTAINED, env) as u64)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        let displacement = Pmd::read(
            session,
            LAYOUT.name,
            address + LAYOUT.offset_of(FIELD_WHERE, env) as u64,
        )?;

        let raw_attributes = image
            .read_u32(address + LAYOUT.offset_of(FIELD_ATTRIBUTES, env) as u64)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        let attributes = BcdAttributes::from_bits_retain(raw_attributes);

        let class_hierarchy_descriptor =
            if attributes.contains(BcdAttributes::HAS_HIERARCHY_DESCRIPTOR) {
                let chd_address = session
                    .codec()
                    .read_offset(image, address + LAYOUT.offset_of(FIELD_CLASS_DESCRIPTOR, env) as u64)
                    .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
                if chd_address.is_null() {
                    return Err(Rejection::invariant(
                        LAYOUT.name,
                        address,
                        "hierarchy flag set but descriptor reference is null",
                    ));
                }
                Some(chd_address)
            } else {
                None
            };

        Ok(Self {
            address,
            type_descriptor,
            num_contained_bases,
            displacement,
            attributes,
            class_hierarchy_descriptor,
        })
    }
}

/// Ordered view over one class's flattened base-class array. Entry 0 is the
/// class itself; the length comes from the owning hierarchy descriptor.
#[derive(Debug)]
pub struct BaseClassArray {
    pub address: Address,
    pub entries: Vec<Arc<BaseClassDescriptor>>,
}

impl BaseClassArray {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn decode(
        session: &Session,
        address: Address,
        length: u32,
    ) -> Result<Self, Rejection> {
        const STRUCTURE: &str = "BaseClassArray";
        let env = session.env();
        let image = session.image();
        let width = env.offset_width() as u64;
        if !address.is_aligned(width) {
            return Err(Rejection::Misaligned { structure: STRUCTURE, address });
        }

        let mut entries = Vec::with_capacity(length as usize);
        for i in 0..length as u64 {
            let bcd_address = session
                .codec()
                .read_offset(image, address + i * width)
                .map_err(|e| Rejection::unreadable(STRUCTURE, address, e))?;
            entries.push(BaseClassDescriptor::build(session, bcd_address)?);
        }
        Ok(Self { address, entries })
    }
}
