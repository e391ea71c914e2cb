// Fri Feb 6 2026 - Alex

use crate::layout::{FieldDef, FieldKind, StructLayout};
use crate::memory::Address;
use crate::name::TypeName;
use crate::session::{Rejection, Session};
use crate::structs::BaseClassArray;
use bitflags::bitflags;
use std::sync::Arc;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChdAttributes: u32 {
        const MULTIPLE_INHERITANCE  = 0x0000_0001;
        const VIRTUAL_INHERITANCE   = 0x0000_0002;
        const AMBIGUOUS_INHERITANCE = 0x0000_0004;
    }
}

static LAYOUT: StructLayout = StructLayout::new(
    "ClassHierarchyDescriptor",
    &[
        FieldDef::new("signature", FieldKind::UInt(4)),
        FieldDef::new("attributes", FieldKind::UInt(4)),
        FieldDef::new("numBaseClasses", FieldKind::UInt(4)),
        FieldDef::new("pBaseClassArray", FieldKind::Offset),
    ],
);

const FIELD_ATTRIBUTES: usize = 1;
const FIELD_NUM_BASE_CLASSES: usize = 2;
const FIELD_BASE_CLASS_ARRAY: usize = 3;

/// Summary of one class's inheritance shape, pointing at the flattened
/// base-class array. One per class; every locator for the class's vftables
/// references the same descriptor.
#[derive(Debug)]
pub struct ClassHierarchyDescriptor {
    pub address: Address,
    pub attributes: ChdAttributes,
    pub base_class_array: BaseClassArray,
}

impl ClassHierarchyDescriptor {
    /// The owning class's descriptor is always entry 0.
    pub fn type_name(&self) -> Option<&TypeName> {
        self.base_class_array
            .entries
            .first()
            .and_then(|bcd| bcd.type_descriptor.type_name.as_ref())
    }

    pub fn build(session: &Session, address: Address) -> Result<Arc<Self>, Rejection> {
        session
            .class_hierarchy_descriptors
            .get_or_build(address, || Self::decode(session, address))
    }

    fn decode(session: &Session, address: Address) -> Result<Self, Rejection> {
        let env = session.env();
        let image = session.image();
        if !address.is_aligned(LAYOUT.alignment(env)) {
            return Err(Rejection::Misaligned { structure: LAYOUT.name, address });
        }

        let signature = image
            .read_u32(address)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        if signature != 0 {
            return Err(Rejection::invariant(LAYOUT.name, address, "non-zero signature"));
        }

        let raw_attributes = image
            .read_u32(address + LAYOUT.offset_of(FIELD_ATTRIBUTES, env) as u64)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        let num_base_classes = image
            .read_u32(address + LAYOUT.offset_of(FIELD_NUM_BASE_CLASSES, env) as u64)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        if num_base_classes == 0 {
            return Err(Rejection::invariant(LAYOUT.name, address, "empty base class array"));
        }

        let bca_address = session
            .codec()
            .read_offset(image, address + LAYOUT.offset_of(FIELD_BASE_CLASS_ARRAY, env) as u64)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        let base_class_array = BaseClassArray::decode(session, bca_address, num_base_classes)?;

        Ok(Self {
            address,
            attributes: ChdAttributes::from_bits_retain(raw_attributes),
            base_class_array,
        })
    }
}
