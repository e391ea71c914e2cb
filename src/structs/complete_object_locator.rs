// Fri Feb 6 2026 - Alex

use crate::layout::{FieldDef, FieldKind, StructLayout};
use crate::memory::{is_data_address, Address};
use crate::scanner::{CandidateScanner, PatternSet};
use crate::session::{Rejection, Session};
use crate::structs::{ClassHierarchyDescriptor, TypeDescriptor};
use std::sync::Arc;

const SIGNATURE_V0: u32 = 0;
const SIGNATURE_V1: u32 = 1;

static LAYOUT: StructLayout = StructLayout::new(
    "CompleteObjectLocator",
    &[
        FieldDef::new("signature", FieldKind::UInt(4)),
        FieldDef::new("offset", FieldKind::UInt(4)),
        FieldDef::new("cdOffset", FieldKind::UInt(4)),
        FieldDef::new("pTypeDescriptor", FieldKind::Offset),
        FieldDef::new("pClassDescriptor", FieldKind::Offset),
        // v1 only; image-relative targets append a self-reference.
        FieldDef::new("pSelf", FieldKind::Offset),
    ],
);

const FIELD_OFFSET: usize = 1;
const FIELD_CD_OFFSET: usize = 2;
const FIELD_TYPE_DESCRIPTOR: usize = 3;
const FIELD_CLASS_DESCRIPTOR: usize = 4;
const FIELD_SELF: usize = 5;

/// Connects a vftable to its owning type and hierarchy. Two on-disk
/// versions: v0 (absolute targets) and v1 (image-relative targets, with a
/// trailing self-reference). The version is a target fact, so one session
/// only ever decodes one of them.
#[derive(Debug)]
pub struct CompleteObjectLocator {
    pub address: Address,
    pub signature: u32,
    /// Displacement of this vftable's subobject inside the complete object.
    pub offset: u32,
    pub constructor_displacement_offset: u32,
    pub type_descriptor: Arc<TypeDescriptor>,
    pub class_hierarchy_descriptor: Arc<ClassHierarchyDescriptor>,
}

impl CompleteObjectLocator {
    fn expected_signature(session: &Session) -> u32 {
        if session.arch().uses_relative_offsets() {
            SIGNATURE_V1
        } else {
            SIGNATURE_V0
        }
    }

    pub fn build(session: &Session, address: Address) -> Result<Arc<Self>, Rejection> {
        session
            .complete_object_locators
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
        if signature != Self::expected_signature(session) {
            return Err(Rejection::invariant(LAYOUT.name, address, "signature mismatch"));
        }

        if signature == SIGNATURE_V1 {
            let self_offset = image
                .read_u32(address + LAYOUT.offset_of(FIELD_SELF, env) as u64)
                .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
            if u64::from(self_offset) != session.codec().encode(address) {
                return Err(Rejection::invariant(LAYOUT.name, address, "self reference mismatch"));
            }
        }

        let offset = image
            .read_u32(address + LAYOUT.offset_of(FIELD_OFFSET, env) as u64)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        let constructor_displacement_offset = image
            .read_u32(address + LAYOUT.offset_of(FIELD_CD_OFFSET, env) as u64)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;

        let td_address = session
            .codec()
            .read_offset(image, address + LAYOUT.offset_of(FIELD_TYPE_DESCRIPTOR, env) as u64)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        let type_descriptor = TypeDescriptor::build(session, td_address)?;

        let chd_address = session
            .codec()
            .read_offset(image, address + LAYOUT.offset_of(FIELD_CLASS_DESCRIPTOR, env) as u64)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        if !is_data_address(image, chd_address) {
            return Err(Rejection::invariant(
                LAYOUT.name,
                address,
                "hierarchy descriptor outside data sections",
            ));
        }
        let class_hierarchy_descriptor = ClassHierarchyDescriptor::build(session, chd_address)?;

        let first = class_hierarchy_descriptor
            .base_class_array
            .entries
            .first()
            .map(|bcd| &bcd.type_descriptor);
        if !first.is_some_and(|td| Arc::ptr_eq(td, &type_descriptor)) {
            return Err(Rejection::cross_reference(
                LAYOUT.name,
                address,
                "type descriptor disagrees with first base-class entry",
            ));
        }

        Ok(Self {
            address,
            signature,
            offset,
            constructor_displacement_offset,
            type_descriptor,
            class_hierarchy_descriptor,
        })
    }

    /// Scans for locators referencing the given descriptors: the search key
    /// is each descriptor's encoded address sitting in the pTypeDescriptor
    /// slot. Lambda types never get their own locator and only bloat the
    /// pattern set.
    pub fn search_with_type_descriptors(
        session: &Session,
        type_descriptors: &[Arc<TypeDescriptor>],
    ) -> Vec<Arc<Self>> {
        let env = session.env();
        let mut set = PatternSet::new();
        for td in type_descriptors {
            if td.is_lambda() {
                continue;
            }
            set.add_target(td.address, session.codec(), session.arch(), 0);
        }
        if set.is_empty() {
            return Vec::new();
        }

        let scanner = session.scanner();
        let candidates = CandidateScanner::new(session.image(), *session.codec(), &scanner)
            .candidates(
                &set,
                LAYOUT.offset_of(FIELD_TYPE_DESCRIPTOR, env),
                LAYOUT.alignment(env),
                session.cancel_token(),
            );

        let mut out = Vec::new();
        for candidate in candidates {
            match Self::build(session, candidate.address) {
                Ok(col) => {
                    log::debug!("defined complete object locator at {}", candidate.address);
                    out.push(col);
                }
                Err(rejection) => {
                    log::debug!("rejected complete object locator candidate: {}", rejection);
                }
            }
        }
        out
    }
}
