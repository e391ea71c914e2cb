// Mon Feb 9 2026 - Alex

use crate::layout::{FieldDef, FieldKind, StructLayout};
use crate::memory::Address;
use crate::scanner::{CandidateScanner, PatternSet};
use crate::session::{Rejection, Session};
use crate::structs::base_class_descriptor::PMD_LAYOUT;
use crate::structs::{Pmd, TypeDescriptor};
use bitflags::bitflags;
use std::sync::Arc;

const PATTERN_SHIFT: usize = 2;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtProperties: u32 {
        const IS_SIMPLE_TYPE    = 0x0000_0001;
        const BY_REFERENCE_ONLY = 0x0000_0002;
        const HAS_VIRTUAL_BASE  = 0x0000_0004;
        const IS_WINRT_HANDLE   = 0x0000_0008;
        const IS_STD_BAD_ALLOC  = 0x0000_0010;
    }
}

static LAYOUT: StructLayout = StructLayout::new(
    "CatchableType",
    &[
        FieldDef::new("properties", FieldKind::UInt(4)),
        FieldDef::new("pType", FieldKind::Offset),
        FieldDef::new("thisDisplacement", FieldKind::Embedded(&PMD_LAYOUT)),
        FieldDef::new("sizeOrOffset", FieldKind::Int(4)),
        FieldDef::new("copyFunction", FieldKind::Offset),
    ],
);

const FIELD_TYPE: usize = 1;
const FIELD_THIS_DISPLACEMENT: usize = 2;
const FIELD_SIZE_OR_OFFSET: usize = 3;
const FIELD_COPY_FUNCTION: usize = 4;

/// Describes one type a thrown object can be caught as.
#[derive(Debug)]
pub struct CatchableType {
    pub address: Address,
    pub properties: CtProperties,
    pub type_descriptor: Arc<TypeDescriptor>,
    pub this_displacement: Pmd,
    pub size_or_offset: i32,
    pub copy_function: Option<Address>,
}

impl CatchableType {
    pub fn build(session: &Session, address: Address) -> Result<Arc<Self>, Rejection> {
        session
            .catchable_types
            .get_or_build(address, || Self::decode(session, address))
    }

    fn decode(session: &Session, address: Address) -> Result<Self, Rejection> {
        let env = session.env();
        let image = session.image();
        if !address.is_aligned(LAYOUT.alignment(env)) {
            return Err(Rejection::Misaligned { structure: LAYOUT.name, address });
        }

        let raw_properties = image
            .read_u32(address)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;

        let td_address = session
            .codec()
            .read_offset(image, address + LAYOUT.offset_of(FIELD_TYPE, env) as u64)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        let type_descriptor = TypeDescriptor::build(session, td_address)?;

        let this_displacement = Pmd::read(
            session,
            LAYOUT.name,
            address + LAYOUT.offset_of(FIELD_THIS_DISPLACEMENT, env) as u64,
        )?;
        let size_or_offset = image
            .read_i32(address + LAYOUT.offset_of(FIELD_SIZE_OR_OFFSET, env) as u64)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;

        let copy_function = session
            .codec()
            .read_offset(image, address + LAYOUT.offset_of(FIELD_COPY_FUNCTION, env) as u64)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        let copy_function = (!copy_function.is_null()).then_some(copy_function);

        Ok(Self {
            address,
            properties: CtProperties::from_bits_retain(raw_properties),
            type_descriptor,
            this_displacement,
            size_or_offset,
            copy_function,
        })
    }

    /// Keyed on known descriptors in the pType slot; a candidate must also
    /// carry a copy-function reference that lands on plausible code (or
    /// none at all, for trivially-copyable types).
    pub fn search_with_type_descriptors(
        session: &Session,
        type_descriptors: &[Arc<TypeDescriptor>],
    ) -> Vec<Arc<Self>> {
        let env = session.env();
        let mut set = PatternSet::new();
        for td in type_descriptors {
            set.add_target(td.address, session.codec(), session.arch(), PATTERN_SHIFT);
        }
        if set.is_empty() {
            return Vec::new();
        }

        let scanner = session.scanner();
        let candidates = CandidateScanner::new(session.image(), *session.codec(), &scanner)
            .candidates(
                &set,
                LAYOUT.offset_of(FIELD_TYPE, env),
                LAYOUT.alignment(env),
                session.cancel_token(),
            );

        let mut out = Vec::new();
        for candidate in candidates {
            match Self::build(session, candidate.address) {
                Ok(ct) => {
                    if let Some(copy) = ct.copy_function {
                        if !session.plausible_function(copy) {
                            log::debug!(
                                "rejected catchable type at {}: copy function {} is not code",
                                candidate.address,
                                copy
                            );
                            continue;
                        }
                    }
                    log::debug!("defined catchable type at {}", candidate.address);
                    out.push(ct);
                }
                Err(rejection) => {
                    log::debug!("rejected catchable type candidate: {}", rejection);
                }
            }
        }
        out
    }
}

/// Length-prefixed array of catchable-type references, the order a handler
/// tries them in.
#[derive(Debug)]
pub struct CatchableTypeArray {
    pub address: Address,
    pub catchable_types: Vec<Arc<CatchableType>>,
}

const CTA_STRUCTURE: &str = "CatchableTypeArray";
const CTA_MAX_ENTRIES: u32 = 0xFFFF;

impl CatchableTypeArray {
    pub fn len(&self) -> usize {
        self.catchable_types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catchable_types.is_empty()
    }

    pub fn build(session: &Session, address: Address) -> Result<Arc<Self>, Rejection> {
        session
            .catchable_type_arrays
            .get_or_build(address, || Self::decode(session, address))
    }

    fn decode(session: &Session, address: Address) -> Result<Self, Rejection> {
        let env = session.env();
        let image = session.image();
        if !address.is_aligned(4) {
            return Err(Rejection::Misaligned { structure: CTA_STRUCTURE, address });
        }

        let count = image
            .read_i32(address)
            .map_err(|e| Rejection::unreadable(CTA_STRUCTURE, address, e))?;
        if count <= 0 || count as u32 > CTA_MAX_ENTRIES {
            return Err(Rejection::invariant(CTA_STRUCTURE, address, "implausible length"));
        }

        // Entries the first scan pass missed are built on demand here.
        let width = env.offset_width() as u64;
        let first = address + 4;
        let mut catchable_types = Vec::with_capacity(count as usize);
        for i in 0..count as u64 {
            let ct_address = session
                .codec()
                .read_offset(image, first + i * width)
                .map_err(|e| Rejection::unreadable(CTA_STRUCTURE, address, e))?;
            catchable_types.push(CatchableType::build(session, ct_address)?);
        }

        Ok(Self { address, catchable_types })
    }

    /// Runs of adjacent catchable-type references merge into one array
    /// candidate; the length prefix immediately before the run decides how
    /// much of it the array actually claims.
    pub fn search(session: &Session, catchable_types: &[Arc<CatchableType>]) -> Vec<Arc<Self>> {
        let env = session.env();
        let mut set = PatternSet::new();
        for ct in catchable_types {
            set.add_target(ct.address, session.codec(), session.arch(), PATTERN_SHIFT);
        }
        if set.is_empty() {
            return Vec::new();
        }

        let scanner = session.scanner();
        let elements = CandidateScanner::new(session.image(), *session.codec(), &scanner)
            .candidates(&set, 0, env.offset_width() as u64, session.cancel_token());

        let width = env.offset_width() as u64;
        let mut starts: ahash::AHashSet<Address> = ahash::AHashSet::new();
        let mut addresses: Vec<Address> = elements.iter().map(|c| c.address).collect();
        addresses.sort_unstable_by(|a, b| b.cmp(a));
        for element in addresses {
            starts.insert(element);
            starts.remove(&(element + width));
        }

        let mut run_starts: Vec<Address> = starts.into_iter().collect();
        run_starts.sort_unstable();

        let mut out = Vec::new();
        for start in run_starts {
            let Some(address) = start.checked_sub(4) else {
                continue;
            };
            match Self::build(session, address) {
                Ok(cta) => {
                    log::debug!("defined catchable type array at {}", address);
                    out.push(cta);
                }
                Err(rejection) => {
                    log::debug!("rejected catchable type array candidate: {}", rejection);
                }
            }
        }
        out
    }
}
