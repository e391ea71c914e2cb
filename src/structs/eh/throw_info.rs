// Mon Feb 9 2026 - Alex

use crate::layout::{FieldDef, FieldKind, StructLayout};
use crate::memory::Address;
use crate::scanner::{CandidateScanner, PatternSet};
use crate::session::{Rejection, Session};
use crate::structs::eh::CatchableTypeArray;
use std::sync::Arc;

const PATTERN_SHIFT: usize = 2;

static LAYOUT: StructLayout = StructLayout::new(
    "ThrowInfo",
    &[
        FieldDef::new("attributes", FieldKind::UInt(4)),
        FieldDef::new("pmfnUnwind", FieldKind::Offset),
        FieldDef::new("pForwardCompat", FieldKind::Offset),
        FieldDef::new("pCatchableTypeArray", FieldKind::Offset),
    ],
);

const FIELD_UNWIND: usize = 1;
const FIELD_FORWARD_COMPAT: usize = 2;
const FIELD_CATCHABLE_TYPE_ARRAY: usize = 3;

/// Per-throw-site metadata: how to destroy the in-flight object and what
/// it can be caught as.
#[derive(Debug)]
pub struct ThrowInfo {
    pub address: Address,
    pub attributes: u32,
    /// Destructor invoked when unwinding past the throw; absent for
    /// trivially-destructible types.
    pub member_unwind: Option<Address>,
    pub forward_compat: Option<Address>,
    pub catchable_type_array: Arc<CatchableTypeArray>,
}

impl ThrowInfo {
    pub fn build(session: &Session, address: Address) -> Result<Arc<Self>, Rejection> {
        session
            .throw_infos
            .get_or_build(address, || Self::decode(session, address))
    }

    fn decode(session: &Session, address: Address) -> Result<Self, Rejection> {
        let env = session.env();
        let image = session.image();
        if !address.is_aligned(LAYOUT.alignment(env)) {
            return Err(Rejection::Misaligned { structure: LAYOUT.name, address });
        }

        let attributes = image
            .read_u32(address)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;

        let read_fn = |index: usize| -> Result<Option<Address>, Rejection> {
            let target = session
                .codec()
                .read_offset(image, address + LAYOUT.offset_of(index, env) as u64)
                .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
            Ok((!target.is_null()).then_some(target))
        };
        let member_unwind = read_fn(FIELD_UNWIND)?;
        let forward_compat = read_fn(FIELD_FORWARD_COMPAT)?;

        let cta_address = session
            .codec()
            .read_offset(
                image,
                address + LAYOUT.offset_of(FIELD_CATCHABLE_TYPE_ARRAY, env) as u64,
            )
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        let catchable_type_array = CatchableTypeArray::build(session, cta_address)?;

        Ok(Self { address, attributes, member_unwind, forward_compat, catchable_type_array })
    }

    /// Keyed on known catchable-type arrays in the pCatchableTypeArray
    /// slot; a candidate must carry a member-unwind reference that lands on
    /// plausible code.
    pub fn search_with_catchable_type_arrays(
        session: &Session,
        catchable_type_arrays: &[Arc<CatchableTypeArray>],
    ) -> Vec<Arc<Self>> {
        let env = session.env();
        let mut set = PatternSet::new();
        for cta in catchable_type_arrays {
            set.add_target(cta.address, session.codec(), session.arch(), PATTERN_SHIFT);
        }
        if set.is_empty() {
            return Vec::new();
        }

        let scanner = session.scanner();
        let candidates = CandidateScanner::new(session.image(), *session.codec(), &scanner)
            .candidates(
                &set,
                LAYOUT.offset_of(FIELD_CATCHABLE_TYPE_ARRAY, env),
                LAYOUT.alignment(env),
                session.cancel_token(),
            );

        let mut out = Vec::new();
        for candidate in candidates {
            match Self::build(session, candidate.address) {
                Ok(ti) => {
                    let plausible = ti
                        .member_unwind
                        .is_some_and(|unwind| session.plausible_function(unwind));
                    if !plausible {
                        log::debug!(
                            "rejected throw info at {}: member unwind is not code",
                            candidate.address
                        );
                        continue;
                    }
                    log::debug!("defined throw info at {}", candidate.address);
                    out.push(ti);
                }
                Err(rejection) => {
                    log::debug!("rejected throw info candidate: {}", rejection);
                }
            }
        }
        out
    }
}
