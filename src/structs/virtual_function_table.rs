// Fri Feb 6 2026 - Alex

use crate::memory::Address;
use crate::scanner::{CandidateScanner, PatternSet};
use crate::session::{Rejection, Session};
use crate::structs::CompleteObjectLocator;
use std::sync::Arc;

const STRUCTURE: &str = "VirtualFunctionTable";

/// Loses the low address bytes so locators sharing high bytes collapse
/// into one scan pass.
const PATTERN_SHIFT: usize = 3;

/// A run of method pointers whose slot at -1 holds the locator pointer.
/// The table address is the address vptrs actually point at, one pointer
/// past the meta slot.
#[derive(Debug)]
pub struct VirtualFunctionTable {
    pub address: Address,
    pub meta: Arc<CompleteObjectLocator>,
    pub method_addresses: Vec<Address>,
}

impl VirtualFunctionTable {
    pub fn build(session: &Session, address: Address) -> Result<Arc<Self>, Rejection> {
        session
            .virtual_function_tables
            .get_or_build(address, || Self::decode(session, address))
    }

    fn decode(session: &Session, address: Address) -> Result<Self, Rejection> {
        let image = session.image();
        let ptr_width = session.arch().pointer_size() as u64;
        if !address.is_aligned(ptr_width) {
            return Err(Rejection::Misaligned { structure: STRUCTURE, address });
        }

        let meta_address = address
            .checked_sub(ptr_width)
            .ok_or_else(|| Rejection::invariant(STRUCTURE, address, "no room for meta slot"))?;
        let col_address = image
            .read_ptr(meta_address)
            .map_err(|e| Rejection::unreadable(STRUCTURE, address, e))?;
        let meta = CompleteObjectLocator::build(session, col_address)?;

        // The method run continues while slots decode to plausible code.
        let mut method_addresses = Vec::new();
        let limit = session.config().max_methods;
        loop {
            let slot = address + method_addresses.len() as u64 * ptr_width;
            let Ok(target) = image.read_ptr(slot) else {
                break;
            };
            if !session.plausible_function(target) {
                break;
            }
            method_addresses.push(target);
            if method_addresses.len() >= limit {
                break;
            }
        }
        if method_addresses.is_empty() {
            return Err(Rejection::invariant(STRUCTURE, address, "no method pointers"));
        }

        Ok(Self { address, meta, method_addresses })
    }

    /// Finds every location holding one of the given locators' addresses
    /// and treats the following slot as a table start.
    pub fn search_with_complete_object_locators(
        session: &Session,
        complete_object_locators: &[Arc<CompleteObjectLocator>],
    ) -> Vec<Arc<Self>> {
        let ptr_width = session.arch().pointer_size() as u64;
        let mut set = PatternSet::new();
        for col in complete_object_locators {
            set.add_pointer_target(col.address, session.arch(), PATTERN_SHIFT);
        }
        if set.is_empty() {
            return Vec::new();
        }

        let scanner = session.scanner();
        let candidates = CandidateScanner::new(session.image(), *session.codec(), &scanner)
            .candidates(&set, 0, ptr_width, session.cancel_token());

        let mut out = Vec::new();
        for candidate in candidates {
            let address = candidate.address + ptr_width;
            match Self::build(session, address) {
                Ok(vft) => {
                    log::debug!("defined virtual function table at {}", address);
                    out.push(vft);
                }
                Err(rejection) => {
                    log::warn!("failed to define virtual function table at {}", address);
                    log::debug!("rejection: {}", rejection);
                }
            }
        }
        out
    }
}
