// Fri Feb 6 2026 - Alex

use crate::layout::{FieldDef, FieldKind, StructLayout};
use crate::memory::Address;
use crate::name::TypeName;
use crate::scanner::{CandidateScanner, PatternSet};
use crate::session::{Rejection, Session};
use itertools::Itertools;
use std::sync::Arc;

pub const NAME_PREFIX: &str = ".?A";
const CLASS_PREFIX: &str = ".?AV";
const STRUCT_PREFIX: &str = ".?AU";

static LAYOUT: StructLayout = StructLayout::new(
    "TypeDescriptor",
    &[
        FieldDef::new("pVFTable", FieldKind::Ptr),
        FieldDef::new("spare", FieldKind::Ptr),
        FieldDef::new("name", FieldKind::Trailing(&FieldKind::Bytes(1))),
    ],
);

const FIELD_SPARE: usize = 1;
const FIELD_NAME: usize = 2;

/// `type_info` instance emitted for every class with RTTI: the `type_info`
/// vftable pointer, a reserved spare slot, and the decorated name.
#[derive(Debug)]
pub struct TypeDescriptor {
    pub address: Address,
    pub vftable: Address,
    pub decorated_name: String,
    /// Demangled form; `None` when the demangler cannot parse the name.
    pub type_name: Option<TypeName>,
}

impl TypeDescriptor {
    pub fn is_class(&self) -> bool {
        self.decorated_name.starts_with(CLASS_PREFIX)
    }

    pub fn is_struct(&self) -> bool {
        self.decorated_name.starts_with(STRUCT_PREFIX)
    }

    pub fn is_lambda(&self) -> bool {
        self.decorated_name.starts_with(".?AV<lambda")
    }

    pub fn build(session: &Session, address: Address) -> Result<Arc<Self>, Rejection> {
        session
            .type_descriptors
            .get_or_build(address, || Self::decode(session, address))
    }

    fn decode(session: &Session, address: Address) -> Result<Self, Rejection> {
        let env = session.env();
        let image = session.image();
        if !address.is_aligned(LAYOUT.alignment(env)) {
            return Err(Rejection::Misaligned { structure: LAYOUT.name, address });
        }

        let vftable = image
            .read_ptr(address)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        let spare = image
            .read_ptr(address + LAYOUT.offset_of(FIELD_SPARE, env) as u64)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        if !spare.is_null() {
            return Err(Rejection::invariant(LAYOUT.name, address, "non-null spare"));
        }

        let name_address = address + LAYOUT.offset_of(FIELD_NAME, env) as u64;
        let decorated_name = image
            .read_c_string(name_address, session.config().max_name_len)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        if !decorated_name.starts_with(NAME_PREFIX) {
            return Err(Rejection::invariant(LAYOUT.name, address, "bad name prefix"));
        }

        let type_name = session.demangler().demangle(&decorated_name);
        if type_name.is_none() {
            log::debug!(
                "TypeDescriptor at {} has undemanglable name {:?}",
                address,
                decorated_name
            );
        }

        Ok(Self { address, vftable, decorated_name, type_name })
    }

    /// Scans the data sections for decorated-name prefixes, then keeps only
    /// candidates whose vftable pointer matches the most frequent value
    /// across all candidates. That majority is the real `type_info` vftable;
    /// everything else is a string that merely looks like a decorated name.
    pub fn search(session: &Session) -> Vec<Arc<Self>> {
        let env = session.env();
        let image = session.image();
        let name_offset = LAYOUT.offset_of(FIELD_NAME, env);

        let mut set = PatternSet::new();
        set.add_signature(NAME_PREFIX.as_bytes().to_vec());
        let scanner = session.scanner();
        let raw = CandidateScanner::new(image, *session.codec(), &scanner).candidates(
            &set,
            name_offset,
            LAYOUT.alignment(env),
            session.cancel_token(),
        );

        let mut candidates = Vec::new();
        for candidate in raw {
            let address = candidate.address;
            let name_address = address + name_offset as u64;
            let Ok(name) = image.read_c_string(name_address, session.config().max_name_len)
            else {
                continue;
            };
            if !name.starts_with(CLASS_PREFIX) && !name.starts_with(STRUCT_PREFIX) {
                continue;
            }
            if !name.ends_with("@@") {
                continue;
            }
            let Ok(vftable) = image.read_ptr(address) else {
                continue;
            };
            candidates.push((address, vftable));
        }

        let Some(type_info_vftable) = candidates
            .iter()
            .map(|(_, vftable)| *vftable)
            .counts()
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(vftable, _)| vftable)
        else {
            return Vec::new();
        };
        log::debug!("type_info vftable vote: {}", type_info_vftable);

        let mut out = Vec::new();
        for (address, vftable) in candidates {
            if vftable != type_info_vftable {
                continue;
            }
            match Self::build(session, address) {
                Ok(td) => {
                    log::debug!("defined type descriptor at {}", address);
                    out.push(td);
                }
                Err(rejection) => {
                    log::debug!("rejected type descriptor candidate: {}", rejection);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::TargetArch;
    use crate::memory::{AddressRange, OwnedImage, SectionSemantics};

    fn test_image() -> OwnedImage {
        let base = Address::new(0x140000000);
        let mut builder = OwnedImage::builder(base, TargetArch::X64).section(
            ".rdata",
            AddressRange::with_size(Address::new(0x140001000), 0x1000),
            SectionSemantics::ReadOnlyData,
        );

        let type_info_vft = Address::new(0x140001800);
        // Two real descriptors plus a decoy with a divergent vftable.
        for (addr, name) in [
            (0x140001000u64, ".?AVFoo@@"),
            (0x140001040u64, ".?AUBar@ns@@"),
        ] {
            builder.write_ptr(Address::new(addr), type_info_vft);
            builder.write_ptr(Address::new(addr + 8), Address::zero());
            builder.write_c_string(Address::new(addr + 16), name);
        }
        builder.write_ptr(Address::new(0x140001100), Address::new(0x140001900));
        builder.write_ptr(Address::new(0x140001108), Address::zero());
        builder.write_c_string(Address::new(0x140001110), ".?AVDecoy@@");

        builder.build()
    }

    #[test]
    fn test_search_majority_vote() {
        let image = test_image();
        let session = Session::new(&image);
        let found = TypeDescriptor::search(&session);

        let names: Vec<&str> = found.iter().map(|td| td.decorated_name.as_str()).collect();
        assert_eq!(names, vec![".?AVFoo@@", ".?AUBar@ns@@"]);
        assert!(found[0].is_class());
        assert!(found[1].is_struct());
        assert_eq!(found[1].type_name.as_ref().unwrap().qualified(), "ns::Bar");
    }

    #[test]
    fn test_identity_memoized() {
        let image = test_image();
        let session = Session::new(&image);
        let a = TypeDescriptor::build(&session, Address::new(0x140001000)).unwrap();
        let b = TypeDescriptor::build(&session, Address::new(0x140001000)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_non_null_spare_rejected() {
        let base = Address::new(0x140000000);
        let mut builder = OwnedImage::builder(base, TargetArch::X64).section(
            ".rdata",
            AddressRange::with_size(Address::new(0x140001000), 0x100),
            SectionSemantics::ReadOnlyData,
        );
        builder.write_ptr(Address::new(0x140001000), Address::new(0x140001800));
        builder.write_ptr(Address::new(0x140001008), Address::new(0x1));
        builder.write_c_string(Address::new(0x140001010), ".?AVFoo@@");
        let image = builder.build();

        let session = Session::new(&image);
        let result = TypeDescriptor::build(&session, Address::new(0x140001000));
        assert!(matches!(result, Err(Rejection::Invariant { .. })));
    }
}
