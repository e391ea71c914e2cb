// Thu Feb 5 2026 - Alex

//! Per-image analysis session: target facts, collaborator seams, and one
//! identity cache per structure type. Everything discovered during one
//! session hangs off this context; two sessions over different images never
//! share state.

use crate::arch::TargetArch;
use crate::codec::OffsetCodec;
use crate::layout::LayoutEnv;
use crate::memory::{is_code_address, Address, ByteImage, MemoryError};
use crate::name::{Demangler, MsvcNameParser};
use crate::scanner::{CancelToken, PatternScanner};
use crate::symbols::FunctionRegistry;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Why one candidate was rejected. Never escapes the candidate's own
/// construction: the caller logs it and moves to the next candidate.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("misaligned {structure} candidate at {address}")]
    Misaligned { structure: &'static str, address: Address },
    #[error("invalid {structure} at {address}: {reason}")]
    Invariant {
        structure: &'static str,
        address: Address,
        reason: String,
    },
    #[error("cross-reference mismatch in {structure} at {address}: {reason}")]
    CrossReference {
        structure: &'static str,
        address: Address,
        reason: String,
    },
    #[error("cyclic reference re-entered {structure} at {address}")]
    Cycle { structure: &'static str, address: Address },
    #[error("unreadable {structure} at {address}")]
    Unreadable {
        structure: &'static str,
        address: Address,
        #[source]
        source: MemoryError,
    },
}

impl Rejection {
    pub fn invariant(structure: &'static str, address: Address, reason: impl Into<String>) -> Self {
        Rejection::Invariant { structure, address, reason: reason.into() }
    }

    pub fn cross_reference(
        structure: &'static str,
        address: Address,
        reason: impl Into<String>,
    ) -> Self {
        Rejection::CrossReference { structure, address, reason: reason.into() }
    }

    pub fn unreadable(structure: &'static str, address: Address, source: MemoryError) -> Self {
        Rejection::Unreadable { structure, address, source }
    }

    pub fn address(&self) -> Address {
        match self {
            Rejection::Misaligned { address, .. }
            | Rejection::Invariant { address, .. }
            | Rejection::CrossReference { address, .. }
            | Rejection::Cycle { address, .. }
            | Rejection::Unreadable { address, .. } => *address,
        }
    }
}

enum Slot<T> {
    /// Construction has started but not finished. Since construction is
    /// single-threaded and recursion is the only way back in, hitting this
    /// means the candidate references itself.
    InProgress,
    Ready(Arc<T>),
}

/// Address-keyed identity cache for one structure type. Guarantees one
/// `Arc<T>` per address per session, so `Arc::ptr_eq` substitutes for deep
/// equality across the whole graph.
pub struct StructCache<T> {
    structure: &'static str,
    slots: Mutex<IndexMap<Address, Slot<T>, ahash::RandomState>>,
}

impl<T> StructCache<T> {
    pub fn new(structure: &'static str) -> Self {
        Self { structure, slots: Mutex::new(IndexMap::default()) }
    }

    pub fn get(&self, addr: Address) -> Option<Arc<T>> {
        match self.slots.lock().get(&addr) {
            Some(Slot::Ready(arc)) => Some(Arc::clone(arc)),
            _ => None,
        }
    }

    /// Builds the instance at `addr` once; later calls return the cached
    /// `Arc`. A failed build leaves no trace so an address can be retried
    /// from a different discovery path.
    pub fn get_or_build<F>(&self, addr: Address, build: F) -> Result<Arc<T>, Rejection>
    where
        F: FnOnce() -> Result<T, Rejection>,
    {
        {
            let mut slots = self.slots.lock();
            match slots.get(&addr) {
                Some(Slot::Ready(arc)) => return Ok(Arc::clone(arc)),
                Some(Slot::InProgress) => {
                    return Err(Rejection::Cycle { structure: self.structure, address: addr })
                }
                None => {
                    slots.insert(addr, Slot::InProgress);
                }
            }
        }

        // Build without the lock so the builder can recurse into other
        // caches (and this one, which is how cycles get caught).
        match build() {
            Ok(value) => {
                let arc = Arc::new(value);
                self.slots.lock().insert(addr, Slot::Ready(Arc::clone(&arc)));
                Ok(arc)
            }
            Err(rejection) => {
                self.slots.lock().shift_remove(&addr);
                Err(rejection)
            }
        }
    }

    /// All built instances, in first-construction order.
    pub fn instances(&self) -> Vec<Arc<T>> {
        self.slots
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(arc) => Some(Arc::clone(arc)),
                Slot::InProgress => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

/// MSVC caps external names at 2047 characters.
pub const MAX_NAME_LEN: usize = 2047;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_name_len: usize,
    pub scan_chunk_size: usize,
    /// Cap on the method-pointer run read out of one vftable.
    pub max_methods: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_name_len: MAX_NAME_LEN,
            scan_chunk_size: PatternScanner::DEFAULT_CHUNK_SIZE,
            max_methods: 0x1000,
        }
    }
}

pub struct Session<'a> {
    image: &'a dyn ByteImage,
    codec: OffsetCodec,
    env: LayoutEnv,
    registry: Option<&'a dyn FunctionRegistry>,
    demangler: Box<dyn Demangler>,
    cancel: CancelToken,
    config: SessionConfig,

    pub(crate) type_descriptors: StructCache<crate::structs::TypeDescriptor>,
    pub(crate) class_hierarchy_descriptors: StructCache<crate::structs::ClassHierarchyDescriptor>,
    pub(crate) base_class_descriptors: StructCache<crate::structs::BaseClassDescriptor>,
    pub(crate) complete_object_locators: StructCache<crate::structs::CompleteObjectLocator>,
    pub(crate) virtual_function_tables: StructCache<crate::structs::VirtualFunctionTable>,
    pub(crate) catchable_types: StructCache<crate::structs::eh::CatchableType>,
    pub(crate) catchable_type_arrays: StructCache<crate::structs::eh::CatchableTypeArray>,
    pub(crate) throw_infos: StructCache<crate::structs::eh::ThrowInfo>,
    pub(crate) func_infos: StructCache<crate::structs::eh::FuncInfo>,
    pub(crate) func_info4s: StructCache<crate::structs::eh::FuncInfo4>,
}

impl<'a> Session<'a> {
    pub fn new(image: &'a dyn ByteImage) -> Self {
        let codec = OffsetCodec::for_image(image);
        Self {
            image,
            codec,
            env: LayoutEnv::new(image.arch(), codec),
            registry: None,
            demangler: Box::new(MsvcNameParser::new()),
            cancel: CancelToken::new(),
            config: SessionConfig::default(),
            type_descriptors: StructCache::new("TypeDescriptor"),
            class_hierarchy_descriptors: StructCache::new("ClassHierarchyDescriptor"),
            base_class_descriptors: StructCache::new("BaseClassDescriptor"),
            complete_object_locators: StructCache::new("CompleteObjectLocator"),
            virtual_function_tables: StructCache::new("VirtualFunctionTable"),
            catchable_types: StructCache::new("CatchableType"),
            catchable_type_arrays: StructCache::new("CatchableTypeArray"),
            throw_infos: StructCache::new("ThrowInfo"),
            func_infos: StructCache::new("FuncInfo"),
            func_info4s: StructCache::new("FuncInfo4"),
        }
    }

    pub fn with_registry(mut self, registry: &'a dyn FunctionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_demangler(mut self, demangler: Box<dyn Demangler>) -> Self {
        self.demangler = demangler;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn image(&self) -> &'a dyn ByteImage {
        self.image
    }

    pub fn arch(&self) -> TargetArch {
        self.image.arch()
    }

    pub fn codec(&self) -> &OffsetCodec {
        &self.codec
    }

    pub fn env(&self) -> &LayoutEnv {
        &self.env
    }

    pub fn demangler(&self) -> &dyn Demangler {
        self.demangler.as_ref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> Option<&'a dyn FunctionRegistry> {
        self.registry
    }

    pub fn scanner(&self) -> PatternScanner {
        PatternScanner::new().with_chunk_size(self.config.scan_chunk_size)
    }

    /// A code pointer is plausible when it lands in read-only code and the
    /// symbol collaborator either knows a function there or lets one be
    /// declared. Without a registry the section check stands alone.
    pub fn plausible_function(&self, addr: Address) -> bool {
        if addr.is_null() || !is_code_address(self.image, addr) {
            return false;
        }
        match self.registry {
            Some(registry) => {
                registry.function_at(addr).is_some() || registry.declare_function(addr).is_some()
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_identity() {
        let cache: StructCache<u32> = StructCache::new("Test");
        let addr = Address::new(0x1000);
        let a = cache.get_or_build(addr, || Ok(7)).unwrap();
        let b = cache.get_or_build(addr, || panic!("must not rebuild")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_rejects_reentry() {
        let cache: StructCache<u32> = StructCache::new("Test");
        let addr = Address::new(0x1000);
        let result = cache.get_or_build(addr, || {
            match cache.get_or_build(addr, || Ok(1)) {
                Err(Rejection::Cycle { .. }) => Err(Rejection::invariant("Test", addr, "cycle")),
                other => panic!("expected cycle rejection, got {:?}", other.map(|_| ())),
            }
        });
        assert!(result.is_err());
        // The failed build leaves the slot free for a retry.
        assert!(cache.get_or_build(addr, || Ok(2)).is_ok());
    }

    #[test]
    fn test_failed_build_not_cached() {
        let cache: StructCache<u32> = StructCache::new("Test");
        let addr = Address::new(0x2000);
        assert!(cache
            .get_or_build(addr, || Err(Rejection::invariant("Test", addr, "bad")))
            .is_err());
        assert!(cache.get(addr).is_none());
        assert!(cache.get_or_build(addr, || Ok(3)).is_ok());
    }
}
