// Wed Feb 4 2026 - Alex

use crate::memory::Address;
use ahash::AHashMap;
use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FunctionRef {
    pub address: Address,
    pub name: Option<String>,
}

impl FunctionRef {
    pub fn new(address: Address, name: Option<String>) -> Self {
        Self { address, name }
    }
}

/// Symbol collaborator: address to known-function lookup, with an optional
/// declare hook for builders that may create functions at code addresses.
/// The engine tolerates this being absent; a pointer then only has to pass
/// the code-section check.
pub trait FunctionRegistry: Send + Sync {
    fn function_at(&self, addr: Address) -> Option<FunctionRef>;

    /// Declares a function at `addr` if the backing store supports it.
    fn declare_function(&self, _addr: Address) -> Option<FunctionRef> {
        None
    }
}

/// In-memory registry, used by tests and by callers without a richer
/// symbol source.
#[derive(Debug, Default)]
pub struct SimpleFunctionRegistry {
    functions: RwLock<AHashMap<Address, FunctionRef>>,
}

impl SimpleFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, addr: Address, name: Option<&str>) {
        self.functions
            .write()
            .insert(addr, FunctionRef::new(addr, name.map(str::to_string)));
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }
}

impl FunctionRegistry for SimpleFunctionRegistry {
    fn function_at(&self, addr: Address) -> Option<FunctionRef> {
        self.functions.read().get(&addr).cloned()
    }

    fn declare_function(&self, addr: Address) -> Option<FunctionRef> {
        let mut functions = self.functions.write();
        Some(
            functions
                .entry(addr)
                .or_insert_with(|| FunctionRef::new(addr, None))
                .clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_declare() {
        let registry = SimpleFunctionRegistry::new();
        let addr = Address::new(0x1000);
        assert!(registry.function_at(addr).is_none());

        registry.insert(addr, Some("__CxxFrameHandler3"));
        let f = registry.function_at(addr).unwrap();
        assert_eq!(f.name.as_deref(), Some("__CxxFrameHandler3"));

        let declared = registry.declare_function(Address::new(0x2000)).unwrap();
        assert!(declared.name.is_none());
        assert_eq!(registry.len(), 2);

        // Declaring over an existing function keeps its name.
        let again = registry.declare_function(addr).unwrap();
        assert_eq!(again.name.as_deref(), Some("__CxxFrameHandler3"));
    }
}
