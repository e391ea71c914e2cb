// Tue Feb 10 2026 - Alex

use crate::memory::Address;
use crate::name::TypeName;
use crate::structs::{
    BaseClassDescriptor, ClassHierarchyDescriptor, TypeDescriptor, VirtualFunctionTable,
};
use indexmap::IndexMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClassError {
    #[error(
        "class at {class} carries two vftables for subobject key \
         (offset {offset}, cd offset {constructor_displacement_offset})"
    )]
    DuplicateVftableKey {
        class: Address,
        offset: u32,
        constructor_displacement_offset: u32,
    },
}

/// One direct base of a class, as recovered by hierarchy linearization.
#[derive(Debug, Clone)]
pub struct VisualCxxBaseClass {
    pub descriptor: Arc<BaseClassDescriptor>,
    pub is_virtual: bool,
}

impl VisualCxxBaseClass {
    pub fn type_name(&self) -> Option<&TypeName> {
        self.descriptor.type_descriptor.type_name.as_ref()
    }
}

/// Direct-base recovery state. Stays `Unresolved` until the linearizer has
/// run over the whole class set.
#[derive(Debug, Clone, Default)]
pub enum BaseResolution {
    #[default]
    Unresolved,
    Resolved(Vec<VisualCxxBaseClass>),
    Failed(String),
}

/// A reconstructed C++ class: one hierarchy descriptor plus every vftable
/// whose locator points back at it, keyed by the subobject each vftable
/// serves.
#[derive(Debug)]
pub struct VisualCxxClass {
    pub class_hierarchy_descriptor: Arc<ClassHierarchyDescriptor>,
    base_vftables: IndexMap<(u32, u32), Arc<VirtualFunctionTable>>,
    pub bases: BaseResolution,
}

impl VisualCxxClass {
    pub fn new(class_hierarchy_descriptor: Arc<ClassHierarchyDescriptor>) -> Self {
        Self {
            class_hierarchy_descriptor,
            base_vftables: IndexMap::new(),
            bases: BaseResolution::Unresolved,
        }
    }

    pub fn address(&self) -> Address {
        self.class_hierarchy_descriptor.address
    }

    pub fn type_descriptor(&self) -> Option<&Arc<TypeDescriptor>> {
        self.class_hierarchy_descriptor
            .base_class_array
            .entries
            .first()
            .map(|bcd| &bcd.type_descriptor)
    }

    pub fn type_name(&self) -> Option<&TypeName> {
        self.class_hierarchy_descriptor.type_name()
    }

    /// Registers a vftable under its subobject key. Two locators claiming
    /// the same key within one class contradict the ABI and poison the
    /// whole class.
    pub fn add_vftable(&mut self, vftable: Arc<VirtualFunctionTable>) -> Result<(), ClassError> {
        let key = (
            vftable.meta.offset,
            vftable.meta.constructor_displacement_offset,
        );
        if self.base_vftables.contains_key(&key) {
            return Err(ClassError::DuplicateVftableKey {
                class: self.address(),
                offset: key.0,
                constructor_displacement_offset: key.1,
            });
        }
        self.base_vftables.insert(key, vftable);
        Ok(())
    }

    pub fn vftables(&self) -> impl Iterator<Item = &Arc<VirtualFunctionTable>> {
        self.base_vftables.values()
    }

    pub fn vftable_for(&self, offset: u32, constructor_displacement_offset: u32) -> Option<&Arc<VirtualFunctionTable>> {
        self.base_vftables
            .get(&(offset, constructor_displacement_offset))
    }

    pub fn vftable_count(&self) -> usize {
        self.base_vftables.len()
    }

    pub fn direct_bases(&self) -> Option<&[VisualCxxBaseClass]> {
        match &self.bases {
            BaseResolution::Resolved(bases) => Some(bases),
            _ => None,
        }
    }
}
