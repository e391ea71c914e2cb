// Fri Feb 6 2026 - Alex

mod base_class_descriptor;
mod class_hierarchy_descriptor;
mod complete_object_locator;
mod type_descriptor;
mod virtual_function_table;

pub mod eh;

pub use base_class_descriptor::{
    BaseClassArray, BaseClassDescriptor, BcdAttributes, Pmd,
};
pub use class_hierarchy_descriptor::{ChdAttributes, ClassHierarchyDescriptor};
pub use complete_object_locator::CompleteObjectLocator;
pub use type_descriptor::TypeDescriptor;
pub use virtual_function_table::VirtualFunctionTable;
