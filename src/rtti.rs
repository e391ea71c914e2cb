// Wed Feb 11 2026 - Alex

//! RTTI graph construction. Discovery is strictly ordered: type descriptors
//! anchor the locator scan, locators anchor the vftable scan, and only once
//! the whole image has been covered do the vftables collapse into classes
//! and the linearizer run.

use crate::classes::VisualCxxClass;
use crate::linearize::{resolve_base_classes, LinearizeReport};
use crate::memory::Address;
use crate::session::Session;
use crate::structs::{CompleteObjectLocator, TypeDescriptor, VirtualFunctionTable};
use ahash::AHashSet;
use indexmap::IndexMap;
use std::sync::Arc;

/// Fully-resolved products of one image pass. No lazy state remains; every
/// reference inside is already validated.
#[derive(Debug)]
pub struct RttiGraph {
    pub classes: Vec<VisualCxxClass>,
    /// Type descriptors no locator points at: non-polymorphic types, or
    /// RTTI emitted only for exception metadata.
    pub free_standing_type_descriptors: Vec<Arc<TypeDescriptor>>,
    pub linearization: LinearizeReport,
}

impl RttiGraph {
    pub fn class_named(&self, qualified: &str) -> Option<&VisualCxxClass> {
        self.classes
            .iter()
            .find(|class| class.type_name().is_some_and(|name| name.qualified() == qualified))
    }
}

pub fn build_rtti_graph(session: &Session) -> RttiGraph {
    let type_descriptors = TypeDescriptor::search(session);
    log::info!("found {} type descriptors", type_descriptors.len());

    let complete_object_locators =
        CompleteObjectLocator::search_with_type_descriptors(session, &type_descriptors);
    log::info!(
        "found {} complete object locators",
        complete_object_locators.len()
    );

    let vftables =
        VirtualFunctionTable::search_with_complete_object_locators(
            session,
            &complete_object_locators,
        );
    log::info!("found {} virtual function tables", vftables.len());

    for locator in unreferenced_locators(&complete_object_locators, &vftables) {
        log::warn!("no vftable references complete object locator at {}", locator.address);
    }

    let mut classes = group_into_classes(&vftables);

    let referenced: AHashSet<Address> = complete_object_locators
        .iter()
        .map(|col| col.type_descriptor.address)
        .collect();
    let free_standing_type_descriptors: Vec<Arc<TypeDescriptor>> = type_descriptors
        .iter()
        .filter(|td| !referenced.contains(&td.address))
        .cloned()
        .collect();

    let linearization = resolve_base_classes(session, &mut classes);

    RttiGraph { classes, free_standing_type_descriptors, linearization }
}

fn unreferenced_locators<'a>(
    complete_object_locators: &'a [Arc<CompleteObjectLocator>],
    vftables: &[Arc<VirtualFunctionTable>],
) -> Vec<&'a Arc<CompleteObjectLocator>> {
    let referenced: AHashSet<Address> =
        vftables.iter().map(|vft| vft.meta.address).collect();
    complete_object_locators
        .iter()
        .filter(|col| !referenced.contains(&col.address))
        .collect()
}

/// Groups vftables by the hierarchy descriptor their locator names. A class
/// whose locators contradict each other (two vftables for one subobject
/// key) is dropped whole.
fn group_into_classes(vftables: &[Arc<VirtualFunctionTable>]) -> Vec<VisualCxxClass> {
    let mut classes: IndexMap<Address, VisualCxxClass> = IndexMap::new();
    let mut poisoned: AHashSet<Address> = AHashSet::new();

    for vftable in vftables {
        let chd = &vftable.meta.class_hierarchy_descriptor;
        let class = classes
            .entry(chd.address)
            .or_insert_with(|| VisualCxxClass::new(chd.clone()));
        if let Err(error) = class.add_vftable(vftable.clone()) {
            log::warn!("dropping contradictory class: {error}");
            poisoned.insert(chd.address);
        }
    }

    classes.retain(|address, _| !poisoned.contains(address));
    classes.into_values().collect()
}
