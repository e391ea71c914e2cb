// Thu Feb 12 2026 - Alex

//! End-to-end recovery over synthetic images carrying hand-written MSVC
//! metadata: type descriptors, locator/vftable chains, throw-side tables,
//! and exception-directory handler data.

use rtti_recovery::arch::TargetArch;
use rtti_recovery::classes::VisualCxxClass;
use rtti_recovery::eh::HandlerData;
use rtti_recovery::linearize::resolve_base_classes;
use rtti_recovery::memory::{
    Address, AddressRange, OwnedImage, OwnedImageBuilder, SectionSemantics,
};
use rtti_recovery::structs::eh::Personality;
use rtti_recovery::structs::{BaseClassDescriptor, ClassHierarchyDescriptor, TypeDescriptor};
use rtti_recovery::{
    build_exception_metadata, build_rtti_graph, RttiGraph, Session, SimpleFunctionRegistry,
};
use std::collections::HashSet;
use std::sync::Arc;

const BASE: u64 = 0x1_4000_0000;
const TYPE_INFO_VFT: u64 = 0x2010;

const HAS_HIERARCHY: u32 = 0x40;
const VIRTUAL_BASE: u32 = 0x10;

fn at(offset: u64) -> Address {
    Address::new(BASE + offset)
}

fn rva(offset: u64) -> u32 {
    offset as u32
}

/// Writes MSVC metadata into a two-section x64 image: code at +0x1000,
/// read-only data at +0x2000.
struct ImageWriter {
    builder: OwnedImageBuilder,
}

impl ImageWriter {
    fn base_builder() -> OwnedImageBuilder {
        let _ = env_logger::builder().is_test(true).try_init();
        OwnedImage::builder(Address::new(BASE), TargetArch::X64)
            .section(
                ".text",
                AddressRange::new(at(0x1000), at(0x2000)),
                SectionSemantics::ReadOnlyCode,
            )
            .section(
                ".rdata",
                AddressRange::new(at(0x2000), at(0x3000)),
                SectionSemantics::ReadOnlyData,
            )
    }

    fn new() -> Self {
        Self {
            builder: Self::base_builder(),
        }
    }

    fn with_exception_directory(range: AddressRange) -> Self {
        Self {
            builder: Self::base_builder().exception_directory(range),
        }
    }

    fn type_descriptor(&mut self, offset: u64, name: &str) {
        self.builder.write_ptr(at(offset), at(TYPE_INFO_VFT));
        self.builder.write_ptr(at(offset) + 8, Address::zero());
        self.builder.write_c_string(at(offset) + 16, name);
    }

    /// Hierarchy descriptor plus its base-class array in one go.
    fn hierarchy(&mut self, offset: u64, attributes: u32, bca_offset: u64, entries: &[u64]) {
        self.builder.write_u32(at(offset), 0);
        self.builder.write_u32(at(offset) + 4, attributes);
        self.builder.write_u32(at(offset) + 8, entries.len() as u32);
        self.builder.write_u32(at(offset) + 12, rva(bca_offset));
        for (index, entry) in entries.iter().enumerate() {
            self.builder
                .write_u32(at(bca_offset) + index as u64 * 4, rva(*entry));
        }
    }

    fn base_class(
        &mut self,
        offset: u64,
        td_offset: u64,
        contained: u32,
        attributes: u32,
        chd_offset: u64,
    ) {
        self.builder.write_u32(at(offset), rva(td_offset));
        self.builder.write_u32(at(offset) + 4, contained);
        self.builder.write_i32(at(offset) + 8, 0); // mdisp
        self.builder.write_i32(at(offset) + 12, -1); // pdisp
        self.builder.write_i32(at(offset) + 16, 0); // vdisp
        self.builder.write_u32(at(offset) + 20, attributes);
        self.builder.write_u32(at(offset) + 24, rva(chd_offset));
    }

    fn locator(&mut self, offset: u64, subobject: u32, td_offset: u64, chd_offset: u64) {
        self.builder.write_u32(at(offset), 1); // x64 signature
        self.builder.write_u32(at(offset) + 4, subobject);
        self.builder.write_u32(at(offset) + 8, 0);
        self.builder.write_u32(at(offset) + 12, rva(td_offset));
        self.builder.write_u32(at(offset) + 16, rva(chd_offset));
        self.builder.write_u32(at(offset) + 20, rva(offset)); // pSelf
    }

    /// Meta slot at `offset`, method run right after.
    fn vftable(&mut self, offset: u64, col_offset: u64, methods: &[u64]) {
        self.builder.write_ptr(at(offset), at(col_offset));
        for (index, method) in methods.iter().enumerate() {
            self.builder
                .write_ptr(at(offset) + 8 + index as u64 * 8, at(*method));
        }
    }

    fn finish(mut self) -> OwnedImage {
        // Scans read whole sections; make sure .rdata is backed to its end.
        self.builder.write_u8(at(0x2fff), 0);
        self.builder.build()
    }
}

fn class_named<'a>(graph: &'a RttiGraph, name: &str) -> &'a VisualCxxClass {
    graph
        .class_named(name)
        .unwrap_or_else(|| panic!("no class named {name}"))
}

fn base_names(class: &VisualCxxClass) -> Vec<(String, bool)> {
    class
        .direct_bases()
        .expect("bases should be resolved")
        .iter()
        .map(|base| {
            (
                base.type_name().map(|n| n.qualified()).unwrap_or_default(),
                base.is_virtual,
            )
        })
        .collect()
}

fn single_inheritance_image() -> OwnedImage {
    let mut w = ImageWriter::new();
    // Non-polymorphic struct: descriptor only, nothing references it.
    w.type_descriptor(0x20c0, ".?AUS@@");
    w.type_descriptor(0x2100, ".?AVB@@");
    w.type_descriptor(0x2140, ".?AVD@@");

    w.hierarchy(0x2180, 0, 0x2190, &[0x21a0]);
    w.base_class(0x21a0, 0x2100, 0, HAS_HIERARCHY, 0x2180);

    w.hierarchy(0x21c0, 0, 0x21d0, &[0x21e0, 0x2200]);
    w.base_class(0x21e0, 0x2140, 1, HAS_HIERARCHY, 0x21c0);
    w.base_class(0x2200, 0x2100, 0, HAS_HIERARCHY, 0x2180);

    w.locator(0x2240, 0, 0x2100, 0x2180);
    w.locator(0x2260, 0, 0x2140, 0x21c0);

    w.vftable(0x2280, 0x2240, &[0x1100]);
    w.vftable(0x22a0, 0x2260, &[0x1200, 0x1208]);
    w.finish()
}

#[test]
fn single_inheritance_resolves_one_direct_base() {
    let image = single_inheritance_image();
    let session = Session::new(&image);
    let graph = build_rtti_graph(&session);

    assert_eq!(graph.classes.len(), 2);
    assert!(graph.linearization.is_clean());

    let b = class_named(&graph, "B");
    let d = class_named(&graph, "D");
    assert_eq!(base_names(b), vec![]);
    assert_eq!(base_names(d), vec![("B".to_string(), false)]);

    assert_eq!(d.vftable_count(), 1);
    let vft = d.vftables().next().unwrap();
    assert_eq!(vft.address, at(0x22a8));
    assert_eq!(vft.method_addresses, vec![at(0x1200), at(0x1208)]);
}

#[test]
fn unreferenced_type_descriptor_stays_free_standing() {
    let image = single_inheritance_image();
    let session = Session::new(&image);
    let graph = build_rtti_graph(&session);

    let free: Vec<String> = graph
        .free_standing_type_descriptors
        .iter()
        .filter_map(|td| td.type_name.as_ref().map(|n| n.qualified()))
        .collect();
    assert_eq!(free, vec!["S".to_string()]);
}

#[test]
fn locator_agrees_with_first_base_entry() {
    let image = single_inheritance_image();
    let session = Session::new(&image);
    let graph = build_rtti_graph(&session);

    for class in &graph.classes {
        for vft in class.vftables() {
            let col = &vft.meta;
            let first = &col.class_hierarchy_descriptor.base_class_array.entries[0];
            assert!(Arc::ptr_eq(&col.type_descriptor, &first.type_descriptor));
        }
    }
}

#[test]
fn discovery_paths_share_one_instance_per_address() {
    let image = single_inheritance_image();
    let session = Session::new(&image);
    let graph = build_rtti_graph(&session);

    let d = class_named(&graph, "D");
    let td_via_graph = d.type_descriptor().unwrap().clone();
    let td_direct = TypeDescriptor::build(&session, at(0x2140)).unwrap();
    assert!(Arc::ptr_eq(&td_via_graph, &td_direct));
}

fn diamond_image() -> OwnedImage {
    let mut w = ImageWriter::new();
    w.type_descriptor(0x2100, ".?AVA@@");
    w.type_descriptor(0x2140, ".?AVB1@@");
    w.type_descriptor(0x2180, ".?AVB2@@");
    w.type_descriptor(0x21c0, ".?AVD@@");

    w.hierarchy(0x2200, 0, 0x2210, &[0x2220]);
    w.base_class(0x2220, 0x2100, 0, HAS_HIERARCHY, 0x2200);

    w.hierarchy(0x2240, 2, 0x2250, &[0x2260, 0x2280]);
    w.base_class(0x2260, 0x2140, 1, HAS_HIERARCHY, 0x2240);
    w.base_class(0x2280, 0x2100, 0, HAS_HIERARCHY | VIRTUAL_BASE, 0x2200);

    w.hierarchy(0x22a0, 2, 0x22b0, &[0x22c0, 0x22e0]);
    w.base_class(0x22c0, 0x2180, 1, HAS_HIERARCHY, 0x22a0);
    w.base_class(0x22e0, 0x2100, 0, HAS_HIERARCHY | VIRTUAL_BASE, 0x2200);

    // D's flattened array holds the shared virtual A only once.
    w.hierarchy(0x2300, 3, 0x2310, &[0x2320, 0x2340, 0x2360, 0x2380]);
    w.base_class(0x2320, 0x21c0, 3, HAS_HIERARCHY, 0x2300);
    w.base_class(0x2340, 0x2140, 1, HAS_HIERARCHY | VIRTUAL_BASE, 0x2240);
    w.base_class(0x2360, 0x2100, 0, HAS_HIERARCHY | VIRTUAL_BASE, 0x2200);
    w.base_class(0x2380, 0x2180, 1, HAS_HIERARCHY | VIRTUAL_BASE, 0x22a0);

    w.locator(0x2400, 0, 0x2100, 0x2200);
    w.locator(0x2420, 0, 0x2140, 0x2240);
    w.locator(0x2440, 0, 0x2180, 0x22a0);
    w.locator(0x2460, 0, 0x21c0, 0x2300);

    w.vftable(0x2480, 0x2400, &[0x1100]);
    w.vftable(0x24a0, 0x2420, &[0x1110]);
    w.vftable(0x24c0, 0x2440, &[0x1120]);
    w.vftable(0x24e0, 0x2460, &[0x1130]);
    w.finish()
}

#[test]
fn diamond_virtual_base_appears_once() {
    let image = diamond_image();
    let session = Session::new(&image);
    let graph = build_rtti_graph(&session);
    assert_eq!(graph.classes.len(), 4);
    assert!(graph.linearization.is_clean());

    let d = class_named(&graph, "D");
    assert_eq!(
        base_names(d),
        vec![("B1".to_string(), true), ("B2".to_string(), true)]
    );

    let b1 = class_named(&graph, "B1");
    let b2 = class_named(&graph, "B2");
    assert_eq!(base_names(b1), vec![("A".to_string(), true)]);
    assert_eq!(base_names(b2), vec![("A".to_string(), true)]);
    assert_eq!(base_names(class_named(&graph, "A")), vec![]);
}

fn entry_identity(entry: &BaseClassDescriptor) -> (Option<Address>, Address) {
    (
        entry.class_hierarchy_descriptor,
        entry.type_descriptor.address,
    )
}

#[test]
fn flat_base_arrays_rebuild_from_direct_bases() {
    let image = diamond_image();
    let session = Session::new(&image);
    let graph = build_rtti_graph(&session);
    assert!(graph.linearization.is_clean());

    // Entry 0 plus each direct base's own flattened array, with virtual
    // bases emitted only on first sight, must reproduce the class's flat
    // base-class array exactly.
    for class in &graph.classes {
        let flat = &class.class_hierarchy_descriptor.base_class_array.entries;
        let mut rebuilt = vec![entry_identity(&flat[0])];
        let mut seen: HashSet<(Option<Address>, Address)> = HashSet::new();

        for base in class.direct_bases().expect("bases should be resolved") {
            let chd = base
                .descriptor
                .nested_hierarchy(&session)
                .expect("base carries a hierarchy")
                .expect("hierarchy decodes");
            for (index, entry) in chd.base_class_array.entries.iter().enumerate() {
                let id = entry_identity(entry);
                let is_virtual = entry.is_virtual() || (index == 0 && base.is_virtual);
                if is_virtual && !seen.insert(id) {
                    continue;
                }
                rebuilt.push(id);
            }
        }

        let flat_ids: Vec<_> = flat.iter().map(|entry| entry_identity(entry)).collect();
        assert_eq!(rebuilt, flat_ids, "class {:?}", class.type_name());
    }
}

#[test]
fn cyclic_base_array_reports_unresolved() {
    let mut w = ImageWriter::new();
    w.type_descriptor(0x2100, ".?AVX@@");
    // X lists itself as a base; the fixed point can never resolve it.
    w.hierarchy(0x2140, 0, 0x2150, &[0x2160, 0x2180]);
    w.base_class(0x2160, 0x2100, 1, HAS_HIERARCHY, 0x2140);
    w.base_class(0x2180, 0x2100, 1, HAS_HIERARCHY, 0x2140);
    let image = w.finish();

    let session = Session::new(&image);
    let chd = ClassHierarchyDescriptor::build(&session, at(0x2140)).unwrap();
    let mut classes = vec![VisualCxxClass::new(chd)];

    let report = resolve_base_classes(&session, &mut classes);
    assert_eq!(report.unresolved, vec![at(0x2140)]);
    assert!(classes[0].direct_bases().is_none());
}

#[test]
fn throw_metadata_chains_from_type_descriptor() {
    let mut w = ImageWriter::new();
    w.type_descriptor(0x2100, ".?AVE@@");
    // CatchableType for E, trivially copyable.
    w.builder.write_u32(at(0x2140), 0);
    w.builder.write_u32(at(0x2144), rva(0x2100));
    w.builder.write_i32(at(0x2148), 0);
    w.builder.write_i32(at(0x214c), -1);
    w.builder.write_i32(at(0x2150), 0);
    w.builder.write_i32(at(0x2154), 8);
    w.builder.write_u32(at(0x2158), 0);
    // CatchableTypeArray with one entry.
    w.builder.write_i32(at(0x2180), 1);
    w.builder.write_u32(at(0x2184), rva(0x2140));
    // ThrowInfo with a destructor in .text.
    w.builder.write_u32(at(0x21a0), 0);
    w.builder.write_u32(at(0x21a4), rva(0x1300));
    w.builder.write_u32(at(0x21a8), 0);
    w.builder.write_u32(at(0x21ac), rva(0x2180));
    let image = w.finish();

    let session = Session::new(&image);
    let metadata = build_exception_metadata(&session);

    assert_eq!(metadata.catchable_types.len(), 1);
    assert_eq!(metadata.catchable_type_arrays.len(), 1);
    assert_eq!(metadata.throw_infos.len(), 1);

    let ti = &metadata.throw_infos[0];
    assert_eq!(ti.address, at(0x21a0));
    assert_eq!(ti.member_unwind, Some(at(0x1300)));
    assert!(ti.forward_compat.is_none());
    assert!(Arc::ptr_eq(
        &ti.catchable_type_array,
        &metadata.catchable_type_arrays[0]
    ));
    let ct = &ti.catchable_type_array.catchable_types[0];
    assert_eq!(
        ct.type_descriptor.type_name.as_ref().map(|n| n.qualified()),
        Some("E".to_string())
    );
}

#[test]
fn exception_directory_yields_compact_func_info() {
    let directory = AddressRange::with_size(at(0x2800), 12);
    let mut w = ImageWriter::with_exception_directory(directory);
    // Runtime function covering +0x1400..+0x1480.
    w.builder.write_u32(at(0x2800), rva(0x1400));
    w.builder.write_u32(at(0x2804), rva(0x1480));
    w.builder.write_u32(at(0x2808), rva(0x2820));
    // UNWIND_INFO: version 1, EHANDLER, no codes.
    w.builder.write_u8(at(0x2820), 1 | (0x1 << 3));
    w.builder.write_u8(at(0x2821), 4);
    w.builder.write_u8(at(0x2822), 0);
    w.builder.write_u8(at(0x2823), 0);
    w.builder.write_u32(at(0x2824), rva(0x1500)); // personality routine
    w.builder.write_u32(at(0x2828), rva(0x2840)); // handler data: FuncInfo4
    // FuncInfo4: EH flag only, empty ip-to-state map.
    w.builder.write_u8(at(0x2840), 0x20);
    w.builder.write_u32(at(0x2841), rva(0x2850));
    w.builder.write_u8(at(0x2850), 0); // compressed zero count
    let image = w.finish();

    let registry = SimpleFunctionRegistry::new();
    registry.insert(at(0x1500), Some("__CxxFrameHandler4"));

    let session = Session::new(&image).with_registry(&registry);
    let metadata = build_exception_metadata(&session);

    assert_eq!(metadata.function_exception_infos.len(), 1);
    let info = &metadata.function_exception_infos[0];
    assert_eq!(info.function_start, at(0x1400));
    assert_eq!(info.function_end, at(0x1480));
    assert_eq!(info.exception_handler, at(0x1500));
    assert_eq!(info.personality, Personality::CxxFrameHandler4);
    let HandlerData::Compact(fi) = &info.data else {
        panic!("expected compact handler data");
    };
    assert!(fi.unwind_map.is_empty());
    assert!(fi.try_blocks.is_empty());
    assert!(fi.ip_to_state_map.is_empty());
    assert_eq!(metadata.func_info4s.len(), 1);
}
