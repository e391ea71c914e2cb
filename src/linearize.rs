// Tue Feb 10 2026 - Alex

//! Direct-base recovery. The compiler flattens every class's inheritance
//! DAG into one pre-order base-class array with virtual bases emitted only
//! once. Inverting that is a fixed-point: a class's direct bases can be cut
//! out of its array only once each base's own flattened extent is known.

use crate::classes::{BaseResolution, VisualCxxBaseClass, VisualCxxClass};
use crate::memory::Address;
use crate::session::Session;
use crate::structs::BaseClassDescriptor;
use ahash::AHashSet;
use indexmap::IndexMap;
use std::sync::Arc;

/// Identity used to match base-array entries across classes. Hierarchy
/// descriptors are preferred; entries without one fall back to their type
/// descriptor, which cannot distinguish ambiguous repeated bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BaseIdentity {
    Hierarchy(Address),
    Type(Address),
}

fn identity(descriptor: &BaseClassDescriptor) -> BaseIdentity {
    match descriptor.class_hierarchy_descriptor {
        Some(address) => BaseIdentity::Hierarchy(address),
        None => BaseIdentity::Type(descriptor.type_descriptor.address),
    }
}

fn entries_match(actual: &BaseClassDescriptor, expected: &BaseClassDescriptor) -> bool {
    match (
        actual.class_hierarchy_descriptor,
        expected.class_hierarchy_descriptor,
    ) {
        (Some(a), Some(e)) => a == e,
        _ => {
            let matched =
                Arc::ptr_eq(&actual.type_descriptor, &expected.type_descriptor);
            if matched {
                log::warn!(
                    "matched base {} by type descriptor only; ambiguous bases \
                     sharing a type are indistinguishable here",
                    actual.type_descriptor.address
                );
            }
            matched
        }
    }
}

#[derive(Debug)]
enum NodeState {
    Pending,
    Resolved(Vec<VisualCxxBaseClass>),
    Failed(String),
}

struct Node {
    name: Option<String>,
    /// Flattened transitive bases: the owning array minus entry 0.
    tail: Vec<Arc<BaseClassDescriptor>>,
    state: NodeState,
}

#[derive(Debug)]
pub struct LinearizeFailure {
    pub class: Address,
    pub name: Option<String>,
    pub reason: String,
}

/// Outcome of a linearization pass. `unresolved` holds classes whose base
/// arrays depend on something that never resolved (cycles, or bases that
/// themselves failed).
#[derive(Debug, Default)]
pub struct LinearizeReport {
    pub failures: Vec<LinearizeFailure>,
    pub unresolved: Vec<Address>,
}

impl LinearizeReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.unresolved.is_empty()
    }
}

/// Resolves every class's direct-base list in place. Must run only after
/// RTTI discovery has finished: any class may appear as a base before it is
/// otherwise reachable.
pub fn resolve_base_classes(
    session: &Session,
    classes: &mut [VisualCxxClass],
) -> LinearizeReport {
    let mut nodes: IndexMap<BaseIdentity, Node> = IndexMap::new();

    for class in classes.iter() {
        let chd = &class.class_hierarchy_descriptor;
        nodes.entry(BaseIdentity::Hierarchy(chd.address)).or_insert_with(|| Node {
            name: chd.type_name().map(|name| name.qualified()),
            tail: chd.base_class_array.entries[1..].to_vec(),
            state: NodeState::Pending,
        });
    }

    // Pull in every base reachable through the class arrays, including
    // bases that never got a class of their own.
    let mut worklist: Vec<Arc<BaseClassDescriptor>> = classes
        .iter()
        .flat_map(|class| {
            class.class_hierarchy_descriptor.base_class_array.entries[1..]
                .iter()
                .cloned()
        })
        .collect();
    while let Some(descriptor) = worklist.pop() {
        let ident = identity(&descriptor);
        if nodes.contains_key(&ident) {
            continue;
        }
        let node = match descriptor.nested_hierarchy(session) {
            None => Node {
                name: descriptor
                    .type_descriptor
                    .type_name
                    .as_ref()
                    .map(|name| name.qualified()),
                tail: Vec::new(),
                state: NodeState::Pending,
            },
            Some(Ok(chd)) => {
                worklist.extend(chd.base_class_array.entries[1..].iter().cloned());
                Node {
                    name: chd.type_name().map(|name| name.qualified()),
                    tail: chd.base_class_array.entries[1..].to_vec(),
                    state: NodeState::Pending,
                }
            }
            Some(Err(rejection)) => Node {
                name: descriptor
                    .type_descriptor
                    .type_name
                    .as_ref()
                    .map(|name| name.qualified()),
                tail: Vec::new(),
                state: NodeState::Failed(format!(
                    "base hierarchy descriptor failed to decode: {rejection}"
                )),
            },
        };
        nodes.insert(ident, node);
    }

    // Fixed point: each round resolves every node whose dependencies all
    // resolved in earlier rounds, so the round count is bounded by the
    // inheritance depth.
    loop {
        let mut progressed = false;
        for index in 0..nodes.len() {
            if session.cancel_token().is_cancelled() {
                break;
            }
            if !matches!(nodes[index].state, NodeState::Pending) {
                continue;
            }
            let ready = nodes[index].tail.iter().all(|entry| {
                nodes
                    .get(&identity(entry))
                    .is_some_and(|node| matches!(node.state, NodeState::Resolved(_)))
            });
            if !ready {
                continue;
            }
            let state = match walk_direct_bases(&nodes, &nodes[index].tail) {
                Ok(direct) => NodeState::Resolved(direct),
                Err(reason) => NodeState::Failed(reason),
            };
            nodes[index].state = state;
            progressed = true;
        }
        if !progressed || session.cancel_token().is_cancelled() {
            break;
        }
    }

    let mut report = LinearizeReport::default();
    for class in classes.iter_mut() {
        let ident = BaseIdentity::Hierarchy(class.class_hierarchy_descriptor.address);
        let node = &nodes[&ident];
        class.bases = match &node.state {
            NodeState::Resolved(direct) => BaseResolution::Resolved(direct.clone()),
            NodeState::Failed(reason) => {
                log::warn!(
                    "failed to linearize {}: {reason}",
                    node.name.as_deref().unwrap_or("<unnamed class>")
                );
                report.failures.push(LinearizeFailure {
                    class: class.address(),
                    name: node.name.clone(),
                    reason: reason.clone(),
                });
                BaseResolution::Failed(reason.clone())
            }
            NodeState::Pending => {
                log::warn!(
                    "base hierarchy of {} never resolved",
                    node.name.as_deref().unwrap_or("<unnamed class>")
                );
                report.unresolved.push(class.address());
                BaseResolution::Unresolved
            }
        };
    }
    report
}

/// Cuts the direct bases out of one flattened array tail. The entry at the
/// cursor is direct; its own flattened extent is then skipped, checking each
/// skipped entry against the base's array. Virtual bases already consumed
/// earlier in the walk were emitted only once by the compiler and take no
/// slot here.
fn walk_direct_bases(
    nodes: &IndexMap<BaseIdentity, Node>,
    tail: &[Arc<BaseClassDescriptor>],
) -> Result<Vec<VisualCxxBaseClass>, String> {
    let mut direct = Vec::new();
    let mut seen: AHashSet<BaseIdentity> = AHashSet::new();
    let mut cursor = 0;

    while cursor < tail.len() {
        let entry = &tail[cursor];
        let ident = identity(entry);
        let is_virtual = entry.is_virtual();
        direct.push(VisualCxxBaseClass { descriptor: entry.clone(), is_virtual });
        if is_virtual {
            seen.insert(ident);
        }
        cursor += 1;

        let base = &nodes[&ident];
        for expected in &base.tail {
            let expected_ident = identity(expected);
            if expected.is_virtual() && seen.contains(&expected_ident) {
                continue;
            }
            let Some(actual) = tail.get(cursor) else {
                return Err(format!(
                    "base array ended while skipping transitive bases of {}",
                    base.name.as_deref().unwrap_or("<unnamed base>")
                ));
            };
            if !entries_match(actual, expected) {
                return Err(format!(
                    "base array entry at index {cursor} does not match the \
                     flattened bases of {}",
                    base.name.as_deref().unwrap_or("<unnamed base>")
                ));
            }
            if actual.is_virtual() {
                seen.insert(identity(actual));
            }
            cursor += 1;
        }
    }
    Ok(direct)
}
