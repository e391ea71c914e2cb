// Thu Feb 12 2026 - Alex

//! Flat, serializable views of the recovered graphs. These are plain data
//! for downstream tooling; nothing here holds a live reference back into
//! the session.

use crate::classes::{BaseResolution, VisualCxxClass};
use crate::eh::{ExceptionMetadata, FunctionExceptionInfo, HandlerData};
use crate::memory::Address;
use crate::name::simplify_std_name;
use crate::rtti::RttiGraph;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
pub struct VftableSummary {
    pub address: Address,
    pub subobject_offset: u32,
    pub constructor_displacement_offset: u32,
    pub method_count: usize,
}

#[derive(Debug, Serialize)]
pub struct BaseSummary {
    pub name: Option<String>,
    pub is_virtual: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "bases")]
pub enum BaseListSummary {
    Unresolved,
    Resolved(Vec<BaseSummary>),
    Failed(String),
}

#[derive(Debug, Serialize)]
pub struct ClassSummary {
    pub name: Option<String>,
    pub hierarchy_descriptor: Address,
    pub vftables: Vec<VftableSummary>,
    pub direct_bases: BaseListSummary,
}

#[derive(Debug, Serialize)]
pub struct ThrowInfoSummary {
    pub address: Address,
    pub attributes: u32,
    pub catchable_type_names: Vec<Option<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerDataKind {
    Classic,
    Compact,
    ScopeTable,
    GuardOnly,
}

#[derive(Debug, Serialize)]
pub struct FunctionSummary {
    pub start: Address,
    pub end: Address,
    pub exception_handler: Address,
    pub personality: String,
    pub handler_data: HandlerDataKind,
}

#[derive(Debug, Serialize)]
pub struct RecoverySummary {
    pub classes: Vec<ClassSummary>,
    pub free_standing_types: Vec<Option<String>>,
    pub throw_infos: Vec<ThrowInfoSummary>,
    pub functions: Vec<FunctionSummary>,
}

impl RecoverySummary {
    pub fn new(rtti: &RttiGraph, exceptions: &ExceptionMetadata) -> Self {
        Self {
            classes: rtti.classes.iter().map(summarize_class).collect(),
            free_standing_types: rtti
                .free_standing_type_descriptors
                .iter()
                .map(|td| td.type_name.as_ref().map(display_name))
                .collect(),
            throw_infos: exceptions
                .throw_infos
                .iter()
                .map(|ti| ThrowInfoSummary {
                    address: ti.address,
                    attributes: ti.attributes,
                    catchable_type_names: ti
                        .catchable_type_array
                        .catchable_types
                        .iter()
                        .map(|ct| ct.type_descriptor.type_name.as_ref().map(display_name))
                        .collect(),
                })
                .collect(),
            functions: exceptions
                .function_exception_infos
                .iter()
                .map(summarize_function)
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, ExportError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, ExportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn display_name(name: &crate::name::TypeName) -> String {
    simplify_std_name(&name.qualified())
}

fn summarize_class(class: &VisualCxxClass) -> ClassSummary {
    ClassSummary {
        name: class.type_name().map(display_name),
        hierarchy_descriptor: class.address(),
        vftables: class
            .vftables()
            .map(|vft| VftableSummary {
                address: vft.address,
                subobject_offset: vft.meta.offset,
                constructor_displacement_offset: vft.meta.constructor_displacement_offset,
                method_count: vft.method_addresses.len(),
            })
            .collect(),
        direct_bases: match &class.bases {
            BaseResolution::Unresolved => BaseListSummary::Unresolved,
            BaseResolution::Failed(reason) => BaseListSummary::Failed(reason.clone()),
            BaseResolution::Resolved(bases) => BaseListSummary::Resolved(
                bases
                    .iter()
                    .map(|base| BaseSummary {
                        name: base.type_name().map(display_name),
                        is_virtual: base.is_virtual,
                    })
                    .collect(),
            ),
        },
    }
}

fn summarize_function(info: &FunctionExceptionInfo) -> FunctionSummary {
    FunctionSummary {
        start: info.function_start,
        end: info.function_end,
        exception_handler: info.exception_handler,
        personality: format!("{:?}", info.personality),
        handler_data: match info.data {
            HandlerData::Classic(_) => HandlerDataKind::Classic,
            HandlerData::Compact(_) => HandlerDataKind::Compact,
            HandlerData::ScopeTable(_) => HandlerDataKind::ScopeTable,
            HandlerData::GuardOnly => HandlerDataKind::GuardOnly,
        },
    }
}
