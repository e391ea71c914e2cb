// Wed Feb 11 2026 - Alex

//! Exception metadata recovery. Throw-side discovery mirrors the RTTI
//! pipeline (type descriptors anchor catchable types, which anchor arrays,
//! which anchor throw infos). Catch-side FuncInfo comes from two routes:
//! magic-word scans for the classic pointer-table form, and the exception
//! directory for everything reached through a known personality routine.

use crate::memory::Address;
use crate::session::Session;
use crate::structs::eh::{
    CatchableType, CatchableTypeArray, FuncInfo, FuncInfo4, ImageRuntimeFunction, Personality,
    ScopeTable, ThrowInfo, UnwindHandler,
};
use crate::structs::TypeDescriptor;
use std::sync::Arc;

/// What a personality routine's handler data decoded to.
#[derive(Debug)]
pub enum HandlerData {
    Classic(Arc<FuncInfo>),
    Compact(Arc<FuncInfo4>),
    ScopeTable(ScopeTable),
    /// Stack-guard cookie check only; no exception metadata behind it.
    GuardOnly,
}

/// Per-function view stitched from the exception directory.
#[derive(Debug)]
pub struct FunctionExceptionInfo {
    pub function_start: Address,
    pub function_end: Address,
    pub exception_handler: Address,
    pub personality: Personality,
    pub data: HandlerData,
}

#[derive(Debug)]
pub struct ExceptionMetadata {
    pub catchable_types: Vec<Arc<CatchableType>>,
    pub catchable_type_arrays: Vec<Arc<CatchableTypeArray>>,
    pub throw_infos: Vec<Arc<ThrowInfo>>,
    pub func_infos: Vec<Arc<FuncInfo>>,
    pub func_info4s: Vec<Arc<FuncInfo4>>,
    pub function_exception_infos: Vec<FunctionExceptionInfo>,
}

pub fn build_exception_metadata(session: &Session) -> ExceptionMetadata {
    // Reuse descriptors an earlier RTTI pass already validated; scan only
    // when this builder runs on its own.
    let mut type_descriptors = session.type_descriptors.instances();
    if type_descriptors.is_empty() {
        type_descriptors = TypeDescriptor::search(session);
    }

    let catchable_types =
        CatchableType::search_with_type_descriptors(session, &type_descriptors);
    log::info!("found {} catchable types", catchable_types.len());

    let catchable_type_arrays = CatchableTypeArray::search(session, &catchable_types);
    log::info!("found {} catchable type arrays", catchable_type_arrays.len());

    let throw_infos =
        ThrowInfo::search_with_catchable_type_arrays(session, &catchable_type_arrays);
    log::info!("found {} throw infos", throw_infos.len());

    let scanned_func_infos = FuncInfo::search(session);
    log::info!("found {} FuncInfos by magic scan", scanned_func_infos.len());

    let function_exception_infos = walk_personalities(session);

    // The directory walk may have built FuncInfos the magic scan missed
    // (and vice versa); the caches hold the union.
    ExceptionMetadata {
        catchable_types,
        catchable_type_arrays,
        throw_infos,
        func_infos: session.func_infos.instances(),
        func_info4s: session.func_info4s.instances(),
        function_exception_infos,
    }
}

/// Classifies every exception-directory entry by its personality routine
/// and decodes the handler data accordingly. Functions whose personality we
/// cannot name are left out, at debug level.
fn walk_personalities(session: &Session) -> Vec<FunctionExceptionInfo> {
    let image = session.image();
    let mut out = Vec::new();

    for entry in ImageRuntimeFunction::walk_exception_directory(session) {
        // Chained entries share their parent's handler; decoding the parent
        // once is enough.
        if matches!(entry.unwind_info.handler, UnwindHandler::Chained(_)) {
            continue;
        }
        let Some((handler, data)) = entry.unwind_info.handler_data() else {
            continue;
        };
        let Some(name) = session
            .registry()
            .and_then(|registry| registry.function_at(handler))
            .and_then(|function| function.name)
        else {
            log::debug!("no symbol for exception handler at {handler}");
            continue;
        };
        let Some(personality) = Personality::from_symbol(&name) else {
            log::debug!("unrecognized exception personality {name} at {handler}");
            continue;
        };

        let decoded = if personality.uses_scope_table() {
            ScopeTable::read(session, data).map(HandlerData::ScopeTable)
        } else if personality.uses_classic_metadata() {
            image
                .read_u32(data)
                .map_err(|e| crate::session::Rejection::unreadable("FuncInfo", data, e))
                .and_then(|disp| FuncInfo::build(session, image.base() + disp as u64))
                .map(HandlerData::Classic)
        } else if personality.uses_compact_metadata() {
            image
                .read_u32(data)
                .map_err(|e| crate::session::Rejection::unreadable("FuncInfo4", data, e))
                .and_then(|disp| FuncInfo4::build(session, image.base() + disp as u64))
                .map(HandlerData::Compact)
        } else {
            Ok(HandlerData::GuardOnly)
        };

        match decoded {
            Ok(data) => out.push(FunctionExceptionInfo {
                function_start: entry.start,
                function_end: entry.end,
                exception_handler: handler,
                personality,
                data,
            }),
            Err(rejection) => {
                log::warn!(
                    "dropping exception info for function at {}: {rejection}",
                    entry.start
                );
            }
        }
    }
    out
}
