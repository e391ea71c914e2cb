// Mon Feb 9 2026 - Alex

pub mod catchable_type;
pub mod compressed;
pub mod func_info;
pub mod func_info4;
pub mod scope_table;
pub mod throw_info;
pub mod unwind;

pub use catchable_type::{CatchableType, CatchableTypeArray, CtProperties};
pub use compressed::{read_compressed_int, CompressedInt, CompressedReader};
pub use func_info::{
    EsTypeList, FuncInfo, HandlerType, IpToStateMapEntry, TryBlockMapEntry, UnwindMapEntry,
};
pub use func_info4::{
    FuncInfo4, FuncInfo4Header, HandlerType4, HandlerType4Header, IpToStateMapEntry4,
    TryBlockMapEntry4, UnwindEntryType, UnwindMapEntry4,
};
pub use scope_table::{ScopeHandler, ScopeTable, ScopeTableEntry};
pub use throw_info::ThrowInfo;
pub use unwind::{
    ImageRuntimeFunction, Personality, UnwindCode, UnwindFlags, UnwindHandler, UnwindInfo,
};
