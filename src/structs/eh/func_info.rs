// Mon Feb 9 2026 - Alex

use crate::arch::uint_bytes;
use crate::layout::{FieldDef, FieldKind, StructLayout};
use crate::memory::Address;
use crate::scanner::{CandidateScanner, PatternSet};
use crate::session::{Rejection, Session};
use std::sync::Arc;

pub const MAGIC_V1: u32 = 0x1993_0520;
pub const MAGIC_V2: u32 = 0x1993_0521;
pub const MAGIC_V3: u32 = 0x1993_0522;

/// Top three bits of the magic word carry BBT instrumentation flags.
const MAGIC_MASK: u32 = 0x1FFF_FFFF;

const MAX_MAP_ENTRIES: u32 = 0xFFFF;

static LAYOUT: StructLayout = StructLayout::new(
    "FuncInfo",
    &[
        FieldDef::new("magicNumber", FieldKind::UInt(4)),
        FieldDef::new("maxState", FieldKind::Int(4)),
        FieldDef::new("pUnwindMap", FieldKind::Offset),
        FieldDef::new("nTryBlocks", FieldKind::UInt(4)),
        FieldDef::new("pTryBlockMap", FieldKind::Offset),
        FieldDef::new("nIPMapEntries", FieldKind::UInt(4)),
        FieldDef::new("pIPtoStateMap", FieldKind::Offset),
    ],
);

const FIELD_MAX_STATE: usize = 1;
const FIELD_UNWIND_MAP: usize = 2;
const FIELD_N_TRY_BLOCKS: usize = 3;
const FIELD_TRY_BLOCK_MAP: usize = 4;
const FIELD_N_IP_MAP_ENTRIES: usize = 5;
const FIELD_IP_TO_STATE_MAP: usize = 6;

static UNWIND_MAP_ENTRY_LAYOUT: StructLayout = StructLayout::new(
    "UnwindMapEntry",
    &[
        FieldDef::new("toState", FieldKind::Int(4)),
        FieldDef::new("action", FieldKind::Offset),
    ],
);

static TRY_BLOCK_MAP_ENTRY_LAYOUT: StructLayout = StructLayout::new(
    "TryBlockMapEntry",
    &[
        FieldDef::new("tryLow", FieldKind::Int(4)),
        FieldDef::new("tryHigh", FieldKind::Int(4)),
        FieldDef::new("catchHigh", FieldKind::Int(4)),
        FieldDef::new("nCatches", FieldKind::Int(4)),
        FieldDef::new("pHandlerArray", FieldKind::Offset),
    ],
);

static HANDLER_TYPE_LAYOUT: StructLayout = StructLayout::new(
    "HandlerType",
    &[
        FieldDef::new("adjectives", FieldKind::UInt(4)),
        FieldDef::new("pType", FieldKind::Offset),
        FieldDef::new("dispCatchObj", FieldKind::Int(4)),
        FieldDef::new("pHandler", FieldKind::Offset),
    ],
);

static IP_TO_STATE_MAP_ENTRY_LAYOUT: StructLayout = StructLayout::new(
    "IpToStateMapEntry",
    &[
        FieldDef::new("Ip", FieldKind::Offset),
        FieldDef::new("state", FieldKind::Int(4)),
    ],
);

static ES_TYPE_LIST_LAYOUT: StructLayout = StructLayout::new(
    "ESTypeList",
    &[
        FieldDef::new("nCount", FieldKind::Int(4)),
        FieldDef::new("pTypeArray", FieldKind::Offset),
    ],
);

#[derive(Debug, Clone)]
pub struct UnwindMapEntry {
    pub to_state: i32,
    pub action: Option<Address>,
}

/// Catch clause. A null type reference means `catch (...)`. The frame
/// displacement only exists on targets with image-relative offsets.
#[derive(Debug, Clone)]
pub struct HandlerType {
    pub address: Address,
    pub adjectives: u32,
    pub type_descriptor: Option<Address>,
    pub disp_catch_obj: i32,
    pub handler: Address,
    pub frame: Option<i32>,
}

impl HandlerType {
    pub fn is_catch_all(&self) -> bool {
        self.type_descriptor.is_none()
    }

    fn size(session: &Session) -> usize {
        let base = HANDLER_TYPE_LAYOUT.fixed_size(session.env());
        if session.arch().uses_relative_offsets() {
            base + 4
        } else {
            base
        }
    }

    fn read(session: &Session, address: Address) -> Result<Self, Rejection> {
        let env = session.env();
        let image = session.image();
        let unreadable =
            |e| Rejection::unreadable(HANDLER_TYPE_LAYOUT.name, address, e);

        let adjectives = image.read_u32(address).map_err(unreadable)?;
        let type_descriptor = session
            .codec()
            .read_offset(image, address + HANDLER_TYPE_LAYOUT.offset_of(1, env) as u64)
            .map_err(unreadable)?;
        let disp_catch_obj = image
            .read_i32(address + HANDLER_TYPE_LAYOUT.offset_of(2, env) as u64)
            .map_err(unreadable)?;
        let handler = session
            .codec()
            .read_offset(image, address + HANDLER_TYPE_LAYOUT.offset_of(3, env) as u64)
            .map_err(unreadable)?;
        let frame = if session.arch().uses_relative_offsets() {
            let offset = HANDLER_TYPE_LAYOUT.fixed_size(env);
            Some(image.read_i32(address + offset as u64).map_err(unreadable)?)
        } else {
            None
        };

        Ok(Self {
            address,
            adjectives,
            type_descriptor: (!type_descriptor.is_null()).then_some(type_descriptor),
            disp_catch_obj,
            handler,
            frame,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TryBlockMapEntry {
    pub try_low: i32,
    pub try_high: i32,
    pub catch_high: i32,
    pub handlers: Vec<HandlerType>,
}

#[derive(Debug, Clone)]
pub struct IpToStateMapEntry {
    pub ip: Address,
    pub state: i32,
}

#[derive(Debug, Clone)]
pub struct EsTypeList {
    pub address: Address,
    pub handlers: Vec<HandlerType>,
}

/// Per-function C++ exception metadata in its pointer-table form, emitted by
/// `__CxxFrameHandler` through `__CxxFrameHandler3` frontends.
#[derive(Debug)]
pub struct FuncInfo {
    pub address: Address,
    pub magic: u32,
    pub bbt_flags: u32,
    pub max_state: i32,
    pub unwind_map: Vec<UnwindMapEntry>,
    pub try_blocks: Vec<TryBlockMapEntry>,
    pub ip_to_state_map: Vec<IpToStateMapEntry>,
    pub es_type_list: Option<EsTypeList>,
    pub eh_flags: Option<i32>,
}

impl FuncInfo {
    pub fn build(session: &Session, address: Address) -> Result<Arc<Self>, Rejection> {
        session
            .func_infos
            .get_or_build(address, || Self::decode(session, address))
    }

    fn decode(session: &Session, address: Address) -> Result<Self, Rejection> {
        let env = session.env();
        let image = session.image();
        if !address.is_aligned(LAYOUT.alignment(env)) {
            return Err(Rejection::Misaligned { structure: LAYOUT.name, address });
        }
        let unreadable = |e| Rejection::unreadable(LAYOUT.name, address, e);
        let field = |index: usize| address + LAYOUT.offset_of(index, env) as u64;

        let raw_magic = image.read_u32(address).map_err(unreadable)?;
        let magic = raw_magic & MAGIC_MASK;
        let bbt_flags = raw_magic >> 29;
        if !matches!(magic, MAGIC_V1 | MAGIC_V2 | MAGIC_V3) {
            return Err(Rejection::invariant(
                LAYOUT.name,
                address,
                format!("unknown magic {magic:#x}"),
            ));
        }

        let max_state = image.read_i32(field(FIELD_MAX_STATE)).map_err(unreadable)?;
        if max_state < 0 || max_state as u32 > MAX_MAP_ENTRIES {
            return Err(Rejection::invariant(
                LAYOUT.name,
                address,
                format!("implausible state count {max_state}"),
            ));
        }
        let unwind_map = if max_state > 0 {
            let map = session
                .codec()
                .read_offset(image, field(FIELD_UNWIND_MAP))
                .map_err(unreadable)?;
            Self::read_unwind_map(session, map, max_state as u32)?
        } else {
            Vec::new()
        };

        let n_try_blocks = image
            .read_u32(field(FIELD_N_TRY_BLOCKS))
            .map_err(unreadable)?;
        if n_try_blocks > MAX_MAP_ENTRIES {
            return Err(Rejection::invariant(
                LAYOUT.name,
                address,
                format!("implausible try block count {n_try_blocks}"),
            ));
        }
        let try_blocks = if n_try_blocks > 0 {
            let map = session
                .codec()
                .read_offset(image, field(FIELD_TRY_BLOCK_MAP))
                .map_err(unreadable)?;
            Self::read_try_block_map(session, map, n_try_blocks)?
        } else {
            Vec::new()
        };

        let n_ip_map_entries = image
            .read_u32(field(FIELD_N_IP_MAP_ENTRIES))
            .map_err(unreadable)?;
        if n_ip_map_entries > MAX_MAP_ENTRIES {
            return Err(Rejection::invariant(
                LAYOUT.name,
                address,
                format!("implausible ip map count {n_ip_map_entries}"),
            ));
        }
        let ip_to_state_map = if n_ip_map_entries > 0 {
            let map = session
                .codec()
                .read_offset(image, field(FIELD_IP_TO_STATE_MAP))
                .map_err(unreadable)?;
            Self::read_ip_to_state_map(session, map, n_ip_map_entries)?
        } else {
            Vec::new()
        };

        let mut trailing = address + LAYOUT.fixed_size(env) as u64;
        // Image-relative layouts interpose a 4-byte dispUnwindHelp frame
        // slot between the fixed fields and the versioned tail.
        if session.arch().uses_relative_offsets() {
            trailing = trailing + 4;
        }
        let es_type_list = if magic >= MAGIC_V2 {
            let list = session
                .codec()
                .read_offset(image, trailing)
                .map_err(unreadable)?;
            trailing = trailing + env.offset_width() as u64;
            if list.is_null() {
                None
            } else {
                Some(Self::read_es_type_list(session, list)?)
            }
        } else {
            None
        };
        let eh_flags = if magic >= MAGIC_V3 {
            Some(image.read_i32(trailing).map_err(unreadable)?)
        } else {
            None
        };

        Ok(Self {
            address,
            magic,
            bbt_flags,
            max_state,
            unwind_map,
            try_blocks,
            ip_to_state_map,
            es_type_list,
            eh_flags,
        })
    }

    fn read_unwind_map(
        session: &Session,
        map: Address,
        count: u32,
    ) -> Result<Vec<UnwindMapEntry>, Rejection> {
        let env = session.env();
        let image = session.image();
        let stride = UNWIND_MAP_ENTRY_LAYOUT.fixed_size(env) as u64;
        let mut entries = Vec::with_capacity(count as usize);
        for index in 0..count as u64 {
            let entry = map + index * stride;
            let unreadable =
                |e| Rejection::unreadable(UNWIND_MAP_ENTRY_LAYOUT.name, entry, e);
            let to_state = image.read_i32(entry).map_err(unreadable)?;
            let action = session
                .codec()
                .read_offset(image, entry + UNWIND_MAP_ENTRY_LAYOUT.offset_of(1, env) as u64)
                .map_err(unreadable)?;
            entries.push(UnwindMapEntry {
                to_state,
                action: (!action.is_null()).then_some(action),
            });
        }
        Ok(entries)
    }

    fn read_try_block_map(
        session: &Session,
        map: Address,
        count: u32,
    ) -> Result<Vec<TryBlockMapEntry>, Rejection> {
        let env = session.env();
        let image = session.image();
        let stride = TRY_BLOCK_MAP_ENTRY_LAYOUT.fixed_size(env) as u64;
        let mut entries = Vec::with_capacity(count as usize);
        for index in 0..count as u64 {
            let entry = map + index * stride;
            let unreadable =
                |e| Rejection::unreadable(TRY_BLOCK_MAP_ENTRY_LAYOUT.name, entry, e);
            let try_low = image.read_i32(entry).map_err(unreadable)?;
            let try_high = image
                .read_i32(entry + TRY_BLOCK_MAP_ENTRY_LAYOUT.offset_of(1, env) as u64)
                .map_err(unreadable)?;
            let catch_high = image
                .read_i32(entry + TRY_BLOCK_MAP_ENTRY_LAYOUT.offset_of(2, env) as u64)
                .map_err(unreadable)?;
            let n_catches = image
                .read_i32(entry + TRY_BLOCK_MAP_ENTRY_LAYOUT.offset_of(3, env) as u64)
                .map_err(unreadable)?;
            if n_catches < 0 || n_catches as u32 > MAX_MAP_ENTRIES {
                return Err(Rejection::invariant(
                    TRY_BLOCK_MAP_ENTRY_LAYOUT.name,
                    entry,
                    format!("implausible catch count {n_catches}"),
                ));
            }
            let handler_array = session
                .codec()
                .read_offset(image, entry + TRY_BLOCK_MAP_ENTRY_LAYOUT.offset_of(4, env) as u64)
                .map_err(unreadable)?;
            let handlers =
                Self::read_handler_array(session, handler_array, n_catches as u32)?;
            entries.push(TryBlockMapEntry { try_low, try_high, catch_high, handlers });
        }
        Ok(entries)
    }

    fn read_handler_array(
        session: &Session,
        array: Address,
        count: u32,
    ) -> Result<Vec<HandlerType>, Rejection> {
        let stride = HandlerType::size(session) as u64;
        let mut handlers = Vec::with_capacity(count as usize);
        for index in 0..count as u64 {
            handlers.push(HandlerType::read(session, array + index * stride)?);
        }
        Ok(handlers)
    }

    fn read_ip_to_state_map(
        session: &Session,
        map: Address,
        count: u32,
    ) -> Result<Vec<IpToStateMapEntry>, Rejection> {
        let env = session.env();
        let image = session.image();
        let stride = IP_TO_STATE_MAP_ENTRY_LAYOUT.fixed_size(env) as u64;
        let mut entries = Vec::with_capacity(count as usize);
        for index in 0..count as u64 {
            let entry = map + index * stride;
            let unreadable =
                |e| Rejection::unreadable(IP_TO_STATE_MAP_ENTRY_LAYOUT.name, entry, e);
            let ip = session.codec().read_offset(image, entry).map_err(unreadable)?;
            let state = image
                .read_i32(entry + IP_TO_STATE_MAP_ENTRY_LAYOUT.offset_of(1, env) as u64)
                .map_err(unreadable)?;
            entries.push(IpToStateMapEntry { ip, state });
        }
        Ok(entries)
    }

    fn read_es_type_list(session: &Session, address: Address) -> Result<EsTypeList, Rejection> {
        let env = session.env();
        let image = session.image();
        let unreadable = |e| Rejection::unreadable(ES_TYPE_LIST_LAYOUT.name, address, e);
        let count = image.read_i32(address).map_err(unreadable)?;
        if count < 0 || count as u32 > MAX_MAP_ENTRIES {
            return Err(Rejection::invariant(
                ES_TYPE_LIST_LAYOUT.name,
                address,
                format!("implausible exception spec count {count}"),
            ));
        }
        let array = session
            .codec()
            .read_offset(image, address + ES_TYPE_LIST_LAYOUT.offset_of(1, env) as u64)
            .map_err(unreadable)?;
        let handlers = Self::read_handler_array(session, array, count as u32)?;
        Ok(EsTypeList { address, handlers })
    }

    /// Sweeps data sections for the three magic words, under every BBT flag
    /// combination the top bits can carry.
    pub fn search(session: &Session) -> Vec<Arc<Self>> {
        let mut set = PatternSet::new();
        for magic in [MAGIC_V1, MAGIC_V2, MAGIC_V3] {
            for bbt in 0u32..8 {
                let raw = magic | (bbt << 29);
                set.add_signature(uint_bytes(raw as u64, 4, session.arch().endianness()));
            }
        }

        let scanner = session.scanner();
        let candidates = CandidateScanner::new(session.image(), *session.codec(), &scanner)
            .candidates(&set, 0, LAYOUT.alignment(session.env()), session.cancel_token());

        let mut out = Vec::new();
        for candidate in candidates {
            match Self::build(session, candidate.address) {
                Ok(fi) => {
                    log::debug!("defined FuncInfo at {}", candidate.address);
                    out.push(fi);
                }
                Err(rejection) => {
                    log::debug!("rejected FuncInfo candidate: {}", rejection);
                }
            }
        }
        out
    }
}
