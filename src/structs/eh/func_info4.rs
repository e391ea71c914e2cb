// Mon Feb 9 2026 - Alex

//! Compact per-function exception metadata emitted for
//! `__CxxFrameHandler4` frontends. Every map is a compressed-count header
//! followed by variable-width entries, so decoding is a strict forward
//! walk with no random access.

use crate::memory::Address;
use crate::session::{Rejection, Session};
use crate::structs::eh::compressed::CompressedReader;
use bitflags::bitflags;
use std::sync::Arc;

const STRUCTURE: &str = "FuncInfo4";

const MAX_MAP_ENTRIES: u32 = 0xFFFF;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FuncInfo4Header: u8 {
        const IS_CATCH          = 0x01;
        const IS_SEPARATED      = 0x02;
        const BBT               = 0x04;
        const HAS_UNWIND_MAP    = 0x08;
        const HAS_TRY_BLOCK_MAP = 0x10;
        const EH                = 0x20;
        const NOEXCEPT          = 0x40;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandlerType4Header: u8 {
        const HAS_ADJECTIVES = 0x01;
        const HAS_TYPE       = 0x02;
        const HAS_CATCH_OBJ  = 0x04;
        const CONT_IS_RVA    = 0x08;
    }
}

/// Low two bits of an unwind entry's `nextOffsetAndType` word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindEntryType {
    NoUnwind,
    DtorWithObj,
    DtorWithPtrToObj,
    Rva,
}

impl UnwindEntryType {
    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => Self::NoUnwind,
            0b01 => Self::DtorWithObj,
            0b10 => Self::DtorWithPtrToObj,
            _ => Self::Rva,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnwindMapEntry4 {
    pub next_offset: u32,
    pub entry_type: UnwindEntryType,
    pub action: Option<Address>,
    pub object: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct HandlerType4 {
    pub address: Address,
    pub header: HandlerType4Header,
    pub adjectives: Option<u32>,
    pub type_descriptor: Option<Address>,
    pub disp_catch_obj: Option<u32>,
    pub handler: Address,
    pub continuation_addresses: Vec<u32>,
}

impl HandlerType4 {
    pub fn is_catch_all(&self) -> bool {
        self.type_descriptor.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct TryBlockMapEntry4 {
    pub try_low: u32,
    pub try_high: u32,
    pub catch_high: u32,
    pub handlers: Vec<HandlerType4>,
}

#[derive(Debug, Clone)]
pub struct IpToStateMapEntry4 {
    pub ip: u32,
    pub state: u32,
}

#[derive(Debug)]
pub struct FuncInfo4 {
    pub address: Address,
    pub header: FuncInfo4Header,
    pub bbt_flags: Option<u32>,
    pub unwind_map: Vec<UnwindMapEntry4>,
    pub try_blocks: Vec<TryBlockMapEntry4>,
    pub ip_to_state_map: Vec<IpToStateMapEntry4>,
    /// Frame displacement for funclets compiled out of catch bodies.
    pub disp_frame: Option<u32>,
}

impl FuncInfo4 {
    pub fn build(session: &Session, address: Address) -> Result<Arc<Self>, Rejection> {
        session
            .func_info4s
            .get_or_build(address, || Self::decode(session, address))
    }

    fn decode(session: &Session, address: Address) -> Result<Self, Rejection> {
        let image = session.image();
        let mut reader = CompressedReader::new(image, address);
        let unreadable = |e| Rejection::unreadable(STRUCTURE, address, e);

        let header = FuncInfo4Header::from_bits_truncate(
            reader.read_u8().map_err(unreadable)?,
        );

        let bbt_flags = if header.contains(FuncInfo4Header::BBT) {
            Some(reader.read_compressed().map_err(unreadable)?)
        } else {
            None
        };

        let unwind_map_address = if header.contains(FuncInfo4Header::HAS_UNWIND_MAP) {
            Some(reader.read_disp().map_err(unreadable)?)
        } else {
            None
        };
        let try_block_map_address = if header.contains(FuncInfo4Header::HAS_TRY_BLOCK_MAP) {
            Some(reader.read_disp().map_err(unreadable)?)
        } else {
            None
        };
        let ip_to_state_map_address = reader.read_disp().map_err(unreadable)?;

        let disp_frame = if header.contains(FuncInfo4Header::IS_CATCH) {
            Some(reader.read_compressed().map_err(unreadable)?)
        } else {
            None
        };

        let unwind_map = match unwind_map_address {
            Some(map) => Self::read_unwind_map(session, map)?,
            None => Vec::new(),
        };
        let try_blocks = match try_block_map_address {
            Some(map) => Self::read_try_block_map(session, map)?,
            None => Vec::new(),
        };
        let ip_to_state_map = if ip_to_state_map_address.is_null() {
            Vec::new()
        } else {
            Self::read_ip_to_state_map(session, ip_to_state_map_address)?
        };

        Ok(Self {
            address,
            header,
            bbt_flags,
            unwind_map,
            try_blocks,
            ip_to_state_map,
            disp_frame,
        })
    }

    fn check_count(structure: &'static str, address: Address, count: u32) -> Result<(), Rejection> {
        if count > MAX_MAP_ENTRIES {
            return Err(Rejection::invariant(
                structure,
                address,
                format!("implausible entry count {count}"),
            ));
        }
        Ok(())
    }

    fn read_unwind_map(
        session: &Session,
        map: Address,
    ) -> Result<Vec<UnwindMapEntry4>, Rejection> {
        const STRUCTURE: &str = "UwMap4";
        let mut reader = CompressedReader::new(session.image(), map);
        let unreadable = |e| Rejection::unreadable(STRUCTURE, map, e);

        let count = reader.read_compressed().map_err(unreadable)?;
        Self::check_count(STRUCTURE, map, count)?;

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = reader.read_compressed().map_err(unreadable)?;
            let entry_type = UnwindEntryType::from_bits(raw);
            let action = if entry_type != UnwindEntryType::NoUnwind {
                let action = reader.read_disp().map_err(unreadable)?;
                (!action.is_null()).then_some(action)
            } else {
                None
            };
            let object = if matches!(
                entry_type,
                UnwindEntryType::DtorWithObj | UnwindEntryType::DtorWithPtrToObj
            ) {
                Some(reader.read_compressed().map_err(unreadable)?)
            } else {
                None
            };
            entries.push(UnwindMapEntry4 {
                next_offset: raw >> 2,
                entry_type,
                action,
                object,
            });
        }
        Ok(entries)
    }

    fn read_try_block_map(
        session: &Session,
        map: Address,
    ) -> Result<Vec<TryBlockMapEntry4>, Rejection> {
        const STRUCTURE: &str = "TryBlockMap4";
        let mut reader = CompressedReader::new(session.image(), map);
        let unreadable = |e| Rejection::unreadable(STRUCTURE, map, e);

        let count = reader.read_compressed().map_err(unreadable)?;
        Self::check_count(STRUCTURE, map, count)?;

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let try_low = reader.read_compressed().map_err(unreadable)?;
            let try_high = reader.read_compressed().map_err(unreadable)?;
            let catch_high = reader.read_compressed().map_err(unreadable)?;
            let handler_array = reader.read_disp().map_err(unreadable)?;
            let handlers = Self::read_handler_map(session, handler_array)?;
            entries.push(TryBlockMapEntry4 { try_low, try_high, catch_high, handlers });
        }
        Ok(entries)
    }

    fn read_handler_map(
        session: &Session,
        map: Address,
    ) -> Result<Vec<HandlerType4>, Rejection> {
        const STRUCTURE: &str = "HandlerMap4";
        let mut reader = CompressedReader::new(session.image(), map);
        let unreadable = |e| Rejection::unreadable(STRUCTURE, map, e);

        let count = reader.read_compressed().map_err(unreadable)?;
        Self::check_count(STRUCTURE, map, count)?;

        let mut handlers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let address = reader.position();
            // Bits 4-5 of the raw header byte count trailing continuation
            // addresses; they are not part of the flag set.
            let raw_header = reader.read_u8().map_err(unreadable)?;
            let header = HandlerType4Header::from_bits_truncate(raw_header);
            let cont_addr_count = (raw_header >> 4) & 0b11;

            let adjectives = if header.contains(HandlerType4Header::HAS_ADJECTIVES) {
                Some(reader.read_compressed().map_err(unreadable)?)
            } else {
                None
            };
            let type_descriptor = if header.contains(HandlerType4Header::HAS_TYPE) {
                let ty = reader.read_disp().map_err(unreadable)?;
                (!ty.is_null()).then_some(ty)
            } else {
                None
            };
            let disp_catch_obj = if header.contains(HandlerType4Header::HAS_CATCH_OBJ) {
                Some(reader.read_compressed().map_err(unreadable)?)
            } else {
                None
            };
            let handler = reader.read_disp().map_err(unreadable)?;
            let mut continuation_addresses = Vec::with_capacity(cont_addr_count as usize);
            for _ in 0..cont_addr_count {
                continuation_addresses
                    .push(reader.read_compressed().map_err(unreadable)?);
            }

            handlers.push(HandlerType4 {
                address,
                header,
                adjectives,
                type_descriptor,
                disp_catch_obj,
                handler,
                continuation_addresses,
            });
        }
        Ok(handlers)
    }

    fn read_ip_to_state_map(
        session: &Session,
        map: Address,
    ) -> Result<Vec<IpToStateMapEntry4>, Rejection> {
        const STRUCTURE: &str = "IPtoStateMap4";
        let mut reader = CompressedReader::new(session.image(), map);
        let unreadable = |e| Rejection::unreadable(STRUCTURE, map, e);

        let count = reader.read_compressed().map_err(unreadable)?;
        Self::check_count(STRUCTURE, map, count)?;

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let ip = reader.read_compressed().map_err(unreadable)?;
            let state = reader.read_compressed().map_err(unreadable)?;
            entries.push(IpToStateMapEntry4 { ip, state });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::TargetArch;
    use crate::memory::{AddressRange, OwnedImage, SectionSemantics};
    use crate::structs::eh::compressed::encode_compressed_int;

    #[test]
    fn decodes_variable_layout() {
        let base = Address::new(0x1_4000_0000);
        let fi = base + 0x100;
        let uw_map = base + 0x200;
        let tb_map = base + 0x300;
        let handlers = base + 0x400;
        let ip_map = base + 0x500;

        let mut builder = OwnedImage::builder(base, TargetArch::X64).section(
            ".rdata",
            AddressRange::with_size(base, 0x1000),
            SectionSemantics::ReadOnlyData,
        );

        // header: unwind + try block maps present, EH semantics
        let mut cursor = fi;
        let header = FuncInfo4Header::HAS_UNWIND_MAP
            | FuncInfo4Header::HAS_TRY_BLOCK_MAP
            | FuncInfo4Header::EH;
        builder.write_u8(cursor, header.bits());
        cursor = cursor + 1;
        builder.write_u32(cursor, (uw_map - base) as u32);
        cursor = cursor + 4;
        builder.write_u32(cursor, (tb_map - base) as u32);
        cursor = cursor + 4;
        builder.write_u32(cursor, (ip_map - base) as u32);

        // unwind map: one destructor entry with an object displacement
        let mut cursor = uw_map;
        for value in [1u32, (0x40 << 2) | 0b01] {
            let bytes = encode_compressed_int(value);
            builder.write_bytes(cursor, &bytes);
            cursor = cursor + bytes.len() as u64;
        }
        builder.write_u32(cursor, 0x2000); // action disp
        cursor = cursor + 4;
        let object = encode_compressed_int(0x18);
        builder.write_bytes(cursor, &object);

        // try block map: one entry pointing at the handler map
        let mut cursor = tb_map;
        for value in [1u32, 0, 1, 2] {
            let bytes = encode_compressed_int(value);
            builder.write_bytes(cursor, &bytes);
            cursor = cursor + bytes.len() as u64;
        }
        builder.write_u32(cursor, (handlers - base) as u32);

        // handler map: one catch-all handler with a continuation address
        let mut cursor = handlers;
        let count = encode_compressed_int(1);
        builder.write_bytes(cursor, &count);
        cursor = cursor + count.len() as u64;
        builder.write_u8(cursor, HandlerType4Header::CONT_IS_RVA.bits() | (1 << 4));
        cursor = cursor + 1;
        builder.write_u32(cursor, 0x3000); // pOfHandler disp
        cursor = cursor + 4;
        let cont = encode_compressed_int(0x1234);
        builder.write_bytes(cursor, &cont);

        // ip-to-state map: two entries
        let mut cursor = ip_map;
        for value in [2u32, 0x10, 0, 0x90, 1] {
            let bytes = encode_compressed_int(value);
            builder.write_bytes(cursor, &bytes);
            cursor = cursor + bytes.len() as u64;
        }

        let image = builder.build();
        let session = Session::new(&image);
        let info = FuncInfo4::build(&session, fi).unwrap();

        assert_eq!(info.header, header);
        assert!(info.bbt_flags.is_none());
        assert!(info.disp_frame.is_none());

        assert_eq!(info.unwind_map.len(), 1);
        let uw = &info.unwind_map[0];
        assert_eq!(uw.entry_type, UnwindEntryType::DtorWithObj);
        assert_eq!(uw.next_offset, 0x40);
        assert_eq!(uw.action, Some(base + 0x2000));
        assert_eq!(uw.object, Some(0x18));

        assert_eq!(info.try_blocks.len(), 1);
        let tb = &info.try_blocks[0];
        assert_eq!((tb.try_low, tb.try_high, tb.catch_high), (0, 1, 2));
        assert_eq!(tb.handlers.len(), 1);
        let handler = &tb.handlers[0];
        assert!(handler.is_catch_all());
        assert_eq!(handler.handler, base + 0x3000);
        assert_eq!(handler.continuation_addresses, vec![0x1234]);

        assert_eq!(info.ip_to_state_map.len(), 2);
        assert_eq!(info.ip_to_state_map[1].ip, 0x90);
        assert_eq!(info.ip_to_state_map[1].state, 1);
    }

    #[test]
    fn catch_funclet_header_reads_frame_displacement() {
        let base = Address::new(0x1_4000_0000);
        let fi = base + 0x100;
        let ip_map = base + 0x200;

        let mut builder = OwnedImage::builder(base, TargetArch::X64).section(
            ".rdata",
            AddressRange::with_size(base, 0x1000),
            SectionSemantics::ReadOnlyData,
        );

        let header = FuncInfo4Header::BBT | FuncInfo4Header::IS_CATCH;
        let mut cursor = fi;
        builder.write_u8(cursor, header.bits());
        cursor = cursor + 1;
        let bbt = encode_compressed_int(0b11);
        builder.write_bytes(cursor, &bbt);
        cursor = cursor + bbt.len() as u64;
        builder.write_u32(cursor, (ip_map - base) as u32);
        cursor = cursor + 4;
        let frame = encode_compressed_int(0x58);
        builder.write_bytes(cursor, &frame);
        builder.write_bytes(ip_map, &encode_compressed_int(0));

        let image = builder.build();
        let session = Session::new(&image);
        let info = FuncInfo4::build(&session, fi).unwrap();

        assert_eq!(info.header, header);
        assert_eq!(info.bbt_flags, Some(0b11));
        assert_eq!(info.disp_frame, Some(0x58));
        assert!(info.unwind_map.is_empty());
        assert!(info.try_blocks.is_empty());
        assert!(info.ip_to_state_map.is_empty());
    }
}
