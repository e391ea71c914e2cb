// Mon Feb 9 2026 - Alex

//! x64 exception-directory walking. Each runtime function carries an
//! UNWIND_INFO whose trailing language-specific handler tells us which
//! exception personality owns the function, and where its handler data
//! lives. That handler data is what seeds FuncInfo recovery.

use crate::memory::Address;
use crate::session::{Rejection, Session};
use bitflags::bitflags;

pub const UNWIND_REGISTERS: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi",
    "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];

/// Guard against chained-info loops in damaged directories.
const MAX_CHAIN_DEPTH: usize = 16;

const RUNTIME_FUNCTION_SIZE: u64 = 12;
const UNWIND_INFO_HEADER_SIZE: u64 = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnwindFlags: u8 {
        const EHANDLER  = 0x1;
        const UHANDLER  = 0x2;
        const CHAININFO = 0x4;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwindCode {
    PushNonVol { offset: u8, register: &'static str },
    AllocLarge { offset: u8, size: u32 },
    AllocSmall { offset: u8, size: u32 },
    SetFpRegister { offset: u8 },
    SaveNonVol { offset: u8, register: &'static str, stack_offset: u32 },
    SaveNonVolFar { offset: u8, register: &'static str, stack_offset: u32 },
    SaveXmm128 { offset: u8, register: u8, stack_offset: u32 },
    SaveXmm128Far { offset: u8, register: u8, stack_offset: u32 },
    PushMachFrame { offset: u8, has_error_code: bool },
}

/// What follows the unwind code array, selected by the header flags.
#[derive(Debug)]
pub enum UnwindHandler {
    None,
    /// CHAININFO: this entry continues the parent function's unwind data.
    Chained(Box<ImageRuntimeFunction>),
    /// EHANDLER/UHANDLER: language-specific handler plus its data blob.
    Handler { exception_handler: Address, data: Address },
}

#[derive(Debug)]
pub struct UnwindInfo {
    pub address: Address,
    pub version: u8,
    pub flags: UnwindFlags,
    pub prolog_size: u8,
    pub frame_register: &'static str,
    pub frame_register_offset: u8,
    pub codes: Vec<UnwindCode>,
    pub handler: UnwindHandler,
}

impl UnwindInfo {
    const STRUCTURE: &'static str = "UnwindInfo";

    pub fn read(session: &Session, address: Address) -> Result<Self, Rejection> {
        Self::read_at_depth(session, address, 0)
    }

    fn read_at_depth(
        session: &Session,
        address: Address,
        depth: usize,
    ) -> Result<Self, Rejection> {
        let image = session.image();
        let unreadable = |e| Rejection::unreadable(Self::STRUCTURE, address, e);

        let header = image
            .read_bytes(address, UNWIND_INFO_HEADER_SIZE as usize)
            .map_err(unreadable)?;
        let version = header[0] & 0b111;
        let flags = UnwindFlags::from_bits_truncate(header[0] >> 3);
        let prolog_size = header[1];
        let code_count = header[2] as usize;
        let frame_register = UNWIND_REGISTERS[(header[3] >> 4) as usize];
        let frame_register_offset = (header[3] & 0xF) * 16;

        let code_start = address + UNWIND_INFO_HEADER_SIZE;
        let raw = image
            .read_bytes(code_start, code_count * 2)
            .map_err(unreadable)?;
        let slots: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let codes = Self::parse_codes(address, &slots)?;

        let mut current = code_start + (code_count * 2) as u64;
        current = current.align_up(4);

        let handler = if flags.contains(UnwindFlags::CHAININFO) {
            if depth >= MAX_CHAIN_DEPTH {
                return Err(Rejection::invariant(
                    Self::STRUCTURE,
                    address,
                    "chained unwind info exceeds depth limit".to_string(),
                ));
            }
            UnwindHandler::Chained(Box::new(ImageRuntimeFunction::read_at_depth(
                session,
                current,
                depth + 1,
            )?))
        } else if flags.intersects(UnwindFlags::EHANDLER | UnwindFlags::UHANDLER) {
            let disp = image.read_u32(current).map_err(unreadable)?;
            UnwindHandler::Handler {
                exception_handler: image.base() + disp as u64,
                data: current + 4,
            }
        } else {
            UnwindHandler::None
        };

        Ok(Self {
            address,
            version,
            flags,
            prolog_size,
            frame_register,
            frame_register_offset,
            codes,
            handler,
        })
    }

    fn parse_codes(address: Address, slots: &[u16]) -> Result<Vec<UnwindCode>, Rejection> {
        let mut codes = Vec::new();
        let mut i = 0;
        let next = |i: &mut usize| -> Result<u16, Rejection> {
            let slot = slots.get(*i).copied().ok_or_else(|| {
                Rejection::invariant(
                    Self::STRUCTURE,
                    address,
                    "unwind code operand past end of array".to_string(),
                )
            })?;
            *i += 1;
            Ok(slot)
        };

        while i < slots.len() {
            let raw = slots[i];
            i += 1;
            let offset = (raw & 0xFF) as u8;
            let op = (raw >> 8) & 0xF;
            let info = (raw >> 12) as u8;

            let code = match op {
                0 => UnwindCode::PushNonVol {
                    offset,
                    register: UNWIND_REGISTERS[info as usize],
                },
                1 => {
                    let size = match info {
                        0 => next(&mut i)? as u32 * 8,
                        1 => {
                            let lo = next(&mut i)? as u32;
                            let hi = next(&mut i)? as u32;
                            lo | (hi << 16)
                        }
                        _ => {
                            return Err(Rejection::invariant(
                                Self::STRUCTURE,
                                address,
                                format!("invalid ALLOC_LARGE info {info}"),
                            ))
                        }
                    };
                    UnwindCode::AllocLarge { offset, size }
                }
                2 => UnwindCode::AllocSmall { offset, size: info as u32 * 8 + 8 },
                3 => UnwindCode::SetFpRegister { offset },
                4 => UnwindCode::SaveNonVol {
                    offset,
                    register: UNWIND_REGISTERS[info as usize],
                    stack_offset: next(&mut i)? as u32 * 8,
                },
                5 => {
                    let lo = next(&mut i)? as u32;
                    let hi = next(&mut i)? as u32;
                    UnwindCode::SaveNonVolFar {
                        offset,
                        register: UNWIND_REGISTERS[info as usize],
                        stack_offset: lo | (hi << 16),
                    }
                }
                8 => UnwindCode::SaveXmm128 {
                    offset,
                    register: info,
                    stack_offset: next(&mut i)? as u32 * 16,
                },
                9 => {
                    let lo = next(&mut i)? as u32;
                    let hi = next(&mut i)? as u32;
                    UnwindCode::SaveXmm128Far {
                        offset,
                        register: info,
                        stack_offset: lo | (hi << 16),
                    }
                }
                10 => UnwindCode::PushMachFrame { offset, has_error_code: info != 0 },
                _ => {
                    return Err(Rejection::invariant(
                        Self::STRUCTURE,
                        address,
                        format!("invalid unwind opcode {op}"),
                    ))
                }
            };
            codes.push(code);
        }
        Ok(codes)
    }

    /// Follows CHAININFO links to the unwind info that actually owns the
    /// handler, then returns it with its data blob.
    pub fn handler_data(&self) -> Option<(Address, Address)> {
        match &self.handler {
            UnwindHandler::None => None,
            UnwindHandler::Chained(parent) => parent.unwind_info.handler_data(),
            UnwindHandler::Handler { exception_handler, data } => {
                Some((*exception_handler, *data))
            }
        }
    }
}

/// One exception-directory entry: the RVAs of a function's extent and its
/// unwind information.
#[derive(Debug)]
pub struct ImageRuntimeFunction {
    pub address: Address,
    pub start: Address,
    pub end: Address,
    pub unwind_info: UnwindInfo,
}

impl ImageRuntimeFunction {
    const STRUCTURE: &'static str = "ImageRuntimeFunction";

    pub fn read(session: &Session, address: Address) -> Result<Self, Rejection> {
        Self::read_at_depth(session, address, 0)
    }

    fn read_at_depth(
        session: &Session,
        address: Address,
        depth: usize,
    ) -> Result<Self, Rejection> {
        let image = session.image();
        let base = image.base();
        let unreadable = |e| Rejection::unreadable(Self::STRUCTURE, address, e);

        let begin = image.read_u32(address).map_err(unreadable)?;
        let end = image.read_u32(address + 4).map_err(unreadable)?;
        let unwind = image.read_u32(address + 8).map_err(unreadable)?;
        if begin == 0 || end <= begin {
            return Err(Rejection::invariant(
                Self::STRUCTURE,
                address,
                "empty function extent".to_string(),
            ));
        }

        let unwind_info = UnwindInfo::read_at_depth(session, base + unwind as u64, depth)?;
        Ok(Self {
            address,
            start: base + begin as u64,
            end: base + end as u64,
            unwind_info,
        })
    }

    /// Walks every entry of the image's exception directory. Zeroed
    /// padding entries are skipped; anything else that fails to decode is
    /// reported and dropped.
    pub fn walk_exception_directory(session: &Session) -> Vec<Self> {
        let image = session.image();
        let Some(directory) = image.exception_directory() else {
            return Vec::new();
        };

        let mut entries = Vec::new();
        let mut address = directory.start;
        while address + RUNTIME_FUNCTION_SIZE <= directory.end {
            if session.cancel_token().is_cancelled() {
                break;
            }
            match Self::read(session, address) {
                Ok(entry) => entries.push(entry),
                Err(Rejection::Invariant { reason, .. }) if reason == "empty function extent" => {}
                Err(rejection) => {
                    log::warn!("failed to parse runtime function at {address}: {rejection}");
                }
            }
            address = address + RUNTIME_FUNCTION_SIZE;
        }
        entries
    }
}

/// Language-specific handler personalities we know how to interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personality {
    /// `__C_specific_handler`: SEH scope tables.
    SpecificHandler,
    /// `__GSHandlerCheck`: cookie check only, no exception metadata.
    GsCheck,
    /// `__GSHandlerCheck_SEH`: cookie check plus SEH scope table.
    GsCheckSeh,
    /// `__CxxFrameHandler` through `__CxxFrameHandler3`: classic FuncInfo.
    CxxFrameHandler,
    /// `__GSHandlerCheck_EH`: cookie check plus classic FuncInfo.
    GsCheckEh,
    /// `__CxxFrameHandler4`: compact FuncInfo4.
    CxxFrameHandler4,
    /// `__GSHandlerCheck_EH4`: cookie check plus compact FuncInfo4.
    GsCheckEh4,
}

impl Personality {
    pub fn from_symbol(name: &str) -> Option<Self> {
        let name = name.strip_prefix("_imp_").unwrap_or(name);
        match name {
            "__C_specific_handler" => Some(Self::SpecificHandler),
            "__GSHandlerCheck" => Some(Self::GsCheck),
            "__GSHandlerCheck_SEH" => Some(Self::GsCheckSeh),
            "__CxxFrameHandler" | "__CxxFrameHandler2" | "__CxxFrameHandler3" => {
                Some(Self::CxxFrameHandler)
            }
            "__GSHandlerCheck_EH" => Some(Self::GsCheckEh),
            "__CxxFrameHandler4" => Some(Self::CxxFrameHandler4),
            "__GSHandlerCheck_EH4" => Some(Self::GsCheckEh4),
            _ => None,
        }
    }

    /// Handler data starts with a classic FuncInfo reference.
    pub fn uses_classic_metadata(self) -> bool {
        matches!(self, Self::CxxFrameHandler | Self::GsCheckEh)
    }

    /// Handler data starts with a displacement to a FuncInfo4.
    pub fn uses_compact_metadata(self) -> bool {
        matches!(self, Self::CxxFrameHandler4 | Self::GsCheckEh4)
    }

    /// Handler data is an SEH scope table.
    pub fn uses_scope_table(self) -> bool {
        matches!(self, Self::SpecificHandler | Self::GsCheckSeh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::TargetArch;
    use crate::memory::{AddressRange, OwnedImage, SectionSemantics};

    fn write_runtime_function(
        builder: &mut crate::memory::OwnedImageBuilder,
        entry: Address,
        begin: u32,
        end: u32,
        unwind: u32,
    ) {
        builder.write_u32(entry, begin);
        builder.write_u32(entry + 4, end);
        builder.write_u32(entry + 8, unwind);
    }

    #[test]
    fn decodes_codes_and_handler() {
        let base = Address::new(0x1_4000_0000);
        let directory = AddressRange::with_size(base + 0x100, RUNTIME_FUNCTION_SIZE);
        let unwind = base + 0x200;

        let mut builder = OwnedImage::builder(base, TargetArch::X64)
            .section(
                ".rdata",
                AddressRange::with_size(base, 0x1000),
                SectionSemantics::ReadOnlyData,
            )
            .exception_directory(directory);
        write_runtime_function(&mut builder, directory.start, 0x1000, 0x1080, 0x200);

        builder.write_u8(unwind, 1 | (UnwindFlags::EHANDLER.bits() << 3));
        builder.write_u8(unwind + 1, 0x0A); // prolog size
        builder.write_u8(unwind + 2, 3); // code count
        builder.write_u8(unwind + 3, 0x50); // frame register rbp, offset 0
        // UWOP_ALLOC_LARGE info=0, size slot 0x20 * 8
        builder.write_u16(unwind + 4, 0x0100 | 0x08);
        builder.write_u16(unwind + 6, 0x20);
        // UWOP_PUSH_NONVOL rbx
        builder.write_u16(unwind + 8, 0x3000 | 0x04);
        // 3 slots + header = 10 bytes, aligned to 12
        builder.write_u32(unwind + 12, 0x5000); // handler rva
        builder.write_u32(unwind + 16, 0xdead); // handler data
        let image = builder.build();

        let session = Session::new(&image);
        let entries = ImageRuntimeFunction::walk_exception_directory(&session);
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.start, base + 0x1000);
        assert_eq!(entry.end, base + 0x1080);

        let info = &entry.unwind_info;
        assert_eq!(info.version, 1);
        assert_eq!(info.frame_register, "rbp");
        assert_eq!(
            info.codes,
            vec![
                UnwindCode::AllocLarge { offset: 8, size: 0x100 },
                UnwindCode::PushNonVol { offset: 4, register: "rbx" },
            ]
        );
        let (handler, data) = info.handler_data().unwrap();
        assert_eq!(handler, base + 0x5000);
        assert_eq!(data, unwind + 16);
    }

    #[test]
    fn invalid_opcode_is_rejected() {
        let base = Address::new(0x1_4000_0000);
        let unwind = base + 0x200;
        let mut builder = OwnedImage::builder(base, TargetArch::X64).section(
            ".rdata",
            AddressRange::with_size(base, 0x1000),
            SectionSemantics::ReadOnlyData,
        );
        builder.write_u8(unwind, 1);
        builder.write_u8(unwind + 1, 0);
        builder.write_u8(unwind + 2, 1);
        builder.write_u8(unwind + 3, 0);
        builder.write_u16(unwind + 4, 0x0700); // opcode 7 is undefined
        let image = builder.build();

        let session = Session::new(&image);
        assert!(UnwindInfo::read(&session, unwind).is_err());
    }

    #[test]
    fn personality_names_classify() {
        assert_eq!(
            Personality::from_symbol("__CxxFrameHandler3"),
            Some(Personality::CxxFrameHandler)
        );
        assert!(Personality::from_symbol("__CxxFrameHandler4")
            .unwrap()
            .uses_compact_metadata());
        assert!(Personality::from_symbol("__GSHandlerCheck_SEH")
            .unwrap()
            .uses_scope_table());
        assert_eq!(Personality::from_symbol("memcpy"), None);
    }
}
