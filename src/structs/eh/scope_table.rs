// Mon Feb 9 2026 - Alex

use crate::layout::{FieldDef, FieldKind, StructLayout};
use crate::memory::Address;
use crate::session::{Rejection, Session};

const MAX_SCOPES: u32 = 0xFFFF;

static ENTRY_LAYOUT: StructLayout = StructLayout::new(
    "ScopeTableEntry",
    &[
        FieldDef::new("BeginAddress", FieldKind::UInt(4)),
        FieldDef::new("EndAddress", FieldKind::UInt(4)),
        FieldDef::new("HandlerAddress", FieldKind::UInt(4)),
        FieldDef::new("JumpTarget", FieldKind::UInt(4)),
    ],
);

static LAYOUT: StructLayout = StructLayout::new(
    "ScopeTable",
    &[FieldDef::new("Count", FieldKind::UInt(4))],
);

/// Filter or termination handler reference from a `__try` scope. A raw
/// value of 1 stands for `EXCEPTION_EXECUTE_HANDLER` with no filter code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeHandler {
    None,
    ExecuteHandler,
    Filter(Address),
}

#[derive(Debug, Clone)]
pub struct ScopeTableEntry {
    pub begin: Address,
    pub end: Address,
    pub handler: ScopeHandler,
    pub jump_target: Option<Address>,
}

/// `__C_specific_handler` data: the scope records of a function's SEH
/// `__try` regions, as image-base displacements.
#[derive(Debug)]
pub struct ScopeTable {
    pub address: Address,
    pub scopes: Vec<ScopeTableEntry>,
}

impl ScopeTable {
    pub fn read(session: &Session, address: Address) -> Result<Self, Rejection> {
        let env = session.env();
        let image = session.image();
        let base = image.base();
        if !address.is_aligned(LAYOUT.alignment(env)) {
            return Err(Rejection::Misaligned { structure: LAYOUT.name, address });
        }

        let count = image
            .read_u32(address)
            .map_err(|e| Rejection::unreadable(LAYOUT.name, address, e))?;
        if count > MAX_SCOPES {
            return Err(Rejection::invariant(
                LAYOUT.name,
                address,
                format!("implausible scope count {count}"),
            ));
        }

        let stride = ENTRY_LAYOUT.fixed_size(env) as u64;
        let first = address + LAYOUT.fixed_size(env) as u64;
        let mut scopes = Vec::with_capacity(count as usize);
        for index in 0..count as u64 {
            let entry = first + index * stride;
            let unreadable = |e| Rejection::unreadable(ENTRY_LAYOUT.name, entry, e);
            let disp = |field: usize| -> Result<u32, Rejection> {
                image
                    .read_u32(entry + ENTRY_LAYOUT.offset_of(field, env) as u64)
                    .map_err(unreadable)
            };

            let handler = match disp(2)? {
                0 => ScopeHandler::None,
                1 => ScopeHandler::ExecuteHandler,
                raw => ScopeHandler::Filter(base + raw as u64),
            };
            let jump_target = match disp(3)? {
                0 => None,
                raw => Some(base + raw as u64),
            };
            scopes.push(ScopeTableEntry {
                begin: base + disp(0)? as u64,
                end: base + disp(1)? as u64,
                handler,
                jump_target,
            });
        }

        Ok(Self { address, scopes })
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::TargetArch;
    use crate::memory::{AddressRange, OwnedImage, SectionSemantics};

    #[test]
    fn special_handler_values_decode() {
        let base = Address::new(0x1_4000_0000);
        let table = base + 0x100;
        let mut builder = OwnedImage::builder(base, TargetArch::X64).section(
            ".rdata",
            AddressRange::with_size(base, 0x1000),
            SectionSemantics::ReadOnlyData,
        );
        builder.write_u32(table, 2);
        // scope 0: plain termination handler
        builder.write_u32(table + 4, 0x1000);
        builder.write_u32(table + 8, 0x1020);
        builder.write_u32(table + 12, 1);
        builder.write_u32(table + 16, 0);
        // scope 1: filter with jump target
        builder.write_u32(table + 20, 0x1020);
        builder.write_u32(table + 24, 0x1040);
        builder.write_u32(table + 28, 0x2000);
        builder.write_u32(table + 32, 0x1044);
        let image = builder.build();

        let session = Session::new(&image);
        let table = ScopeTable::read(&session, table).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.scopes[0].handler, ScopeHandler::ExecuteHandler);
        assert_eq!(table.scopes[0].jump_target, None);
        assert_eq!(table.scopes[1].handler, ScopeHandler::Filter(base + 0x2000));
        assert_eq!(table.scopes[1].jump_target, Some(base + 0x1044));
        assert_eq!(table.scopes[1].begin, base + 0x1020);
    }
}
