//! The compiled unit container.
//!
//! Layout: a 48-byte little-endian header (`"WO"` magic, format and
//! language versions, area offsets), the type-info area, the symbol area
//! (globals first, then procedures), the constants area and finally the
//! procedure code area.

use whais_core::endian::{Reader, Writer};
use whais_core::types::TypeDescriptor;

use crate::errors::{InterError, InterErrorKind, Result};
use crate::opcodes::Opcode;

pub const UNIT_MAGIC: [u8; 2] = *b"WO";
pub const FORMAT_VERSION: (u8, u8) = (1, 0);
pub const LANGUAGE_VERSION: (u8, u8) = (1, 0);

const HEADER_SIZE: usize = 48;
const FLAG_EXTERNAL: u16 = 0x0001;

#[derive(Debug, Clone)]
pub struct GlobalEntry {
    pub name: String,
    pub external: bool,
    pub type_offset: u32,
}

#[derive(Debug, Clone)]
pub struct ProcedureEntry {
    pub name: String,
    pub external: bool,
    pub code_offset: u32,
    pub code_size: u32,
    pub locals_count: u16,
    pub args_count: u16,
    pub sync_count: u16,
    /// Type-info offsets for every slot: return value, parameters, locals.
    pub locals_type_offsets: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub format: (u8, u8),
    pub language: (u8, u8),
    pub globals: Vec<GlobalEntry>,
    pub procedures: Vec<ProcedureEntry>,
    type_info: Vec<u8>,
    constants: Vec<u8>,
    code: Vec<u8>,
}

fn corrupted(what: &str) -> InterError {
    InterError::new(InterErrorKind::UnitCorrupted, what.to_string())
}

impl CompiledUnit {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        if r.bytes(2).map_err(|_| corrupted("truncated header"))? != UNIT_MAGIC {
            return Err(corrupted("not a whais object file"));
        }
        let format = (r.u8()?, r.u8()?);
        let language = (r.u8()?, r.u8()?);
        if format.0 != FORMAT_VERSION.0 {
            return Err(corrupted("unsupported format version"));
        }
        r.u16()?; // padding
        let globals_count = r.u32()? as usize;
        let procedures_count = r.u32()? as usize;
        let type_info_start = r.u32()? as usize;
        let type_info_size = r.u32()? as usize;
        let symbols_start = r.u32()? as usize;
        let symbols_size = r.u32()? as usize;
        let constants_start = r.u32()? as usize;
        let constants_size = r.u32()? as usize;
        r.u64()?; // reserved

        let area = |start: usize, size: usize| -> Result<&[u8]> {
            bytes
                .get(start..start + size)
                .ok_or_else(|| corrupted("area exceeds the file"))
        };
        let type_info = area(type_info_start, type_info_size)?.to_vec();
        let symbols = area(symbols_start, symbols_size)?;
        let constants = area(constants_start, constants_size)?.to_vec();
        let code_start = constants_start + constants_size;
        let code = bytes
            .get(code_start..)
            .ok_or_else(|| corrupted("missing code area"))?
            .to_vec();

        let mut s = Reader::new(symbols);
        let mut globals = Vec::with_capacity(globals_count);
        for _ in 0..globals_count {
            let flags = s.u16().map_err(|_| corrupted("truncated global entry"))?;
            let type_offset = s.u32()?;
            if type_offset as usize >= type_info.len() && !type_info.is_empty() {
                return Err(corrupted("global type offset out of range"));
            }
            let name = s.cstr().map_err(|_| corrupted("unterminated global name"))?;
            globals.push(GlobalEntry {
                name: name.to_string(),
                external: flags & FLAG_EXTERNAL != 0,
                type_offset,
            });
        }

        let mut procedures = Vec::with_capacity(procedures_count);
        for _ in 0..procedures_count {
            let flags = s.u16().map_err(|_| corrupted("truncated procedure entry"))?;
            let code_offset = s.u32()?;
            let code_size = s.u32()?;
            let locals_count = s.u16()?;
            let args_count = s.u16()?;
            let sync_count = s.u16()?;
            if args_count >= locals_count && locals_count > 0 {
                return Err(corrupted("procedure arguments exceed its locals"));
            }
            let mut locals_type_offsets = Vec::with_capacity(locals_count as usize);
            for _ in 0..locals_count {
                locals_type_offsets.push(s.u32()?);
            }
            let name = s
                .cstr()
                .map_err(|_| corrupted("unterminated procedure name"))?;
            if flags & FLAG_EXTERNAL == 0
                && (code_offset as usize + code_size as usize) > code.len()
            {
                return Err(corrupted("procedure code out of range"));
            }
            procedures.push(ProcedureEntry {
                name: name.to_string(),
                external: flags & FLAG_EXTERNAL != 0,
                code_offset,
                code_size,
                locals_count,
                args_count,
                sync_count,
                locals_type_offsets,
            });
        }

        Ok(Self {
            format,
            language,
            globals,
            procedures,
            type_info,
            constants,
            code,
        })
    }

    pub fn type_descriptor_at(&self, offset: u32) -> Result<TypeDescriptor> {
        let bytes = self
            .type_info
            .get(offset as usize..)
            .ok_or_else(|| corrupted("type offset out of range"))?;
        Ok(TypeDescriptor::parse(bytes)?.0)
    }

    pub fn raw_type_at(&self, offset: u32) -> Result<&[u8]> {
        self.type_info
            .get(offset as usize..)
            .ok_or_else(|| corrupted("type offset out of range"))
    }

    pub fn constants(&self) -> &[u8] {
        &self.constants
    }

    /// Null-terminated string inside the constants area.
    pub fn const_text(&self, offset: u32) -> Result<&str> {
        let bytes = self
            .constants
            .get(offset as usize..)
            .ok_or_else(|| corrupted("constant offset out of range"))?;
        let end = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| corrupted("unterminated constant"))?;
        std::str::from_utf8(&bytes[..end]).map_err(|_| corrupted("constant is not UTF-8"))
    }

    pub fn code_of(&self, procedure: &ProcedureEntry) -> &[u8] {
        &self.code[procedure.code_offset as usize
            ..procedure.code_offset as usize + procedure.code_size as usize]
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut symbols = Writer::new();
        for global in &self.globals {
            symbols.u16(if global.external { FLAG_EXTERNAL } else { 0 });
            symbols.u32(global.type_offset);
            symbols.cstr(&global.name);
        }
        for procedure in &self.procedures {
            symbols.u16(if procedure.external { FLAG_EXTERNAL } else { 0 });
            symbols.u32(procedure.code_offset);
            symbols.u32(procedure.code_size);
            symbols.u16(procedure.locals_count);
            symbols.u16(procedure.args_count);
            symbols.u16(procedure.sync_count);
            for &offset in &procedure.locals_type_offsets {
                symbols.u32(offset);
            }
            symbols.cstr(&procedure.name);
        }

        let type_info_start = HEADER_SIZE;
        let symbols_start = type_info_start + self.type_info.len();
        let constants_start = symbols_start + symbols.len();

        let mut w = Writer::new();
        w.bytes(&UNIT_MAGIC);
        w.u8(self.format.0).u8(self.format.1);
        w.u8(self.language.0).u8(self.language.1);
        w.u16(0);
        w.u32(self.globals.len() as u32);
        w.u32(self.procedures.len() as u32);
        w.u32(type_info_start as u32);
        w.u32(self.type_info.len() as u32);
        w.u32(symbols_start as u32);
        w.u32(symbols.len() as u32);
        w.u32(constants_start as u32);
        w.u32(self.constants.len() as u32);
        w.u64(0);
        debug_assert_eq!(w.len(), HEADER_SIZE);
        w.bytes(&self.type_info);
        w.bytes(symbols.as_bytes());
        w.bytes(&self.constants);
        w.bytes(&self.code);
        w.into_bytes()
    }
}

/// Assembles compiled units, mainly for tools and test drivers.
#[derive(Default)]
pub struct UnitBuilder {
    type_info: Vec<u8>,
    type_offsets: ahash::AHashMap<Vec<u8>, u32>,
    constants: Vec<u8>,
    code: Vec<u8>,
    globals: Vec<GlobalEntry>,
    procedures: Vec<ProcedureEntry>,
}

impl UnitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a type descriptor into the type-info area.
    pub fn type_offset(&mut self, descriptor: &TypeDescriptor) -> u32 {
        let bytes = descriptor.serialize();
        if let Some(&offset) = self.type_offsets.get(&bytes) {
            return offset;
        }
        let offset = self.type_info.len() as u32;
        self.type_info.extend_from_slice(&bytes);
        self.type_offsets.insert(bytes, offset);
        offset
    }

    /// Append a null-terminated string to the constants area.
    pub fn constant_text(&mut self, text: &str) -> u32 {
        let offset = self.constants.len() as u32;
        self.constants.extend_from_slice(text.as_bytes());
        self.constants.push(0);
        offset
    }

    pub fn global(&mut self, name: &str, descriptor: &TypeDescriptor, external: bool) -> u32 {
        let type_offset = self.type_offset(descriptor);
        self.globals.push(GlobalEntry {
            name: name.to_string(),
            external,
            type_offset,
        });
        self.globals.len() as u32 - 1
    }

    /// Register a procedure. `slots` holds one descriptor per local slot
    /// (return value first, then the `args_count` parameters, then plain
    /// locals); `code` is its bytecode.
    pub fn procedure(
        &mut self,
        name: &str,
        slots: &[TypeDescriptor],
        args_count: u16,
        sync_count: u16,
        code: &[u8],
    ) -> u32 {
        let locals_type_offsets: Vec<u32> =
            slots.iter().map(|d| self.type_offset(d)).collect();
        let code_offset = self.code.len() as u32;
        self.code.extend_from_slice(code);
        self.procedures.push(ProcedureEntry {
            name: name.to_string(),
            external: false,
            code_offset,
            code_size: code.len() as u32,
            locals_count: slots.len() as u16,
            args_count,
            sync_count,
            locals_type_offsets,
        });
        self.procedures.len() as u32 - 1
    }

    pub fn external_procedure(&mut self, name: &str, slots: &[TypeDescriptor], args_count: u16) {
        let locals_type_offsets: Vec<u32> =
            slots.iter().map(|d| self.type_offset(d)).collect();
        self.procedures.push(ProcedureEntry {
            name: name.to_string(),
            external: true,
            code_offset: 0,
            code_size: 0,
            locals_count: slots.len() as u16,
            args_count,
            sync_count: 0,
            locals_type_offsets,
        });
    }

    pub fn build(self) -> CompiledUnit {
        CompiledUnit {
            format: FORMAT_VERSION,
            language: LANGUAGE_VERSION,
            globals: self.globals,
            procedures: self.procedures,
            type_info: self.type_info,
            constants: self.constants,
            code: self.code,
        }
    }
}

/// Byte-level code assembler used alongside [`UnitBuilder`].
#[derive(Default)]
pub struct CodeBuilder {
    bytes: Vec<u8>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn op(mut self, op: Opcode) -> Self {
        self.bytes.push(op as u8);
        self
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.bytes.push(value);
        self
    }

    pub fn u16(mut self, value: u16) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(mut self, value: u64) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn i32(self, value: i32) -> Self {
        self.u32(value as u32)
    }

    pub fn i64(self, value: i64) -> Self {
        self.u64(value as u64)
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use whais_core::types::{TypeId, TypeWord};

    fn scalar(kind: TypeId) -> TypeDescriptor {
        TypeDescriptor::Simple(TypeWord::scalar(kind))
    }

    #[test]
    fn unit_round_trip() {
        let mut b = UnitBuilder::new();
        let greeting = b.constant_text("hello");
        b.global("counter", &scalar(TypeId::Int64), false);
        b.global("other_db", &scalar(TypeId::Text), true);
        let code = CodeBuilder::new()
            .op(Opcode::Ldt)
            .u32(greeting)
            .op(Opcode::Ret)
            .finish();
        b.procedure(
            "greet",
            &[scalar(TypeId::Text), scalar(TypeId::Int8)],
            1,
            0,
            &code,
        );
        let unit = b.build();
        let bytes = unit.serialize();

        let parsed = CompiledUnit::parse(&bytes).unwrap();
        assert_eq!(parsed.globals.len(), 2);
        assert_eq!(parsed.globals[0].name, "counter");
        assert!(parsed.globals[1].external);
        assert_eq!(parsed.procedures.len(), 1);
        let procedure = &parsed.procedures[0];
        assert_eq!(procedure.name, "greet");
        assert_eq!(procedure.locals_count, 2);
        assert_eq!(procedure.args_count, 1);
        assert_eq!(parsed.code_of(procedure), code.as_slice());
        assert_eq!(parsed.const_text(greeting).unwrap(), "hello");
        assert_eq!(
            parsed.type_descriptor_at(procedure.locals_type_offsets[0]).unwrap(),
            scalar(TypeId::Text)
        );
    }

    #[test]
    fn magic_is_checked() {
        let unit = UnitBuilder::new().build();
        let mut bytes = unit.serialize();
        bytes[0] = b'X';
        assert!(CompiledUnit::parse(&bytes).is_err());
    }

    #[test]
    fn truncated_symbol_area_rejected() {
        let mut b = UnitBuilder::new();
        b.global("g", &scalar(TypeId::Bool), false);
        let mut bytes = b.build().serialize();
        bytes.truncate(bytes.len() - 2);
        assert!(CompiledUnit::parse(&bytes).is_err());
    }

    #[test]
    fn header_fields_land_at_documented_offsets() {
        let unit = UnitBuilder::new().build();
        let bytes = unit.serialize();
        assert_eq!(&bytes[0..2], b"WO");
        assert_eq!(bytes[2], FORMAT_VERSION.0);
        assert_eq!(bytes[4], LANGUAGE_VERSION.0);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 0);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 48);
    }
}
