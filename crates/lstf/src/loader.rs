//! Binary program loader (C7): the inverse of [`crate::serialize`].
//!
//! Reproduces a [`VmProgram`] byte-for-byte from the section-table layout
//! described in §4.6, validating the same way
//! `original_source/src/vm/lstf-vm-loader.c` does: magic check, section
//! table parse loop (rejecting unknown or zero-sized sections, entry points
//! past the end of code), then a bulk read of each present section.

use std::collections::HashMap;

use crate::status::LoadError;

const MAGIC: [u8; 8] = [0x89, b'L', b'S', b'T', b'F', 0x01, 0x0A, 0x00];
const MAX_SECTION_NAME_LEN: usize = 128;

#[derive(Debug, Clone, Copy)]
pub struct DebugEntry {
    pub instruction_offset: u64,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone)]
pub struct DebugSymbol {
    pub instruction_offset: u64,
    pub name: String,
}

/// An immutable, loaded program, ready to hand to [`crate::vm::Vm`].
#[derive(Debug, Clone)]
pub struct VmProgram {
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub entry_point_offset: u64,
    pub source_filename: Option<String>,
    pub debug_entries: Vec<DebugEntry>,
    pub debug_symbols: Vec<DebugSymbol>,
}

impl VmProgram {
    /// Source location recorded for the instruction at `offset`, if any.
    pub fn source_loc_at(&self, offset: u64) -> Option<(u32, u32)> {
        self.debug_entries.iter().find(|e| e.instruction_offset == offset).map(|e| (e.line, e.column))
    }

    /// Symbol name recorded for the instruction at `offset`, if any —
    /// typically a function's first instruction.
    pub fn symbol_at(&self, offset: u64) -> Option<&str> {
        self.debug_symbols.iter().find(|s| s.instruction_offset == offset).map(|s| s.name.as_str())
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    fn has_data(&self) -> bool {
        self.pos < self.bytes.len()
    }

    fn read_byte(&mut self) -> Result<u8, LoadError> {
        let b = *self.bytes.get(self.pos).ok_or(LoadError::Read)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u64(&mut self) -> Result<u64, LoadError> {
        let end = self.pos + 8;
        let slice = self.bytes.get(self.pos..end).ok_or(LoadError::InvalidSectionSize)?;
        self.pos = end;
        Ok(u64::from_be_bytes(slice.try_into().expect("slice is exactly 8 bytes")))
    }

    fn read_u32(&mut self) -> Result<u32, LoadError> {
        let end = self.pos + 4;
        let slice = self.bytes.get(self.pos..end).ok_or(LoadError::InvalidSectionSize)?;
        self.pos = end;
        Ok(u32::from_be_bytes(slice.try_into().expect("slice is exactly 4 bytes")))
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8], LoadError> {
        let end = self.pos + len;
        let slice = self.bytes.get(self.pos..end).ok_or(LoadError::InvalidSectionSize)?;
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), LoadError> {
        self.read_exact(len).map(|_| ())
    }
}

pub fn load(bytes: &[u8]) -> Result<VmProgram, LoadError> {
    let mut r = Reader::new(bytes);

    for expected in MAGIC {
        if !r.has_data() {
            return Err(LoadError::Read);
        }
        if r.read_byte()? != expected {
            return Err(LoadError::InvalidMagic);
        }
    }

    let entry_point_offset = r.read_u64()?;

    let mut debuginfo_size = 0u64;
    let mut comments_size = 0u64;
    let mut data_size = 0u64;
    let mut code_size = 0u64;

    loop {
        if !r.has_data() {
            return Err(LoadError::Read);
        }
        let first = r.read_byte()?;
        if first == 0 {
            break;
        }
        let mut name = vec![first];
        loop {
            let b = r.read_byte()?;
            if name.len() >= MAX_SECTION_NAME_LEN {
                return Err(LoadError::TooLongSectionName);
            }
            name.push(b);
            if b == 0 {
                break;
            }
        }
        let name = String::from_utf8(name[..name.len() - 1].to_vec()).map_err(|_| LoadError::InvalidSectionName(String::new()))?;
        let size = r.read_u64()?;
        if size == 0 {
            return Err(LoadError::ZeroSectionSize);
        }

        match name.as_str() {
            "debuginfo" => debuginfo_size = size,
            "comments" => comments_size = size,
            "data" => data_size = size,
            "code" => {
                code_size = size;
                if entry_point_offset >= code_size {
                    return Err(LoadError::InvalidEntryPoint);
                }
            }
            other => return Err(LoadError::InvalidSectionName(other.to_string())),
        }
    }

    let mut source_filename = None;
    let mut debug_entries = Vec::new();
    let mut debug_symbols = Vec::new();

    if debuginfo_size > 0 {
        let section = r.read_exact(debuginfo_size as usize)?;
        let mut dr = Reader::new(section);

        let nul = section.iter().position(|b| *b == 0).ok_or(LoadError::InvalidDebugInfo)?;
        source_filename = Some(String::from_utf8_lossy(&section[..nul]).into_owned());
        dr.pos = nul + 1;
        // 8-byte alignment padding after the filename, matching the
        // serializer's alignment of the fixed-width debug-entry records.
        let padding = (8 - dr.pos % 8) % 8;
        dr.skip(padding)?;

        let n_entries = dr.read_u64()?;
        for _ in 0..n_entries {
            let instruction_offset = dr.read_u64()?;
            let line = dr.read_u32()?;
            let column = dr.read_u32()?;
            debug_entries.push(DebugEntry { instruction_offset, line, column });
        }

        let n_symbols = dr.read_u64()?;
        for _ in 0..n_symbols {
            let instruction_offset = dr.read_u64()?;
            let name_start = dr.pos;
            let nul = section[name_start..].iter().position(|b| *b == 0).ok_or(LoadError::InvalidDebugInfo)?;
            let name = String::from_utf8_lossy(&section[name_start..name_start + nul]).into_owned();
            dr.pos = name_start + nul + 1;
            let padding = (8 - dr.pos % 8) % 8;
            dr.skip(padding)?;
            debug_symbols.push(DebugSymbol { instruction_offset, name });
        }
    }

    if comments_size > 0 {
        r.skip(comments_size as usize)?;
    }

    let data = if data_size > 0 { r.read_exact(data_size as usize)?.to_vec() } else { Vec::new() };

    if code_size == 0 {
        return Err(LoadError::NoCodeSection);
    }
    let code = r.read_exact(code_size as usize)?.to_vec();

    Ok(VmProgram { code, data, entry_point_offset, source_filename, debug_entries, debug_symbols })
}

/// Builds a name→offset index out of the debug-symbol table, for tools
/// (the CLI's `-d` disassembler) that want to print `main:` instead of a
/// raw hex address.
pub fn symbol_index(program: &VmProgram) -> HashMap<u64, &str> {
    program.debug_symbols.iter().map(|s| (s.instruction_offset, s.name.as_str())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BcFunction, BcProgram, Op};
    use crate::json::Json;

    #[test]
    fn round_trips_hello_world() {
        let mut program = BcProgram::new();
        let mut main = BcFunction::new("main");
        main.push(Op::LoadData(0), Default::default());
        main.push(Op::Print, Default::default());
        main.push(Op::Exit(0), Default::default());
        program.intern(&Json::string("hello, world\n"));
        program.add_function(main);

        let mut buf = Vec::new();
        crate::serialize::serialize(&program, &mut buf).unwrap();
        let loaded = load(&buf).unwrap();
        assert_eq!(loaded.entry_point_offset, 0);
        assert_eq!(loaded.data, b"\"hello, world\\n\"\0");
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0u8; 16];
        assert!(matches!(load(&bytes), Err(LoadError::InvalidMagic)));
    }
}
