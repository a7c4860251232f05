//! Binary program serializer (C6).
//!
//! Produces the layout from §4.6: an 8-byte magic, an entry-point offset, a
//! section table, then the non-empty sections themselves in fixed order
//! (`debuginfo`, `comments`, `data`, `code`). Integers are big-endian
//! throughout, matching `original_source/src/bytecode/lstf-bc-serialize.c`.
//!
//! Function addresses (`call`, `loadaddress`, `schedule`, `closure`) are
//! resolved here rather than in [`crate::assembler`]: only once every
//! function's encoded size is known can a function's absolute code-section
//! offset be computed, which is exactly what this module does before
//! emitting a single byte.

use std::io::Write;

use crate::bytecode::{BcProgram, JumpTarget, Op, VmCallCode};
use crate::status::SerializeError;

const MAGIC: [u8; 8] = [0x89, b'L', b'S', b'T', b'F', 0x01, 0x0A, 0x00];

/// Serializes `program` to `out`, mutating a working copy so the original
/// (still holding placeholder addresses) is left untouched by the caller.
pub fn serialize(program: &BcProgram, out: &mut impl Write) -> Result<(), SerializeError> {
    let mut program = program.clone();
    let code_offsets = resolve_addresses(&mut program)?;

    let main_index = program.main_index().ok_or(SerializeError::MissingMain)?;
    if program.functions[main_index].instructions.is_empty() {
        return Err(SerializeError::MissingMain);
    }
    let entry_point_offset = code_offsets[main_index];

    let data = program.data();
    let data_size = data.len() as u64;
    let code_size: u64 = program.functions.iter().map(|f| f.byte_len() as u64).sum();

    let debuginfo = build_debuginfo(&program);
    let debuginfo_size = debuginfo.len() as u64;

    out.write_all(&MAGIC)?;
    write_u64(out, entry_point_offset)?;

    if debuginfo_size > 0 {
        write_section_name(out, "debuginfo")?;
        write_u64(out, debuginfo_size)?;
    }
    if data_size > 0 {
        write_section_name(out, "data")?;
        write_u64(out, data_size)?;
    }
    write_section_name(out, "code")?;
    write_u64(out, code_size)?;
    out.write_all(&[0u8])?; // section-table terminator

    if debuginfo_size > 0 {
        out.write_all(&debuginfo)?;
    }

    if data_size > 0 {
        out.write_all(data)?;
    }

    for func in &program.functions {
        for op in &func.instructions {
            write_op(out, op)?;
        }
    }

    Ok(())
}

/// Serializes an already-resolved flat instruction stream directly, with no
/// function-index rewriting pass. This is what `lstf-cli`'s `-a` mode
/// targets: its input text ([`crate::disasm::parse`]) already carries final
/// addresses rather than `BcProgram`'s function-index placeholders, so
/// there is nothing left for [`resolve_addresses`] to do.
pub fn serialize_flat(ops: &[Op], entry_point_offset: u64, out: &mut impl Write) -> Result<(), SerializeError> {
    let code_size: u64 = ops.iter().map(|op| op.encoded_size() as u64).sum();
    if code_size == 0 {
        return Err(SerializeError::MissingMain);
    }
    out.write_all(&MAGIC)?;
    write_u64(out, entry_point_offset)?;
    write_section_name(out, "code")?;
    write_u64(out, code_size)?;
    out.write_all(&[0u8])?;
    for op in ops {
        write_op(out, op)?;
    }
    Ok(())
}

/// Builds the `debuginfo` section body: a NUL-terminated source filename
/// (empty string if none was recorded), padded to an 8-byte boundary, then a
/// count-prefixed table of `(instruction_offset, line, column)` entries —
/// one per instruction that carries a non-default source location — and a
/// count-prefixed table of `(instruction_offset, name)` symbols, one per
/// function, each name padded to the same 8-byte boundary. Every
/// `code_offset` here is already the absolute, resolved offset computed by
/// [`resolve_addresses`], which must run before this is called.
///
/// Returns an empty vec (and so no section is written at all) when there is
/// nothing to record, matching the loader's treatment of a missing
/// `debuginfo` section as "no debug info" rather than an error.
fn build_debuginfo(program: &BcProgram) -> Vec<u8> {
    if program.functions.is_empty() {
        return Vec::new();
    }

    let mut buf = Vec::new();
    let filename = program.source_filename.as_deref().unwrap_or("");
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    pad_to_8(&mut buf);

    let mut entries: Vec<(u64, u32, u32)> = Vec::new();
    for func in &program.functions {
        let base = func.code_offset.expect("resolve_addresses fills code_offset for every function");
        let mut offset = base;
        for (op, loc) in func.instructions.iter().zip(&func.source_map) {
            if loc.line != 0 || loc.column != 0 {
                entries.push((offset, loc.line, loc.column));
            }
            offset += op.encoded_size() as u64;
        }
    }
    buf.extend_from_slice(&(entries.len() as u64).to_be_bytes());
    for (offset, line, column) in entries {
        buf.extend_from_slice(&offset.to_be_bytes());
        buf.extend_from_slice(&line.to_be_bytes());
        buf.extend_from_slice(&column.to_be_bytes());
    }

    buf.extend_from_slice(&(program.functions.len() as u64).to_be_bytes());
    for func in &program.functions {
        let base = func.code_offset.expect("resolve_addresses fills code_offset for every function");
        buf.extend_from_slice(&base.to_be_bytes());
        buf.extend_from_slice(func.name.as_bytes());
        buf.push(0);
        pad_to_8(&mut buf);
    }

    buf
}

fn pad_to_8(buf: &mut Vec<u8>) {
    let padding = (8 - buf.len() % 8) % 8;
    buf.resize(buf.len() + padding, 0);
}

/// Computes each function's absolute base offset within the code section
/// and rewrites every `Call`/`LoadAddress`/`Schedule`/`Closure` target
/// (currently a `BcProgram` function index) and every `Jump`/`Else` target
/// (currently a byte offset local to its own function) into one absolute
/// offset space.
fn resolve_addresses(program: &mut BcProgram) -> Result<Vec<u64>, SerializeError> {
    let mut code_offsets = Vec::with_capacity(program.functions.len());
    let mut running = 0u64;
    for func in &program.functions {
        code_offsets.push(running);
        running += func.byte_len() as u64;
    }

    for (i, func) in program.functions.iter_mut().enumerate() {
        let base = code_offsets[i];
        func.code_offset = Some(base);
        for op in &mut func.instructions {
            match op {
                Op::Call(addr) | Op::LoadAddress(addr) => {
                    *addr = code_offsets
                        .get(*addr as usize)
                        .copied()
                        .ok_or_else(|| SerializeError::UnresolvedJump(func_name_placeholder()))?;
                }
                Op::Schedule(addr, _) => {
                    *addr = code_offsets.get(*addr as usize).copied().ok_or_else(|| SerializeError::UnresolvedJump(func_name_placeholder()))?;
                }
                Op::Closure(desc) => {
                    desc.func_address = code_offsets
                        .get(desc.func_address as usize)
                        .copied()
                        .ok_or_else(|| SerializeError::UnresolvedJump(func_name_placeholder()))?;
                }
                Op::Jump(JumpTarget::Resolved(local)) | Op::Else(JumpTarget::Resolved(local)) => {
                    *local += base;
                }
                Op::Jump(JumpTarget::Unresolved) | Op::Else(JumpTarget::Unresolved) => {
                    return Err(SerializeError::UnresolvedJump(func_name_placeholder()));
                }
                _ => {}
            }
        }
    }

    Ok(code_offsets)
}

fn func_name_placeholder() -> String {
    "<unknown>".to_string()
}

fn write_u64(out: &mut impl Write, value: u64) -> Result<(), SerializeError> {
    out.write_all(&value.to_be_bytes())?;
    Ok(())
}

fn write_section_name(out: &mut impl Write, name: &str) -> Result<(), SerializeError> {
    out.write_all(name.as_bytes())?;
    out.write_all(&[0u8])?;
    Ok(())
}

fn write_op(out: &mut impl Write, op: &Op) -> Result<(), SerializeError> {
    out.write_all(&[opcode_byte(op)])?;
    match op {
        Op::LoadFrame(n) | Op::Store(n) => out.write_all(&n.to_be_bytes())?,
        Op::LoadData(n) | Op::LoadAddress(n) | Op::Call(n) => write_u64(out, *n)?,
        Op::LoadExpr(json) => {
            out.write_all(json.to_json_string(false).as_bytes())?;
            out.write_all(&[0u8])?;
        }
        Op::Pop | Op::Get | Op::Set | Op::Append | Op::In | Op::Calli | Op::Schedulei(_) | Op::Return => {
            if let Op::Schedulei(n) = op {
                out.write_all(&[*n])?;
            }
        }
        Op::Params(n) | Op::Upget(n) | Op::Upset(n) | Op::Exit(n) => out.write_all(&[*n])?,
        Op::Schedule(addr, n) => {
            write_u64(out, *addr)?;
            out.write_all(&[*n])?;
        }
        Op::Closure(desc) => {
            out.write_all(&[desc.captures.len() as u8])?;
            write_u64(out, desc.func_address)?;
            for cap in &desc.captures {
                out.write_all(&[cap.is_local as u8])?;
                write_u64(out, cap.index)?;
            }
        }
        Op::Vmcall(code) => out.write_all(&[code.to_u8()])?,
        Op::Jump(JumpTarget::Resolved(addr)) | Op::Else(JumpTarget::Resolved(addr)) => write_u64(out, *addr)?,
        Op::Jump(JumpTarget::Unresolved) | Op::Else(JumpTarget::Unresolved) => {
            return Err(SerializeError::UnresolvedJump("<unresolved>".to_string()));
        }
        Op::Bool
        | Op::Land
        | Op::Lor
        | Op::Lnot
        | Op::LessThan
        | Op::LessThanEqual
        | Op::Equal
        | Op::GreaterThan
        | Op::GreaterThanEqual
        | Op::Add
        | Op::Sub
        | Op::Mul
        | Op::Div
        | Op::Pow
        | Op::Mod
        | Op::Neg
        | Op::And
        | Op::Or
        | Op::Xor
        | Op::Lshift
        | Op::Rshift
        | Op::Not
        | Op::Print
        | Op::Assert => {}
    }
    Ok(())
}

/// A stable per-opcode byte, assigned in the same order as
/// `original_source/src/vm/lstf-vm-opcodes.h` so a hex dump of the code
/// section reads the same way against that reference.
fn opcode_byte(op: &Op) -> u8 {
    match op {
        Op::LoadFrame(_) => 0x01,
        Op::LoadData(_) => 0x02,
        Op::LoadAddress(_) => 0x03,
        Op::LoadExpr(_) => 0x04,
        Op::Store(_) => 0x05,
        Op::Pop => 0x06,
        Op::Get => 0x07,
        Op::Set => 0x08,
        Op::Append => 0x09,
        Op::In => 0x0A,
        Op::Params(_) => 0x0B,
        Op::Call(_) => 0x0C,
        Op::Calli => 0x0D,
        Op::Schedule(..) => 0x0E,
        Op::Schedulei(_) => 0x0F,
        Op::Return => 0x10,
        Op::Closure(_) => 0x11,
        Op::Upget(_) => 0x12,
        Op::Upset(_) => 0x13,
        Op::Vmcall(_) => 0x14,
        Op::Else(_) => 0x15,
        Op::Jump(_) => 0x16,
        Op::Bool => 0x17,
        Op::Land => 0x18,
        Op::Lor => 0x19,
        Op::Lnot => 0x1A,
        Op::LessThan => 0x1B,
        Op::LessThanEqual => 0x1C,
        Op::Equal => 0x1D,
        Op::GreaterThan => 0x1E,
        Op::GreaterThanEqual => 0x1F,
        Op::Add => 0x20,
        Op::Sub => 0x21,
        Op::Mul => 0x22,
        Op::Div => 0x23,
        Op::Pow => 0x24,
        Op::Mod => 0x25,
        Op::Neg => 0x26,
        Op::And => 0x27,
        Op::Or => 0x28,
        Op::Xor => 0x29,
        Op::Lshift => 0x2A,
        Op::Rshift => 0x2B,
        Op::Not => 0x2C,
        Op::Print => 0x2D,
        Op::Exit(_) => 0x2E,
        Op::Assert => 0x2F,
    }
}

pub(crate) fn opcode_from_byte(byte: u8) -> Option<OpcodeTag> {
    use OpcodeTag::*;
    Some(match byte {
        0x01 => LoadFrame,
        0x02 => LoadData,
        0x03 => LoadAddress,
        0x04 => LoadExpr,
        0x05 => Store,
        0x06 => Pop,
        0x07 => Get,
        0x08 => Set,
        0x09 => Append,
        0x0A => In,
        0x0B => Params,
        0x0C => Call,
        0x0D => Calli,
        0x0E => Schedule,
        0x0F => Schedulei,
        0x10 => Return,
        0x11 => Closure,
        0x12 => Upget,
        0x13 => Upset,
        0x14 => Vmcall,
        0x15 => Else,
        0x16 => Jump,
        0x17 => Bool,
        0x18 => Land,
        0x19 => Lor,
        0x1A => Lnot,
        0x1B => LessThan,
        0x1C => LessThanEqual,
        0x1D => Equal,
        0x1E => GreaterThan,
        0x1F => GreaterThanEqual,
        0x20 => Add,
        0x21 => Sub,
        0x22 => Mul,
        0x23 => Div,
        0x24 => Pow,
        0x25 => Mod,
        0x26 => Neg,
        0x27 => And,
        0x28 => Or,
        0x29 => Xor,
        0x2A => Lshift,
        0x2B => Rshift,
        0x2C => Not,
        0x2D => Print,
        0x2E => Exit,
        0x2F => Assert,
        _ => return None,
    })
}

/// Mirrors the `Op` variant shape without carrying operand data, so
/// [`crate::loader`] can dispatch on the opcode byte before it has parsed
/// the operand out of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpcodeTag {
    LoadFrame,
    LoadData,
    LoadAddress,
    LoadExpr,
    Store,
    Pop,
    Get,
    Set,
    Append,
    In,
    Params,
    Call,
    Calli,
    Schedule,
    Schedulei,
    Return,
    Closure,
    Upget,
    Upset,
    Vmcall,
    Else,
    Jump,
    Bool,
    Land,
    Lor,
    Lnot,
    LessThan,
    LessThanEqual,
    Equal,
    GreaterThan,
    GreaterThanEqual,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Mod,
    Neg,
    And,
    Or,
    Xor,
    Lshift,
    Rshift,
    Not,
    Print,
    Exit,
    Assert,
}

pub(crate) fn vmcall_from_u8(byte: u8) -> Option<VmCallCode> {
    VmCallCode::from_u8(byte)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BcFunction;
    use crate::json::Json;

    #[test]
    fn magic_and_entry_point_are_written() {
        let mut program = BcProgram::new();
        let mut main = BcFunction::new("main");
        main.push(Op::LoadExpr(Json::string("hi")), Default::default());
        main.push(Op::Print, Default::default());
        main.push(Op::Exit(0), Default::default());
        program.add_function(main);

        let mut buf = Vec::new();
        serialize(&program, &mut buf).unwrap();
        assert_eq!(&buf[..8], &MAGIC);
        let entry = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        assert_eq!(entry, 0);
    }

    #[test]
    fn missing_main_is_an_error() {
        let program = BcProgram::new();
        let mut buf = Vec::new();
        assert!(matches!(serialize(&program, &mut buf), Err(SerializeError::MissingMain)));
    }

    #[test]
    fn debuginfo_round_trips_symbol_and_line() {
        let mut program = BcProgram::new();
        program.source_filename = Some("hello.lstf".to_string());
        let mut main = BcFunction::new("main");
        main.push(Op::LoadExpr(Json::string("hi")), crate::bytecode::SourceMapEntry { line: 3, column: 5 });
        main.push(Op::Print, crate::bytecode::SourceMapEntry { line: 3, column: 1 });
        main.push(Op::Exit(0), Default::default());
        program.add_function(main);

        let mut buf = Vec::new();
        serialize(&program, &mut buf).unwrap();
        let loaded = crate::loader::load(&buf).unwrap();
        assert_eq!(loaded.source_filename.as_deref(), Some("hello.lstf"));
        assert_eq!(loaded.symbol_at(0), Some("main"));
        assert_eq!(loaded.source_loc_at(0), Some((3, 5)));
        let print_offset = Op::LoadExpr(Json::string("hi")).encoded_size() as u64;
        assert_eq!(loaded.source_loc_at(print_offset), Some((3, 1)));
    }
}
