//! Line-oriented assembly text, the `.lstfa` format read/written by
//! `lstf-cli`'s `-d` and `-a` modes.
//!
//! One instruction per line: `<address>: <mnemonic> <operand...>`. The
//! address is informational only. Every operand that refers to a code
//! location (`call`, `jump`, `else`, `schedule`, `closure`, `loadaddress`)
//! is written and read back as the already-resolved absolute address
//! [`crate::vm::decode_op`]/`crate::serialize::write_op` use — there is no
//! symbol table or relocation pass at this layer, so `parse(render(p))`
//! reproduces `p`'s code section byte for byte.

use std::fmt::Write as _;

use crate::bytecode::{CaptureDescriptor, ClosureDescriptor, JumpTarget, Op, VmCallCode};
use crate::json::Json;
use crate::loader::VmProgram;
use crate::vm::decode_op;

#[derive(Debug, thiserror::Error)]
pub enum DisasmError {
    #[error("line {0}: {1}")]
    Malformed(usize, String),
}

/// Renders every instruction of `program.code`, with symbol and
/// source-location comments from the debug tables where present.
pub fn render(program: &VmProgram) -> String {
    let mut out = String::new();
    let mut pc = 0usize;
    while pc < program.code.len() {
        let addr = pc as u64;
        if let Some(name) = program.symbol_at(addr) {
            let _ = writeln!(out, "; {name}:");
        }
        if let Some((line, column)) = program.source_loc_at(addr) {
            let _ = writeln!(out, "; line {line}, column {column}");
        }
        match decode_op(&program.code, &mut pc) {
            Ok(op) => {
                let _ = writeln!(out, "{addr:016x}: {}", render_op(&op));
            }
            Err(_) => {
                let _ = writeln!(out, "{addr:016x}: <invalid>");
                break;
            }
        }
    }
    out
}

fn render_op(op: &Op) -> String {
    let mnemonic = op.mnemonic();
    match op {
        Op::LoadFrame(n) | Op::Store(n) => format!("{mnemonic} {n}"),
        Op::LoadData(n) | Op::LoadAddress(n) | Op::Call(n) => format!("{mnemonic} {n}"),
        Op::LoadExpr(json) => format!("{mnemonic} {}", json.to_json_string(false)),
        Op::Params(n) | Op::Upget(n) | Op::Upset(n) | Op::Exit(n) => format!("{mnemonic} {n}"),
        Op::Schedule(addr, n) => format!("{mnemonic} {addr} {n}"),
        Op::Schedulei(n) => format!("{mnemonic} {n}"),
        Op::Closure(desc) => {
            let mut s = format!("{mnemonic} {}", desc.func_address);
            for cap in &desc.captures {
                let _ = write!(s, " {}:{}", if cap.is_local { "local" } else { "upvalue" }, cap.index);
            }
            s
        }
        Op::Vmcall(code) => format!("{mnemonic} {}", vmcall_name(*code)),
        Op::Else(JumpTarget::Resolved(addr)) | Op::Jump(JumpTarget::Resolved(addr)) => format!("{mnemonic} {addr}"),
        Op::Else(JumpTarget::Unresolved) | Op::Jump(JumpTarget::Unresolved) => format!("{mnemonic} ?"),
        _ => mnemonic.to_string(),
    }
}

fn vmcall_name(code: VmCallCode) -> &'static str {
    match code {
        VmCallCode::Connect => "connect",
        VmCallCode::TdOpen => "td_open",
        VmCallCode::Diagnostics => "diagnostics",
        VmCallCode::OpenBuffer => "open_buffer",
    }
}

fn vmcall_from_name(name: &str) -> Option<VmCallCode> {
    Some(match name {
        "connect" => VmCallCode::Connect,
        "td_open" => VmCallCode::TdOpen,
        "diagnostics" => VmCallCode::Diagnostics,
        "open_buffer" => VmCallCode::OpenBuffer,
        _ => return None,
    })
}

/// Parses text in the format [`render`] produces back into a flat
/// instruction sequence, in file order. Comment lines (starting with `;`)
/// and blank lines are skipped; a leading `<address>:` token on an
/// instruction line is accepted and ignored.
pub fn parse(text: &str) -> Result<Vec<Op>, DisasmError> {
    let mut ops = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        let body = match line.split_once(':') {
            Some((prefix, rest)) if prefix.len() == 16 && prefix.bytes().all(|b| b.is_ascii_hexdigit()) => rest.trim(),
            _ => line,
        };
        let (mnemonic, rest) = body.split_once(' ').map(|(a, b)| (a, b.trim())).unwrap_or((body, ""));
        ops.push(parse_op(mnemonic, rest, lineno + 1)?);
    }
    Ok(ops)
}

fn parse_op(mnemonic: &str, rest: &str, lineno: usize) -> Result<Op, DisasmError> {
    let err = |msg: &str| DisasmError::Malformed(lineno, msg.to_string());
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let operand = |i: usize| tokens.get(i).copied().ok_or_else(|| err("missing operand"));
    let parse_i64 = |s: &str| s.parse::<i64>().map_err(|_| err("expected integer"));
    let parse_u64 = |s: &str| s.parse::<u64>().map_err(|_| err("expected integer"));
    let parse_u8 = |s: &str| s.parse::<u8>().map_err(|_| err("expected byte"));

    Ok(match mnemonic {
        "loadframe" => Op::LoadFrame(parse_i64(operand(0)?)?),
        "loaddata" => Op::LoadData(parse_u64(operand(0)?)?),
        "loadaddress" => Op::LoadAddress(parse_u64(operand(0)?)?),
        "loadexpr" => Op::LoadExpr(Json::parse(rest).map_err(|_| err("invalid JSON literal"))?),
        "store" => Op::Store(parse_i64(operand(0)?)?),
        "pop" => Op::Pop,
        "get" => Op::Get,
        "set" => Op::Set,
        "append" => Op::Append,
        "in" => Op::In,
        "params" => Op::Params(parse_u8(operand(0)?)?),
        "call" => Op::Call(parse_u64(operand(0)?)?),
        "calli" => Op::Calli,
        "schedule" => Op::Schedule(parse_u64(operand(0)?)?, parse_u8(operand(1)?)?),
        "schedulei" => Op::Schedulei(parse_u8(operand(0)?)?),
        "return" => Op::Return,
        "closure" => {
            let func_address = parse_u64(operand(0)?)?;
            let mut captures = Vec::new();
            for tok in &tokens[1..] {
                let (kind, idx) = tok.split_once(':').ok_or_else(|| err("malformed capture"))?;
                let is_local = match kind {
                    "local" => true,
                    "upvalue" => false,
                    _ => return Err(err("unknown capture kind")),
                };
                captures.push(CaptureDescriptor { is_local, index: parse_u64(idx)? });
            }
            Op::Closure(ClosureDescriptor { func_address, captures })
        }
        "upget" => Op::Upget(parse_u8(operand(0)?)?),
        "upset" => Op::Upset(parse_u8(operand(0)?)?),
        "vmcall" => Op::Vmcall(vmcall_from_name(operand(0)?).ok_or_else(|| err("unknown vmcall"))?),
        "else" => Op::Else(JumpTarget::Resolved(parse_u64(operand(0)?)?)),
        "jump" => Op::Jump(JumpTarget::Resolved(parse_u64(operand(0)?)?)),
        "bool" => Op::Bool,
        "land" => Op::Land,
        "lor" => Op::Lor,
        "lnot" => Op::Lnot,
        "lessthan" => Op::LessThan,
        "lessthaneq" => Op::LessThanEqual,
        "eq" => Op::Equal,
        "greaterthan" => Op::GreaterThan,
        "greaterthaneq" => Op::GreaterThanEqual,
        "add" => Op::Add,
        "sub" => Op::Sub,
        "mul" => Op::Mul,
        "div" => Op::Div,
        "pow" => Op::Pow,
        "mod" => Op::Mod,
        "neg" => Op::Neg,
        "and" => Op::And,
        "or" => Op::Or,
        "xor" => Op::Xor,
        "lshift" => Op::Lshift,
        "rshift" => Op::Rshift,
        "not" => Op::Not,
        "print" => Op::Print,
        "exit" => Op::Exit(parse_u8(operand(0)?)?),
        "assert" => Op::Assert,
        other => return Err(err(&format!("unknown mnemonic `{other}`"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BcFunction, BcProgram};

    #[test]
    fn render_then_parse_reproduces_the_code_section() {
        let mut program = BcProgram::new();
        let mut main = BcFunction::new("main");
        main.push(Op::LoadExpr(Json::string("hi")), Default::default());
        main.push(Op::LoadFrame(-2), Default::default());
        main.push(Op::Print, Default::default());
        main.push(Op::Exit(0), Default::default());
        program.add_function(main);

        let mut buf = Vec::new();
        crate::serialize::serialize(&program, &mut buf).unwrap();
        let loaded = crate::loader::load(&buf).unwrap();

        let text = render(&loaded);
        let ops = parse(&text).unwrap();

        let mut reassembled = Vec::new();
        crate::serialize::serialize_flat(&ops, loaded.entry_point_offset, &mut reassembled).unwrap();
        let reloaded = crate::loader::load(&reassembled).unwrap();
        assert_eq!(reloaded.code, loaded.code);
    }

    #[test]
    fn rejects_unknown_mnemonic() {
        assert!(matches!(parse("0000000000000000: bogus"), Err(DisasmError::Malformed(1, _))));
    }
}
