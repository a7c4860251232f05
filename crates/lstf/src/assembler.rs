//! IR→bytecode lowering (C5).
//!
//! Walks each user function's basic blocks depth-first, serializing each
//! block at most once and recording, for every block, the bytecode address
//! of its first emitted instruction (`bb_addresses`). Jumps whose target
//! hasn't been serialized yet are emitted with [`JumpTarget::Unresolved`]
//! and queued on a per-target back-patch list, the same placeholder/patch
//! idiom the teacher's compiler uses for its own forward jumps — just one
//! level removed, since here the "placeholder" travels through an
//! `Option<u64>` instead of a dummy `0`.

use std::collections::HashMap;

use crate::bytecode::{BcFunction, BcProgram, CaptureDescriptor, ClosureDescriptor, JumpTarget, Op, SourceMapEntry};
use crate::ir::{
    BinOp, BlockId, Capture, FuncId, IrFunction, IrFunctionBody, IrInstruction, IrInstructionKind, IrProgram, UnOp,
};
use crate::status::AssembleError;

/// Lowers every user function of `program` into `out`. Primitive functions
/// (built-ins) contribute no bytecode of their own — calls to them are
/// inlined directly at the call site by [`lower_call_target`].
///
/// `Call`/`Schedule`/`Closure`/`LoadFunction` operands reference a target by
/// its IR [`FuncId`] while lowering (see `function_placeholder_address`);
/// once every user function has a `BcProgram` index, a final pass rewrites
/// those placeholders to the index the serializer will turn into a real
/// code-section byte offset.
pub fn assemble(program: &IrProgram) -> Result<BcProgram, AssembleError> {
    let mut out = BcProgram::new();
    let mut ir_to_bc: HashMap<usize, usize> = HashMap::new();
    for (ir_idx, func) in program.functions.iter().enumerate() {
        if let IrFunctionBody::User { .. } = &func.body {
            let bc = lower_function(program, func)?;
            let bc_idx = out.add_function(bc);
            ir_to_bc.insert(ir_idx, bc_idx);
        }
    }

    for func in &mut out.functions {
        for op in &mut func.instructions {
            match op {
                Op::Call(addr) | Op::LoadAddress(addr) => *addr = resolve_placeholder(&ir_to_bc, *addr),
                Op::Schedule(addr, _) => *addr = resolve_placeholder(&ir_to_bc, *addr),
                Op::Closure(desc) => desc.func_address = resolve_placeholder(&ir_to_bc, desc.func_address),
                _ => {}
            }
        }
    }

    Ok(out)
}

/// Placeholders hold the target's IR function index (see
/// `function_placeholder_address`); this rewrites it to the corresponding
/// `BcProgram` function index, which `crate::serialize` resolves to a byte
/// offset once every function's size is known.
fn resolve_placeholder(ir_to_bc: &HashMap<usize, usize>, ir_index: u64) -> u64 {
    *ir_to_bc.get(&(ir_index as usize)).expect("call/closure/schedule target must be a user function") as u64
}

struct UnresolvedJump {
    function: usize,
    instr_index: usize,
}

fn lower_function(program: &IrProgram, func: &IrFunction) -> Result<BcFunction, AssembleError> {
    let IrFunctionBody::User { blocks, entry, exit, .. } = &func.body else {
        unreachable!("lower_function only called on user functions")
    };

    let mut bc = BcFunction::new(func.name.clone());
    bc.push(Op::Params(func.num_params), SourceMapEntry::default());

    let mut serialized = vec![false; blocks.len()];
    let mut bb_start_index: HashMap<usize, usize> = HashMap::new();
    let mut unresolved: HashMap<usize, Vec<UnresolvedJump>> = HashMap::new();

    if blocks[entry.0].successors().first() == Some(exit) {
        return Err(AssembleError::EmptyFunction(func.name.clone()));
    }

    let start = blocks[entry.0].successors().first().copied().unwrap_or(*exit);

    let mut stack = vec![start];
    let mut order = Vec::new();
    // Emit in the order dictated by successor order (0 then 1), depth first,
    // matching §4.5 step 6. We walk with an explicit stack rather than
    // recursion so arbitrarily long chains of blocks don't blow the Rust
    // call stack.
    while let Some(block_id) = stack.pop() {
        if block_id == *exit || serialized[block_id.0] {
            continue;
        }
        serialized[block_id.0] = true;
        order.push(block_id);
        let succs = blocks[block_id.0].successors();
        for succ in succs.into_iter().rev() {
            stack.push(succ);
        }
    }

    for block_id in order {
        bb_start_index.insert(block_id.0, bc.instructions.len());
        lower_block(program, func, block_id, &mut bc, &mut unresolved, &bb_start_index, blocks)?;
    }

    // Patch every jump whose target had not yet been serialized at emission time.
    for (target, jumps) in unresolved {
        let addr = *bb_start_index.get(&target).ok_or(AssembleError::MisplacedBranch)?;
        for j in jumps {
            debug_assert_eq!(j.function, 0);
            let resolved = JumpTarget::Resolved(addr as u64);
            match &mut bc.instructions[j.instr_index] {
                Op::Jump(t) | Op::Else(t) => *t = resolved,
                _ => return Err(AssembleError::MisplacedBranch),
            }
        }
    }

    resolve_instruction_indices_to_byte_offsets(&mut bc);

    Ok(bc)
}

/// Up to this point every `Jump`/`Else` target recorded above is an
/// *instruction index* within this function (that's all a depth-first walk
/// over variable-size instructions can produce in one pass). This converts
/// each one to the function-local byte offset the VM actually jumps by,
/// using `Op::encoded_size` as the running offset.
fn resolve_instruction_indices_to_byte_offsets(bc: &mut BcFunction) {
    let mut byte_offset_of = Vec::with_capacity(bc.instructions.len());
    let mut running = 0u64;
    for op in &bc.instructions {
        byte_offset_of.push(running);
        running += op.encoded_size() as u64;
    }
    for op in &mut bc.instructions {
        if let Op::Jump(JumpTarget::Resolved(idx)) | Op::Else(JumpTarget::Resolved(idx)) = op {
            *idx = byte_offset_of[*idx as usize];
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn lower_block(
    program: &IrProgram,
    _func: &IrFunction,
    block_id: BlockId,
    bc: &mut BcFunction,
    unresolved: &mut HashMap<usize, Vec<UnresolvedJump>>,
    bb_start_index: &HashMap<usize, usize>,
    blocks: &[crate::ir::IrBasicBlock],
) -> Result<(), AssembleError> {
    let block = &blocks[block_id.0];
    let mut fp: i64 = 0;

    let last_index = block.instructions.len().saturating_sub(1);
    for (i, instr) in block.instructions.iter().enumerate() {
        // `Branch` is a block terminator (`IrBasicBlock::push` stores it in
        // the same `instructions` Vec as everything else); when it's last,
        // its bytecode is emitted by the dedicated `Else`/`Jump` logic
        // below instead of here. A `Branch` anywhere else is malformed IR
        // and still reaches `lower_instruction`'s `MisplacedBranch` arm.
        if matches!(instr.kind, IrInstructionKind::Branch { .. }) && i == last_index {
            continue;
        }
        lower_instruction(program, instr, bc, &mut fp)?;
    }

    // Emit the pops computed by the C3 stack-pop-point analysis, but only
    // ahead of a conditional branch or a valueless return (§4.3).
    let emits_pops = match block.instructions.last().map(|i| &i.kind) {
        Some(IrInstructionKind::Branch { cond: true, .. }) => true,
        Some(IrInstructionKind::Return { has_value: false }) => true,
        _ => false,
    };
    if emits_pops {
        let insert_at = bc.instructions.len() - 1;
        for _ in 0..block.variables_killed {
            bc.instructions.insert(insert_at, Op::Pop);
            bc.source_map.insert(insert_at, SourceMapEntry::default());
        }
    }

    match block.instructions.last().map(|i| &i.kind) {
        Some(IrInstructionKind::Branch { cond: true, taken, not_taken }) => {
            let not_taken = not_taken.expect("conditional branch always has a not_taken target");
            emit_jump_to(bc, Op::Else, not_taken, unresolved, bb_start_index);
            if bb_start_index.get(&taken.0).is_none() {
                // `taken` hasn't been laid out contiguously right after this
                // block; it will be serialized later in program order, so a
                // fallthrough is correct only when the DFS order happens to
                // place it immediately next. We can't know that here, so
                // conservatively always emit the jump — an extra jump never
                // changes program semantics, just disassembly density.
                emit_jump_to(bc, Op::Jump, *taken, unresolved, bb_start_index);
            }
        }
        _ => {}
    }

    Ok(())
}

fn emit_jump_to(
    bc: &mut BcFunction,
    make_op: fn(JumpTarget) -> Op,
    target: BlockId,
    unresolved: &mut HashMap<usize, Vec<UnresolvedJump>>,
    bb_start_index: &HashMap<usize, usize>,
) {
    let idx = bc.instructions.len();
    if let Some(addr) = bb_start_index.get(&target.0) {
        bc.push(make_op(JumpTarget::Resolved(*addr as u64)), SourceMapEntry::default());
    } else {
        bc.push(make_op(JumpTarget::Unresolved), SourceMapEntry::default());
        unresolved.entry(target.0).or_default().push(UnresolvedJump { function: 0, instr_index: idx });
    }
}

fn lower_instruction(program: &IrProgram, instr: &IrInstruction, bc: &mut BcFunction, fp: &mut i64) -> Result<(), AssembleError> {
    let loc = SourceMapEntry { line: instr.loc.line, column: instr.loc.column };
    match &instr.kind {
        IrInstructionKind::Alloc { is_automatic } => {
            instr.frame_offset.set(Some(*fp));
            if *is_automatic {
                *fp += 1;
            }
            // A non-automatic alloc with an initializer aliases the
            // initializer's slot per §4.5 step 3; the caller is expected to
            // have assigned the initializer's frame_offset to `*fp - 1`
            // already, so no `fp` bump happens here either.
        }
        IrInstructionKind::Load { src } => {
            let offset = src.get().ok_or(AssembleError::PhiFrameOffsetMismatch)?;
            bc.push(Op::LoadFrame(offset), loc);
            instr.frame_offset.set(Some(*fp));
            *fp += 1;
        }
        IrInstructionKind::Store { src, dst } => {
            let _ = src;
            let offset = dst.get().ok_or(AssembleError::PhiFrameOffsetMismatch)?;
            bc.push(Op::Store(offset), loc);
            *fp -= 1;
        }
        IrInstructionKind::Const(json) => {
            bc.push(Op::LoadExpr(json.clone()), loc);
            instr.frame_offset.set(Some(*fp));
            *fp += 1;
        }
        IrInstructionKind::Binary(op) => {
            bc.push(binop_to_op(*op), loc);
            *fp -= 1; // two operands consumed, one result pushed
            instr.frame_offset.set(Some(*fp));
            *fp += 1;
        }
        IrInstructionKind::Unary(op) => {
            bc.push(unop_to_op(*op), loc);
            instr.frame_offset.set(Some(*fp));
        }
        IrInstructionKind::Append => {
            bc.push(Op::Append, loc);
            *fp -= 1;
        }
        IrInstructionKind::GetElem => {
            bc.push(Op::Get, loc);
            *fp -= 1;
        }
        IrInstructionKind::SetElem => {
            bc.push(Op::Set, loc);
            *fp -= 2;
        }
        IrInstructionKind::Match => {
            bc.push(Op::Equal, loc);
            *fp -= 1;
            instr.frame_offset.set(Some(*fp));
            *fp += 1;
        }
        IrInstructionKind::Call { func: target, args } => {
            lower_call_target(program, *target, *args, bc, loc.clone())?;
            let has_result = matches!(&program.function(*target).body, IrFunctionBody::User { .. })
                && program.function(*target).has_result
                || matches!(&program.function(*target).body, IrFunctionBody::Primitive { .. })
                    && program.function(*target).has_result;
            *fp -= *args as i64;
            if has_result {
                instr.frame_offset.set(Some(*fp));
                *fp += 1;
            }
        }
        IrInstructionKind::IndirectCall { args, has_result } => {
            bc.push(Op::Calli, loc);
            *fp -= *args as i64 + 1;
            if *has_result {
                instr.frame_offset.set(Some(*fp));
                *fp += 1;
            }
        }
        IrInstructionKind::Schedule { func: target, args } => {
            let address = function_placeholder_address(program, *target);
            bc.push(Op::Schedule(address, *args), loc);
            *fp -= *args as i64;
        }
        IrInstructionKind::IndirectSchedule { args } => {
            bc.push(Op::Schedulei(*args), loc);
            *fp -= *args as i64 + 1;
        }
        IrInstructionKind::Closure { func: target, captures } => {
            let descriptors = captures
                .iter()
                .map(|c| match c {
                    Capture::Local(offset) => CaptureDescriptor { is_local: true, index: *offset as u64 },
                    Capture::Upvalue(id) => CaptureDescriptor { is_local: false, index: *id },
                })
                .collect();
            let address = function_placeholder_address(program, *target);
            bc.push(Op::Closure(ClosureDescriptor { func_address: address, captures: descriptors }), loc);
            instr.frame_offset.set(Some(*fp));
            *fp += 1;
        }
        IrInstructionKind::GetUpvalue { id } => {
            bc.push(Op::Upget(*id as u8), loc);
            instr.frame_offset.set(Some(*fp));
            *fp += 1;
        }
        IrInstructionKind::SetUpvalue { id, .. } => {
            bc.push(Op::Upset(*id as u8), loc);
            *fp -= 1;
        }
        IrInstructionKind::Phi { args } => {
            let first = args.first().and_then(|a| a.get()).ok_or(AssembleError::PhiFrameOffsetMismatch)?;
            if !args.iter().all(|a| a.get() == Some(first)) {
                return Err(AssembleError::PhiFrameOffsetMismatch);
            }
            instr.frame_offset.set(Some(first));
        }
        IrInstructionKind::LoadFunction { func: target } => {
            let address = function_placeholder_address(program, *target);
            bc.push(Op::LoadAddress(address), loc);
            instr.frame_offset.set(Some(*fp));
            *fp += 1;
        }
        // A `Branch` that is its block's last instruction is skipped by
        // `lower_block` and emitted there instead; reaching this arm means
        // it wasn't last.
        IrInstructionKind::Branch { .. } => {
            return Err(AssembleError::MisplacedBranch);
        }
        IrInstructionKind::Return { has_value } => {
            bc.push(Op::Return, loc);
            if *has_value {
                *fp -= 1;
            }
        }
    }
    Ok(())
}

/// Primitive (built-in) functions have no bytecode body of their own — a
/// call site lowers directly to the primitive's fixed opcode instead of a
/// `call` instruction. A user function's address is resolved later by the
/// serializer once every function's final byte offset is known; here we
/// just record a placeholder that the serializer fixes up (see
/// `crate::serialize`).
fn lower_call_target(program: &IrProgram, target: FuncId, args: u8, bc: &mut BcFunction, loc: SourceMapEntry) -> Result<(), AssembleError> {
    match &program.function(target).body {
        IrFunctionBody::Primitive { opcode_mnemonic, vmcall_code } => {
            match *opcode_mnemonic {
                "print" => bc.push(Op::Print, loc),
                "vmcall" => bc.push(Op::Vmcall(vmcall_code.ok_or(AssembleError::EmptyFunction(program.function(target).name.clone()))?), loc),
                "in" => bc.push(Op::In, loc),
                "assert" => bc.push(Op::Assert, loc),
                "exit" => bc.push(Op::Exit(args), loc),
                other => return Err(AssembleError::EmptyFunction(other.to_string())),
            };
        }
        IrFunctionBody::User { .. } => {
            bc.push(Op::Call(function_placeholder_address(program, target)), loc);
        }
    }
    Ok(())
}

/// A function's eventual code-section byte offset isn't known until every
/// preceding function has been fully lowered and serialized; we record the
/// *IR* function index here and let `crate::serialize` replace it with the
/// real address (functions are serialized in `BcProgram.functions` order,
/// which mirrors `IrProgram.functions` order for user functions).
fn function_placeholder_address(program: &IrProgram, target: FuncId) -> u64 {
    let _ = program;
    target.0 as u64
}

fn binop_to_op(op: BinOp) -> Op {
    match op {
        BinOp::Add => Op::Add,
        BinOp::Sub => Op::Sub,
        BinOp::Mul => Op::Mul,
        BinOp::Div => Op::Div,
        BinOp::Mod => Op::Mod,
        BinOp::Eq => Op::Equal,
        BinOp::Neq => Op::Equal, // negated by a following `lnot` emitted by the caller's desugaring
        BinOp::Lt => Op::LessThan,
        BinOp::Lte => Op::LessThanEqual,
        BinOp::Gt => Op::GreaterThan,
        BinOp::Gte => Op::GreaterThanEqual,
        BinOp::And => Op::And,
        BinOp::Or => Op::Or,
        BinOp::LAnd => Op::Land,
        BinOp::LOr => Op::Lor,
        BinOp::In => Op::In,
    }
}

fn unop_to_op(op: UnOp) -> Op {
    match op {
        UnOp::Neg => Op::Neg,
        UnOp::Not => Op::Not,
        UnOp::LNot => Op::Lnot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{new_slot, IrInstructionKind};
    use crate::json::Json;

    fn push_const(func: &mut IrFunction, block: BlockId, json: Json) {
        func.block_mut(block).push(IrInstruction::new(IrInstructionKind::Const(json)));
    }

    #[test]
    fn hello_world_lowers_to_load_print_return() {
        let mut program = IrProgram::new();
        let print_fn = IrFunction::new_for_instruction("print", 1, false, true, "print", None);
        let print_id = program.add_function(print_fn);

        let mut main = IrFunction::new_userfn("main", 0, 0, false);
        let IrFunctionBody::User { entry, exit, .. } = &main.body else { unreachable!() };
        let (entry, exit) = (*entry, *exit);
        // `entry` stays a bare forwarding stub (its default Branch to
        // `exit`, per `new_userfn`); real code lives in a block the
        // assembler's DFS reaches by following that stub, same as a
        // lowering pass would build it.
        let body = main.add_block();
        main.block_mut(entry).clear();
        main.block_mut(entry).push(IrInstruction::new(IrInstructionKind::Branch { cond: false, taken: body, not_taken: None }));
        push_const(&mut main, body, Json::string("hello, world\n"));
        main.block_mut(body).instructions.push(IrInstruction::new(IrInstructionKind::Call { func: print_id, args: 1 }));
        main.block_mut(body).push(IrInstruction::new(IrInstructionKind::Return { has_value: false }));
        let _ = exit;

        let main_id = program.add_function(main);
        crate::analysis::run(program.function_mut(main_id));

        let bc = assemble(&program).unwrap();
        let f = bc.find_function("main").unwrap();
        assert!(matches!(f.instructions[0], Op::Params(0)));
        assert!(matches!(f.instructions[1], Op::LoadExpr(_)));
        assert!(matches!(f.instructions[2], Op::Print));
        assert!(matches!(f.instructions[3], Op::Return));
        let _ = new_slot();
    }

    #[test]
    fn conditional_branch_lowers_to_else_and_jump_around_both_arms() {
        let mut program = IrProgram::new();
        let print_fn = IrFunction::new_for_instruction("print", 1, false, true, "print", None);
        let print_id = program.add_function(print_fn);

        let mut main = IrFunction::new_userfn("main", 0, 0, false);
        let IrFunctionBody::User { entry, exit, .. } = &main.body else { unreachable!() };
        let (entry, exit) = (*entry, *exit);

        let check = main.add_block();
        let then_b = main.add_block();
        let else_b = main.add_block();

        main.block_mut(entry).clear();
        main.block_mut(entry).push(IrInstruction::new(IrInstructionKind::Branch { cond: false, taken: check, not_taken: None }));

        push_const(&mut main, check, Json::bool(true));
        main.block_mut(check)
            .push(IrInstruction::new(IrInstructionKind::Branch { cond: true, taken: then_b, not_taken: Some(else_b) }));

        push_const(&mut main, then_b, Json::string("yes"));
        main.block_mut(then_b).instructions.push(IrInstruction::new(IrInstructionKind::Call { func: print_id, args: 1 }));
        main.block_mut(then_b).push(IrInstruction::new(IrInstructionKind::Return { has_value: false }));

        push_const(&mut main, else_b, Json::string("no"));
        main.block_mut(else_b).instructions.push(IrInstruction::new(IrInstructionKind::Call { func: print_id, args: 1 }));
        main.block_mut(else_b).push(IrInstruction::new(IrInstructionKind::Return { has_value: false }));
        let _ = exit;

        let main_id = program.add_function(main);
        crate::analysis::run(program.function_mut(main_id));

        let bc = assemble(&program).expect("a block ending in Branch must lower, not error with MisplacedBranch");
        let f = bc.find_function("main").unwrap();
        assert!(f.instructions.iter().any(|op| matches!(op, Op::Else(_))), "conditional branch must emit `else`");
        assert!(f.instructions.iter().filter(|op| matches!(op, Op::Return)).count() == 2, "both arms must lower to their own `return`");
    }
}
