//! Control-flow-graph intermediate representation (C2).
//!
//! An [`IrProgram`] is built programmatically (there is no surface-syntax
//! parser in this crate — callers construct IR directly, the way a
//! front end would after parsing and type-checking) and is the input to the
//! analyses in [`crate::analysis`] and the lowering in [`crate::assembler`].

use std::cell::Cell;
use std::rc::Rc;

use crate::bytecode::VmCallCode;
use crate::json::Json;

/// Assigned during assembly; `None` means "not yet assigned" (the spec's
/// −∞ sentinel). Shared by `Rc` so that every consumer of a value-producing
/// instruction observes the same frame offset once lowering assigns it —
/// this is also how `Phi` convergence is checked (§3.4: "all arguments must
/// share the same frame offset").
pub type Slot = Rc<Cell<Option<i64>>>;

pub fn new_slot() -> Slot {
    Rc::new(Cell::new(None))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    /// Eager logical-and (`land`), distinct from the short-circuiting `And`
    /// the surface language lowers to branches: kept for scripts that build
    /// IR directly and want a single eager instruction.
    LAnd,
    LOr,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    LNot,
}

/// How a closure capture is resolved at the point the `Closure` instruction
/// executes.
#[derive(Debug, Clone, Copy)]
pub enum Capture {
    /// Capture the local at this frame offset in the *creating* frame.
    Local(i64),
    /// Re-capture the creating closure's own upvalue at this id.
    Upvalue(u64),
}

/// A source location used only for diagnostics; carried by every
/// instruction but never consulted by the assembler or VM.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceLoc {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone)]
pub enum IrInstructionKind {
    Const(Json),
    GetElem,
    SetElem,
    Binary(BinOp),
    Unary(UnOp),
    Call { func: FuncId, args: u8 },
    IndirectCall { args: u8, has_result: bool },
    Schedule { func: FuncId, args: u8 },
    IndirectSchedule { args: u8 },
    Branch { cond: bool, taken: BlockId, not_taken: Option<BlockId> },
    Return { has_value: bool },
    /// `is_automatic` distinguishes a compiler-inserted temporary slot from
    /// a user-declared variable (which may carry an initializer).
    Alloc { is_automatic: bool },
    Load { src: Slot },
    LoadFunction { func: FuncId },
    Store { src: Slot, dst: Slot },
    Closure { func: FuncId, captures: Vec<Capture> },
    GetUpvalue { id: u64 },
    SetUpvalue { id: u64, value: Slot },
    Phi { args: Vec<Slot> },
    Append,
    Match,
}

#[derive(Debug, Clone)]
pub struct IrInstruction {
    pub kind: IrInstructionKind,
    pub loc: SourceLoc,
    /// Assigned by the assembler during lowering; `None` before that.
    pub frame_offset: Slot,
}

impl IrInstruction {
    pub fn new(kind: IrInstructionKind) -> Self {
        IrInstruction { kind, loc: SourceLoc::default(), frame_offset: new_slot() }
    }

    pub fn with_loc(mut self, loc: SourceLoc) -> Self {
        self.loc = loc;
        self
    }
}

#[derive(Debug, Default)]
pub struct IrBasicBlock {
    pub instructions: Vec<IrInstruction>,
    /// Filled in by [`crate::analysis::run`]; empty until analysis runs.
    pub variables_killed: usize,
    ended: bool,
}

impl IrBasicBlock {
    /// Appends `instr`. Panics if the block already ends in `Branch` or
    /// `Return` — appending after a terminator is a programming error, per
    /// the IR model's own invariant, not a recoverable runtime condition.
    pub fn push(&mut self, instr: IrInstruction) {
        assert!(!self.ended, "cannot append an instruction after a block terminator");
        self.ended = matches!(
            instr.kind,
            IrInstructionKind::Branch { .. } | IrInstructionKind::Return { .. }
        );
        self.instructions.push(instr);
    }

    pub fn is_terminated(&self) -> bool {
        self.ended
    }

    /// Discards every instruction, including a terminator, so the block can
    /// be rebuilt from scratch via [`IrBasicBlock::push`].
    pub fn clear(&mut self) {
        self.instructions.clear();
        self.ended = false;
    }

    /// The block's successors in visitation order (0, then 1), per §4.5 step 6.
    pub fn successors(&self) -> Vec<BlockId> {
        match self.instructions.last().map(|i| &i.kind) {
            Some(IrInstructionKind::Branch { taken, not_taken, .. }) => {
                let mut out = vec![*taken];
                out.extend(*not_taken);
                out
            }
            _ => Vec::new(),
        }
    }
}

/// Either a user function with a CFG body, or a stub the assembler lowers
/// directly to a single primitive opcode (built-ins like `print`).
#[derive(Debug)]
pub enum IrFunctionBody {
    User {
        blocks: Vec<IrBasicBlock>,
        entry: BlockId,
        exit: BlockId,
        /// Reverse CFG edge index, maintained by [`crate::analysis`].
        predecessors: Vec<Vec<BlockId>>,
    },
    Primitive {
        opcode_mnemonic: &'static str,
        vmcall_code: Option<VmCallCode>,
    },
}

#[derive(Debug)]
pub struct IrFunction {
    pub name: String,
    pub num_params: u8,
    pub num_upvalues: u8,
    pub has_result: bool,
    pub does_return: bool,
    pub body: IrFunctionBody,
}

impl IrFunction {
    /// Pre-creates entry and exit blocks, wired entry → exit, per §4.2.
    pub fn new_userfn(name: impl Into<String>, num_params: u8, num_upvalues: u8, has_result: bool) -> Self {
        let mut entry = IrBasicBlock::default();
        let exit = IrBasicBlock::default();
        entry.push(IrInstruction::new(IrInstructionKind::Branch { cond: false, taken: BlockId(1), not_taken: None }));
        IrFunction {
            name: name.into(),
            num_params,
            num_upvalues,
            has_result,
            does_return: true,
            body: IrFunctionBody::User {
                blocks: vec![entry, exit],
                entry: BlockId(0),
                exit: BlockId(1),
                predecessors: vec![Vec::new(), vec![BlockId(0)]],
            },
        }
    }

    pub fn new_for_instruction(
        name: impl Into<String>,
        num_params: u8,
        has_result: bool,
        does_return: bool,
        opcode_mnemonic: &'static str,
        vmcall_code: Option<VmCallCode>,
    ) -> Self {
        IrFunction {
            name: name.into(),
            num_params,
            num_upvalues: 0,
            has_result,
            does_return,
            body: IrFunctionBody::Primitive { opcode_mnemonic, vmcall_code },
        }
    }

    /// Appends a new, unreachable-until-wired block and returns its id. The
    /// exit block is kept last in `blocks` so iteration order always visits
    /// user blocks before it (§4.2).
    pub fn add_block(&mut self) -> BlockId {
        match &mut self.body {
            IrFunctionBody::User { blocks, exit, predecessors, .. } => {
                let exit_block = blocks.pop().expect("exit block always present");
                let exit_preds = predecessors.pop().expect("predecessors tracked 1:1 with blocks");
                let new_id = BlockId(blocks.len());
                blocks.push(IrBasicBlock::default());
                predecessors.push(Vec::new());
                blocks.push(exit_block);
                predecessors.push(exit_preds);
                *exit = BlockId(blocks.len() - 1);
                new_id
            }
            IrFunctionBody::Primitive { .. } => panic!("cannot add a block to a primitive function"),
        }
    }

    pub fn block(&self, id: BlockId) -> &IrBasicBlock {
        match &self.body {
            IrFunctionBody::User { blocks, .. } => &blocks[id.0],
            IrFunctionBody::Primitive { .. } => panic!("primitive function has no blocks"),
        }
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut IrBasicBlock {
        match &mut self.body {
            IrFunctionBody::User { blocks, .. } => &mut blocks[id.0],
            IrFunctionBody::Primitive { .. } => panic!("primitive function has no blocks"),
        }
    }

    /// Records that `from` falls through or branches to `to`, updating the
    /// reverse-edge index that [`crate::analysis`] consumes.
    pub fn link(&mut self, from: BlockId, to: BlockId) {
        match &mut self.body {
            IrFunctionBody::User { predecessors, .. } => predecessors[to.0].push(from),
            IrFunctionBody::Primitive { .. } => panic!("primitive function has no blocks"),
        }
    }
}

#[derive(Debug, Default)]
pub struct IrProgram {
    pub functions: Vec<IrFunction>,
}

impl IrProgram {
    pub fn new() -> Self {
        IrProgram::default()
    }

    pub fn add_function(&mut self, func: IrFunction) -> FuncId {
        self.functions.push(func);
        FuncId(self.functions.len() - 1)
    }

    pub fn function(&self, id: FuncId) -> &IrFunction {
        &self.functions[id.0]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut IrFunction {
        &mut self.functions[id.0]
    }

    pub fn find_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions.iter().position(|f| f.name == name).map(FuncId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_userfn_wires_entry_to_exit() {
        let f = IrFunction::new_userfn("main", 0, 0, false);
        let IrFunctionBody::User { entry, exit, .. } = &f.body else { panic!("expected user body") };
        assert_eq!(f.block(*entry).successors(), vec![*exit]);
    }

    #[test]
    #[should_panic]
    fn pushing_after_terminator_panics() {
        let mut block = IrBasicBlock::default();
        block.push(IrInstruction::new(IrInstructionKind::Return { has_value: false }));
        block.push(IrInstruction::new(IrInstructionKind::Append));
    }

    #[test]
    fn phi_slots_share_identity_across_arguments() {
        let a = new_slot();
        a.set(Some(3));
        let phi = IrInstruction::new(IrInstructionKind::Phi { args: vec![a.clone()] });
        if let IrInstructionKind::Phi { args } = &phi.kind {
            assert_eq!(args[0].get(), Some(3));
        }
    }
}
