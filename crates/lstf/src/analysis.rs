//! IR analyses (C3): CFG simplification and the stack-pop-point dataflow
//! that tells the assembler how many `pop`s to emit at the end of a block.

use std::collections::HashSet;

use crate::ir::{BlockId, IrFunction, IrFunctionBody, IrInstructionKind};

/// Runs both passes on a user function. No-op on a primitive function.
pub fn run(func: &mut IrFunction) {
    if matches!(func.body, IrFunctionBody::Primitive { .. }) {
        return;
    }
    simplify_cfg(func);
    compute_variables_killed(func);
}

/// Repeatedly removes empty, non-entry, non-exit blocks by splicing their
/// unique predecessor(s) directly to their unique (or absent) successor,
/// rewriting any `Branch` target that pointed at the removed block.
fn simplify_cfg(func: &mut IrFunction) {
    // Derive predecessors from the blocks' actual terminators rather than
    // trust whatever incremental bookkeeping the IR builder did via
    // `link()` — callers are free to mutate a block's terminator directly
    // (see the `closure`/test builders), and a stale reverse index would
    // make retargeting silently no-op instead of rewiring branches.
    recompute_predecessors(func);

    loop {
        let IrFunctionBody::User { blocks, entry, exit, .. } = &func.body else { return };
        let candidate = blocks.iter().enumerate().position(|(i, b)| {
            BlockId(i) != *entry && BlockId(i) != *exit && is_trivial_jump(b)
        });
        let Some(removed_idx) = candidate else { break };
        let removed = BlockId(removed_idx);

        let IrFunctionBody::User { blocks, predecessors, .. } = &func.body else { return };
        let successor = blocks[removed_idx].successors().first().copied();
        let preds = predecessors[removed_idx].clone();

        for pred in &preds {
            retarget_block(func, *pred, removed, successor);
        }

        // Splice out of the graph: leave the block empty with no incoming
        // edges (an orphan); later address assignment only ever visits
        // reachable blocks from `entry`, so an orphan is harmless dead
        // weight rather than a correctness hazard. Clearing its own
        // instructions also drops it out of `is_trivial_jump` so the outer
        // loop can't keep re-selecting the same block forever.
        let IrFunctionBody::User { blocks, predecessors, .. } = &mut func.body else { return };
        blocks[removed_idx].clear();
        predecessors[removed_idx].clear();
        if let Some(succ) = successor {
            if let Some(pos) = predecessors[succ.0].iter().position(|p| *p == removed) {
                predecessors[succ.0].remove(pos);
            }
            for pred in &preds {
                predecessors[succ.0].push(*pred);
            }
        }
    }

    recompute_predecessors(func);
}

/// A block that does no real work of its own: a single unconditional
/// `Branch` falling through to its successor. Only these are safe to splice
/// out — a block with zero instructions has no successor to retarget
/// predecessors to, so leaving it in place is correct, not a bug.
fn is_trivial_jump(b: &crate::ir::IrBasicBlock) -> bool {
    matches!(
        b.instructions.as_slice(),
        [instr] if matches!(instr.kind, IrInstructionKind::Branch { cond: false, .. })
    )
}

fn retarget_block(func: &mut IrFunction, block: BlockId, from: BlockId, to: Option<BlockId>) {
    let IrFunctionBody::User { blocks, .. } = &mut func.body else { return };
    if let Some(instr) = blocks[block.0].instructions.last_mut() {
        if let IrInstructionKind::Branch { taken, not_taken, .. } = &mut instr.kind {
            if *taken == from {
                if let Some(to) = to {
                    *taken = to;
                }
            }
            if *not_taken == Some(from) {
                *not_taken = to;
            }
        }
    }
}

fn recompute_predecessors(func: &mut IrFunction) {
    let IrFunctionBody::User { blocks, predecessors, .. } = &mut func.body else { return };
    for preds in predecessors.iter_mut() {
        preds.clear();
    }
    for (i, block) in blocks.iter().enumerate() {
        for succ in block.successors() {
            predecessors[succ.0].push(BlockId(i));
        }
    }
}

/// Forward dataflow over a bitset of local-variable ids — one bit per
/// `Alloc` with an initializer, in enumeration order — computing, for each
/// block, how many of those locals go out of scope (and so must be popped)
/// at the end of the block.
fn compute_variables_killed(func: &mut IrFunction) {
    let IrFunctionBody::User { blocks, predecessors, exit, .. } = &func.body else { return };
    let num_blocks = blocks.len();
    let exit = *exit;

    // Enumerate `Alloc(var)` instructions (those with an initializer) in
    // program order; the spec defines one bit per such instruction.
    let mut locals: Vec<(BlockId, usize)> = Vec::new();
    for (bi, block) in blocks.iter().enumerate() {
        for (ii, instr) in block.instructions.iter().enumerate() {
            if let IrInstructionKind::Alloc { is_automatic: false } = instr.kind {
                locals.push((BlockId(bi), ii));
            }
        }
    }
    let num_locals = locals.len();
    if num_locals == 0 {
        for block in 0..num_blocks {
            let IrFunctionBody::User { blocks, .. } = &mut func.body else { return };
            blocks[block].variables_killed = 0;
        }
        return;
    }

    let gen_set: Vec<HashSet<usize>> = (0..num_blocks)
        .map(|bi| {
            locals.iter().enumerate().filter(|(_, (b, _))| b.0 == bi).map(|(id, _)| id).collect()
        })
        .collect();

    let universal: HashSet<usize> = (0..num_locals).collect();
    let mut out: Vec<HashSet<usize>> = vec![universal.clone(); num_blocks];

    let mut changed = true;
    while changed {
        changed = false;
        for bi in 0..num_blocks {
            let preds = &predecessors[bi];
            let in_set: HashSet<usize> = if preds.is_empty() {
                universal.clone()
            } else {
                let mut it = preds.iter();
                let first = out[it.next().unwrap().0].clone();
                it.fold(first, |acc, p| acc.intersection(&out[p.0]).copied().collect())
            };
            let new_out: HashSet<usize> = in_set.union(&gen_set[bi]).copied().collect();
            if new_out != out[bi] {
                out[bi] = new_out;
                changed = true;
            }
        }
    }

    for bi in 0..num_blocks {
        if BlockId(bi) == exit {
            continue;
        }
        let IrFunctionBody::User { blocks, .. } = &func.body else { return };
        let succ_ins: HashSet<usize> = blocks[bi]
            .successors()
            .into_iter()
            .filter(|s| *s != exit)
            .flat_map(|s| out[s.0].iter().copied().collect::<Vec<_>>())
            .collect();
        let reaching: HashSet<usize> = out[bi].union(&gen_set[bi]).copied().collect();
        let killed = reaching.difference(&succ_ins).count();

        let IrFunctionBody::User { blocks, .. } = &mut func.body else { return };
        blocks[bi].variables_killed = killed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrInstruction, SourceLoc};

    #[test]
    fn removes_empty_non_entry_non_exit_blocks() {
        let mut f = IrFunction::new_userfn("f", 0, 0, false);
        let mid = f.add_block();
        // Rewire entry -> mid -> exit.
        let IrFunctionBody::User { blocks, entry, exit, .. } = &mut f.body else { unreachable!() };
        let exit = *exit;
        blocks[entry.0].clear();
        blocks[entry.0].push(IrInstruction::new(crate::ir::IrInstructionKind::Branch {
            cond: false,
            taken: mid,
            not_taken: None,
        }));
        blocks[mid.0].push(IrInstruction::new(crate::ir::IrInstructionKind::Branch {
            cond: false,
            taken: exit,
            not_taken: None,
        }));
        // mid does no real work besides its terminator branch, so it is a
        // trivial jump-only block and should be spliced out.
        run(&mut f);
        let IrFunctionBody::User { blocks, entry, .. } = &f.body else { unreachable!() };
        assert_eq!(blocks[entry.0].successors(), vec![exit]);
    }

    #[test]
    fn no_locals_means_zero_kills_everywhere() {
        let mut f = IrFunction::new_userfn("f", 0, 0, false);
        run(&mut f);
        let IrFunctionBody::User { blocks, .. } = &f.body else { unreachable!() };
        assert!(blocks.iter().all(|b| b.variables_killed == 0));
        let _ = SourceLoc::default();
    }
}
