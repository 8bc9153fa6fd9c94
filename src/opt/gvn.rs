//! Value numbering: dominator-checked common-subexpression elimination.
//!
//! Pure instructions with identical data are merged when the existing
//! definition dominates the redundant one. Loads are not handled here; the
//! redundant-load pass owns memory.

use rustc_hash::FxHashMap;

use crate::dominator_tree::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Function, Inst, InstructionData, Module, Opcode, Value};
use crate::opt::{replace_with_value, OptLimits};

pub fn run(module: &Module, func: &mut Function, limits: &OptLimits) -> bool {
    let _ = module;
    let cfg = ControlFlowGraph::with_function(func);
    let domtree = DominatorTree::with_function(func, &cfg);

    // Visit blocks in reverse post-order so definitions are usually seen
    // before the redundant copies they dominate.
    let rpo: Vec<_> = domtree.cfg_postorder().iter().rev().copied().collect();

    let mut table: FxHashMap<InstructionData, (Inst, Value)> = FxHashMap::default();
    let mut changed = false;
    for block in rpo {
        for inst in func.layout.block_insts(block).to_vec() {
            if !is_numberable(&func.dfg.insts[inst]) {
                continue;
            }
            // Normalise the key: operands must be alias-free, and
            // commutative operations order their operands canonically.
            func.dfg.resolve_inst_aliases(inst);
            let mut data = func.dfg.insts[inst];
            if let InstructionData::Binary { opcode, args } = data {
                if opcode.is_commutative() && args[1] < args[0] {
                    data = InstructionData::Binary {
                        opcode,
                        args: [args[1], args[0]],
                    };
                }
            }
            match table.get(&data).copied() {
                Some((prev_inst, prev_value))
                    if domtree.dominates(prev_inst, inst, &func.layout) =>
                {
                    replace_with_value(func, inst, prev_value);
                    changed = true;
                }
                _ => {
                    if table.len() >= limits.gvn_table_limit {
                        continue;
                    }
                    if let Some(value) = func.dfg.first_result(inst) {
                        table.insert(data, (inst, value));
                    }
                }
            }
        }
    }
    changed
}

/// Single-result pure instructions are candidates. `iconst` is included so
/// duplicate constants collapse; extending/reducing casts too.
fn is_numberable(data: &InstructionData) -> bool {
    match data.opcode() {
        Opcode::Load | Opcode::Store | Opcode::Call => false,
        op if op.is_terminator() => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Signature, Type};

    #[test]
    fn merges_duplicate_expressions() {
        let module = Module::new("t");
        let mut func = Function::with_name_signature(
            "f",
            Signature::new(vec![Type::I32, Type::I32], vec![Type::I32]),
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            let block = b.create_block();
            let x = b.append_block_param(block, Type::I32);
            let y = b.append_block_param(block, Type::I32);
            b.switch_to_block(block);
            let a = b.iadd(x, y);
            let c = b.iadd(y, x); // commutative duplicate
            let d = b.iadd(a, c);
            b.ret(&[d]);
        }
        assert!(run(&module, &mut func, &OptLimits::default()));
        assert_eq!(func.instruction_count(), 3);
    }

    #[test]
    fn respects_dominance() {
        let module = Module::new("t");
        let mut func = Function::with_name_signature(
            "f",
            Signature::new(vec![Type::I32], vec![Type::I32]),
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            let entry = b.create_block();
            let x = b.append_block_param(entry, Type::I32);
            let left = b.create_block();
            let right = b.create_block();
            let join = b.create_block();
            let out = b.append_block_param(join, Type::I32);
            b.switch_to_block(entry);
            b.brif(x, left, &[], right, &[]);
            b.switch_to_block(left);
            let a = b.iadd(x, x);
            b.jump(join, &[a]);
            b.switch_to_block(right);
            let c = b.iadd(x, x);
            b.jump(join, &[c]);
            b.switch_to_block(join);
            b.ret(&[out]);
        }
        // Neither iadd dominates the other; nothing merges.
        assert!(!run(&module, &mut func, &OptLimits::default()));
        assert_eq!(func.instruction_count(), 6);
    }
}
