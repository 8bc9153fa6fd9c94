//! Control-flow simplification.
//!
//! Folds branches on constants, removes unreachable blocks, merges blocks
//! into their single predecessor, and forwards branches through empty
//! blocks. Runs at both ends of the custom schedule: early to strip the
//! guards that the runtime's constant predicates fold away, late to clean
//! up what the other passes expose.

use rustc_hash::FxHashSet;

use crate::flowgraph::ControlFlowGraph;
use crate::ir::{
    Block, BlockCall, Function, Inst, InstructionData, Module, Opcode, Value,
};
use crate::opt::{iconst_value, OptLimits};

pub fn run(module: &Module, func: &mut Function, _limits: &OptLimits) -> bool {
    let _ = module;
    let mut changed = false;
    loop {
        let mut local = false;
        local |= fold_constant_branches(func);
        local |= remove_unreachable_blocks(func);
        local |= forward_empty_blocks(func);
        local |= merge_single_predecessors(func);
        if !local {
            break;
        }
        changed = true;
    }
    changed
}

/// `brif` on a constant becomes a jump; so does `br_table` on a constant
/// index, and a `brif` whose arms are the same edge.
fn fold_constant_branches(func: &mut Function) -> bool {
    let mut changed = false;
    for block in func.layout.block_order() {
        let Some(term) = func.layout.last_inst(block) else {
            continue;
        };
        match func.dfg.insts[term] {
            InstructionData::Brif { arg, blocks, .. } => {
                let taken = match iconst_value(func, arg) {
                    Some((_, c)) => Some(if c != 0 { blocks[0] } else { blocks[1] }),
                    None => {
                        let pool = &func.dfg.value_lists;
                        let same_block = blocks[0].block(pool) == blocks[1].block(pool);
                        let same_args = blocks[0].args_slice(pool) == blocks[1].args_slice(pool);
                        (same_block && same_args).then_some(blocks[0])
                    }
                };
                if let Some(dest) = taken {
                    func.dfg.replace(
                        term,
                        InstructionData::Jump {
                            opcode: Opcode::Jump,
                            destination: dest,
                        },
                    );
                    changed = true;
                }
            }
            InstructionData::BranchTable { arg, table, .. } => {
                if let Some((_, index)) = iconst_value(func, arg) {
                    let jt = &func.dfg.jump_tables[table];
                    let dest = jt
                        .as_slice()
                        .get(index as usize)
                        .copied()
                        .unwrap_or_else(|| jt.default_block());
                    func.dfg.replace(
                        term,
                        InstructionData::Jump {
                            opcode: Opcode::Jump,
                            destination: dest,
                        },
                    );
                    changed = true;
                }
            }
            _ => {}
        }
    }
    changed
}

fn remove_unreachable_blocks(func: &mut Function) -> bool {
    let Some(entry) = func.layout.entry_block() else {
        return false;
    };
    let cfg = ControlFlowGraph::with_function(func);
    let mut reachable: FxHashSet<Block> = FxHashSet::default();
    let mut stack = vec![entry];
    reachable.insert(entry);
    while let Some(block) = stack.pop() {
        for succ in cfg.succ_iter(block) {
            if reachable.insert(succ) {
                stack.push(succ);
            }
        }
    }
    let mut changed = false;
    for block in func.layout.block_order() {
        if reachable.contains(&block) {
            continue;
        }
        for inst in func.layout.block_insts(block).to_vec() {
            func.layout.remove_inst(inst);
        }
        func.layout.remove_block(block);
        changed = true;
    }
    changed
}

/// Replace branches to a block that contains nothing but a `jump` with a
/// branch to the jump's destination, substituting block parameters.
fn forward_empty_blocks(func: &mut Function) -> bool {
    let mut changed = false;
    let entry = func.layout.entry_block();
    for block in func.layout.block_order() {
        if Some(block) == entry {
            continue;
        }
        if func.layout.block_insts(block).len() != 1 {
            continue;
        }
        let jump = func.layout.first_inst(block).unwrap();
        let InstructionData::Jump { destination, .. } = func.dfg.insts[jump] else {
            continue;
        };
        let target = destination.block(&func.dfg.value_lists);
        if target == block {
            continue;
        }
        // Never forward into another trivial jump block: a reachable cycle
        // of empty blocks would keep threading forever.
        if func.layout.block_insts(target).len() == 1 {
            if let InstructionData::Jump { .. } = func.dfg.insts[func.layout.first_inst(target).unwrap()] {
                continue;
            }
        }
        // Snapshot the forwarded jump: destination args, with this block's
        // parameters replaced positionally at each predecessor.
        let params: Vec<Value> = func.dfg.block_params(block).to_vec();
        let jump_args: Vec<Value> = destination
            .args_slice(&func.dfg.value_lists)
            .iter()
            .map(|&v| func.dfg.resolve_aliases(v))
            .collect();

        let cfg = ControlFlowGraph::with_function(func);
        let preds: Vec<Inst> = cfg.pred_iter(block).map(|p| p.inst).collect();
        for pred_inst in preds {
            rewrite_branch_through(func, pred_inst, block, target, &params, &jump_args);
            changed = true;
        }
    }
    changed
}

/// Rewrite every edge of `pred_inst` that targets `through` so it targets
/// `target` instead, with `jump_args` (parameters of `through` substituted
/// by the edge's own arguments).
fn rewrite_branch_through(
    func: &mut Function,
    pred_inst: Inst,
    through: Block,
    target: Block,
    params: &[Value],
    jump_args: &[Value],
) {
    let substitute = |func: &mut Function, call: BlockCall| -> BlockCall {
        let edge_args: Vec<Value> = call
            .args_slice(&func.dfg.value_lists)
            .iter()
            .map(|&v| func.dfg.resolve_aliases(v))
            .collect();
        let new_args: Vec<Value> = jump_args
            .iter()
            .map(|&arg| match params.iter().position(|&p| p == arg) {
                Some(i) => edge_args[i],
                None => arg,
            })
            .collect();
        BlockCall::new(target, &new_args, &mut func.dfg.value_lists)
    };

    let mut data = func.dfg.insts[pred_inst];
    let mut rewritten = false;
    for i in 0..data.branch_destinations().len() {
        let call = data.branch_destinations()[i];
        if call.block(&func.dfg.value_lists) == through {
            let new_call = substitute(func, call);
            data.branch_destinations_mut()[i] = new_call;
            rewritten = true;
        }
    }
    if rewritten {
        func.dfg.insts[pred_inst] = data;
    }
    if let InstructionData::BranchTable { table, .. } = func.dfg.insts[pred_inst] {
        let mut jt = func.dfg.jump_tables[table].clone();
        let mut any = false;
        for call in jt.all_branches_mut() {
            if call.block(&func.dfg.value_lists) == through {
                *call = substitute_jt(func, *call, target, params, jump_args);
                any = true;
            }
        }
        if any {
            func.dfg.jump_tables[table] = jt;
        }
    }
}

fn substitute_jt(
    func: &mut Function,
    call: BlockCall,
    target: Block,
    params: &[Value],
    jump_args: &[Value],
) -> BlockCall {
    let edge_args: Vec<Value> = call
        .args_slice(&func.dfg.value_lists)
        .iter()
        .map(|&v| func.dfg.resolve_aliases(v))
        .collect();
    let new_args: Vec<Value> = jump_args
        .iter()
        .map(|&arg| match params.iter().position(|&p| p == arg) {
            Some(i) => edge_args[i],
            None => arg,
        })
        .collect();
    BlockCall::new(target, &new_args, &mut func.dfg.value_lists)
}

/// Merge a block into its unique predecessor when the predecessor ends in
/// an unconditional jump to it.
fn merge_single_predecessors(func: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let cfg = ControlFlowGraph::with_function(func);
        let entry = func.layout.entry_block();
        let mut merged = false;
        for block in func.layout.block_order() {
            if Some(block) == entry {
                continue;
            }
            let preds: Vec<_> = cfg.pred_iter(block).collect();
            if preds.len() != 1 {
                continue;
            }
            let pred = preds[0];
            if pred.block == block {
                continue;
            }
            let InstructionData::Jump { destination, .. } = func.dfg.insts[pred.inst] else {
                continue;
            };
            debug_assert_eq!(destination.block(&func.dfg.value_lists), block);
            // Parameters become the jump's arguments.
            let args: Vec<Value> = destination
                .args_slice(&func.dfg.value_lists)
                .iter()
                .map(|&v| func.dfg.resolve_aliases(v))
                .collect();
            let params: Vec<Value> = func.dfg.block_params(block).to_vec();
            debug_assert_eq!(args.len(), params.len());
            for (&param, &arg) in params.iter().zip(args.iter()) {
                func.dfg.change_to_alias(param, arg);
            }
            func.layout.remove_inst(pred.inst);
            for inst in func.layout.block_insts(block).to_vec() {
                func.layout.remove_inst(inst);
                func.layout.append_inst(inst, pred.block);
            }
            func.layout.remove_block(block);
            merged = true;
            changed = true;
            break;
        }
        if !merged {
            break;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Signature, Type};

    fn new_func() -> (Module, Function) {
        let module = Module::new("t");
        let func = Function::with_name_signature(
            "f",
            Signature::new(vec![Type::I32], vec![Type::I32]),
        );
        (module, func)
    }

    #[test]
    fn folds_constant_brif_and_prunes() {
        let (module, mut func) = new_func();
        {
            let mut b = FunctionBuilder::new(&mut func);
            let entry = b.create_block();
            let x = b.append_block_param(entry, Type::I32);
            let then_block = b.create_block();
            let else_block = b.create_block();
            b.switch_to_block(entry);
            let c = b.iconst(Type::I8, 1);
            b.brif(c, then_block, &[], else_block, &[]);
            b.switch_to_block(then_block);
            b.ret(&[x]);
            b.switch_to_block(else_block);
            let z = b.iconst(Type::I32, 0);
            b.ret(&[z]);
        }
        assert!(run(&module, &mut func, &OptLimits::default()));
        // else_block is unreachable and then_block merges into the entry.
        assert_eq!(func.layout.num_blocks(), 1);
        let entry = func.layout.entry_block().unwrap();
        let term = func.layout.last_inst(entry).unwrap();
        assert_eq!(func.dfg.insts[term].opcode(), Opcode::Return);
    }

    #[test]
    fn forwards_through_empty_block() {
        let (module, mut func) = new_func();
        {
            let mut b = FunctionBuilder::new(&mut func);
            let entry = b.create_block();
            let x = b.append_block_param(entry, Type::I32);
            let hop = b.create_block();
            let hop_param = b.append_block_param(hop, Type::I32);
            let exit = b.create_block();
            let exit_param = b.append_block_param(exit, Type::I32);
            b.switch_to_block(entry);
            b.jump(hop, &[x]);
            b.switch_to_block(hop);
            b.jump(exit, &[hop_param]);
            b.switch_to_block(exit);
            b.ret(&[exit_param]);
        }
        assert!(run(&module, &mut func, &OptLimits::default()));
        assert_eq!(func.layout.num_blocks(), 1);
    }
}
