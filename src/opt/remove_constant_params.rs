//! Removal of constant block parameters.
//!
//! A block parameter whose incoming arguments all resolve to one value
//! (ignoring self-references through back edges) is redundant: uses are
//! redirected to that value and the argument is dropped from every
//! predecessor edge. Scalar replacement leaves a trail of these at join
//! points, and branch folding exposes more.

use rustc_hash::FxHashSet;

use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function, InstructionData, Module, Value};
use crate::opt::OptLimits;

pub fn run(module: &Module, func: &mut Function, _limits: &OptLimits) -> bool {
    let _ = module;
    let mut changed = false;
    loop {
        let mut local = false;
        let cfg = ControlFlowGraph::with_function(func);
        let entry = func.layout.entry_block();
        for block in func.layout.block_order() {
            // Entry parameters are the function's signature; never touch
            // them.
            if Some(block) == entry {
                continue;
            }
            if try_remove_one(func, &cfg, block) {
                local = true;
                break;
            }
        }
        if !local {
            break;
        }
        changed = true;
    }
    changed
}

/// Remove the first removable parameter of `block`, if any.
fn try_remove_one(func: &mut Function, cfg: &ControlFlowGraph, block: Block) -> bool {
    let params: Vec<Value> = func.dfg.block_params(block).to_vec();
    for (index, &param) in params.iter().enumerate() {
        let mut incoming: FxHashSet<Value> = FxHashSet::default();
        for pred in cfg.pred_iter(block) {
            for call in branch_calls_to(func, pred.inst, block) {
                let args = call.args_slice(&func.dfg.value_lists);
                let Some(&arg) = args.get(index) else {
                    return false;
                };
                incoming.insert(func.dfg.resolve_aliases(arg));
            }
        }
        incoming.remove(&param);
        if incoming.len() != 1 {
            continue;
        }
        let replacement = *incoming.iter().next().unwrap();
        // Drop the argument from every predecessor edge, then the
        // parameter itself, then redirect its uses.
        let preds: Vec<_> = cfg.pred_iter(block).collect();
        for pred in preds {
            remove_branch_arg(func, pred.inst, block, index);
        }
        func.dfg.remove_block_param(block, index);
        func.dfg.change_to_alias(param, replacement);
        return true;
    }
    false
}

fn branch_calls_to(
    func: &Function,
    pred_inst: crate::ir::Inst,
    target: Block,
) -> Vec<crate::ir::BlockCall> {
    let pool = &func.dfg.value_lists;
    let data = &func.dfg.insts[pred_inst];
    let mut out = Vec::new();
    for &call in data.branch_destinations() {
        if call.block(pool) == target {
            out.push(call);
        }
    }
    if let InstructionData::BranchTable { table, .. } = *data {
        for &call in func.dfg.jump_tables[table].all_branches().collect::<Vec<_>>() {
            if call.block(pool) == target {
                out.push(call);
            }
        }
    }
    out
}

fn remove_branch_arg(func: &mut Function, pred_inst: crate::ir::Inst, target: Block, index: usize) {
    let mut data = func.dfg.insts[pred_inst];
    let mut rewritten = false;
    for call in data.branch_destinations_mut() {
        if call.block(&func.dfg.value_lists) == target {
            call.remove_arg(index, &mut func.dfg.value_lists);
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
            if call.block(&func.dfg.value_lists) == target {
                call.remove_arg(index, &mut func.dfg.value_lists);
                any = true;
            }
        }
        if any {
            func.dfg.jump_tables[table] = jt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Signature, Type};

    #[test]
    fn constant_parameter_collapses() {
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
            let p = b.append_block_param(join, Type::I32);
            b.switch_to_block(entry);
            b.brif(x, left, &[], right, &[]);
            b.switch_to_block(left);
            b.jump(join, &[x]);
            b.switch_to_block(right);
            b.jump(join, &[x]);
            b.switch_to_block(join);
            b.ret(&[p]);
        }
        assert!(run(&module, &mut func, &OptLimits::default()));
        let join = func.layout.block_order()[3];
        assert_eq!(func.dfg.num_block_params(join), 0);
        let ret = func.layout.last_inst(join).unwrap();
        let arg = func.dfg.resolve_aliases(func.dfg.inst_args(ret)[0]);
        let entry = func.layout.entry_block().unwrap();
        assert_eq!(arg, func.dfg.block_params(entry)[0]);
    }

    #[test]
    fn diverging_arguments_stay() {
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
            let p = b.append_block_param(join, Type::I32);
            b.switch_to_block(entry);
            b.brif(x, left, &[], right, &[]);
            b.switch_to_block(left);
            let one = b.iconst(Type::I32, 1);
            b.jump(join, &[one]);
            b.switch_to_block(right);
            let two = b.iconst(Type::I32, 2);
            b.jump(join, &[two]);
            b.switch_to_block(join);
            b.ret(&[p]);
        }
        assert!(!run(&module, &mut func, &OptLimits::default()));
    }
}
