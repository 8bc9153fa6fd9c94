//! Dead-code elimination.
//!
//! Dead code here means instructions that have no side effects and no
//! result values used by other instructions. One backward sweep over the
//! CFG post-order; the convergence loop around the pipeline takes care of
//! anything a single sweep misses.

use cranelift_entity::EntityRef;

use crate::dominator_tree::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::inst_predicates::{any_inst_results_used, has_side_effect, is_removable_if_unused};
use crate::ir::{Function, Module};
use crate::opt::OptLimits;

pub fn run(module: &Module, func: &mut Function, _limits: &OptLimits) -> bool {
    let cfg = ControlFlowGraph::with_function(func);
    let domtree = DominatorTree::with_function(func, &cfg);

    let mut changed = false;
    let mut live = vec![false; func.dfg.num_values()];
    for &block in domtree.cfg_postorder() {
        for inst in func.layout.block_insts(block).to_vec().into_iter().rev() {
            let keep = if has_side_effect(module, func, inst) {
                true
            } else if any_inst_results_used(func, inst, &live) {
                true
            } else {
                !is_removable_if_unused(module, func, inst)
            };
            if keep {
                for value in func.dfg.inst_values(inst) {
                    let v = func.dfg.resolve_aliases(value);
                    live[v.index()] = true;
                }
            } else {
                func.layout.remove_inst(inst);
                changed = true;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Signature, Type};

    #[test]
    fn removes_unused_pure_chain() {
        let mut module = Module::new("t");
        let mut func = Function::with_name_signature(
            "f",
            Signature::new(vec![Type::I32], vec![Type::I32]),
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            let block = b.create_block();
            let x = b.append_block_param(block, Type::I32);
            b.switch_to_block(block);
            let dead1 = b.iconst(Type::I32, 5);
            let _dead2 = b.iadd(dead1, dead1);
            b.ret(&[x]);
        }
        let f = module.declare_function(func);
        let mut func = module.take_function(f);
        assert_eq!(func.instruction_count(), 3);
        assert!(run(&module, &mut func, &OptLimits::default()));
        assert_eq!(func.instruction_count(), 1);
    }

    #[test]
    fn keeps_stores_and_used_values() {
        let mut module = Module::new("t");
        let mut func =
            Function::with_name_signature("f", Signature::new(vec![], vec![Type::I32]));
        {
            let mut b = FunctionBuilder::new(&mut func);
            let slot = b.func.create_stack_slot(crate::ir::StackSlotData::new(8));
            let block = b.create_block();
            b.switch_to_block(block);
            let addr = b.stack_addr(slot, 0);
            let v = b.iconst(Type::I32, 9);
            b.store(Type::I32, v, addr, 0);
            let loaded = b.load(Type::I32, addr, 0);
            b.ret(&[loaded]);
        }
        let f = module.declare_function(func);
        let mut func = module.take_function(f);
        assert!(!run(&module, &mut func, &OptLimits::default()));
        assert_eq!(func.instruction_count(), 5);
    }
}
