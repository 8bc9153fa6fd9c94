//! A control flow graph: mappings of basic blocks to predecessors and
//! successors.

use cranelift_entity::SecondaryMap;

use crate::ir::{Block, Function, Inst, InstructionData};

/// A basic block denoted by its enclosing block and terminating instruction.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct BlockPredecessor {
    /// Enclosing block.
    pub block: Block,
    /// The branch instruction that transfers control here.
    pub inst: Inst,
}

impl BlockPredecessor {
    pub fn new(block: Block, inst: Inst) -> Self {
        Self { block, inst }
    }
}

#[derive(Clone, Default, PartialEq)]
struct CFGNode {
    predecessors: Vec<BlockPredecessor>,
    successors: Vec<Block>,
}

/// The control flow graph of a function.
pub struct ControlFlowGraph {
    data: SecondaryMap<Block, CFGNode>,
    valid: bool,
}

impl ControlFlowGraph {
    pub fn new() -> Self {
        Self {
            data: SecondaryMap::new(),
            valid: false,
        }
    }

    /// Allocate and compute the control flow graph for `func`.
    pub fn with_function(func: &Function) -> Self {
        let mut cfg = Self::new();
        cfg.compute(func);
        cfg
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.valid = false;
    }

    /// Compute the control flow graph of `func`, clearing any previous
    /// contents.
    pub fn compute(&mut self, func: &Function) {
        self.clear();
        self.data.resize(func.dfg.blocks.len());
        for block in func.layout.blocks() {
            self.compute_block(func, block);
        }
        self.valid = true;
    }

    fn compute_block(&mut self, func: &Function, block: Block) {
        let Some(term) = func.layout.last_inst(block) else {
            return;
        };
        for succ in branch_targets(func, term) {
            self.add_edge(block, term, succ);
        }
    }

    fn add_edge(&mut self, from: Block, from_inst: Inst, to: Block) {
        if !self.data[from].successors.contains(&to) {
            self.data[from].successors.push(to);
        }
        let pred = BlockPredecessor::new(from, from_inst);
        if !self.data[to].predecessors.contains(&pred) {
            self.data[to].predecessors.push(pred);
        }
    }

    /// The predecessors of `block`.
    pub fn pred_iter(&self, block: Block) -> impl Iterator<Item = BlockPredecessor> + '_ {
        debug_assert!(self.is_valid());
        self.data[block].predecessors.iter().copied()
    }

    /// The successors of `block`, deduplicated.
    pub fn succ_iter(&self, block: Block) -> impl Iterator<Item = Block> + '_ {
        debug_assert!(self.is_valid());
        self.data[block].successors.iter().copied()
    }

    pub fn num_predecessors(&self, block: Block) -> usize {
        self.data[block].predecessors.len()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// The distinct branch targets of `inst`, in branch order.
pub fn branch_targets(func: &Function, inst: Inst) -> Vec<Block> {
    let pool = &func.dfg.value_lists;
    let data = &func.dfg.insts[inst];
    let mut out = Vec::new();
    for call in data.branch_destinations() {
        out.push(call.block(pool));
    }
    if let InstructionData::BranchTable { table, .. } = *data {
        for call in func.dfg.jump_tables[table].all_branches() {
            out.push(call.block(pool));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Signature, Type};

    #[test]
    fn branches_and_jumps() {
        let mut func = Function::with_name_signature("f", Signature::default());
        let mut b = FunctionBuilder::new(&mut func);
        let block0 = b.create_block();
        let cond = b.append_block_param(block0, Type::I32);
        let block1 = b.create_block();
        let block2 = b.create_block();

        b.switch_to_block(block0);
        b.brif(cond, block2, &[], block1, &[]);
        b.switch_to_block(block1);
        b.jump(block2, &[]);
        b.switch_to_block(block2);
        b.ret(&[]);

        let cfg = ControlFlowGraph::with_function(&func);
        assert_eq!(cfg.pred_iter(block0).count(), 0);
        assert_eq!(cfg.pred_iter(block1).count(), 1);
        assert_eq!(cfg.pred_iter(block2).count(), 2);
        let s0: Vec<_> = cfg.succ_iter(block0).collect();
        assert!(s0.contains(&block1) && s0.contains(&block2));
    }
}
