//! A dominator tree represented as mappings of blocks to their immediate
//! dominator, with a cached CFG post-order.

use core::cmp::Ordering;

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;

use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function, Inst, Layout};

#[derive(Clone, Default, PartialEq)]
struct DomNode {
    /// Number of this block in a reverse post-order traversal, starting
    /// from 1. Unreachable blocks get 0.
    rpo_number: u32,
    /// The immediate dominator, `None` for the entry and unreachable blocks.
    idom: PackedOption<Block>,
}

/// The dominator tree for a single function.
pub struct DominatorTree {
    nodes: SecondaryMap<Block, DomNode>,
    /// CFG post-order of all reachable blocks.
    postorder: Vec<Block>,
    valid: bool,
}

impl DominatorTree {
    pub fn new() -> Self {
        Self {
            nodes: SecondaryMap::new(),
            postorder: Vec::new(),
            valid: false,
        }
    }

    /// Allocate and compute a dominator tree.
    pub fn with_function(func: &Function, cfg: &ControlFlowGraph) -> Self {
        let mut domtree = Self::new();
        domtree.compute(func, cfg);
        domtree
    }

    /// Reset and compute the CFG post-order and dominator tree.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        debug_assert!(cfg.is_valid());
        self.clear();
        self.nodes.resize(func.dfg.blocks.len());
        self.compute_postorder(func, cfg);
        self.compute_domtree(cfg);
        self.valid = true;
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.postorder.clear();
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Is `block` reachable from the entry block?
    pub fn is_reachable(&self, block: Block) -> bool {
        self.nodes[block].rpo_number != 0
    }

    /// The CFG post-order used to compute this tree.
    pub fn cfg_postorder(&self) -> &[Block] {
        debug_assert!(self.is_valid());
        &self.postorder
    }

    /// The immediate dominator of `block`, or `None` for the entry block
    /// and unreachable blocks.
    pub fn idom(&self, block: Block) -> Option<Block> {
        self.nodes[block].idom.expand()
    }

    fn compute_postorder(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        const SEEN: u8 = 1;
        const DONE: u8 = 2;
        let Some(entry) = func.layout.entry_block() else {
            return;
        };
        let mut marks: SecondaryMap<Block, u8> = SecondaryMap::with_capacity(func.dfg.blocks.len());
        let mut stack = vec![entry];
        marks[entry] = SEEN;
        while let Some(block) = stack.pop() {
            if marks[block] == DONE {
                self.postorder.push(block);
                continue;
            }
            marks[block] = DONE;
            // Re-push the block, then its unseen successors; when it pops
            // again all successors have been emitted.
            stack.push(block);
            for succ in cfg.succ_iter(block) {
                if marks[succ] == 0 {
                    marks[succ] = SEEN;
                    stack.push(succ);
                }
            }
        }
        for (i, &block) in self.postorder.iter().rev().enumerate() {
            self.nodes[block].rpo_number = i as u32 + 1;
        }
    }

    /// The classic iterative algorithm of Cooper, Harvey and Kennedy over
    /// the reverse post-order.
    fn compute_domtree(&mut self, cfg: &ControlFlowGraph) {
        let rpo: Vec<Block> = self.postorder.iter().rev().copied().collect();
        let Some((&entry, body)) = rpo.split_first() else {
            return;
        };
        let mut changed = true;
        while changed {
            changed = false;
            for &block in body {
                let mut new_idom: Option<Block> = None;
                for pred in cfg.pred_iter(block) {
                    if !self.is_reachable(pred.block) {
                        continue;
                    }
                    // Only use predecessors that already have an idom (or
                    // are the entry).
                    if pred.block != entry && self.nodes[pred.block].idom.is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred.block,
                        Some(cur) => self.intersect(pred.block, cur),
                    });
                }
                if let Some(idom) = new_idom {
                    if self.nodes[block].idom.expand() != Some(idom) {
                        self.nodes[block].idom = Some(idom).into();
                        changed = true;
                    }
                }
            }
        }
    }

    fn intersect(&self, mut a: Block, mut b: Block) -> Block {
        while a != b {
            while self.nodes[a].rpo_number > self.nodes[b].rpo_number {
                a = self.nodes[a].idom.expand().expect("entry reached");
            }
            while self.nodes[b].rpo_number > self.nodes[a].rpo_number {
                b = self.nodes[b].idom.expand().expect("entry reached");
            }
        }
        a
    }

    /// Does `a` dominate `b` (blocks)? A block dominates itself.
    pub fn block_dominates(&self, a: Block, b: Block) -> bool {
        let rpo_a = self.nodes[a].rpo_number;
        if rpo_a == 0 || self.nodes[b].rpo_number == 0 {
            return false;
        }
        let mut b = b;
        while self.nodes[b].rpo_number > rpo_a {
            match self.nodes[b].idom.expand() {
                Some(idom) => b = idom,
                None => return false,
            }
        }
        a == b
    }

    /// Does instruction `a` dominate instruction `b`? An instruction
    /// dominates itself.
    pub fn dominates(&self, a: Inst, b: Inst, layout: &Layout) -> bool {
        let block_a = layout.inst_block(a).expect("a not placed");
        let block_b = layout.inst_block(b).expect("b not placed");
        if block_a == block_b {
            layout.pp_cmp(a, b) != Ordering::Greater
        } else {
            self.block_dominates(block_a, block_b) && block_a != block_b
        }
    }

    /// Does the definition point of `value` dominate instruction `inst`?
    pub fn value_dominates(&self, func: &Function, value: crate::ir::Value, inst: Inst) -> bool {
        match func.dfg.value_def(func.dfg.resolve_aliases(value)) {
            crate::ir::ValueDef::Result(def, _) => {
                def != inst && self.dominates(def, inst, &func.layout)
            }
            crate::ir::ValueDef::Param(block, _) => {
                let inst_block = func.layout.inst_block(inst).expect("inst not placed");
                self.block_dominates(block, inst_block)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Signature, Type};

    #[test]
    fn diamond() {
        let mut func = Function::with_name_signature("f", Signature::default());
        let mut b = FunctionBuilder::new(&mut func);
        let entry = b.create_block();
        let c = b.append_block_param(entry, Type::I32);
        let left = b.create_block();
        let right = b.create_block();
        let join = b.create_block();

        b.switch_to_block(entry);
        b.brif(c, left, &[], right, &[]);
        b.switch_to_block(left);
        b.jump(join, &[]);
        b.switch_to_block(right);
        b.jump(join, &[]);
        b.switch_to_block(join);
        b.ret(&[]);

        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);

        assert_eq!(domtree.idom(entry), None);
        assert_eq!(domtree.idom(left), Some(entry));
        assert_eq!(domtree.idom(right), Some(entry));
        assert_eq!(domtree.idom(join), Some(entry));
        assert!(domtree.block_dominates(entry, join));
        assert!(!domtree.block_dominates(left, join));
        assert_eq!(domtree.cfg_postorder().len(), 4);
    }
}
