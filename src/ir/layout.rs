//! Layout of blocks and instructions.
//!
//! The `Layout` records which blocks are in the function, in which order,
//! and which instructions each block contains. The data flow graph knows
//! nothing about program order; every pass that cares about it goes through
//! here.

use core::cmp::Ordering;

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;

use super::entities::{Block, Inst};

#[derive(Clone, PartialEq, Default)]
struct BlockNode {
    insts: Vec<Inst>,
    in_layout: bool,
}

/// Block order and per-block instruction sequences.
#[derive(Clone, PartialEq)]
pub struct Layout {
    /// Blocks in layout order. The first block is the entry block.
    order: Vec<Block>,
    nodes: SecondaryMap<Block, BlockNode>,
    inst_block: SecondaryMap<Inst, PackedOption<Block>>,
}

impl Default for Layout {
    fn default() -> Self {
        Self::new()
    }
}

impl Layout {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            nodes: SecondaryMap::new(),
            inst_block: SecondaryMap::new(),
        }
    }

    /// The entry block, or `None` for a function with no body (a
    /// declaration).
    pub fn entry_block(&self) -> Option<Block> {
        self.order.first().copied()
    }

    /// Iterate over the blocks in layout order.
    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.order.iter().copied()
    }

    /// A snapshot of the block order, for passes that mutate the layout
    /// while walking it.
    pub fn block_order(&self) -> Vec<Block> {
        self.order.clone()
    }

    /// Number of blocks in the layout.
    pub fn num_blocks(&self) -> usize {
        self.order.len()
    }

    /// Is `block` currently placed in the layout?
    pub fn is_block_inserted(&self, block: Block) -> bool {
        self.nodes[block].in_layout
    }

    /// Append `block` to the end of the layout.
    pub fn append_block(&mut self, block: Block) {
        debug_assert!(!self.is_block_inserted(block));
        self.nodes[block].in_layout = true;
        self.order.push(block);
    }

    /// Insert `block` immediately after `after`.
    pub fn insert_block_after(&mut self, block: Block, after: Block) {
        debug_assert!(!self.is_block_inserted(block));
        let pos = self.block_pos(after) + 1;
        self.nodes[block].in_layout = true;
        self.order.insert(pos, block);
    }

    /// Remove `block` from the layout. The block must be empty.
    pub fn remove_block(&mut self, block: Block) {
        debug_assert!(self.nodes[block].insts.is_empty(), "removing non-empty block");
        let pos = self.block_pos(block);
        self.order.remove(pos);
        self.nodes[block].in_layout = false;
    }

    fn block_pos(&self, block: Block) -> usize {
        self.order
            .iter()
            .position(|&b| b == block)
            .expect("block not in layout")
    }

    /// The instructions of `block`, in order.
    pub fn block_insts(&self, block: Block) -> &[Inst] {
        &self.nodes[block].insts
    }

    /// The first instruction of `block`.
    pub fn first_inst(&self, block: Block) -> Option<Inst> {
        self.nodes[block].insts.first().copied()
    }

    /// The last instruction of `block` — its terminator, once the block is
    /// complete.
    pub fn last_inst(&self, block: Block) -> Option<Inst> {
        self.nodes[block].insts.last().copied()
    }

    /// The block containing `inst`, if it is placed.
    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self.inst_block[inst].expand()
    }

    /// Append `inst` to the end of `block`.
    pub fn append_inst(&mut self, inst: Inst, block: Block) {
        debug_assert!(self.inst_block(inst).is_none(), "inst already placed");
        self.nodes[block].insts.push(inst);
        self.inst_block[inst] = Some(block).into();
    }

    /// Insert `inst` immediately before `before` in the latter's block.
    pub fn insert_inst_before(&mut self, inst: Inst, before: Inst) {
        debug_assert!(self.inst_block(inst).is_none(), "inst already placed");
        let block = self.inst_block(before).expect("before not placed");
        let pos = self.inst_pos(block, before);
        self.nodes[block].insts.insert(pos, inst);
        self.inst_block[inst] = Some(block).into();
    }

    /// Insert `inst` immediately after `after` in the latter's block.
    pub fn insert_inst_after(&mut self, inst: Inst, after: Inst) {
        debug_assert!(self.inst_block(inst).is_none(), "inst already placed");
        let block = self.inst_block(after).expect("after not placed");
        let pos = self.inst_pos(block, after);
        self.nodes[block].insts.insert(pos + 1, inst);
        self.inst_block[inst] = Some(block).into();
    }

    /// Remove `inst` from the layout. The instruction itself stays in the
    /// data flow graph and can be re-inserted.
    pub fn remove_inst(&mut self, inst: Inst) {
        let block = self.inst_block(inst).expect("inst not placed");
        let pos = self.inst_pos(block, inst);
        self.nodes[block].insts.remove(pos);
        self.inst_block[inst] = None.into();
    }

    fn inst_pos(&self, block: Block, inst: Inst) -> usize {
        self.nodes[block]
            .insts
            .iter()
            .position(|&i| i == inst)
            .expect("inst not in its block")
    }

    /// Split `block` before `before`: all instructions from `before` to the
    /// end of the block are moved to `new_block`, which is inserted right
    /// after `block` in the layout.
    pub fn split_block(&mut self, new_block: Block, before: Inst) {
        let old_block = self.inst_block(before).expect("split point not placed");
        let pos = self.inst_pos(old_block, before);
        let tail: Vec<Inst> = self.nodes[old_block].insts.split_off(pos);
        for &inst in &tail {
            self.inst_block[inst] = Some(new_block).into();
        }
        self.insert_block_after(new_block, old_block);
        self.nodes[new_block].insts = tail;
    }

    /// Compare the program order of two instructions in the same block.
    pub fn pp_cmp(&self, a: Inst, b: Inst) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        let block = self.inst_block(a).expect("a not placed");
        debug_assert_eq!(Some(block), self.inst_block(b), "pp_cmp across blocks");
        for &inst in &self.nodes[block].insts {
            if inst == a {
                return Ordering::Less;
            }
            if inst == b {
                return Ordering::Greater;
            }
        }
        unreachable!("instructions not found in their block");
    }

    /// Total number of placed instructions. This is the "instruction count"
    /// that the convergence loop measures.
    pub fn num_insts(&self) -> usize {
        self.order.iter().map(|&b| self.nodes[b].insts.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    fn b(n: usize) -> Block {
        Block::new(n)
    }

    fn i(n: usize) -> Inst {
        Inst::new(n)
    }

    #[test]
    fn append_and_split() {
        let mut layout = Layout::new();
        layout.append_block(b(0));
        layout.append_inst(i(0), b(0));
        layout.append_inst(i(1), b(0));
        layout.append_inst(i(2), b(0));
        assert_eq!(layout.num_insts(), 3);

        layout.split_block(b(1), i(1));
        assert_eq!(layout.block_insts(b(0)), &[i(0)]);
        assert_eq!(layout.block_insts(b(1)), &[i(1), i(2)]);
        assert_eq!(layout.inst_block(i(2)), Some(b(1)));
        assert_eq!(layout.block_order(), vec![b(0), b(1)]);
    }

    #[test]
    fn remove_and_reinsert() {
        let mut layout = Layout::new();
        layout.append_block(b(0));
        layout.append_inst(i(0), b(0));
        layout.append_inst(i(1), b(0));
        layout.remove_inst(i(0));
        assert_eq!(layout.block_insts(b(0)), &[i(1)]);
        layout.insert_inst_before(i(0), i(1));
        assert_eq!(layout.block_insts(b(0)), &[i(0), i(1)]);
    }

    #[test]
    fn program_order() {
        let mut layout = Layout::new();
        layout.append_block(b(0));
        layout.append_inst(i(0), b(0));
        layout.append_inst(i(1), b(0));
        assert_eq!(layout.pp_cmp(i(0), i(1)), Ordering::Less);
        assert_eq!(layout.pp_cmp(i(1), i(0)), Ordering::Greater);
        assert_eq!(layout.pp_cmp(i(1), i(1)), Ordering::Equal);
    }
}
