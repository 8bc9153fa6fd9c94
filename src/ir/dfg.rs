//! Data flow graph tracking instructions, blocks and values.

use cranelift_entity::{PrimaryMap, SecondaryMap};
use smallvec::SmallVec;

use super::entities::{Block, Inst, JumpTable, Value};
use super::instructions::{InstructionData, JumpTableData, ValueList, ValueListPool};
use super::types::Type;

/// Where a value comes from.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ValueDef {
    /// The value is the `num`'th result of an instruction.
    Result(Inst, usize),
    /// The value is the `num`'th parameter of a block.
    Param(Block, usize),
}

#[derive(Clone, PartialEq, Debug)]
enum ValueData {
    Inst { ty: Type, inst: Inst, num: u16 },
    Param { ty: Type, block: Block, num: u16 },
    /// A value that has been redirected to another value. Aliases are
    /// resolved lazily by the passes and rewritten out of instruction
    /// operands by `resolve_inst_aliases`.
    Alias { ty: Type, original: Value },
}

/// Contents of a basic block: its parameter values.
///
/// The instructions in a block are recorded by the `Layout`.
#[derive(Clone, PartialEq, Default, Debug)]
pub struct BlockData {
    params: ValueList,
}

/// A data flow graph defines all instructions, blocks and values in a
/// function as well as the data dependencies between them. Program order is
/// the `Layout`'s business.
#[derive(Clone, PartialEq)]
pub struct DataFlowGraph {
    /// Data about all of the instructions in the function.
    pub insts: PrimaryMap<Inst, InstructionData>,

    /// List of result values for each instruction.
    results: SecondaryMap<Inst, ValueList>,

    /// Basic blocks and their parameters.
    pub blocks: PrimaryMap<Block, BlockData>,

    /// Memory pool for value lists (operands, results, block parameters,
    /// block-call arguments).
    pub value_lists: ValueListPool,

    /// Primary value table.
    values: PrimaryMap<Value, ValueData>,

    /// Jump tables used by `br_table` instructions.
    pub jump_tables: PrimaryMap<JumpTable, JumpTableData>,
}

impl Default for DataFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DataFlowGraph {
    pub fn new() -> Self {
        Self {
            insts: PrimaryMap::new(),
            results: SecondaryMap::new(),
            blocks: PrimaryMap::new(),
            value_lists: ValueListPool::new(),
            values: PrimaryMap::new(),
            jump_tables: PrimaryMap::new(),
        }
    }

    /// Total number of instructions ever created, placed or not.
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    /// Total number of values.
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Create a new instruction from `data`. The instruction is not placed
    /// in the layout and has no result values yet.
    pub fn make_inst(&mut self, data: InstructionData) -> Inst {
        let inst = self.insts.push(data);
        self.results.resize(self.insts.len());
        inst
    }

    /// Create result values for `inst` with the given types.
    pub fn make_inst_results(&mut self, inst: Inst, types: &[Type]) -> SmallVec<[Value; 2]> {
        debug_assert!(self.results[inst].is_empty(), "inst already has results");
        let mut out = SmallVec::new();
        for (num, &ty) in types.iter().enumerate() {
            let value = self.values.push(ValueData::Inst {
                ty,
                inst,
                num: num as u16,
            });
            self.results[inst].push(value, &mut self.value_lists);
            out.push(value);
        }
        out
    }

    /// The result values of `inst`.
    pub fn inst_results(&self, inst: Inst) -> &[Value] {
        self.results[inst].as_slice(&self.value_lists)
    }

    /// The single result of `inst`, if it has exactly one.
    pub fn first_result(&self, inst: Inst) -> Option<Value> {
        self.inst_results(inst).first().copied()
    }

    /// Detach the results of `inst` so they can be reattached elsewhere
    /// (e.g. turned into aliases of block parameters).
    pub fn detach_inst_results(&mut self, inst: Inst) {
        self.results[inst] = ValueList::default();
    }

    /// Clear the instruction so a replacement can be built in its place.
    pub fn clear_results(&mut self, inst: Inst) {
        self.detach_inst_results(inst);
    }

    /// The fixed arguments of `inst` (no branch arguments).
    pub fn inst_args(&self, inst: Inst) -> &[Value] {
        self.insts[inst].arguments(&self.value_lists)
    }

    /// Create a new basic block with no parameters.
    pub fn make_block(&mut self) -> Block {
        self.blocks.push(BlockData::default())
    }

    /// Append a parameter of type `ty` to `block`, returning its value.
    pub fn append_block_param(&mut self, block: Block, ty: Type) -> Value {
        let num = self.blocks[block].params.len(&self.value_lists) as u16;
        let value = self.values.push(ValueData::Param { ty, block, num });
        self.blocks[block].params.push(value, &mut self.value_lists);
        value
    }

    /// The parameters of `block`.
    pub fn block_params(&self, block: Block) -> &[Value] {
        self.blocks[block].params.as_slice(&self.value_lists)
    }

    /// Number of parameters of `block`.
    pub fn num_block_params(&self, block: Block) -> usize {
        self.blocks[block].params.len(&self.value_lists)
    }

    /// Remove the `num`'th parameter of `block`. The caller is responsible
    /// for first redirecting all uses and for removing the matching argument
    /// from every predecessor branch.
    pub fn remove_block_param(&mut self, block: Block, num: usize) {
        self.blocks[block].params.remove(num, &mut self.value_lists);
        // Renumber the tail.
        let params: SmallVec<[Value; 8]> =
            SmallVec::from_slice(self.blocks[block].params.as_slice(&self.value_lists));
        for (i, &val) in params.iter().enumerate().skip(num) {
            if let ValueData::Param { num, .. } = &mut self.values[val] {
                *num = i as u16;
            }
        }
    }

    /// The type of a value.
    pub fn value_type(&self, v: Value) -> Type {
        match self.values[v] {
            ValueData::Inst { ty, .. }
            | ValueData::Param { ty, .. }
            | ValueData::Alias { ty, .. } => ty,
        }
    }

    /// The definition of a value, resolving aliases.
    pub fn value_def(&self, v: Value) -> ValueDef {
        match self.values[self.resolve_aliases(v)] {
            ValueData::Inst { inst, num, .. } => ValueDef::Result(inst, num as usize),
            ValueData::Param { block, num, .. } => ValueDef::Param(block, num as usize),
            ValueData::Alias { .. } => unreachable!("resolve_aliases returned an alias"),
        }
    }

    /// Resolve value aliases: find the original SSA value of `value`.
    pub fn resolve_aliases(&self, value: Value) -> Value {
        let mut v = value;
        // An alias chain cannot be longer than the value table.
        for _ in 0..=self.values.len() {
            match self.values[v] {
                ValueData::Alias { original, .. } => v = original,
                _ => return v,
            }
        }
        panic!("value alias loop detected for {value}");
    }

    /// Turn `dest` into an alias of `src`: every subsequent resolution of
    /// `dest` yields `src`. `dest` must not be attached as a result or block
    /// parameter any more.
    pub fn change_to_alias(&mut self, dest: Value, src: Value) {
        debug_assert_ne!(self.resolve_aliases(src), dest, "alias cycle");
        let ty = self.value_type(dest);
        self.values[dest] = ValueData::Alias { ty, original: src };
    }

    /// Rewrite every fixed argument and branch argument in `inst` through
    /// `map`. Used by use-replacement and by the inliner.
    pub fn map_inst_values(&mut self, inst: Inst, mut map: impl FnMut(Value) -> Value) {
        // Fixed arguments.
        let mut data = self.insts[inst];
        for arg in data.arguments_mut(&mut self.value_lists) {
            *arg = map(*arg);
        }
        // Branch arguments.
        for call in data.branch_destinations_mut() {
            for arg in call.args_slice_mut(&mut self.value_lists) {
                *arg = map(*arg);
            }
        }
        self.insts[inst] = data;
        // Jump table destinations.
        if let InstructionData::BranchTable { table, .. } = self.insts[inst] {
            let mut jt = self.jump_tables[table].clone();
            for call in jt.all_branches_mut() {
                let args: SmallVec<[Value; 8]> = SmallVec::from_slice(
                    call.args_slice(&self.value_lists),
                );
                for (i, &arg) in args.iter().enumerate() {
                    call.args_slice_mut(&mut self.value_lists)[i] = map(arg);
                }
            }
            self.jump_tables[table] = jt;
        }
    }

    /// Collect every value used by `inst`, including branch arguments and
    /// jump-table arguments.
    pub fn inst_values(&self, inst: Inst) -> SmallVec<[Value; 8]> {
        let mut out: SmallVec<[Value; 8]> = SmallVec::new();
        let data = &self.insts[inst];
        out.extend_from_slice(data.arguments(&self.value_lists));
        for call in data.branch_destinations() {
            out.extend_from_slice(call.args_slice(&self.value_lists));
        }
        if let InstructionData::BranchTable { table, .. } = *data {
            for call in self.jump_tables[table].all_branches() {
                out.extend_from_slice(call.args_slice(&self.value_lists));
            }
        }
        out
    }

    /// Resolve all alias references in instruction arguments, branch
    /// arguments and jump tables, so that the printer never sees an alias.
    pub fn resolve_inst_aliases(&mut self, inst: Inst) {
        let mut resolved: SmallVec<[(Value, Value); 8]> = SmallVec::new();
        for v in self.inst_values(inst) {
            let r = self.resolve_aliases(v);
            if r != v {
                resolved.push((v, r));
            }
        }
        if !resolved.is_empty() {
            self.map_inst_values(inst, |v| {
                resolved
                    .iter()
                    .find(|(from, _)| *from == v)
                    .map(|&(_, to)| to)
                    .unwrap_or(v)
            });
        }
    }

    /// Replace the data of `inst`, keeping its identity and results.
    pub fn replace(&mut self, inst: Inst, data: InstructionData) {
        self.insts[inst] = data;
    }

    /// Create a jump table.
    pub fn make_jump_table(&mut self, data: JumpTableData) -> JumpTable {
        self.jump_tables.push(data)
    }

    /// Whether `v` is attached: i.e. still the live result of an instruction
    /// or a parameter of a block (as opposed to an alias).
    pub fn value_is_attached(&self, v: Value) -> bool {
        match self.values[v] {
            ValueData::Inst { inst, num, .. } => {
                self.inst_results(inst).get(num as usize) == Some(&v)
            }
            ValueData::Param { block, num, .. } => {
                self.block_params(block).get(num as usize) == Some(&v)
            }
            ValueData::Alias { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instructions::Opcode;

    #[test]
    fn make_inst_and_results() {
        let mut dfg = DataFlowGraph::new();
        let inst = dfg.make_inst(InstructionData::UnaryImm {
            opcode: Opcode::Iconst,
            ty: Type::I32,
            imm: 7,
        });
        let results = dfg.make_inst_results(inst, &[Type::I32]);
        assert_eq!(results.len(), 1);
        assert_eq!(dfg.value_type(results[0]), Type::I32);
        assert_eq!(dfg.value_def(results[0]), ValueDef::Result(inst, 0));
    }

    #[test]
    fn aliases_resolve() {
        let mut dfg = DataFlowGraph::new();
        let block = dfg.make_block();
        let a = dfg.append_block_param(block, Type::I32);
        let b = dfg.append_block_param(block, Type::I32);
        dfg.change_to_alias(b, a);
        assert_eq!(dfg.resolve_aliases(b), a);
        assert!(!dfg.value_is_attached(b));
        assert!(dfg.value_is_attached(a));
    }

    #[test]
    fn block_params() {
        let mut dfg = DataFlowGraph::new();
        let block = dfg.make_block();
        let a = dfg.append_block_param(block, Type::I32);
        let b = dfg.append_block_param(block, Type::I64);
        assert_eq!(dfg.block_params(block), &[a, b]);
        assert_eq!(dfg.value_def(b), ValueDef::Param(block, 1));
        dfg.remove_block_param(block, 0);
        assert_eq!(dfg.block_params(block), &[b]);
        assert_eq!(dfg.value_def(b), ValueDef::Param(block, 0));
    }
}
