//! Scalar replacement of stack slots.
//!
//! Promotes the cells of non-escaping stack slots to SSA values, inserting
//! block parameters at join points. This is what dissolves the instance
//! and environment allocations once the runtime helpers have been inlined:
//! their field accesses become plain data flow and the allocations die.
//!
//! A slot is promotable when every use of its address is the address
//! operand of a load or store (constant-offset pointer arithmetic is
//! followed), and no two accesses overlap without being the exact same
//! (offset, type) cell.

use rustc_hash::FxHashMap;

use crate::flowgraph::ControlFlowGraph;
use crate::ir::{
    Block, Function, Inst, InstructionData, Module, Opcode, StackSlot, Type, Value,
};
use crate::opt::{append_branch_arg, make_iconst_before, replace_with_value, OptLimits};

pub fn run(module: &Module, func: &mut Function, _limits: &OptLimits) -> bool {
    let _ = module;
    let mut changed = false;
    let slots: Vec<StackSlot> = func.stack_slots.keys().collect();
    for slot in slots {
        if let Some(accesses) = collect_accesses(func, slot) {
            if !accesses.is_empty() {
                promote_slot(func, &accesses);
                changed = true;
            }
        }
    }
    changed
}

#[derive(Clone, Copy, Debug)]
struct Access {
    inst: Inst,
    /// Byte offset of the accessed cell within the slot.
    offset: i64,
    ty: Type,
    is_store: bool,
}

/// Collect all accesses to `slot`, or `None` if its address escapes or its
/// cells overlap inconsistently.
fn collect_accesses(func: &Function, slot: StackSlot) -> Option<Vec<Access>> {
    // Map from resolved value to the placed instructions using it.
    let mut uses: FxHashMap<Value, Vec<Inst>> = FxHashMap::default();
    for block in func.layout.blocks() {
        for &inst in func.layout.block_insts(block) {
            for value in func.dfg.inst_values(inst) {
                let v = func.dfg.resolve_aliases(value);
                uses.entry(v).or_default().push(inst);
            }
        }
    }

    // Seed with the results of every `stack_addr` of this slot, then chase
    // constant-offset derivations.
    let mut worklist: Vec<(Value, i64)> = Vec::new();
    for block in func.layout.blocks() {
        for &inst in func.layout.block_insts(block) {
            if let InstructionData::StackAddr { slot: s, offset, .. } = func.dfg.insts[inst] {
                if s == slot {
                    if let Some(result) = func.dfg.first_result(inst) {
                        worklist.push((result, offset as i64));
                    }
                }
            }
        }
    }

    let mut accesses = Vec::new();
    while let Some((addr, base_off)) = worklist.pop() {
        for &user in uses.get(&addr).map(|v| v.as_slice()).unwrap_or(&[]) {
            match func.dfg.insts[user] {
                InstructionData::Load {
                    ty, arg, offset, ..
                } if func.dfg.resolve_aliases(arg) == addr => {
                    accesses.push(Access {
                        inst: user,
                        offset: base_off + offset as i64,
                        ty,
                        is_store: false,
                    });
                }
                InstructionData::Store {
                    ty, args, offset, ..
                } if func.dfg.resolve_aliases(args[1]) == addr
                    && func.dfg.resolve_aliases(args[0]) != addr =>
                {
                    accesses.push(Access {
                        inst: user,
                        offset: base_off + offset as i64,
                        ty,
                        is_store: true,
                    });
                }
                InstructionData::Binary {
                    opcode: opcode @ (Opcode::Iadd | Opcode::Isub),
                    args,
                } => {
                    // Only constant offsets keep the address identified.
                    let other = if func.dfg.resolve_aliases(args[0]) == addr {
                        args[1]
                    } else {
                        args[0]
                    };
                    let (_, c) = crate::opt::iconst_value(func, other)?;
                    let c = c as i64;
                    let delta = if opcode == Opcode::Iadd { c } else { -c };
                    let result = func.dfg.first_result(user)?;
                    worklist.push((result, base_off + delta));
                }
                _ => return None,
            }
        }
    }

    // Reject overlapping, inconsistently-typed cells.
    for (i, a) in accesses.iter().enumerate() {
        for b in &accesses[i + 1..] {
            let a_end = a.offset + a.ty.bytes() as i64;
            let b_end = b.offset + b.ty.bytes() as i64;
            let overlap = a.offset < b_end && b.offset < a_end;
            if overlap && (a.offset != b.offset || a.ty != b.ty) {
                return None;
            }
        }
    }
    Some(accesses)
}

fn promote_slot(func: &mut Function, accesses: &[Access]) {
    let cfg = ControlFlowGraph::with_function(func);

    // Group accesses by cell.
    let mut cells: FxHashMap<(i64, Type), Vec<Access>> = FxHashMap::default();
    for &access in accesses {
        cells.entry((access.offset, access.ty)).or_default().push(access);
    }

    for ((_, ty), cell_accesses) in cells {
        promote_cell(func, &cfg, ty, &cell_accesses);
    }
}

fn promote_cell(func: &mut Function, cfg: &ControlFlowGraph, ty: Type, accesses: &[Access]) {
    let is_access: FxHashMap<Inst, Access> =
        accesses.iter().map(|&a| (a.inst, a)).collect();

    // Local pass: forward stores to loads within each block, note each
    // block's outgoing definition, and collect loads that need an incoming
    // value.
    let mut defs: FxHashMap<Block, Value> = FxHashMap::default();
    let mut pending_loads: Vec<(Block, Inst)> = Vec::new();
    for block in func.layout.block_order() {
        let mut cur: Option<Value> = None;
        for inst in func.layout.block_insts(block).to_vec() {
            let Some(access) = is_access.get(&inst).copied() else {
                continue;
            };
            if access.is_store {
                let data = func.dfg.insts[inst].store_data().unwrap();
                cur = Some(func.dfg.resolve_aliases(data));
            } else {
                match cur {
                    Some(v) => replace_with_value(func, inst, v),
                    None => pending_loads.push((block, inst)),
                }
            }
        }
        if let Some(v) = cur {
            defs.insert(block, v);
        }
    }

    // Global pass: resolve loads whose value flows in from predecessors.
    let mut builder = CellSsa {
        ty,
        defs,
        incoming: FxHashMap::default(),
        in_progress: Default::default(),
    };
    for (block, load) in pending_loads {
        let value = builder.read_in(func, cfg, block);
        replace_with_value(func, load, value);
    }

    // All loads are rewritten; the stores are dead.
    for access in accesses {
        if access.is_store {
            func.layout.remove_inst(access.inst);
        }
    }
}

struct CellSsa {
    ty: Type,
    /// Value stored last in each block (local definitions only).
    defs: FxHashMap<Block, Value>,
    /// Memoised value live at each block entry.
    incoming: FxHashMap<Block, Value>,
    /// Cycle detection for single-predecessor chains; only unreachable
    /// code can form one.
    in_progress: rustc_hash::FxHashSet<Block>,
}

impl CellSsa {
    fn read_out(&mut self, func: &mut Function, cfg: &ControlFlowGraph, block: Block) -> Value {
        match self.defs.get(&block) {
            Some(&v) => v,
            None => self.read_in(func, cfg, block),
        }
    }

    fn uninit(&mut self, func: &mut Function, block: Block) -> Value {
        let first = func
            .layout
            .first_inst(block)
            .expect("block has a terminator");
        let zero = make_iconst_before(func, first, self.ty, 0);
        self.incoming.insert(block, zero);
        zero
    }

    fn read_in(&mut self, func: &mut Function, cfg: &ControlFlowGraph, block: Block) -> Value {
        if let Some(&v) = self.incoming.get(&block) {
            return v;
        }
        let preds: Vec<_> = cfg.pred_iter(block).collect();
        if preds.is_empty() {
            // Function entry (or a detached block): the cell is
            // uninitialised here; read it as zero.
            return self.uninit(func, block);
        }
        if preds.len() == 1 {
            if !self.in_progress.insert(block) {
                return self.uninit(func, block);
            }
            let v = self.read_out(func, cfg, preds[0].block);
            self.in_progress.remove(&block);
            // `uninit` may have memoised the block while we recursed
            // through an unreachable cycle.
            return *self.incoming.entry(block).or_insert(v);
        }
        // Join point: a fresh block parameter, memoised before recursing so
        // loops terminate. Trivial parameters are cleaned up by the
        // constant-parameter removal pass.
        let param = func.dfg.append_block_param(block, self.ty);
        self.incoming.insert(block, param);
        for pred in preds {
            let v = self.read_out(func, cfg, pred.block);
            append_branch_arg(func, pred.inst, block, v);
        }
        param
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Signature, StackSlotData};
    use crate::opt::OptLimits;

    #[test]
    fn straight_line_promotion() {
        let module = Module::new("t");
        let mut func = Function::with_name_signature(
            "f",
            Signature::new(vec![Type::I32, Type::I32], vec![Type::I32]),
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            let slot = b.func.create_stack_slot(StackSlotData::new(16));
            let block = b.create_block();
            let x = b.append_block_param(block, Type::I32);
            let y = b.append_block_param(block, Type::I32);
            b.switch_to_block(block);
            let a0 = b.stack_addr(slot, 0);
            let a1 = b.stack_addr(slot, 4);
            b.store(Type::I32, x, a0, 0);
            b.store(Type::I32, y, a1, 0);
            let lx = b.load(Type::I32, a0, 0);
            let ly = b.load(Type::I32, a1, 0);
            let sum = b.iadd(lx, ly);
            b.ret(&[sum]);
        }
        assert!(run(&module, &mut func, &OptLimits::default()));
        // Stores and loads are gone; the add now reads the parameters.
        let block = func.layout.entry_block().unwrap();
        let insts = func.layout.block_insts(block).to_vec();
        assert_eq!(insts.len(), 4); // two stack_addrs, iadd, return
        let add = insts[2];
        let args: Vec<Value> = func
            .dfg
            .inst_args(add)
            .iter()
            .map(|&v| func.dfg.resolve_aliases(v))
            .collect();
        assert_eq!(args, func.dfg.block_params(block).to_vec());
    }

    #[test]
    fn cross_block_promotion_inserts_param() {
        let module = Module::new("t");
        let mut func = Function::with_name_signature(
            "f",
            Signature::new(vec![Type::I32], vec![Type::I32]),
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            let slot = b.func.create_stack_slot(StackSlotData::new(4));
            let entry = b.create_block();
            let x = b.append_block_param(entry, Type::I32);
            let then_block = b.create_block();
            let else_block = b.create_block();
            let join = b.create_block();
            b.switch_to_block(entry);
            let addr = b.stack_addr(slot, 0);
            b.brif(x, then_block, &[], else_block, &[]);
            b.switch_to_block(then_block);
            let one = b.iconst(Type::I32, 1);
            b.store(Type::I32, one, addr, 0);
            b.jump(join, &[]);
            b.switch_to_block(else_block);
            let two = b.iconst(Type::I32, 2);
            b.store(Type::I32, two, addr, 0);
            b.jump(join, &[]);
            b.switch_to_block(join);
            let out = b.load(Type::I32, addr, 0);
            b.ret(&[out]);
        }
        assert!(run(&module, &mut func, &OptLimits::default()));
        // The join block gained a parameter fed by both stores.
        let blocks = func.layout.block_order();
        let join = blocks[3];
        assert_eq!(func.dfg.num_block_params(join), 1);
        // No load or store instructions remain.
        for block in func.layout.blocks() {
            for &inst in func.layout.block_insts(block) {
                let op = func.dfg.insts[inst].opcode();
                assert!(op != Opcode::Load && op != Opcode::Store);
            }
        }
    }

    #[test]
    fn escaping_slot_is_left_alone() {
        let mut module = Module::new("t");
        let callee = Function::with_name_signature(
            "sink",
            Signature::new(vec![Type::Ptr], vec![]),
        );
        let callee = module.declare_function(callee);
        let mut func =
            Function::with_name_signature("f", Signature::new(vec![], vec![]));
        {
            let mut b = FunctionBuilder::new(&mut func);
            let slot = b.func.create_stack_slot(StackSlotData::new(8));
            let block = b.create_block();
            b.switch_to_block(block);
            let addr = b.stack_addr(slot, 0);
            let v = b.iconst(Type::I32, 3);
            b.store(Type::I32, v, addr, 0);
            b.call(callee, &[addr], &[]);
            b.ret(&[]);
        }
        assert!(!run(&module, &mut func, &OptLimits::default()));
        assert_eq!(func.instruction_count(), 5);
    }
}
