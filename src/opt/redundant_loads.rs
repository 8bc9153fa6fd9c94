//! Redundant-load elimination and store-to-load forwarding.
//!
//! A fused "last store" / "memory values" pass over alias classes. For
//! each program point we track, per disjoint piece of abstract memory
//! state, the last instruction that might have written it. A load whose
//! (last store, base, offset, type) key is already known to hold an SSA
//! value is replaced by that value — store-to-load forwarding when the
//! value came from a store, redundant-load elimination when it came from
//! an earlier load. Loads from freshly calloc'd objects with no
//! intervening store fold to zero.
//!
//! The per-block scan limit is consulted while walking instructions; when
//! a block exceeds it the rest of that block is treated as unanalysable.
//! Lifted functions routinely blow past conservative limits, which is why
//! the driver raises them.

use cranelift_entity::packed_option::PackedOption;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::dominator_tree::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::inst_predicates::is_allocator_call;
use crate::ir::{
    Block, Function, Inst, InstructionData, Module, Opcode, Type, Value,
};
use crate::opt::{
    alias_class, make_iconst_before, memory_key, replace_with_value, AliasClass, MemBase,
    OptLimits,
};

/// Last-store state: one entry per alias class written since the barrier,
/// and the barrier itself (the last write through an unknown address, call
/// or merge point).
#[derive(Clone, Default, PartialEq)]
struct LastStores {
    classes: FxHashMap<AliasClass, Inst>,
    barrier: PackedOption<Inst>,
}

impl LastStores {
    fn effective(&self, class: AliasClass) -> PackedOption<Inst> {
        match self.classes.get(&class) {
            Some(&inst) => Some(inst).into(),
            None => self.barrier,
        }
    }

    fn update(&mut self, module: &Module, func: &Function, inst: Inst) {
        let data = &func.dfg.insts[inst];
        match data.opcode() {
            Opcode::Store => {
                let (addr, _, _) = data.memory_access().unwrap();
                match alias_class(module, func, addr) {
                    AliasClass::Unknown => self.set_barrier(inst),
                    class => {
                        self.classes.insert(class, inst);
                    }
                }
            }
            Opcode::Call => {
                if is_allocator_call(module, func, inst) {
                    // A fresh allocation defines its own disjoint class and
                    // clobbers nothing else.
                    self.classes.insert(AliasClass::Alloc(inst), inst);
                } else if let InstructionData::Call { func: callee, .. } = *data {
                    if !module.functions[callee].flags.readnone {
                        self.set_barrier(inst);
                    }
                }
            }
            _ => {}
        }
    }

    fn set_barrier(&mut self, inst: Inst) {
        self.classes.clear();
        self.barrier = Some(inst).into();
    }

    fn meet_from(&mut self, other: &LastStores, loc: Inst) {
        let meet = |a: PackedOption<Inst>, b: PackedOption<Inst>| -> PackedOption<Inst> {
            match (a.expand(), b.expand()) {
                (None, None) => None.into(),
                (Some(a), Some(b)) if a == b => Some(a).into(),
                _ => Some(loc).into(),
            }
        };
        let mut keys: FxHashSet<AliasClass> = self.classes.keys().copied().collect();
        keys.extend(other.classes.keys().copied());
        let merged_barrier = meet(self.barrier, other.barrier);
        for class in keys {
            let merged = meet(self.effective(class), other.effective(class));
            match merged.expand() {
                Some(inst) => {
                    self.classes.insert(class, inst);
                }
                None => {
                    self.classes.remove(&class);
                }
            }
        }
        self.barrier = merged_barrier;
    }
}

/// A key identifying a unique memory location: the memory version (last
/// store), the canonical base and offset, and the accessed type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct MemoryLoc {
    last_store: PackedOption<Inst>,
    base: MemBase,
    offset: i64,
    ty: Type,
}

/// A block-local available-memory entry: the value known to live at a
/// canonical location, with its class for aliasing checks.
#[derive(Clone, Copy)]
struct AvailEntry {
    class: AliasClass,
    ty: Type,
    value: Value,
}

pub fn run(module: &Module, func: &mut Function, limits: &OptLimits) -> bool {
    let cfg = ControlFlowGraph::with_function(func);
    let domtree = DominatorTree::with_function(func, &cfg);

    let block_input = compute_block_inputs(module, func, &cfg, limits);

    let mut mem_values: FxHashMap<MemoryLoc, (Inst, Value)> = FxHashMap::default();
    let mut changed = false;

    for block in func.layout.block_order() {
        let mut state = block_input.get(&block).cloned().unwrap_or_default();
        // Block-local precise availability: unlike the last-store keys, a
        // store to a provably disjoint offset of the same object does not
        // invalidate these entries. The lifted shape leans on this — the
        // instance descriptor is written field by field and re-read in
        // between.
        let mut avail: FxHashMap<(MemBase, i64, u32), AvailEntry> = FxHashMap::default();
        let mut scanned = 0usize;
        for inst in func.layout.block_insts(block).to_vec() {
            scanned += 1;
            if scanned > limits.block_scan_limit {
                break;
            }
            if let Some((addr, offset, ty)) = func.dfg.insts[inst].memory_access() {
                let (base, offset) = memory_key(func, addr, offset);
                let opcode = func.dfg.insts[inst].opcode();
                let class = alias_class(module, func, addr);
                if opcode == Opcode::Store {
                    let data = func.dfg.insts[inst].store_data().unwrap();
                    let data = func.dfg.resolve_aliases(data);
                    state.update(module, func, inst);
                    invalidate_overlapping(&mut avail, class, base, offset, ty.bytes());
                    if avail.len() < limits.available_load_limit {
                        avail.insert(
                            (base, offset, ty.bytes()),
                            AvailEntry {
                                class,
                                ty,
                                value: data,
                            },
                        );
                    }
                    let loc = MemoryLoc {
                        last_store: Some(inst).into(),
                        base,
                        offset,
                        ty,
                    };
                    if mem_values.len() < limits.available_load_limit {
                        mem_values.insert(loc, (inst, data));
                    }
                    continue;
                }
                // A load: the precise block-local map first.
                let load_result = func.dfg.first_result(inst).expect("loads have a result");
                let last_store = state.effective(class);
                if let Some(entry) = avail.get(&(base, offset, ty.bytes())).copied() {
                    if entry.ty == ty && func.dfg.resolve_aliases(entry.value) != load_result {
                        let value = func.dfg.resolve_aliases(entry.value);
                        // Keep the fact visible to later blocks even though
                        // this load disappears.
                        if mem_values.len() < limits.available_load_limit {
                            let loc = MemoryLoc {
                                last_store,
                                base,
                                offset,
                                ty,
                            };
                            mem_values.entry(loc).or_insert((inst, value));
                        }
                        replace_with_value(func, inst, value);
                        changed = true;
                        continue;
                    }
                }
                // A load from a calloc'd object that nothing has written
                // yet reads zeroes.
                if ty.is_int() {
                    if let AliasClass::Alloc(alloc) = class {
                        if last_store.expand() == Some(alloc) || last_store.is_none() {
                            let zero = make_iconst_before(func, inst, ty, 0);
                            replace_with_value(func, inst, zero);
                            changed = true;
                            continue;
                        }
                    }
                }
                let loc = MemoryLoc {
                    last_store,
                    base,
                    offset,
                    ty,
                };
                match mem_values.get(&loc).copied() {
                    Some((def_inst, value))
                        if func.dfg.resolve_aliases(value) != load_result
                            && value_available_at(func, &domtree, def_inst, value, inst) =>
                    {
                        let value = func.dfg.resolve_aliases(value);
                        replace_with_value(func, inst, value);
                        changed = true;
                    }
                    _ => {
                        if mem_values.len() < limits.available_load_limit {
                            mem_values.insert(loc, (inst, load_result));
                        }
                        if avail.len() < limits.available_load_limit {
                            avail.insert(
                                (base, offset, ty.bytes()),
                                AvailEntry {
                                    class,
                                    ty,
                                    value: load_result,
                                },
                            );
                        }
                    }
                }
                continue;
            }
            if func.dfg.insts[inst].opcode() == Opcode::Call
                && !is_allocator_call(module, func, inst)
            {
                let readnone = match func.dfg.insts[inst] {
                    InstructionData::Call { func: callee, .. } => {
                        module.functions[callee].flags.readnone
                    }
                    _ => false,
                };
                if !readnone {
                    avail.clear();
                }
            }
            state.update(module, func, inst);
        }
    }
    changed
}

/// Drop availability entries a store to `(class, base, offset..offset+bytes)`
/// may overwrite. Entries for the same object at provably disjoint offsets
/// survive; everything else that may alias goes.
fn invalidate_overlapping(
    avail: &mut FxHashMap<(MemBase, i64, u32), AvailEntry>,
    class: AliasClass,
    base: MemBase,
    offset: i64,
    bytes: u32,
) {
    avail.retain(|&(entry_base, entry_off, entry_bytes), entry| {
        if !crate::opt::may_alias(entry.class, class) {
            return true;
        }
        if entry.class == class && entry_base == base {
            let disjoint = offset + bytes as i64 <= entry_off
                || entry_off + entry_bytes as i64 <= offset;
            return disjoint;
        }
        false
    });
}

/// Is `value`, recorded at `def_inst`, usable at `user`?
///
/// Matching `MemoryLoc` keys mean the memory contents agree — the same
/// last-store version reached both points over the same address — so the
/// remaining requirement is SSA validity: the value must dominate the use.
/// The recording instruction may itself have been folded away already; if
/// it is still placed it is checked too, which keeps sibling-path loads
/// out.
fn value_available_at(
    func: &Function,
    domtree: &DominatorTree,
    def_inst: Inst,
    value: Value,
    user: Inst,
) -> bool {
    let value = func.dfg.resolve_aliases(value);
    if !domtree.value_dominates(func, value, user) {
        return false;
    }
    match func.layout.inst_block(def_inst) {
        Some(_) => domtree.dominates(def_inst, user, &func.layout),
        None => true,
    }
}

/// Forward data-flow over the CFG computing each block's input last-store
/// state, visiting in the usual worklist fashion until a fixed point.
fn compute_block_inputs(
    module: &Module,
    func: &Function,
    cfg: &ControlFlowGraph,
    limits: &OptLimits,
) -> FxHashMap<Block, LastStores> {
    let mut block_input: FxHashMap<Block, LastStores> = FxHashMap::default();
    let Some(entry) = func.layout.entry_block() else {
        return block_input;
    };
    let mut queue = vec![entry];
    let mut queue_set: FxHashSet<Block> = FxHashSet::default();
    queue_set.insert(entry);
    block_input.insert(entry, LastStores::default());

    while let Some(block) = queue.pop() {
        queue_set.remove(&block);
        let mut state = block_input.get(&block).cloned().unwrap_or_default();

        let mut scanned = 0usize;
        for &inst in func.layout.block_insts(block) {
            scanned += 1;
            if scanned > limits.block_scan_limit {
                // Unanalysable tail: everything may have been written.
                if let Some(last) = func.layout.last_inst(block) {
                    state.set_barrier(last);
                }
                break;
            }
            state.update(module, func, inst);
        }

        for succ in cfg.succ_iter(block) {
            let succ_loc = func
                .layout
                .first_inst(succ)
                .expect("successor has instructions");
            let updated = match block_input.get_mut(&succ) {
                Some(succ_state) => {
                    let old = succ_state.clone();
                    succ_state.meet_from(&state, succ_loc);
                    *succ_state != old
                }
                None => {
                    block_input.insert(succ, state.clone());
                    true
                }
            };
            if updated && queue_set.insert(succ) {
                queue.push(succ);
            }
        }
    }
    block_input
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Signature, StackSlotData};

    fn module_with_calloc() -> (Module, crate::ir::Func) {
        let mut module = Module::new("t");
        let mut calloc = Function::with_name_signature(
            "calloc",
            Signature::new(vec![Type::I64, Type::I64], vec![Type::Ptr]),
        );
        calloc.flags.allocator = true;
        let calloc = module.declare_function(calloc);
        (module, calloc)
    }

    #[test]
    fn store_to_load_forwarding_across_disjoint_store() {
        let (module, _) = module_with_calloc();
        let mut func = Function::with_name_signature(
            "f",
            Signature::new(vec![Type::I32], vec![Type::I32]),
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            let s0 = b.func.create_stack_slot(StackSlotData::new(8));
            let s1 = b.func.create_stack_slot(StackSlotData::new(8));
            let block = b.create_block();
            let x = b.append_block_param(block, Type::I32);
            b.switch_to_block(block);
            let a0 = b.stack_addr(s0, 0);
            let a1 = b.stack_addr(s1, 0);
            b.store(Type::I32, x, a0, 0);
            // A store to a different slot must not block forwarding.
            let nine = b.iconst(Type::I32, 9);
            b.store(Type::I32, nine, a1, 0);
            let out = b.load(Type::I32, a0, 0);
            b.ret(&[out]);
        }
        assert!(run(&module, &mut func, &OptLimits::default()));
        // The load is gone; the return yields x.
        let block = func.layout.entry_block().unwrap();
        let ret = func.layout.last_inst(block).unwrap();
        let arg = func.dfg.inst_args(ret)[0];
        let x = func.dfg.block_params(block)[0];
        assert_eq!(func.dfg.resolve_aliases(arg), x);
    }

    #[test]
    fn calloc_memory_reads_zero() {
        let (mut module, calloc) = module_with_calloc();
        let mut func =
            Function::with_name_signature("f", Signature::new(vec![], vec![Type::I32]));
        {
            let mut b = FunctionBuilder::new(&mut func);
            let block = b.create_block();
            b.switch_to_block(block);
            let n = b.iconst(Type::I64, 64);
            let one = b.iconst(Type::I64, 1);
            let call = b.call(calloc, &[n, one], &[Type::Ptr]);
            let buf = b.func.dfg.first_result(call).unwrap();
            let out = b.load(Type::I32, buf, 16);
            b.ret(&[out]);
        }
        let f = module.declare_function(func);
        let mut func = module.take_function(f);
        assert!(run(&module, &mut func, &OptLimits::default()));
        let block = func.layout.entry_block().unwrap();
        let ret = func.layout.last_inst(block).unwrap();
        let arg = func.dfg.resolve_aliases(func.dfg.inst_args(ret)[0]);
        let (_, c) = crate::opt::iconst_value(&func, arg).expect("constant");
        assert_eq!(c, 0);
    }

    #[test]
    fn scan_limit_blocks_forwarding() {
        let (module, _) = module_with_calloc();
        let mut func = Function::with_name_signature(
            "f",
            Signature::new(vec![Type::I32], vec![Type::I32]),
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            let slot = b.func.create_stack_slot(StackSlotData::new(8));
            let block = b.create_block();
            let x = b.append_block_param(block, Type::I32);
            b.switch_to_block(block);
            let addr = b.stack_addr(slot, 0);
            b.store(Type::I32, x, addr, 0);
            // Pad the block far beyond the scan limit.
            let mut acc = x;
            for _ in 0..200 {
                acc = b.iadd(acc, x);
            }
            let out = b.load(Type::I32, addr, 0);
            let sum = b.iadd(out, acc);
            b.ret(&[sum]);
        }
        let narrow = OptLimits {
            block_scan_limit: 16,
            ..OptLimits::default()
        };
        let mut clone = func.clone();
        assert!(!run(&module, &mut clone, &narrow));
        assert!(run(&module, &mut func, &OptLimits::unbounded()));
    }
}
