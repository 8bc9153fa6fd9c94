//! Dead-store elimination.
//!
//! Two cooperating transforms over alias classes:
//!
//! * per-block overwrite elimination: a store whose exact location is
//!   stored again later in the block, with no possibly-aliasing read or
//!   barrier in between, is dead;
//! * whole-object elimination: an identified object (stack slot or
//!   allocation) that is never read and whose address never escapes is
//!   write-only, so every store into it is dead. This is what removes the
//!   lifted code's shadow-stack spill frames once their reads have been
//!   forwarded away.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::inst_predicates::is_allocator_call;
use crate::ir::{Function, InstructionData, Module, Opcode, Value};
use crate::opt::{alias_class, memory_key, AliasClass, MemBase, OptLimits};

pub fn run(module: &Module, func: &mut Function, limits: &OptLimits) -> bool {
    let mut changed = false;
    changed |= remove_overwritten_stores(module, func, limits);
    changed |= remove_write_only_objects(module, func);
    changed
}

fn remove_overwritten_stores(module: &Module, func: &mut Function, limits: &OptLimits) -> bool {
    let mut changed = false;
    for block in func.layout.block_order() {
        // Locations overwritten later in the block without an intervening
        // read, keyed by canonical location; the value is the class for
        // aliasing checks.
        let mut overwritten: FxHashMap<(MemBase, i64, u32), AliasClass> = FxHashMap::default();
        for inst in func.layout.block_insts(block).to_vec().into_iter().rev() {
            let data = func.dfg.insts[inst];
            match data.opcode() {
                Opcode::Store => {
                    let (addr, offset, ty) = data.memory_access().unwrap();
                    let key = memory_key(func, addr, offset);
                    let class = alias_class(module, func, addr);
                    let loc = (key.0, key.1, ty.bytes());
                    if class != AliasClass::Unknown && overwritten.contains_key(&loc) {
                        func.layout.remove_inst(inst);
                        changed = true;
                        continue;
                    }
                    if overwritten.len() < limits.dse_scan_limit {
                        overwritten.insert(loc, class);
                    }
                }
                Opcode::Load => {
                    let (addr, _, _) = data.memory_access().unwrap();
                    let class = alias_class(module, func, addr);
                    overwritten.retain(|_, c| !crate::opt::may_alias(*c, class));
                }
                Opcode::Call => {
                    // An allocator neither reads nor writes existing
                    // state; any other call may read anything.
                    if !is_allocator_call(module, func, inst) {
                        let readnone = match data {
                            InstructionData::Call { func: callee, .. } => {
                                module.functions[callee].flags.readnone
                            }
                            _ => false,
                        };
                        if !readnone {
                            overwritten.clear();
                        }
                    }
                }
                _ => {}
            }
        }
    }
    changed
}

/// Delete all stores into objects that are provably never read.
fn remove_write_only_objects(module: &Module, func: &mut Function) -> bool {
    // An object "may be read" if any load targets its class, if any load
    // goes through an unknown address, or if its address escapes (then a
    // call or the caller could read it). Collect the read/escape facts in
    // one walk.
    let mut read: FxHashSet<AliasClass> = FxHashSet::default();
    let mut any_unknown_read = false;
    let mut escaped: FxHashSet<AliasClass> = FxHashSet::default();

    let mut objects: Vec<AliasClass> = Vec::new();
    for block in func.layout.blocks() {
        for &inst in func.layout.block_insts(block) {
            let data = &func.dfg.insts[inst];
            match data.opcode() {
                Opcode::Load => {
                    let (addr, _, _) = data.memory_access().unwrap();
                    match alias_class(module, func, addr) {
                        AliasClass::Unknown => any_unknown_read = true,
                        class => {
                            read.insert(class);
                        }
                    }
                }
                Opcode::StackAddr => {
                    if let InstructionData::StackAddr { slot, .. } = *data {
                        objects.push(AliasClass::Slot(slot));
                    }
                }
                Opcode::Call => {
                    if is_allocator_call(module, func, inst) {
                        objects.push(AliasClass::Alloc(inst));
                    }
                }
                _ => {}
            }
            // Escape: any use of an object address outside of load/store
            // addressing or constant pointer arithmetic.
            for value in func.dfg.inst_values(inst) {
                let v = func.dfg.resolve_aliases(value);
                if func.dfg.value_type(v) != crate::ir::Type::Ptr {
                    continue;
                }
                let class = alias_class(module, func, v);
                if class == AliasClass::Unknown {
                    continue;
                }
                if address_use_escapes(func, inst, v) {
                    escaped.insert(class);
                }
            }
        }
    }

    if any_unknown_read {
        return false;
    }

    let mut changed = false;
    let dead: FxHashSet<AliasClass> = objects
        .into_iter()
        .filter(|class| !read.contains(class) && !escaped.contains(class))
        .collect();
    if dead.is_empty() {
        return false;
    }
    for block in func.layout.block_order() {
        for inst in func.layout.block_insts(block).to_vec() {
            if func.dfg.insts[inst].opcode() != Opcode::Store {
                continue;
            }
            let (addr, _, _) = func.dfg.insts[inst].memory_access().unwrap();
            if dead.contains(&alias_class(module, func, addr)) {
                func.layout.remove_inst(inst);
                changed = true;
            }
        }
    }
    changed
}

/// Does this particular use of address `v` let it escape?
fn address_use_escapes(func: &Function, user: crate::ir::Inst, v: Value) -> bool {
    match func.dfg.insts[user] {
        InstructionData::Load { arg, .. } => func.dfg.resolve_aliases(arg) != v,
        InstructionData::Store { args, .. } => {
            // Address position is fine; being the stored data is an escape.
            func.dfg.resolve_aliases(args[0]) == v
        }
        InstructionData::Binary {
            opcode: Opcode::Iadd | Opcode::Isub,
            args,
        } => {
            // Pointer arithmetic doesn't escape if the derived pointer
            // itself never escapes; the derived value is classified to the
            // same object and checked at its own uses, so only a
            // non-constant second pointer operand matters here.
            let _ = args;
            // The result of the arithmetic carries the same class and is
            // re-examined at each of its uses.
            false
        }
        InstructionData::Unary {
            opcode: Opcode::Uextend | Opcode::Sextend | Opcode::Ireduce,
            ..
        } => false,
        // Comparing pointers does not publish them.
        InstructionData::IntCompare { .. } => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Signature, StackSlotData, Type};

    #[test]
    fn overwritten_store_is_removed() {
        let module = Module::new("t");
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
            let one = b.iconst(Type::I32, 1);
            b.store(Type::I32, one, addr, 0);
            b.store(Type::I32, x, addr, 0);
            let out = b.load(Type::I32, addr, 0);
            b.ret(&[out]);
        }
        assert!(run(&module, &mut func, &OptLimits::default()));
        let stores = count_op(&func, Opcode::Store);
        assert_eq!(stores, 1);
    }

    #[test]
    fn read_blocks_overwrite_removal() {
        let module = Module::new("t");
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
            let one = b.iconst(Type::I32, 1);
            b.store(Type::I32, one, addr, 0);
            let mid = b.load(Type::I32, addr, 0);
            b.store(Type::I32, x, addr, 0);
            let out = b.load(Type::I32, addr, 0);
            let sum = b.iadd(mid, out);
            b.ret(&[sum]);
        }
        assert!(!run(&module, &mut func, &OptLimits::default()));
        assert_eq!(count_op(&func, Opcode::Store), 2);
    }

    #[test]
    fn write_only_slot_stores_die() {
        let module = Module::new("t");
        let mut func = Function::with_name_signature(
            "f",
            Signature::new(vec![Type::I32], vec![Type::I32]),
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            let slot = b.func.create_stack_slot(StackSlotData::new(16));
            let block = b.create_block();
            let x = b.append_block_param(block, Type::I32);
            b.switch_to_block(block);
            let addr = b.stack_addr(slot, 0);
            b.store(Type::I32, x, addr, 0);
            b.store(Type::I32, x, addr, 8);
            b.ret(&[x]);
        }
        assert!(run(&module, &mut func, &OptLimits::default()));
        assert_eq!(count_op(&func, Opcode::Store), 0);
    }

    fn count_op(func: &Function, op: Opcode) -> usize {
        let mut n = 0;
        for block in func.layout.blocks() {
            for &inst in func.layout.block_insts(block) {
                if func.dfg.insts[inst].opcode() == op {
                    n += 1;
                }
            }
        }
        n
    }
}
