//! The inlining director.
//!
//! Two responsibilities: stamping the closed set of helper names with the
//! always-inline attribute (on the definition and on every call site), and
//! iteratively inlining every always-inline call in a target function until
//! none remain. The runtime's call graph is acyclic, so the loop
//! terminates.
//!
//! Inlining a call site works the way any SSA inliner does: split the
//! block after the call, copy the callee's blocks and instructions into
//! the caller while remapping values and stack slots, replace the call
//! with a jump to the inlined entry, and turn every inlined `return` into
//! a jump to the split-off continuation block whose parameters stand in
//! for the call's results.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;
use smallvec::SmallVec;

use crate::inst_predicates::is_asm_call;
use crate::ir::{
    Block, BlockCall, Func, Function, Inst, InstructionData, JumpTableData, Module, Opcode,
    StackSlot, Value,
};

/// The closed set of helper names that are forced inline, beyond whatever
/// the runtime blob already marks. Older and newer wasm2c shim naming
/// conventions are both present; names missing from a given module are
/// silently skipped.
pub const ALWAYS_INLINE_HELPERS: &[&str] = &[
    // Instance initialisation family.
    "init_globals",
    "init_memories",
    "init_data_instances",
    "init_tables",
    "init_elem_instances",
    "load_data",
    // Older wasm2c load/store shims.
    "i8_load",
    "i16_load",
    "i32_load",
    "i64_load",
    "f32_load",
    "f64_load",
    "i8_store",
    "i16_store",
    "i32_store",
    "i64_store",
    "f32_store",
    "f64_store",
    // Newer wasm2c naming convention.
    "i8_load_default32",
    "i16_load_default32",
    "i32_load_default32",
    "i64_load_default32",
    "i8_store_default32",
    "i16_store_default32",
    "i32_store_default32",
    "i64_store_default32",
    "i8_load_unchecked",
    "i16_load_unchecked",
    "i32_load_unchecked",
    "i64_load_unchecked",
    "i8_store_unchecked",
    "i16_store_unchecked",
    "i32_store_unchecked",
    "i64_store_unchecked",
    // Sub-word variants.
    "i32_load8_s",
    "i32_load8_u",
    "i32_load16_s",
    "i32_load16_u",
    "i64_load8_s",
    "i64_load8_u",
    "i64_load16_s",
    "i64_load16_u",
    "i64_load32_s",
    "i64_load32_u",
    "i32_store8",
    "i32_store16",
    "i64_store8",
    "i64_store16",
    "i64_store32",
    // Arithmetic helpers.
    "add_overflow",
    "func_types_eq",
];

/// Stamp the always-inline helper set: mark each present definition always-inline.
/// Call-site attributes are implied — the inliner treats every call to an
/// always-inline definition as an always-inline call site.
///
/// A function carrying both always-inline and no-inline has both cleared;
/// no-inline is a transient marker the entry rewriter places on the target
/// function itself.
pub fn stamp_always_inline(module: &mut Module, instantiate_name: &str) {
    for name in ALWAYS_INLINE_HELPERS.iter().copied() {
        stamp_one(module, name);
    }
    stamp_one(module, instantiate_name);

    for (_, func) in module.functions.iter_mut() {
        if func.flags.always_inline && func.flags.no_inline {
            func.flags.always_inline = false;
            func.flags.no_inline = false;
        }
    }
}

fn stamp_one(module: &mut Module, name: &str) {
    let Some(id) = module.func_by_name(name) else {
        log::trace!("inline set: no function named {name}, skipping");
        return;
    };
    if module.functions[id].is_declaration() {
        log::trace!("inline set: {name} is only a declaration, skipping");
        return;
    }
    module.functions[id].flags.always_inline = true;
}

/// Inline every always-inline call in `func` to a fixed point.
///
/// Returns the number of call sites inlined.
pub fn inline_always_inline_calls(module: &Module, func: &mut Function) -> usize {
    let mut total = 0;
    loop {
        let mut sites: Vec<(Inst, Func)> = Vec::new();
        for block in func.layout.block_order() {
            for &inst in func.layout.block_insts(block) {
                if let InstructionData::Call { func: callee, .. } = func.dfg.insts[inst] {
                    let callee_func = &module.functions[callee];
                    if callee_func.flags.inline_asm {
                        continue;
                    }
                    if callee_func.flags.always_inline && !callee_func.is_declaration() {
                        sites.push((inst, callee));
                    }
                }
            }
        }
        if sites.is_empty() {
            break;
        }
        for (inst, callee) in sites {
            // The site may have been swallowed by an earlier inline in
            // this round.
            if func.layout.inst_block(inst).is_none() {
                continue;
            }
            inline_one(func, inst, &module.functions[callee]);
            total += 1;
        }
    }
    total
}

/// Delete every call to an inline-assembly callee. These exist solely as
/// optimisation barriers in the lifted code.
pub fn strip_asm_side_effects(module: &Module, func: &mut Function) -> usize {
    let mut removed = 0;
    for block in func.layout.block_order() {
        for inst in func.layout.block_insts(block).to_vec() {
            if is_asm_call(module, func, inst) {
                func.dfg.detach_inst_results(inst);
                func.layout.remove_inst(inst);
                removed += 1;
            }
        }
    }
    removed
}

/// Inline one particular call site.
fn inline_one(func: &mut Function, call_inst: Inst, callee: &Function) {
    debug_assert!(!callee.is_declaration());
    let call_block = func
        .layout
        .inst_block(call_inst)
        .expect("call site is placed");
    log::trace!(
        "inlining call to {} at {call_inst} in {}",
        callee.name,
        func.name
    );

    let mut values: SecondaryMap<Value, PackedOption<Value>> =
        SecondaryMap::with_capacity(callee.dfg.num_values());

    // Map callee stack slots into the caller.
    let mut slot_map: SecondaryMap<StackSlot, PackedOption<StackSlot>> = SecondaryMap::new();
    for (slot, data) in callee.stack_slots.iter() {
        slot_map[slot] = Some(func.create_stack_slot(data.clone())).into();
    }

    // Create caller blocks for every callee block. The inlined entry block
    // takes no parameters: its values are the call's arguments.
    let callee_entry = callee.layout.entry_block().expect("callee has a body");
    let mut block_map: SecondaryMap<Block, PackedOption<Block>> = SecondaryMap::new();
    for block in callee.layout.blocks() {
        let inlined = func.dfg.make_block();
        block_map[block] = Some(inlined).into();
        if block != callee_entry {
            for &param in callee.dfg.block_params(block) {
                let ty = callee.dfg.value_type(param);
                let inlined_param = func.dfg.append_block_param(inlined, ty);
                values[param] = Some(inlined_param).into();
            }
        }
    }

    // The callee's parameters are the caller's arguments.
    let call_args: SmallVec<[Value; 8]> = func
        .dfg
        .inst_args(call_inst)
        .iter()
        .map(|&v| func.dfg.resolve_aliases(v))
        .collect();
    let callee_params = callee.dfg.block_params(callee_entry);
    debug_assert_eq!(call_args.len(), callee_params.len());
    for (&param, &arg) in callee_params.iter().zip(call_args.iter()) {
        values[param] = Some(arg).into();
    }

    // Split off the continuation block and alias the call's results to its
    // parameters.
    let return_block = split_off_return_block(func, call_inst, callee);

    // Insert the inlined blocks into the layout right after the call block,
    // in callee layout order.
    let mut prev = call_block;
    for callee_block in callee.layout.blocks() {
        let inlined = block_map[callee_block].expand().unwrap();
        func.layout.insert_block_after(inlined, prev);
        prev = inlined;
    }

    // Translate instructions.
    for callee_block in callee.layout.blocks() {
        let inlined_block = block_map[callee_block].expand().unwrap();
        for &callee_inst in callee.layout.block_insts(callee_block) {
            let data = callee.dfg.insts[callee_inst];
            if data.opcode() == Opcode::Return {
                // `return rets...` becomes `jump return_block(rets...)`.
                let rets: SmallVec<[Value; 4]> = data
                    .arguments(&callee.dfg.value_lists)
                    .iter()
                    .map(|&v| map_value(&values, callee, v))
                    .collect();
                let destination = BlockCall::new(return_block, &rets, &mut func.dfg.value_lists);
                let jump = func.dfg.make_inst(InstructionData::Jump {
                    opcode: Opcode::Jump,
                    destination,
                });
                func.layout.append_inst(jump, inlined_block);
                continue;
            }

            let inlined_data = translate_inst(func, callee, &values, &block_map, &slot_map, &data);
            let inlined_inst = func.dfg.make_inst(inlined_data);
            func.layout.append_inst(inlined_inst, inlined_block);

            let result_tys: SmallVec<[crate::ir::Type; 2]> = callee
                .dfg
                .inst_results(callee_inst)
                .iter()
                .map(|&v| callee.dfg.value_type(v))
                .collect();
            let inlined_results = func.dfg.make_inst_results(inlined_inst, &result_tys);
            for (&callee_val, &inlined_val) in callee
                .dfg
                .inst_results(callee_inst)
                .iter()
                .zip(inlined_results.iter())
            {
                values[callee_val] = Some(inlined_val).into();
            }
        }
    }

    // Replace the call with a jump to the inlined entry block.
    let entry_dest = BlockCall::new(
        block_map[callee_entry].expand().unwrap(),
        &[],
        &mut func.dfg.value_lists,
    );
    func.dfg.detach_inst_results(call_inst);
    func.dfg.replace(
        call_inst,
        InstructionData::Jump {
            opcode: Opcode::Jump,
            destination: entry_dest,
        },
    );
}

fn map_value(
    values: &SecondaryMap<Value, PackedOption<Value>>,
    callee: &Function,
    value: Value,
) -> Value {
    let resolved = callee.dfg.resolve_aliases(value);
    values[resolved]
        .expand()
        .expect("defs come before uses in a valid callee body")
}

/// Split the call's block after the call instruction; the new block gets
/// one parameter per call result and the old results become aliases of
/// those parameters.
fn split_off_return_block(func: &mut Function, call_inst: Inst, callee: &Function) -> Block {
    let next = func
        .layout
        .block_insts(func.layout.inst_block(call_inst).unwrap())
        .iter()
        .copied()
        .skip_while(|&i| i != call_inst)
        .nth(1)
        .expect("a call is never a terminator");
    let return_block = func.dfg.make_block();
    func.layout.split_block(return_block, next);

    let old_results: SmallVec<[Value; 2]> =
        func.dfg.inst_results(call_inst).iter().copied().collect();
    debug_assert_eq!(old_results.len(), callee.signature.returns.len());
    func.dfg.detach_inst_results(call_inst);
    for (&ty, old) in callee.signature.returns.iter().zip(old_results) {
        let param = func.dfg.append_block_param(return_block, ty);
        func.dfg.change_to_alias(old, param);
    }
    return_block
}

/// Remap one callee instruction's entities into the caller.
fn translate_inst(
    func: &mut Function,
    callee: &Function,
    values: &SecondaryMap<Value, PackedOption<Value>>,
    block_map: &SecondaryMap<Block, PackedOption<Block>>,
    slot_map: &SecondaryMap<StackSlot, PackedOption<StackSlot>>,
    data: &InstructionData,
) -> InstructionData {
    let map = |v: Value| map_value(values, callee, v);
    let map_call = |func: &mut Function, call: BlockCall| -> BlockCall {
        let block = block_map[call.block(&callee.dfg.value_lists)]
            .expand()
            .unwrap();
        let args: SmallVec<[Value; 8]> = call
            .args_slice(&callee.dfg.value_lists)
            .iter()
            .map(|&v| map_value(values, callee, v))
            .collect();
        BlockCall::new(block, &args, &mut func.dfg.value_lists)
    };

    match *data {
        InstructionData::UnaryImm { .. }
        | InstructionData::GlobalAddr { .. }
        | InstructionData::FuncAddr { .. } => *data,
        InstructionData::StackAddr { opcode, slot, offset } => InstructionData::StackAddr {
            opcode,
            slot: slot_map[slot].expand().unwrap(),
            offset,
        },
        InstructionData::Unary { opcode, ty, arg } => InstructionData::Unary {
            opcode,
            ty,
            arg: map(arg),
        },
        InstructionData::Binary { opcode, args } => InstructionData::Binary {
            opcode,
            args: [map(args[0]), map(args[1])],
        },
        InstructionData::IntCompare { opcode, cond, args } => InstructionData::IntCompare {
            opcode,
            cond,
            args: [map(args[0]), map(args[1])],
        },
        InstructionData::Ternary { opcode, args } => InstructionData::Ternary {
            opcode,
            args: [map(args[0]), map(args[1]), map(args[2])],
        },
        InstructionData::Load {
            opcode,
            ty,
            arg,
            offset,
        } => InstructionData::Load {
            opcode,
            ty,
            arg: map(arg),
            offset,
        },
        InstructionData::Store {
            opcode,
            ty,
            args,
            offset,
        } => InstructionData::Store {
            opcode,
            ty,
            args: [map(args[0]), map(args[1])],
            offset,
        },
        InstructionData::Call {
            opcode,
            func: callee_ref,
            args,
        } => {
            let mapped: SmallVec<[Value; 8]> = args
                .as_slice(&callee.dfg.value_lists)
                .iter()
                .map(|&v| map_value(values, callee, v))
                .collect();
            InstructionData::Call {
                opcode,
                func: callee_ref,
                args: crate::ir::ValueList::from_slice(&mapped, &mut func.dfg.value_lists),
            }
        }
        InstructionData::Jump { opcode, destination } => InstructionData::Jump {
            opcode,
            destination: map_call(func, destination),
        },
        InstructionData::Brif { opcode, arg, blocks } => InstructionData::Brif {
            opcode,
            arg: map(arg),
            blocks: [map_call(func, blocks[0]), map_call(func, blocks[1])],
        },
        InstructionData::BranchTable { opcode, arg, table } => {
            let jt = &callee.dfg.jump_tables[table];
            let default = map_call(func, jt.default_block());
            let entries: Vec<BlockCall> = jt
                .as_slice()
                .iter()
                .map(|&c| map_call(func, c))
                .collect();
            let new_table = func.dfg.make_jump_table(JumpTableData::new(default, entries));
            InstructionData::BranchTable {
                opcode,
                arg: map(arg),
                table: new_table,
            }
        }
        InstructionData::MultiAry { opcode, args } => {
            let mapped: SmallVec<[Value; 8]> = args
                .as_slice(&callee.dfg.value_lists)
                .iter()
                .map(|&v| map_value(values, callee, v))
                .collect();
            InstructionData::MultiAry {
                opcode,
                args: crate::ir::ValueList::from_slice(&mapped, &mut func.dfg.value_lists),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Signature, Type};
    use crate::opt::{self, OptLimits};

    /// A helper definition marked always-inline: `double(x) = x + x`.
    fn make_module() -> (Module, Func) {
        let mut module = Module::new("t");
        let mut double = Function::with_name_signature(
            "double",
            Signature::new(vec![Type::I32], vec![Type::I32]),
        );
        double.flags.always_inline = true;
        {
            let mut b = FunctionBuilder::new(&mut double);
            let block = b.create_block();
            let x = b.append_block_param(block, Type::I32);
            b.switch_to_block(block);
            let d = b.iadd(x, x);
            b.ret(&[d]);
        }
        let double = module.declare_function(double);
        (module, double)
    }

    #[test]
    fn inlines_to_fixed_point() {
        let (mut module, double) = make_module();
        let mut func = Function::with_name_signature(
            "f",
            Signature::new(vec![Type::I32], vec![Type::I32]),
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            let block = b.create_block();
            let x = b.append_block_param(block, Type::I32);
            b.switch_to_block(block);
            let c1 = b.call(double, &[x], &[Type::I32]);
            let r1 = b.func.dfg.first_result(c1).unwrap();
            let c2 = b.call(double, &[r1], &[Type::I32]);
            let r2 = b.func.dfg.first_result(c2).unwrap();
            b.ret(&[r2]);
        }
        let f = module.declare_function(func);
        let mut func = module.take_function(f);
        assert_eq!(inline_always_inline_calls(&module, &mut func), 2);

        // No always-inline calls remain.
        for block in func.layout.blocks() {
            for &inst in func.layout.block_insts(block) {
                assert_ne!(func.dfg.insts[inst].opcode(), Opcode::Call);
            }
        }

        // After cleanup the function computes 4*x.
        opt::optimize_function(&module, &mut func, &OptLimits::unbounded(), 3);
        assert_eq!(func.layout.num_blocks(), 1);
        assert!(func.instruction_count() <= 3);
    }

    #[test]
    fn asm_calls_are_stripped() {
        let mut module = Module::new("t");
        let mut barrier = Function::with_name_signature("barrier", Signature::default());
        barrier.flags.inline_asm = true;
        let barrier = module.declare_function(barrier);
        let mut func = Function::with_name_signature("f", Signature::default());
        {
            let mut b = FunctionBuilder::new(&mut func);
            let block = b.create_block();
            b.switch_to_block(block);
            b.call(barrier, &[], &[]);
            b.ret(&[]);
        }
        let f = module.declare_function(func);
        let mut func = module.take_function(f);
        assert_eq!(strip_asm_side_effects(&module, &mut func), 1);
        assert_eq!(func.instruction_count(), 1);
    }
}
