//! The optimisation engine.
//!
//! The engine exposes two entry points: a function-level custom pipeline
//! wrapped in a convergence loop, and a module-level pipeline. The pass
//! schedule is hand ordered — each pass exposes shape the next one
//! exploits — and iterated until the instruction count stops shrinking,
//! because the helper-collapse only reaches a fixed point after several
//! rounds of inline/promote/fold.
//!
//! Pass-internal scan limits live in [`OptLimits`]. The driver raises them
//! far above the defaults: the lifted shape exceeds conservative bounds and
//! passes would otherwise bail out mid-fold, leaving the function in a
//! partially folded state. This is correctness tuning for the result, not
//! performance tuning.

pub mod dce;
pub mod dse;
pub mod gvn;
pub mod instcombine;
pub mod mem2reg;
pub mod redundant_loads;
pub mod remove_constant_params;
pub mod simplify_cfg;

use crate::ir::{
    Block, Function, Global, Inst, InstructionData, Module, Opcode, StackSlot, Type, Value,
};

/// Scan limits consulted by the passes.
///
/// Defaults mirror the conservative bounds of production compilers. The
/// deobfuscation driver replaces them with [`OptLimits::unbounded`].
#[derive(Clone, Copy, Debug)]
pub struct OptLimits {
    /// Memory-dependence state walk: maximum instructions per block before
    /// the redundant-load pass gives up on the rest of the block.
    pub block_scan_limit: usize,
    /// Maximum entries in the available-load table.
    pub available_load_limit: usize,
    /// Maximum store locations tracked per block by dead-store elimination.
    pub dse_scan_limit: usize,
    /// Maximum entries in the value-numbering table.
    pub gvn_table_limit: usize,
}

impl Default for OptLimits {
    fn default() -> Self {
        Self {
            block_scan_limit: 100,
            available_load_limit: 128,
            dse_scan_limit: 150,
            gvn_table_limit: 10_000,
        }
    }
}

impl OptLimits {
    /// Effectively unbounded limits (~10⁶); required for lifted inputs.
    pub fn unbounded() -> Self {
        Self {
            block_scan_limit: 1_000_000,
            available_load_limit: 1_000_000,
            dse_scan_limit: 1_000_000,
            gvn_table_limit: 1_000_000,
        }
    }
}

/// Run the custom function pipeline once.
pub fn run_custom_pipeline(module: &Module, func: &mut Function, limits: &OptLimits) {
    simplify_cfg::run(module, func, limits);
    mem2reg::run(module, func, limits);
    gvn::run(module, func, limits);
    redundant_loads::run(module, func, limits);
    // Instruction combining is hard-capped at one sweep per invocation;
    // re-running it here interacts badly with the store-forwarding state.
    instcombine::run(module, func, limits);
    dse::run(module, func, limits);
    dce::run(module, func, limits);
    remove_constant_params::run(module, func, limits);
    simplify_cfg::run(module, func, limits);
    flush_aliases(func);
}

/// A default-constructed function pipeline, used once after convergence as
/// a belt-and-braces pass.
pub fn run_default_pipeline(module: &Module, func: &mut Function, limits: &OptLimits) {
    simplify_cfg::run(module, func, limits);
    gvn::run(module, func, limits);
    instcombine::run(module, func, limits);
    dce::run(module, func, limits);
    flush_aliases(func);
}

/// Optimise one function: the custom pipeline iterated until the
/// instruction count stops strictly decreasing, then the default pipeline.
///
/// Returns the final instruction count. `opt_level` 0 short-circuits.
pub fn optimize_function(
    module: &Module,
    func: &mut Function,
    limits: &OptLimits,
    opt_level: u8,
) -> usize {
    if opt_level == 0 {
        return func.instruction_count();
    }
    let mut count = func.instruction_count();
    let mut iterations = 0usize;
    loop {
        run_custom_pipeline(module, func, limits);
        iterations += 1;
        // Measured after the schedule, never during it.
        let new_count = func.instruction_count();
        log::debug!(
            "{}: pipeline iteration {iterations}: {count} -> {new_count} instructions",
            func.name
        );
        if new_count >= count {
            break;
        }
        count = new_count;
    }
    run_default_pipeline(module, func, limits);
    func.instruction_count()
}

/// The whole-module pipeline: every definition through the function
/// pipeline, then global dead-code elimination.
pub fn optimize_module(module: &mut Module, limits: &OptLimits, opt_level: u8) {
    if opt_level == 0 {
        return;
    }
    for id in module.defined_functions() {
        if module.functions[id].flags.optimize_none {
            continue;
        }
        let mut func = module.take_function(id);
        optimize_function(module, &mut func, limits, opt_level);
        module.put_function(id, func);
    }
    crate::extract::global_dce(module);
}

// ---------------------------------------------------------------------------
// Shared helpers used by several passes.

/// A disjoint piece of abstract memory state. Distinct identified objects —
/// stack slots, allocation-call results, globals — never alias each other;
/// an unknown address may alias anything.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum AliasClass {
    Slot(StackSlot),
    Alloc(Inst),
    Global(Global),
    Unknown,
}

/// If `value` is an `iconst`, return its type and width-wrapped payload.
pub fn iconst_value(func: &Function, value: Value) -> Option<(Type, u64)> {
    let value = func.dfg.resolve_aliases(value);
    match func.dfg.value_def(value) {
        crate::ir::ValueDef::Result(inst, 0) => match func.dfg.insts[inst] {
            InstructionData::UnaryImm {
                opcode: Opcode::Iconst,
                ty,
                imm,
            } => Some((ty, ty.wrap(imm as u64))),
            _ => None,
        },
        _ => None,
    }
}

/// Strip constant-offset address arithmetic: follow `iadd x, const` and
/// `isub x, const` chains, returning the underlying base value and the
/// accumulated byte offset.
pub fn base_and_offset(func: &Function, value: Value) -> (Value, i64) {
    let mut base = func.dfg.resolve_aliases(value);
    let mut offset = 0i64;
    for _ in 0..64 {
        let crate::ir::ValueDef::Result(inst, 0) = func.dfg.value_def(base) else {
            break;
        };
        match func.dfg.insts[inst] {
            InstructionData::Binary {
                opcode: opcode @ (Opcode::Iadd | Opcode::Isub),
                args,
            } => {
                let lhs = func.dfg.resolve_aliases(args[0]);
                let rhs = func.dfg.resolve_aliases(args[1]);
                if let Some((_, c)) = iconst_value(func, rhs) {
                    let c = c as i64;
                    offset += if opcode == Opcode::Iadd { c } else { -c };
                    base = lhs;
                } else if opcode == Opcode::Iadd {
                    if let Some((_, c)) = iconst_value(func, lhs) {
                        offset += c as i64;
                        base = rhs;
                    } else {
                        break;
                    }
                } else {
                    break;
                }
            }
            _ => break,
        }
    }
    (base, offset)
}

/// Attribute an address value to an identified object, following constant
/// offsets, extensions and one level of pointer arithmetic over a
/// classified base.
pub fn alias_class(module: &Module, func: &Function, addr: Value) -> AliasClass {
    let mut cur = func.dfg.resolve_aliases(addr);
    for _ in 0..64 {
        let crate::ir::ValueDef::Result(inst, 0) = func.dfg.value_def(cur) else {
            return AliasClass::Unknown;
        };
        match func.dfg.insts[inst] {
            InstructionData::StackAddr { slot, .. } => return AliasClass::Slot(slot),
            InstructionData::GlobalAddr { global, .. } => return AliasClass::Global(global),
            InstructionData::Call { func: callee, .. } => {
                if module.functions[callee].flags.allocator {
                    return AliasClass::Alloc(inst);
                }
                return AliasClass::Unknown;
            }
            InstructionData::Binary {
                opcode: Opcode::Iadd | Opcode::Isub,
                args,
            } => {
                // Pointer arithmetic: recurse into the pointer-typed
                // operand, or the left one when neither is a pointer.
                let lhs = func.dfg.resolve_aliases(args[0]);
                let rhs = func.dfg.resolve_aliases(args[1]);
                cur = if func.dfg.value_type(rhs) == Type::Ptr
                    && func.dfg.value_type(lhs) != Type::Ptr
                {
                    rhs
                } else {
                    lhs
                };
            }
            InstructionData::Unary {
                opcode: Opcode::Uextend | Opcode::Sextend | Opcode::Ireduce,
                arg,
                ..
            } => cur = func.dfg.resolve_aliases(arg),
            _ => return AliasClass::Unknown,
        }
    }
    AliasClass::Unknown
}

/// The base of a canonical memory location.
///
/// Stack slots and globals are identified directly, so accesses through
/// distinct `stack_addr`/`global_addr` instructions to the same object
/// still compare equal; everything else is identified by its base SSA
/// value.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum MemBase {
    Slot(StackSlot),
    Global(Global),
    Value(Value),
}

/// The canonical (base, byte offset) location accessed through `addr` with
/// the instruction's own `offset` added in.
pub fn memory_key(func: &Function, addr: Value, inst_offset: i32) -> (MemBase, i64) {
    let (base, acc) = base_and_offset(func, addr);
    let offset = acc + inst_offset as i64;
    if let crate::ir::ValueDef::Result(inst, 0) = func.dfg.value_def(base) {
        match func.dfg.insts[inst] {
            InstructionData::StackAddr { slot, offset: o, .. } => {
                return (MemBase::Slot(slot), offset + o as i64);
            }
            InstructionData::GlobalAddr { global, .. } => {
                return (MemBase::Global(global), offset);
            }
            _ => {}
        }
    }
    (MemBase::Value(base), offset)
}

/// May two alias classes refer to overlapping memory?
pub fn may_alias(a: AliasClass, b: AliasClass) -> bool {
    match (a, b) {
        (AliasClass::Unknown, _) | (_, AliasClass::Unknown) => true,
        (a, b) => a == b,
    }
}

/// Redirect the single result of `inst` to `value` and unplace the
/// instruction.
pub fn replace_with_value(func: &mut Function, inst: Inst, value: Value) {
    let result = func
        .dfg
        .first_result(inst)
        .expect("replace_with_value needs a result");
    debug_assert_ne!(func.dfg.resolve_aliases(value), result);
    func.dfg.detach_inst_results(inst);
    func.dfg.change_to_alias(result, value);
    func.layout.remove_inst(inst);
}

/// Materialise an `iconst` immediately before `before`.
pub fn make_iconst_before(func: &mut Function, before: Inst, ty: Type, imm: i64) -> Value {
    let inst = func.dfg.make_inst(InstructionData::UnaryImm {
        opcode: Opcode::Iconst,
        ty,
        imm,
    });
    let value = func.dfg.make_inst_results(inst, &[ty])[0];
    func.layout.insert_inst_before(inst, before);
    value
}

/// Append `value` to every branch argument list of `pred_inst` that
/// targets `target`.
pub fn append_branch_arg(func: &mut Function, pred_inst: Inst, target: Block, value: Value) {
    let mut data = func.dfg.insts[pred_inst];
    let mut changed = false;
    for call in data.branch_destinations_mut() {
        if call.block(&func.dfg.value_lists) == target {
            call.append_argument(value, &mut func.dfg.value_lists);
            changed = true;
        }
    }
    if changed {
        func.dfg.insts[pred_inst] = data;
    }
    if let InstructionData::BranchTable { table, .. } = func.dfg.insts[pred_inst] {
        let mut jt = func.dfg.jump_tables[table].clone();
        for call in jt.all_branches_mut() {
            if call.block(&func.dfg.value_lists) == target {
                call.append_argument(value, &mut func.dfg.value_lists);
            }
        }
        func.dfg.jump_tables[table] = jt;
    }
}

/// Rewrite all alias references in the function body so later passes and
/// the printer see only resolved values.
pub fn flush_aliases(func: &mut Function) {
    for block in func.layout.block_order() {
        for inst in func.layout.block_insts(block).to_vec() {
            func.dfg.resolve_inst_aliases(inst);
        }
    }
}
