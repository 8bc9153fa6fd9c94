//! Small instruction predicates shared by the passes.

use crate::ir::{Function, Inst, InstructionData, Module, Opcode};

/// Does the instruction have an observable side effect besides producing its
/// result values?
///
/// Stores, branches and returns do. Calls do unless the callee is known to
/// be memory-transparent (`readnone`) — allocator calls are side-effecting
/// here and only become removable through [`is_removable_if_unused`].
pub fn has_side_effect(module: &Module, func: &Function, inst: Inst) -> bool {
    let data = &func.dfg.insts[inst];
    match data.opcode() {
        Opcode::Store | Opcode::Jump | Opcode::Brif | Opcode::BrTable | Opcode::Return => true,
        Opcode::Call => match data {
            InstructionData::Call { func: callee, .. } => !module.functions[*callee].flags.readnone,
            _ => true,
        },
        _ => false,
    }
}

/// Is the instruction removable when none of its results are used?
///
/// Pure instructions are; loads are (the lifted code never relies on a
/// load's trapping behaviour); calls to `readnone` or allocator callees are,
/// because an allocation whose address never escapes is unobservable.
pub fn is_removable_if_unused(module: &Module, func: &Function, inst: Inst) -> bool {
    let data = &func.dfg.insts[inst];
    match data.opcode() {
        op if op.is_pure() => true,
        Opcode::Load => true,
        Opcode::Call => match data {
            InstructionData::Call { func: callee, .. } => {
                let flags = module.functions[*callee].flags;
                flags.readnone || flags.allocator
            }
            _ => false,
        },
        _ => false,
    }
}

/// Is any result of `inst` marked live in `live`?
pub fn any_inst_results_used(func: &Function, inst: Inst, live: &[bool]) -> bool {
    use cranelift_entity::EntityRef;
    func.dfg
        .inst_results(inst)
        .iter()
        .any(|value| live[value.index()])
}

/// Is `inst` a call to an allocator function (`calloc`-like)?
pub fn is_allocator_call(module: &Module, func: &Function, inst: Inst) -> bool {
    match func.dfg.insts[inst] {
        InstructionData::Call { func: callee, .. } => module.functions[callee].flags.allocator,
        _ => false,
    }
}

/// Is `inst` a call to an inline-assembly barrier?
pub fn is_asm_call(module: &Module, func: &Function, inst: Inst) -> bool {
    match func.dfg.insts[inst] {
        InstructionData::Call { func: callee, .. } => module.functions[callee].flags.inline_asm,
        _ => false,
    }
}
