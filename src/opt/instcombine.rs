//! Instruction combining: constant folding and algebraic simplification.
//!
//! One sweep per invocation, by contract — the caller's schedule depends
//! on this pass not chasing its own fixed point, which interacts badly
//! with the store-forwarding state built around it. The convergence loop
//! around the whole schedule provides the iteration instead.

use crate::ir::{
    Function, Global, Inst, InstructionData, IntCC, Module, Opcode, StackSlot, Type, Value,
    ValueDef,
};
use crate::opt::{
    base_and_offset, iconst_value, make_iconst_before, replace_with_value, OptLimits,
};

pub fn run(module: &Module, func: &mut Function, _limits: &OptLimits) -> bool {
    let mut changed = false;
    for block in func.layout.block_order() {
        for inst in func.layout.block_insts(block).to_vec() {
            func.dfg.resolve_inst_aliases(inst);
            changed |= combine(module, func, inst);
        }
    }
    changed
}

/// Replace `inst` (single result) with a constant.
fn fold_to_const(func: &mut Function, inst: Inst, ty: Type, value: u64) -> bool {
    func.dfg.replace(
        inst,
        InstructionData::UnaryImm {
            opcode: Opcode::Iconst,
            ty,
            imm: value as i64,
        },
    );
    true
}

fn combine(module: &Module, func: &mut Function, inst: Inst) -> bool {
    match func.dfg.insts[inst] {
        InstructionData::Binary { opcode, args } => combine_binary(func, inst, opcode, args),
        InstructionData::Unary { opcode, ty, arg } => combine_unary(func, inst, opcode, ty, arg),
        InstructionData::IntCompare { cond, args, .. } => combine_icmp(func, inst, cond, args),
        InstructionData::Ternary {
            opcode: Opcode::Select,
            args,
        } => combine_select(func, inst, args),
        InstructionData::Load {
            ty, arg, offset, ..
        } => combine_load(module, func, inst, ty, arg, offset),
        _ => false,
    }
}

fn combine_binary(func: &mut Function, inst: Inst, opcode: Opcode, args: [Value; 2]) -> bool {
    let ty = func.dfg.value_type(args[0]);
    if !ty.is_int() {
        return false;
    }
    let bits = ty.bits();
    let lhs = iconst_value(func, args[0]);
    let rhs = iconst_value(func, args[1]);

    // Both constant: fold outright (division by zero stays put).
    if let (Some((_, a)), Some((_, b))) = (lhs, rhs) {
        let sext = |v: u64| -> i64 {
            if bits == 64 {
                v as i64
            } else {
                ((v << (64 - bits)) as i64) >> (64 - bits)
            }
        };
        let value = match opcode {
            Opcode::Iadd => Some(a.wrapping_add(b)),
            Opcode::Isub => Some(a.wrapping_sub(b)),
            Opcode::Imul => Some(a.wrapping_mul(b)),
            Opcode::Udiv => (b != 0).then(|| a / b),
            Opcode::Urem => (b != 0).then(|| a % b),
            Opcode::Sdiv => (b != 0).then(|| sext(a).wrapping_div(sext(b)) as u64),
            Opcode::Srem => (b != 0).then(|| sext(a).wrapping_rem(sext(b)) as u64),
            Opcode::Band => Some(a & b),
            Opcode::Bor => Some(a | b),
            Opcode::Bxor => Some(a ^ b),
            Opcode::Ishl => Some(a << (b & (bits as u64 - 1))),
            Opcode::Ushr => Some(a >> (b & (bits as u64 - 1))),
            Opcode::Sshr => Some((sext(a) >> (b & (bits as u64 - 1))) as u64),
            _ => None,
        };
        if let Some(v) = value {
            return fold_to_const(func, inst, ty, ty.wrap(v));
        }
        return false;
    }

    // Canonicalise: constant operand of a commutative operation on the
    // right.
    if opcode.is_commutative() && lhs.is_some() && rhs.is_none() {
        func.dfg.replace(
            inst,
            InstructionData::Binary {
                opcode,
                args: [args[1], args[0]],
            },
        );
        return combine_binary(func, inst, opcode, [args[1], args[0]]) || true;
    }

    // x op x.
    if args[0] == args[1] {
        match opcode {
            Opcode::Isub | Opcode::Bxor => return fold_to_const(func, inst, ty, 0),
            Opcode::Band | Opcode::Bor => {
                replace_with_value(func, inst, args[0]);
                return true;
            }
            _ => {}
        }
    }

    let Some((_, c)) = rhs else {
        return false;
    };

    // Identities with a constant on the right.
    match opcode {
        Opcode::Iadd | Opcode::Isub | Opcode::Bor | Opcode::Bxor | Opcode::Ishl | Opcode::Ushr
        | Opcode::Sshr
            if c == 0 =>
        {
            replace_with_value(func, inst, args[0]);
            return true;
        }
        Opcode::Imul | Opcode::Udiv | Opcode::Sdiv if c == 1 => {
            replace_with_value(func, inst, args[0]);
            return true;
        }
        Opcode::Imul | Opcode::Band if c == 0 => {
            return fold_to_const(func, inst, ty, 0);
        }
        Opcode::Band if c == ty.all_ones() => {
            replace_with_value(func, inst, args[0]);
            return true;
        }
        Opcode::Bor if c == ty.all_ones() => {
            return fold_to_const(func, inst, ty, ty.all_ones());
        }
        Opcode::Urem if c == 1 => {
            return fold_to_const(func, inst, ty, 0);
        }
        // Unsigned remainder by a power of two is a mask. The lifted
        // modulo-dispatch pattern depends on this shape.
        Opcode::Urem if c.is_power_of_two() => {
            let mask = make_iconst_before(func, inst, ty, (c - 1) as i64);
            func.dfg.replace(
                inst,
                InstructionData::Binary {
                    opcode: Opcode::Band,
                    args: [args[0], mask],
                },
            );
            return true;
        }
        _ => {}
    }

    // Reassociate constant-offset chains: (x + c1) + c2 => x + (c1 + c2),
    // and fold pointer arithmetic into stack addresses.
    if opcode == Opcode::Iadd {
        if let Some((slot, base_off)) = stack_addr_def(func, args[0]) {
            let total = base_off as i64 + c as i64;
            if let Ok(offset) = i32::try_from(total) {
                func.dfg.replace(
                    inst,
                    InstructionData::StackAddr {
                        opcode: Opcode::StackAddr,
                        slot,
                        offset,
                    },
                );
                return true;
            }
        }
        let (base, total) = base_and_offset(func, func.dfg.first_result(inst).unwrap());
        if base != args[0] {
            let c2 = make_iconst_before(func, inst, ty, total);
            func.dfg.replace(
                inst,
                InstructionData::Binary {
                    opcode: Opcode::Iadd,
                    args: [base, c2],
                },
            );
            return true;
        }
    }
    false
}

fn stack_addr_def(func: &Function, value: Value) -> Option<(StackSlot, i32)> {
    match func.dfg.value_def(value) {
        ValueDef::Result(inst, 0) => match func.dfg.insts[inst] {
            InstructionData::StackAddr { slot, offset, .. } => Some((slot, offset)),
            _ => None,
        },
        _ => None,
    }
}

fn combine_unary(func: &mut Function, inst: Inst, opcode: Opcode, ty: Type, arg: Value) -> bool {
    if let Some((from_ty, a)) = iconst_value(func, arg) {
        let value = match opcode {
            Opcode::Uextend => Some(a),
            Opcode::Sextend => {
                let bits = from_ty.bits();
                let s = ((a << (64 - bits)) as i64) >> (64 - bits);
                Some(s as u64)
            }
            Opcode::Ireduce => Some(a),
            Opcode::Bnot => Some(!a),
            Opcode::Ineg => Some(a.wrapping_neg()),
            _ => None,
        };
        if let Some(v) = value {
            return fold_to_const(func, inst, ty, ty.wrap(v));
        }
    }
    // ireduce(uextend(x)) and ireduce(sextend(x)) back to the original
    // width are the identity.
    if opcode == Opcode::Ireduce {
        if let ValueDef::Result(def, 0) = func.dfg.value_def(arg) {
            if let InstructionData::Unary {
                opcode: Opcode::Uextend | Opcode::Sextend,
                arg: inner,
                ..
            } = func.dfg.insts[def]
            {
                if func.dfg.value_type(inner) == ty {
                    replace_with_value(func, inst, inner);
                    return true;
                }
            }
        }
    }
    false
}

fn combine_icmp(func: &mut Function, inst: Inst, cond: IntCC, args: [Value; 2]) -> bool {
    let ty = func.dfg.value_type(args[0]);
    if !ty.is_int() {
        return false;
    }
    if let (Some((_, a)), Some((_, b))) = (iconst_value(func, args[0]), iconst_value(func, args[1]))
    {
        let result = cond.evaluate(a, b, ty.bits());
        return fold_to_const(func, inst, Type::I8, result as u64);
    }
    if args[0] == args[1] {
        let result = matches!(
            cond,
            IntCC::Equal
                | IntCC::SignedGreaterThanOrEqual
                | IntCC::SignedLessThanOrEqual
                | IntCC::UnsignedGreaterThanOrEqual
                | IntCC::UnsignedLessThanOrEqual
        );
        return fold_to_const(func, inst, Type::I8, result as u64);
    }
    false
}

fn combine_select(func: &mut Function, inst: Inst, args: [Value; 3]) -> bool {
    if let Some((_, c)) = iconst_value(func, args[0]) {
        let arm = if c != 0 { args[1] } else { args[2] };
        replace_with_value(func, inst, arm);
        return true;
    }
    if args[1] == args[2] {
        replace_with_value(func, inst, args[1]);
        return true;
    }
    false
}

/// Loads from constant globals fold to the initializer bytes.
fn combine_load(
    module: &Module,
    func: &mut Function,
    inst: Inst,
    ty: Type,
    addr: Value,
    offset: i32,
) -> bool {
    if !ty.is_int() {
        return false;
    }
    let Some((global, total)) = const_global_target(func, addr, offset) else {
        return false;
    };
    let Ok(offset) = u32::try_from(total) else {
        return false;
    };
    match module.globals[global].read_int(offset, ty) {
        Some(v) => fold_to_const(func, inst, ty, v),
        None => false,
    }
}

fn const_global_target(func: &Function, addr: Value, offset: i32) -> Option<(Global, i64)> {
    let (base, acc) = base_and_offset(func, addr);
    match func.dfg.value_def(base) {
        ValueDef::Result(def, 0) => match func.dfg.insts[def] {
            InstructionData::GlobalAddr { global, .. } => Some((global, acc + offset as i64)),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, GlobalData, GlobalInit, GlobalType, Linkage, Signature};

    fn with_body(
        module: &Module,
        build: impl FnOnce(&mut FunctionBuilder),
    ) -> Function {
        let _ = module;
        let mut func = Function::with_name_signature(
            "f",
            Signature::new(vec![Type::I32], vec![Type::I32]),
        );
        let mut b = FunctionBuilder::new(&mut func);
        let block = b.create_block();
        b.append_block_param(block, Type::I32);
        b.switch_to_block(block);
        build(&mut b);
        func
    }

    fn returned_const(func: &Function) -> Option<u64> {
        let block = func.layout.entry_block()?;
        let ret = func.layout.last_inst(block)?;
        let arg = func.dfg.resolve_aliases(func.dfg.inst_args(ret)[0]);
        iconst_value(func, arg).map(|(_, v)| v)
    }

    #[test]
    fn folds_constants() {
        let module = Module::new("t");
        let mut func = with_body(&module, |b| {
            let x = b.iconst(Type::I32, 6);
            let y = b.iconst(Type::I32, 7);
            let m = b.imul(x, y);
            b.ret(&[m]);
        });
        assert!(run(&module, &mut func, &OptLimits::default()));
        assert_eq!(returned_const(&func), Some(42));
    }

    #[test]
    fn urem_power_of_two_becomes_mask() {
        let module = Module::new("t");
        let mut func = with_body(&module, |b| {
            let x = b.func.params()[0];
            let four = b.iconst(Type::I32, 4);
            let m = b.urem(x, four);
            b.ret(&[m]);
        });
        assert!(run(&module, &mut func, &OptLimits::default()));
        let block = func.layout.entry_block().unwrap();
        let ops: Vec<Opcode> = func
            .layout
            .block_insts(block)
            .iter()
            .map(|&i| func.dfg.insts[i].opcode())
            .collect();
        assert!(ops.contains(&Opcode::Band));
        assert!(!ops.contains(&Opcode::Urem));
    }

    #[test]
    fn iadd_folds_into_stack_addr() {
        let module = Module::new("t");
        let mut func = Function::with_name_signature("f", Signature::new(vec![], vec![]));
        {
            let mut b = FunctionBuilder::new(&mut func);
            let slot = b.func.create_stack_slot(crate::ir::StackSlotData::new(64));
            let block = b.create_block();
            b.switch_to_block(block);
            let base = b.stack_addr(slot, 8);
            let c = b.iconst(Type::Ptr, 16);
            let p = b.iadd(base, c);
            let v = b.iconst(Type::I32, 1);
            b.store(Type::I32, v, p, 0);
            b.ret(&[]);
        }
        assert!(run(&module, &mut func, &OptLimits::default()));
        let block = func.layout.entry_block().unwrap();
        let addrs: Vec<i32> = func
            .layout
            .block_insts(block)
            .iter()
            .filter_map(|&i| match func.dfg.insts[i] {
                InstructionData::StackAddr { offset, .. } => Some(offset),
                _ => None,
            })
            .collect();
        assert!(addrs.contains(&24));
    }

    #[test]
    fn const_global_load_folds() {
        let mut module = Module::new("t");
        let g = module.declare_global(GlobalData {
            name: "w2c_env_size".to_string(),
            ty: GlobalType::Scalar(Type::I32),
            init: Some(GlobalInit::Int(56)),
            linkage: Linkage::Public,
            constant: true,
        });
        let mut func = Function::with_name_signature("f", Signature::new(vec![], vec![Type::I32]));
        {
            let mut b = FunctionBuilder::new(&mut func);
            let block = b.create_block();
            b.switch_to_block(block);
            let addr = b.global_addr(g);
            let v = b.load(Type::I32, addr, 0);
            b.ret(&[v]);
        }
        assert!(run(&module, &mut func, &OptLimits::default()));
        assert_eq!(returned_const(&func), Some(56));
    }
}
