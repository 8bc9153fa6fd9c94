//! The entry rewriter.
//!
//! A lifted function receives its module instance through an opaque
//! pointer parameter. To let the optimiser see through every access, the
//! rewriter materialises a concrete instance on the function's own stack:
//! it allocates the `w2c_<module>` struct and the runtime environment
//! struct as stack slots, calls the runtime instantiation entrypoint on
//! them ahead of the first original instruction, and redirects every use
//! of the pointer parameter to the new allocation. The function signature
//! is left untouched for ABI compatibility; the parameter is simply dead
//! inside the body afterwards.

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::ir::{
    Function, Inst, InstructionData, Module, Opcode, StackSlotData, Type, Value, ValueList,
};

/// Names derived from the `-module-name` parameter.
pub struct ModuleNames {
    pub instance_struct: String,
    pub instantiate: String,
}

impl ModuleNames {
    pub fn new(module_name: &str) -> Self {
        Self {
            instance_struct: format!("w2c_{module_name}"),
            instantiate: format!("wasm2c_{module_name}_instantiate"),
        }
    }
}

/// The permissive wasm2c shape check.
///
/// The real predicate is reserved for future tightening (`NotWasm2C`); the
/// lifted-function convention — a single leading pointer parameter — is
/// not enforced because translator versions differ.
pub fn is_wasm2c_function(func: &Function) -> bool {
    let _ = func
        .signature
        .params
        .first()
        .map(|&ty| ty == Type::Ptr)
        .unwrap_or(false);
    true
}

/// Rewrite the entry of `func` (taken out of `module` for mutation).
///
/// Fails with `MissingStructType` when `w2c_<module>` is absent and with
/// `MissingEnvSize` when neither the environment struct type nor its
/// published size constant exist.
pub fn rewrite_entry(module: &Module, func: &mut Function, names: &ModuleNames) -> Result<()> {
    let entry = match func.layout.entry_block() {
        Some(entry) => entry,
        None => return Err(Error::MissingFunction(func.name.clone())),
    };
    let first = func
        .layout
        .first_inst(entry)
        .expect("entry block has a terminator");

    // 1. The instance struct must exist; a miss means the module name is
    //    wrong and nothing downstream can work.
    let instance_size = match module.struct_by_name(&names.instance_struct) {
        Some(id) => module.struct_size(id),
        None => return Err(Error::MissingStructType(names.instance_struct.clone())),
    };

    // 2. The environment struct, or its published size constant.
    let env_size = match module.struct_by_name("w2c_env") {
        Some(id) => module.struct_size(id),
        None => {
            let size = module
                .global_by_name("w2c_env_size")
                .and_then(|g| module.globals[g].read_int(0, Type::I32));
            match size {
                Some(size) if size > 0 => size as u32,
                _ => return Err(Error::MissingEnvSize),
            }
        }
    };

    let instantiate = match module.func_by_name(&names.instantiate) {
        Some(f) if !module.functions[f].is_declaration() => f,
        _ => return Err(Error::MissingFunction(names.instantiate.clone())),
    };

    // 3. Stack allocations, materialised ahead of the first original
    //    instruction.
    let inst_slot = func.create_stack_slot(StackSlotData::new(instance_size));
    let env_slot = func.create_stack_slot(StackSlotData::new(env_size));

    let inst_addr_inst = func.dfg.make_inst(InstructionData::StackAddr {
        opcode: Opcode::StackAddr,
        slot: inst_slot,
        offset: 0,
    });
    let inst_addr = func.dfg.make_inst_results(inst_addr_inst, &[Type::Ptr])[0];
    func.layout.insert_inst_before(inst_addr_inst, first);

    let env_addr_inst = func.dfg.make_inst(InstructionData::StackAddr {
        opcode: Opcode::StackAddr,
        slot: env_slot,
        offset: 0,
    });
    let env_addr = func.dfg.make_inst_results(env_addr_inst, &[Type::Ptr])[0];
    func.layout.insert_inst_before(env_addr_inst, first);

    // 4. Call the runtime instantiation entrypoint on both allocations.
    //    Some translator versions declare extra (wasi) parameters; those
    //    are passed as null.
    let mut call_args: SmallVec<[Value; 4]> = SmallVec::new();
    call_args.push(inst_addr);
    let params = module.functions[instantiate].signature.params.clone();
    if params.len() >= 2 {
        call_args.push(env_addr);
    }
    for &ty in params.iter().skip(2) {
        let zero = func.dfg.make_inst(InstructionData::UnaryImm {
            opcode: Opcode::Iconst,
            ty,
            imm: 0,
        });
        let value = func.dfg.make_inst_results(zero, &[ty])[0];
        func.layout.insert_inst_before(zero, first);
        call_args.push(value);
    }
    call_args.truncate(params.len());
    let args = ValueList::from_slice(&call_args, &mut func.dfg.value_lists);
    let call = func.dfg.make_inst(InstructionData::Call {
        opcode: Opcode::Call,
        func: instantiate,
        args,
    });
    let returns: SmallVec<[Type; 2]> = module.functions[instantiate]
        .signature
        .returns
        .iter()
        .copied()
        .collect();
    func.dfg.make_inst_results(call, &returns);
    func.layout.insert_inst_before(call, first);

    // 5. Redirect every use of the opaque instance pointer argument. The
    //    parameter itself stays: callers continue to pass it.
    if let Some(&param) = func.params().first() {
        if func.dfg.value_type(param) == Type::Ptr {
            replace_uses(func, param, inst_addr, call);
        }
    }

    // The optimiser must not inline this function into callers before the
    // folding is complete.
    func.flags.no_inline = true;
    func.flags.optimize_none = false;
    Ok(())
}

/// Rewrite every use of `from` to `to` in the function body, except inside
/// `skip` (the instantiation call itself, whose arguments are the fresh
/// allocations already).
fn replace_uses(func: &mut Function, from: Value, to: Value, skip: Inst) {
    for block in func.layout.block_order() {
        for inst in func.layout.block_insts(block).to_vec() {
            if inst == skip {
                continue;
            }
            func.dfg.map_inst_values(inst, |v| if v == from { to } else { v });
        }
    }
}

/// Experimental: the lifted `funcref_table_init` initialisation is not
/// fully understood. Mirroring the original's tentative behaviour, when
/// exactly one call site of `funcref_table_init` exists in the target, an
/// allocation call for the funcref table is inserted before it.
pub fn handle_funcref_table_init(module: &Module, func: &mut Function) -> Option<Inst> {
    let init = module.func_by_name("funcref_table_init")?;
    let allocate = module.func_by_name("wasm_rt_allocate_funcref_table")?;

    let mut sites: Vec<Inst> = Vec::new();
    for block in func.layout.blocks() {
        for &inst in func.layout.block_insts(block) {
            if let InstructionData::Call { func: callee, .. } = func.dfg.insts[inst] {
                if callee == init {
                    sites.push(inst);
                }
            }
        }
    }
    let [site] = sites.as_slice() else {
        return None;
    };
    let site = *site;
    log::warn!(
        "{}: experimental funcref_table_init handling engaged",
        func.name
    );

    // The table pointer is the first argument of the init call; allocate a
    // minimal table in place before it.
    let table_arg = *func.dfg.inst_args(site).first()?;
    let one = crate::opt::make_iconst_before(func, site, Type::I32, 1);
    let args = ValueList::from_slice(&[table_arg, one, one], &mut func.dfg.value_lists);
    let call = func.dfg.make_inst(InstructionData::Call {
        opcode: Opcode::Call,
        func: allocate,
        args,
    });
    func.dfg.make_inst_results(call, &[]);
    func.layout.insert_inst_before(call, site);
    Some(call)
}

/// Guarded: replace `calloc(n, m)` calls with a stack slot of `n * m`
/// bytes. Off by default — whether this is safe depends on allocation
/// sizes unknowable at rewrite time, so only constant-size sites are
/// touched even when enabled.
pub fn replace_callocs(module: &Module, func: &mut Function) -> usize {
    let mut replaced = 0;
    for block in func.layout.block_order() {
        for inst in func.layout.block_insts(block).to_vec() {
            let InstructionData::Call { func: callee, args, .. } = func.dfg.insts[inst] else {
                continue;
            };
            if module.functions[callee].name != "calloc" {
                continue;
            }
            let argv: SmallVec<[Value; 2]> =
                args.as_slice(&func.dfg.value_lists).iter().copied().collect();
            if argv.len() != 2 {
                continue;
            }
            let (Some((_, n)), Some((_, m))) = (
                crate::opt::iconst_value(func, argv[0]),
                crate::opt::iconst_value(func, argv[1]),
            ) else {
                continue;
            };
            let Some(size) = n.checked_mul(m).and_then(|s| u32::try_from(s).ok()) else {
                continue;
            };
            let slot = func.create_stack_slot(StackSlotData::new(size));
            let addr_inst = func.dfg.make_inst(InstructionData::StackAddr {
                opcode: Opcode::StackAddr,
                slot,
                offset: 0,
            });
            let addr = func.dfg.make_inst_results(addr_inst, &[Type::Ptr])[0];
            func.layout.insert_inst_before(addr_inst, inst);
            crate::opt::replace_with_value(func, inst, addr);
            replaced += 1;
        }
    }
    replaced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Signature, StructField, StructType};

    fn lifted_module() -> Module {
        let mut module = Module::new("t");
        module.declare_struct(StructType {
            name: "w2c_squanchy".to_string(),
            fields: vec![StructField::Scalar(Type::I64), StructField::Scalar(Type::I64)],
        });
        module.declare_global(crate::ir::GlobalData {
            name: "w2c_env_size".to_string(),
            ty: crate::ir::GlobalType::Scalar(Type::I32),
            init: Some(crate::ir::GlobalInit::Int(56)),
            linkage: crate::ir::Linkage::Public,
            constant: true,
        });
        let mut instantiate = Function::with_name_signature(
            "wasm2c_squanchy_instantiate",
            Signature::new(vec![Type::Ptr, Type::Ptr], vec![]),
        );
        {
            let mut b = FunctionBuilder::new(&mut instantiate);
            let block = b.create_block();
            b.append_block_param(block, Type::Ptr);
            b.append_block_param(block, Type::Ptr);
            b.switch_to_block(block);
            b.ret(&[]);
        }
        module.declare_function(instantiate);
        module
    }

    #[test]
    fn rewrites_entry_and_kills_param_uses() {
        let mut module = lifted_module();
        let mut func = Function::with_name_signature(
            "w2c_squanchy_get",
            Signature::new(vec![Type::Ptr], vec![Type::I32]),
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            let block = b.create_block();
            let inst_ptr = b.append_block_param(block, Type::Ptr);
            b.switch_to_block(block);
            let v = b.load(Type::I32, inst_ptr, 8);
            b.ret(&[v]);
        }
        let f = module.declare_function(func);
        let mut func = module.take_function(f);

        let names = ModuleNames::new("squanchy");
        rewrite_entry(&module, &mut func, &names).expect("rewrites");

        // Signature unchanged, parameter unused.
        assert_eq!(func.signature.params, vec![Type::Ptr]);
        let entry = func.layout.entry_block().unwrap();
        let param = func.dfg.block_params(entry)[0];
        for block in func.layout.blocks() {
            for &inst in func.layout.block_insts(block) {
                for v in func.dfg.inst_values(inst) {
                    assert_ne!(func.dfg.resolve_aliases(v), param, "param still used");
                }
            }
        }

        // Two stack slots (instance + env), the call placed before the
        // first original instruction.
        assert_eq!(func.stack_slots.len(), 2);
        let insts = func.layout.block_insts(entry);
        assert_eq!(func.dfg.insts[insts[2]].opcode(), Opcode::Call);
        assert_eq!(func.dfg.insts[insts[3]].opcode(), Opcode::Load);
        assert!(func.flags.no_inline);
    }

    #[test]
    fn missing_struct_type_fails() {
        let mut module = lifted_module();
        let mut func = Function::with_name_signature(
            "f",
            Signature::new(vec![Type::Ptr], vec![]),
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            let block = b.create_block();
            b.append_block_param(block, Type::Ptr);
            b.switch_to_block(block);
            b.ret(&[]);
        }
        let f = module.declare_function(func);
        let mut func = module.take_function(f);
        let names = ModuleNames::new("foo");
        match rewrite_entry(&module, &mut func, &names) {
            Err(Error::MissingStructType(name)) => assert_eq!(name, "w2c_foo"),
            other => panic!("expected MissingStructType, got {other:?}"),
        }
    }

    #[test]
    fn missing_env_size_fails() {
        let mut module = Module::new("t");
        module.declare_struct(StructType {
            name: "w2c_squanchy".to_string(),
            fields: vec![StructField::Scalar(Type::I64)],
        });
        let mut instantiate = Function::with_name_signature(
            "wasm2c_squanchy_instantiate",
            Signature::new(vec![Type::Ptr, Type::Ptr], vec![]),
        );
        {
            let mut b = FunctionBuilder::new(&mut instantiate);
            let block = b.create_block();
            b.append_block_param(block, Type::Ptr);
            b.append_block_param(block, Type::Ptr);
            b.switch_to_block(block);
            b.ret(&[]);
        }
        module.declare_function(instantiate);
        let mut func = Function::with_name_signature(
            "f",
            Signature::new(vec![Type::Ptr], vec![]),
        );
        {
            let mut b = FunctionBuilder::new(&mut func);
            let block = b.create_block();
            b.append_block_param(block, Type::Ptr);
            b.switch_to_block(block);
            b.ret(&[]);
        }
        let f = module.declare_function(func);
        let mut func = module.take_function(f);
        let names = ModuleNames::new("squanchy");
        assert!(matches!(
            rewrite_entry(&module, &mut func, &names),
            Err(Error::MissingEnvSize)
        ));
    }
}
