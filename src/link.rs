//! The runtime linker.
//!
//! Merges a clone of the runtime module into the target module under the
//! policy "definitions from the runtime override any same-named
//! declarations or weak definitions already in the target"; identically
//! named strong definitions in the target are kept. Struct types unify by
//! name. After linking, the target owns the runtime's globals and
//! functions, with all references in migrated bodies remapped into the
//! target's entity spaces.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;

use crate::ir::{
    Func, Function, Global, InstructionData, Linkage, Module, StructField, StructId,
};

/// Link `runtime` into `target`. The runtime module is cloned internally
/// and left untouched.
pub fn link_runtime(target: &mut Module, runtime: &Module) {
    let runtime = runtime.clone();

    // Struct types unify by name; unknown ones migrate.
    let mut struct_map: SecondaryMap<StructId, PackedOption<StructId>> = SecondaryMap::new();
    let mut migrated_structs: Vec<StructId> = Vec::new();
    for (id, st) in runtime.structs.iter() {
        let mapped = match target.struct_by_name(&st.name) {
            Some(existing) => existing,
            None => {
                let new = target.declare_struct(st.clone());
                migrated_structs.push(new);
                new
            }
        };
        struct_map[id] = Some(mapped).into();
    }
    // Second pass: nested struct references inside migrated types still
    // hold runtime ids; rewrite them. Pre-existing target types are left
    // alone.
    for mapped in migrated_structs {
        let mut fields = target.structs[mapped].fields.clone();
        for field in &mut fields {
            if let StructField::Named(inner) = field {
                *inner = struct_map[*inner].expand().expect("nested struct was linked");
            }
        }
        target.structs[mapped].fields = fields;
    }

    // Globals: runtime definitions override target declarations and weak
    // definitions.
    let mut global_map: SecondaryMap<Global, PackedOption<Global>> = SecondaryMap::new();
    for (id, data) in runtime.globals.iter() {
        let mapped = match target.global_by_name(&data.name) {
            Some(existing) => {
                let keep_target = !target.globals[existing].is_declaration()
                    && target.globals[existing].linkage != Linkage::Weak;
                let runtime_defines = !data.is_declaration();
                if runtime_defines && !keep_target {
                    target.globals[existing] = data.clone();
                }
                existing
            }
            None => target.declare_global(data.clone()),
        };
        global_map[id] = Some(mapped).into();
    }

    // Functions, same policy. Bodies are remapped afterwards so mutual
    // references inside the runtime stay consistent.
    let mut func_map: SecondaryMap<Func, PackedOption<Func>> = SecondaryMap::new();
    let mut migrated: Vec<Func> = Vec::new();
    for (id, func) in runtime.functions.iter() {
        let mapped = match target.func_by_name(&func.name) {
            Some(existing) => {
                let keep_target = !target.functions[existing].is_declaration()
                    && target.functions[existing].linkage != Linkage::Weak;
                let runtime_defines = !func.is_declaration();
                if runtime_defines && !keep_target {
                    target.functions[existing] = func.clone();
                    migrated.push(existing);
                }
                existing
            }
            None => {
                let new = target.declare_function(func.clone());
                if !func.is_declaration() {
                    migrated.push(new);
                }
                new
            }
        };
        func_map[id] = Some(mapped).into();
    }

    for id in migrated {
        let mut func = target.take_function(id);
        remap_body(&mut func, &func_map, &global_map);
        target.put_function(id, func);
    }
}

/// Rewrite callee and global references of a function migrated from the
/// runtime module.
fn remap_body(
    func: &mut Function,
    func_map: &SecondaryMap<Func, PackedOption<Func>>,
    global_map: &SecondaryMap<Global, PackedOption<Global>>,
) {
    for block in func.layout.block_order() {
        for inst in func.layout.block_insts(block).to_vec() {
            match &mut func.dfg.insts[inst] {
                InstructionData::Call { func: callee, .. } => {
                    *callee = func_map[*callee].expand().expect("callee was linked");
                }
                InstructionData::FuncAddr { func: f, .. } => {
                    *f = func_map[*f].expand().expect("function was linked");
                }
                InstructionData::GlobalAddr { global, .. } => {
                    *global = global_map[*global].expand().expect("global was linked");
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, GlobalData, GlobalInit, GlobalType, Signature, Type};

    fn define(module: &mut Module, name: &str, value: i64) -> Func {
        let mut func =
            Function::with_name_signature(name, Signature::new(vec![], vec![Type::I32]));
        {
            let mut b = FunctionBuilder::new(&mut func);
            let block = b.create_block();
            b.switch_to_block(block);
            let v = b.iconst(Type::I32, value);
            b.ret(&[v]);
        }
        module.declare_function(func)
    }

    #[test]
    fn runtime_overrides_declarations_but_not_strong_defs() {
        let mut target = Module::new("target");
        // Declaration in the target: will be overridden.
        target.declare_function(Function::with_name_signature(
            "wasm_rt_is_initialized",
            Signature::new(vec![], vec![Type::I32]),
        ));
        // Strong definition in the target: kept.
        define(&mut target, "strong", 1);

        let mut runtime = Module::new("runtime");
        define(&mut runtime, "wasm_rt_is_initialized", 1);
        define(&mut runtime, "strong", 99);
        define(&mut runtime, "extra_helper", 7);

        link_runtime(&mut target, &runtime);

        let is_init = target.func_by_name("wasm_rt_is_initialized").unwrap();
        assert!(!target.functions[is_init].is_declaration());
        let strong = target.func_by_name("strong").unwrap();
        // The strong definition still returns 1 (one iconst of 1).
        let entry = target.functions[strong].layout.entry_block().unwrap();
        let first = target.functions[strong].layout.first_inst(entry).unwrap();
        match target.functions[strong].dfg.insts[first] {
            InstructionData::UnaryImm { imm, .. } => assert_eq!(imm, 1),
            ref other => panic!("unexpected {other:?}"),
        }
        assert!(target.func_by_name("extra_helper").is_some());
    }

    #[test]
    fn migrated_bodies_are_remapped() {
        let mut target = Module::new("target");
        // Give the target a few functions so entity indices diverge.
        define(&mut target, "pad0", 0);
        define(&mut target, "pad1", 0);

        let mut runtime = Module::new("runtime");
        let g = runtime.declare_global(GlobalData {
            name: "w2c_env_size".to_string(),
            ty: GlobalType::Scalar(Type::I32),
            init: Some(GlobalInit::Int(56)),
            linkage: Linkage::Public,
            constant: true,
        });
        let inner = define(&mut runtime, "inner", 3);
        let mut outer =
            Function::with_name_signature("outer", Signature::new(vec![], vec![Type::I32]));
        {
            let mut b = FunctionBuilder::new(&mut outer);
            let block = b.create_block();
            b.switch_to_block(block);
            let addr = b.global_addr(g);
            let x = b.load(Type::I32, addr, 0);
            let call = b.call(inner, &[], &[Type::I32]);
            let y = b.func.dfg.first_result(call).unwrap();
            let sum = b.iadd(x, y);
            b.ret(&[sum]);
        }
        runtime.declare_function(outer);

        link_runtime(&mut target, &runtime);

        let outer = target.func_by_name("outer").unwrap();
        let inner = target.func_by_name("inner").unwrap();
        let g = target.global_by_name("w2c_env_size").unwrap();
        let func = &target.functions[outer];
        let mut saw_call = false;
        let mut saw_global = false;
        for block in func.layout.blocks() {
            for &inst in func.layout.block_insts(block) {
                match func.dfg.insts[inst] {
                    InstructionData::Call { func: callee, .. } => {
                        assert_eq!(callee, inner);
                        saw_call = true;
                    }
                    InstructionData::GlobalAddr { global, .. } => {
                        assert_eq!(global, g);
                        saw_global = true;
                    }
                    _ => {}
                }
            }
        }
        assert!(saw_call && saw_global);
    }
}
