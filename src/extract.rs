//! Keep-set extraction.
//!
//! After the target functions are folded, everything they no longer depend
//! on is deleted from the module: named functions and globals matching the
//! keep patterns survive, optionally together with their transitive
//! callees, and a final global-DCE plus dead-prototype strip leaves only
//! the closure. A delete mode offers the inverse operation.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;
use regex::Regex;
use rustc_hash::FxHashSet;

use crate::error::{Error, Result};
use crate::ir::{Func, Function, Global, InstructionData, Linkage, Module};

/// The default keep pattern: wasm2c data-segment globals.
pub const DATA_SEGMENT_PATTERN: &str = "^data_segment_data_.*";

/// Patterns added by `-keep-wasm-runtime`.
pub const RUNTIME_KEEP_PATTERNS: &[&str] = &["^wasm_rt_", "^w2c_env", "^wasm2c_"];

#[derive(Clone, Debug, Default)]
pub struct ExtractOptions {
    /// Function names to keep. A missing name aborts with `MissingName`.
    pub functions: Vec<String>,
    /// Regular expressions over global-value names (globals and functions
    /// both) to keep.
    pub patterns: Vec<String>,
    /// Include transitive callees of kept functions.
    pub recursive: bool,
    /// Inverse operation: delete exactly the keep-set.
    pub delete: bool,
    /// In delete mode, preserve the initializers of constants.
    pub keep_const_init: bool,
}

/// Run the extraction over `module`.
pub fn extract(module: &mut Module, options: &ExtractOptions) -> Result<()> {
    let mut keep_funcs: FxHashSet<Func> = FxHashSet::default();
    let mut keep_globals: FxHashSet<Global> = FxHashSet::default();

    for name in &options.functions {
        match module.func_by_name(name) {
            Some(id) => {
                keep_funcs.insert(id);
            }
            None => return Err(Error::MissingName(name.clone())),
        }
    }

    for pattern in &options.patterns {
        let regex = Regex::new(pattern).map_err(|e| Error::BadPattern {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;
        let mut matched = false;
        for (id, g) in module.globals.iter() {
            if regex.is_match(&g.name) {
                keep_globals.insert(id);
                matched = true;
            }
        }
        for (id, f) in module.functions.iter() {
            if regex.is_match(&f.name) {
                keep_funcs.insert(id);
                matched = true;
            }
        }
        if !matched {
            // llvm-extract aborts here; a pipeline-internal pattern (the
            // data-segment default) legitimately matches nothing in small
            // modules, so a miss is only reported.
            log::debug!("extraction pattern '{pattern}' matched nothing");
        }
    }

    if options.recursive {
        let mut worklist: Vec<Func> = keep_funcs.iter().copied().collect();
        while let Some(id) = worklist.pop() {
            for callee in callees(&module.functions[id]) {
                if module.functions[callee].is_declaration() {
                    continue;
                }
                if keep_funcs.insert(callee) {
                    worklist.push(callee);
                }
            }
        }
    }

    if options.delete {
        // Drop exactly the keep-set.
        for id in module.functions.keys().collect::<Vec<_>>() {
            if keep_funcs.contains(&id) {
                clear_body(&mut module.functions[id]);
            }
        }
        for id in module.globals.keys().collect::<Vec<_>>() {
            if keep_globals.contains(&id) {
                let g = &mut module.globals[id];
                if !(options.keep_const_init && g.constant) {
                    g.init = None;
                }
            }
        }
    } else {
        // Turn everything outside the keep-set into declarations; kept
        // values are exported so global DCE can root from them.
        for id in module.functions.keys().collect::<Vec<_>>() {
            if keep_funcs.contains(&id) {
                module.functions[id].linkage = Linkage::Public;
            } else {
                clear_body(&mut module.functions[id]);
            }
        }
        for id in module.globals.keys().collect::<Vec<_>>() {
            let g = &mut module.globals[id];
            if keep_globals.contains(&id) {
                g.linkage = Linkage::Public;
            } else if !(options.keep_const_init && g.constant) {
                g.init = None;
            }
        }
    }

    global_dce(module);
    Ok(())
}

fn clear_body(func: &mut Function) {
    let name = func.name.clone();
    let signature = func.signature.clone();
    let flags = func.flags;
    let linkage = func.linkage;
    *func = Function::with_name_signature(name, signature);
    func.flags = flags;
    func.linkage = linkage;
}

fn callees(func: &Function) -> Vec<Func> {
    let mut out = Vec::new();
    for block in func.layout.blocks() {
        for &inst in func.layout.block_insts(block) {
            match func.dfg.insts[inst] {
                InstructionData::Call { func: callee, .. }
                | InstructionData::FuncAddr { func: callee, .. } => out.push(callee),
                _ => {}
            }
        }
    }
    out
}

/// Global dead-code elimination with dead-prototype stripping.
///
/// Roots are the exported (non-local) definitions; everything reachable
/// from a root survives. Unreferenced local definitions and unreferenced
/// declarations are dropped, and the module is rebuilt with compact entity
/// tables.
pub fn global_dce(module: &mut Module) {
    let mut live_funcs: FxHashSet<Func> = FxHashSet::default();
    let mut live_globals: FxHashSet<Global> = FxHashSet::default();

    let mut worklist: Vec<Func> = Vec::new();
    for (id, func) in module.functions.iter() {
        if !func.is_declaration() && func.linkage != Linkage::Local {
            live_funcs.insert(id);
            worklist.push(id);
        }
    }
    for (id, g) in module.globals.iter() {
        if !g.is_declaration() && g.linkage != Linkage::Local {
            live_globals.insert(id);
        }
    }

    while let Some(id) = worklist.pop() {
        let func = &module.functions[id];
        for block in func.layout.blocks() {
            for &inst in func.layout.block_insts(block) {
                match func.dfg.insts[inst] {
                    InstructionData::Call { func: callee, .. }
                    | InstructionData::FuncAddr { func: callee, .. } => {
                        if live_funcs.insert(callee) {
                            worklist.push(callee);
                        }
                    }
                    InstructionData::GlobalAddr { global, .. } => {
                        live_globals.insert(global);
                    }
                    _ => {}
                }
            }
        }
    }

    rebuild(module, &live_funcs, &live_globals);
}

/// Rebuild the module keeping only the live sets, remapping every
/// reference in surviving bodies.
fn rebuild(module: &mut Module, live_funcs: &FxHashSet<Func>, live_globals: &FxHashSet<Global>) {
    let old = std::mem::replace(module, Module::new(""));
    module.name = old.name.clone();
    module.triple = old.triple.clone();
    module.structs = old.structs.clone();

    let mut global_map: SecondaryMap<Global, PackedOption<Global>> = SecondaryMap::new();
    for (id, g) in old.globals.iter() {
        if live_globals.contains(&id) {
            global_map[id] = Some(module.declare_global(g.clone())).into();
        }
    }
    let mut func_map: SecondaryMap<Func, PackedOption<Func>> = SecondaryMap::new();
    for (id, f) in old.functions.iter() {
        if live_funcs.contains(&id) {
            func_map[id] = Some(module.declare_function(f.clone())).into();
        }
    }

    for id in module.functions.keys().collect::<Vec<_>>() {
        let mut func = module.take_function(id);
        for block in func.layout.block_order() {
            for inst in func.layout.block_insts(block).to_vec() {
                match &mut func.dfg.insts[inst] {
                    InstructionData::Call { func: callee, .. }
                    | InstructionData::FuncAddr { func: callee, .. } => {
                        *callee = func_map[*callee].expand().expect("live callee survives");
                    }
                    InstructionData::GlobalAddr { global, .. } => {
                        *global = global_map[*global].expand().expect("live global survives");
                    }
                    _ => {}
                }
            }
        }
        module.put_function(id, func);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, GlobalData, GlobalInit, GlobalType, Signature, Type};

    /// f calls g calls h; u is unrelated; one data-segment global.
    fn chain_module() -> Module {
        let mut module = Module::new("t");
        module.declare_global(GlobalData {
            name: "data_segment_data_w2c_squanchy_d0".to_string(),
            ty: GlobalType::Bytes(4),
            init: Some(GlobalInit::Bytes(vec![1, 2, 3, 4])),
            linkage: Linkage::Public,
            constant: true,
        });
        let mut h = Function::with_name_signature("h", Signature::new(vec![], vec![Type::I32]));
        {
            let mut b = FunctionBuilder::new(&mut h);
            let block = b.create_block();
            b.switch_to_block(block);
            let v = b.iconst(Type::I32, 3);
            b.ret(&[v]);
        }
        let h = module.declare_function(h);
        let mut g = Function::with_name_signature("g", Signature::new(vec![], vec![Type::I32]));
        {
            let mut b = FunctionBuilder::new(&mut g);
            let block = b.create_block();
            b.switch_to_block(block);
            let call = b.call(h, &[], &[Type::I32]);
            let v = b.func.dfg.first_result(call).unwrap();
            b.ret(&[v]);
        }
        let g = module.declare_function(g);
        let mut f = Function::with_name_signature("f", Signature::new(vec![], vec![Type::I32]));
        {
            let mut b = FunctionBuilder::new(&mut f);
            let block = b.create_block();
            b.switch_to_block(block);
            let call = b.call(g, &[], &[Type::I32]);
            let v = b.func.dfg.first_result(call).unwrap();
            b.ret(&[v]);
        }
        module.declare_function(f);
        let mut u = Function::with_name_signature("u", Signature::new(vec![], vec![]));
        {
            let mut b = FunctionBuilder::new(&mut u);
            let block = b.create_block();
            b.switch_to_block(block);
            b.ret(&[]);
        }
        module.declare_function(u);
        module
    }

    #[test]
    fn recursive_extraction_keeps_the_closure() {
        let mut module = chain_module();
        let options = ExtractOptions {
            functions: vec!["f".to_string()],
            patterns: vec![DATA_SEGMENT_PATTERN.to_string()],
            recursive: true,
            ..Default::default()
        };
        extract(&mut module, &options).expect("extracts");

        for name in ["f", "g", "h"] {
            let id = module.func_by_name(name).expect(name);
            assert!(!module.functions[id].is_declaration(), "{name} kept");
        }
        assert!(module.func_by_name("u").is_none(), "u removed");
        assert!(module
            .global_by_name("data_segment_data_w2c_squanchy_d0")
            .is_some());
    }

    #[test]
    fn non_recursive_extraction_declares_callees() {
        let mut module = chain_module();
        let options = ExtractOptions {
            functions: vec!["f".to_string()],
            recursive: false,
            ..Default::default()
        };
        extract(&mut module, &options).expect("extracts");
        let f = module.func_by_name("f").unwrap();
        assert!(!module.functions[f].is_declaration());
        let g = module.func_by_name("g").expect("g survives as a prototype");
        assert!(module.functions[g].is_declaration());
        assert!(module.func_by_name("h").is_none(), "h unreferenced");
    }

    #[test]
    fn missing_name_aborts() {
        let mut module = chain_module();
        let options = ExtractOptions {
            functions: vec!["nope".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            extract(&mut module, &options),
            Err(Error::MissingName(_))
        ));
    }

    #[test]
    fn bad_pattern_aborts() {
        let mut module = chain_module();
        let options = ExtractOptions {
            patterns: vec!["([".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            extract(&mut module, &options),
            Err(Error::BadPattern { .. })
        ));
    }

    #[test]
    fn extraction_is_idempotent() {
        let mut module = chain_module();
        let options = ExtractOptions {
            functions: vec!["f".to_string()],
            patterns: vec![DATA_SEGMENT_PATTERN.to_string()],
            recursive: true,
            ..Default::default()
        };
        extract(&mut module, &options).expect("first");
        let first = crate::write::module_to_string(&module);
        extract(&mut module, &options).expect("second");
        let second = crate::write::module_to_string(&module);
        assert_eq!(first, second);
    }
}
