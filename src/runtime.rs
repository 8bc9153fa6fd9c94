//! The runtime blob.
//!
//! A small precompiled IR library of WASM-runtime helpers whose inlining
//! collapses lifted calls into raw operations. The blob ships with the
//! tool (embedded at build time) and can be substituted from disk with
//! `-runtime-path`; both forms are ordinary IR parsed by the module
//! loader.

use std::path::Path;

use crate::error::{Error, Result};
use crate::ir::Module;

/// The embedded runtime IR, identical to `res/wasm_runtime.sir`.
pub const WASM_RUNTIME_IR: &str = include_str!("../res/wasm_runtime.sir");

/// Parse the embedded runtime blob.
pub fn bundled() -> Module {
    crate::parser::parse_module(WASM_RUNTIME_IR).expect("embedded runtime blob parses")
}

/// Load the runtime module: from `path` when one was given, from the
/// embedded copy otherwise.
///
/// An explicitly given path that is empty or does not exist is a fatal
/// `MissingRuntime`; a file that exists but does not parse is a
/// `ParseError`.
pub fn load(path: Option<&Path>) -> Result<Module> {
    let Some(path) = path else {
        return Ok(bundled());
    };
    if path.as_os_str().is_empty() {
        return Err(Error::MissingRuntime("runtime path is empty".to_string()));
    }
    if !path.exists() {
        return Err(Error::MissingRuntime(format!(
            "{} does not exist",
            path.display()
        )));
    }
    crate::parser::parse_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;

    #[test]
    fn bundled_blob_parses_and_is_complete() {
        let module = bundled();
        for name in [
            "wasm_rt_allocate_memory",
            "wasm_rt_free_memory",
            "wasm_rt_is_initialized",
            "wasm_rt_allocate_funcref_table",
            "wasm_rt_allocate_externref_table",
            "w2c_env_DYNAMICTOP_PTR",
            "w2c_env_STACKTOP",
            "w2c_env_STACK_MAX",
            "w2c_env_memory",
            "w2c_env_memoryBase",
            "w2c_env_table",
            "w2c_env_tableBase",
        ] {
            let id = module.func_by_name(name).unwrap_or_else(|| panic!("{name} missing"));
            assert!(!module.functions[id].is_declaration(), "{name} has a body");
            assert!(
                module.functions[id].flags.always_inline,
                "{name} is always-inline"
            );
        }
        // calloc is a declaration flagged as an allocator.
        let calloc = module.func_by_name("calloc").unwrap();
        assert!(module.functions[calloc].is_declaration());
        assert!(module.functions[calloc].flags.allocator);

        // The published environment size matches the struct layout.
        let env = module.struct_by_name("w2c_env").unwrap();
        let size_global = module.global_by_name("w2c_env_size").unwrap();
        assert_eq!(
            module.globals[size_global].read_int(0, Type::I32),
            Some(module.struct_size(env) as u64)
        );

        // The memory descriptor layout the load/store shims rely on.
        let mem = module.struct_by_name("wasm_rt_memory_t").unwrap();
        assert_eq!(module.struct_size(mem), 40);
    }

    #[test]
    fn missing_runtime_path_is_fatal() {
        assert!(matches!(
            load(Some(Path::new(""))),
            Err(Error::MissingRuntime(_))
        ));
        assert!(matches!(
            load(Some(Path::new("/nonexistent/wasm_runtime.bc"))),
            Err(Error::MissingRuntime(_))
        ));
    }
}
