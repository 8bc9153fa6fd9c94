//! The pipeline driver.
//!
//! Coordinates load → link → per-function rewrite/inline/optimise →
//! extract → module-level optimise → write. Any fatal failure aborts the
//! run before anything is written; partial output is never committed
//! because writing is the last step.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::extract::{self, ExtractOptions, DATA_SEGMENT_PATTERN, RUNTIME_KEEP_PATTERNS};
use crate::inline;
use crate::ir::{normalized_triple, Func, Module};
use crate::link::link_runtime;
use crate::opt::{self, OptLimits};
use crate::rewrite::{self, ModuleNames};

/// Options for one driver invocation; field defaults mirror the CLI
/// contract.
#[derive(Clone, Debug)]
pub struct DriverOptions {
    /// Input IR path.
    pub input: PathBuf,
    /// Output IR path; stdout when absent.
    pub output: Option<PathBuf>,
    /// Target function names; empty targets every definition.
    pub functions: Vec<String>,
    /// Path to the runtime blob; the embedded copy when absent.
    pub runtime_path: Option<PathBuf>,
    /// Base name used to locate `w2c_<name>` and
    /// `wasm2c_<name>_instantiate`.
    pub module_name: String,
    /// Optimisation level; 0 disables both pipelines.
    pub opt_level: u8,
    pub verbose: bool,
    /// Enumerate definitions and exit.
    pub list_functions: bool,
    /// Whether to run the extractor.
    pub extract_function: bool,
    /// Include transitive callees when extracting.
    pub extract_recursive: bool,
    /// Suppress removal of runtime helpers.
    pub keep_wasm_runtime: bool,
    /// Replace constant-size `calloc` calls with stack buffers.
    pub replace_callocs: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output: None,
            functions: Vec::new(),
            runtime_path: None,
            module_name: "squanchy".to_string(),
            opt_level: 3,
            verbose: false,
            list_functions: false,
            extract_function: true,
            extract_recursive: false,
            keep_wasm_runtime: false,
            replace_callocs: false,
        }
    }
}

/// The deobfuscation pipeline over one input module.
pub struct Deobfuscator {
    pub module: Module,
    runtime: Module,
    options: DriverOptions,
    instruction_count_before: usize,
}

impl Deobfuscator {
    /// Load the input and the runtime module, and normalise both to the
    /// fixed target triple so they link without layout conflicts.
    pub fn new(options: DriverOptions) -> Result<Self> {
        let mut module = crate::parser::parse_file(&options.input)?;
        let mut runtime = crate::runtime::load(options.runtime_path.as_deref())?;
        module.triple = normalized_triple();
        runtime.triple = normalized_triple();
        let instruction_count_before = module.instruction_count();
        Ok(Self {
            module,
            runtime,
            options,
            instruction_count_before,
        })
    }

    /// Construct a deobfuscator over an already-parsed module. Used by the
    /// test suite; the CLI goes through [`Deobfuscator::new`].
    pub fn with_module(module: Module, options: DriverOptions) -> Result<Self> {
        let mut module = module;
        let mut runtime = crate::runtime::load(options.runtime_path.as_deref())?;
        module.triple = normalized_triple();
        runtime.triple = normalized_triple();
        let instruction_count_before = module.instruction_count();
        Ok(Self {
            module,
            runtime,
            options,
            instruction_count_before,
        })
    }

    fn progress(&self, message: impl AsRef<str>) {
        if self.options.verbose {
            eprintln!("[*] {}", message.as_ref());
        }
    }

    /// Run the pipeline to completion and write the result.
    pub fn run(&mut self) -> Result<()> {
        if self.options.list_functions {
            for id in self.module.defined_functions() {
                println!("{}", self.module.functions[id].name);
            }
            return Ok(());
        }

        // Resolve the target set against the module as loaded, before the
        // runtime's own definitions join it.
        let targets: Vec<String> = if self.options.functions.is_empty() {
            self.module
                .defined_functions()
                .into_iter()
                .map(|id| self.module.functions[id].name.clone())
                .collect()
        } else {
            for name in &self.options.functions {
                match self.module.func_by_name(name) {
                    Some(id) if !self.module.functions[id].is_declaration() => {}
                    _ => return Err(Error::MissingFunction(name.clone())),
                }
            }
            self.options.functions.clone()
        };

        let names = ModuleNames::new(&self.options.module_name);

        self.progress("Linking the runtime module");
        link_runtime(&mut self.module, &self.runtime);

        inline::stamp_always_inline(&mut self.module, &names.instantiate);

        let limits = OptLimits::unbounded();
        for name in &targets {
            let id = self
                .module
                .func_by_name(name)
                .expect("target resolved before linking");
            self.deobfuscate_function(id, &names, &limits)?;
        }

        if self.options.extract_function {
            self.progress("Extracting the deobfuscated functions");
            let mut patterns = vec![DATA_SEGMENT_PATTERN.to_string()];
            if self.options.keep_wasm_runtime {
                patterns.extend(RUNTIME_KEEP_PATTERNS.iter().map(|s| s.to_string()));
            }
            extract::extract(
                &mut self.module,
                &ExtractOptions {
                    functions: targets.clone(),
                    patterns,
                    recursive: self.options.extract_recursive,
                    delete: false,
                    keep_const_init: false,
                },
            )?;
        }

        // A whole-module pass over the (possibly pruned) working set.
        opt::optimize_module(&mut self.module, &limits, self.options.opt_level);

        // Drop the transient no-inline markers the rewriter placed.
        for name in &targets {
            if let Some(id) = self.module.func_by_name(name) {
                self.module.functions[id].flags.no_inline = false;
            }
        }

        let after = self.module.instruction_count();
        eprintln!(
            "[*] Instruction count: {} -> {}",
            self.instruction_count_before, after
        );

        self.write_output()
    }

    fn deobfuscate_function(
        &mut self,
        id: Func,
        names: &ModuleNames,
        limits: &OptLimits,
    ) -> Result<()> {
        let name = self.module.functions[id].name.clone();
        self.progress(format!("Deobfuscating function: {name}"));

        if !rewrite::is_wasm2c_function(&self.module.functions[id]) {
            return Err(Error::NotWasm2C(name));
        }

        let mut func = self.module.take_function(id);
        let result = (|| -> Result<()> {
            func.flags.optimize_none = false;

            rewrite::rewrite_entry(&self.module, &mut func, names)?;
            rewrite::handle_funcref_table_init(&self.module, &mut func);

            let inlined = inline::inline_always_inline_calls(&self.module, &mut func);
            let stripped = inline::strip_asm_side_effects(&self.module, &mut func);
            self.progress(format!(
                "{name}: inlined {inlined} call sites, stripped {stripped} asm barriers"
            ));

            if self.options.replace_callocs {
                let n = rewrite::replace_callocs(&self.module, &mut func);
                self.progress(format!("{name}: replaced {n} calloc sites"));
            }

            let count = opt::optimize_function(
                &self.module,
                &mut func,
                limits,
                self.options.opt_level,
            );
            self.progress(format!("{name}: folded to {count} instructions"));
            Ok(())
        })();
        self.module.put_function(id, func);
        result
    }

    fn write_output(&self) -> Result<()> {
        let text = crate::write::module_to_string(&self.module);
        match &self.options.output {
            Some(path) => std::fs::write(path, text).map_err(|err| {
                Error::io(format!("could not open the output file {}", path.display()), err)
            }),
            None => {
                print!("{text}");
                Ok(())
            }
        }
    }
}
