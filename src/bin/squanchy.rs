//! Command-line front-end for the deobfuscation pipeline.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use squanchy::{Deobfuscator, DriverOptions};

/// Deobfuscator for wasm2c-lifted IR modules.
#[derive(Parser, Debug)]
#[clap(name = "squanchy", version, about)]
struct Args {
    /// Input IR file.
    #[clap(value_name = "INPUT")]
    input: PathBuf,

    /// Output IR filename; stdout if absent.
    #[clap(short = 'o', value_name = "FILENAME")]
    output: Option<PathBuf>,

    /// Function names to deobfuscate (default all).
    #[clap(
        short = 'f',
        value_name = "FUNCTION",
        action = clap::ArgAction::Append
    )]
    functions: Vec<String>,

    /// Path to the squanchy runtime; the embedded copy if absent.
    #[clap(long = "runtime-path", value_name = "PATH")]
    runtime_path: Option<PathBuf>,

    /// Base name used to locate w2c_<name> and wasm2c_<name>_instantiate.
    #[clap(long = "module-name", value_name = "IDENT", default_value = "squanchy")]
    module_name: String,

    /// Optimization level (0 disables the optimisation pipelines).
    #[clap(short = 'O', value_name = "LEVEL", default_value_t = 3)]
    opt_level: u8,

    /// Print verbose output.
    #[clap(short = 'v')]
    verbose: bool,

    /// Enumerate function definitions and exit.
    #[clap(long = "list-functions")]
    list_functions: bool,

    /// Run the extractor over the deobfuscated functions.
    #[clap(
        long = "extract-function",
        value_name = "BOOL",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    extract_function: bool,

    /// Include transitive callees when extracting.
    #[clap(
        long = "extract-recursive",
        value_name = "BOOL",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    extract_recursive: bool,

    /// Keep WASM runtime functions in the output.
    #[clap(long = "keep-wasm-runtime")]
    keep_wasm_runtime: bool,

    /// Replace constant-size calloc calls with stack buffers (may
    /// misbehave on large allocations).
    #[clap(long = "replace-callocs")]
    replace_callocs: bool,
}

impl Args {
    fn into_options(self) -> DriverOptions {
        DriverOptions {
            input: self.input,
            output: self.output,
            functions: self.functions,
            runtime_path: self.runtime_path,
            module_name: self.module_name,
            opt_level: self.opt_level.min(3),
            verbose: self.verbose,
            list_functions: self.list_functions,
            extract_function: self.extract_function,
            extract_recursive: self.extract_recursive,
            keep_wasm_runtime: self.keep_wasm_runtime,
            replace_callocs: self.replace_callocs,
        }
    }
}

fn run(args: Args) -> Result<()> {
    let mut deobfuscator = Deobfuscator::new(args.into_options())?;
    deobfuscator.run()?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[!] {err}");
            ExitCode::FAILURE
        }
    }
}
