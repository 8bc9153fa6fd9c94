//! Squanchy undoes the damage done by lifting a WebAssembly module to IR
//! through wasm2c: it links a synthetic runtime into the lifted module,
//! materialises the module instance on the stack of a target function,
//! force-inlines the runtime helpers, and folds the result with a custom
//! optimisation schedule until the function looks like a direct compilation
//! of the original source again.
//!
//! The crate is organised like a small compiler backend:
//!
//! * [`ir`] — the SSA intermediate representation (modules, functions,
//!   data flow graph, layout) together with a textual format.
//! * [`opt`] — the optimisation engine: individual rewrite passes and the
//!   convergence-loop pipelines that drive them.
//! * [`inline`] — the always-inline director used to collapse runtime
//!   helpers into the target function.
//! * [`rewrite`] — the entry rewriter that replaces the opaque instance
//!   pointer argument with a stack allocation.
//! * [`link`] — the runtime linker merging the runtime blob into the input.
//! * [`extract`] — keep-set extraction of the deobfuscated functions.
//! * [`driver`] — the end-to-end pipeline behind the CLI.

pub mod dominator_tree;
pub mod driver;
pub mod error;
pub mod extract;
pub mod flowgraph;
pub mod inline;
pub mod inst_predicates;
pub mod ir;
pub mod link;
pub mod opt;
pub mod parser;
pub mod rewrite;
pub mod runtime;
pub mod write;

pub use crate::driver::{Deobfuscator, DriverOptions};
pub use crate::error::{Error, ParseError, Result};

/// The WASM page size, in bytes. Fixed by the WebAssembly specification and
/// baked into the runtime blob's allocators.
pub const PAGE_SIZE: u64 = 65536;
