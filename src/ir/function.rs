//! Intermediate representation of a function.

use core::fmt;

use cranelift_entity::PrimaryMap;

use super::dfg::DataFlowGraph;
use super::entities::{StackSlot, Value};
use super::layout::Layout;
use super::types::Type;

/// A function signature: parameter and return types.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct Signature {
    pub params: Vec<Type>,
    pub returns: Vec<Type>,
}

impl Signature {
    pub fn new(params: Vec<Type>, returns: Vec<Type>) -> Self {
        Self { params, returns }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ")")?;
        for (i, r) in self.returns.iter().enumerate() {
            write!(f, "{}{r}", if i == 0 { " -> " } else { ", " })?;
        }
        Ok(())
    }
}

/// Per-function attribute hints.
///
/// `always_inline` and `no_inline` drive the inlining director; `optimize_none`
/// is honoured (and stripped from the target) by the driver. The remaining
/// flags describe declarations: an `inline_asm` callee is an optimisation
/// barrier planted by the lifter, an `allocator` is calloc-like (fresh,
/// zero-initialised, side-effect free when its result is unused) and a
/// `readnone` callee does not touch memory at all.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct FunctionFlags {
    pub always_inline: bool,
    pub no_inline: bool,
    pub optimize_none: bool,
    pub inline_asm: bool,
    pub allocator: bool,
    pub readnone: bool,
}

/// Linkage of a function or global.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Linkage {
    /// Visible outside the module. The default.
    #[default]
    Public,
    /// Only visible inside the module; removable once unreferenced.
    Local,
    /// A definition that any other same-named definition may override.
    Weak,
}

/// A stack slot: a fixed-size allocation in the function's frame.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StackSlotData {
    /// Size of the slot in bytes.
    pub size: u32,
}

impl StackSlotData {
    pub fn new(size: u32) -> Self {
        Self { size }
    }
}

/// A function: signature, attributes, and (for definitions) a body.
///
/// A function without any block in its layout is a declaration; the linker
/// is allowed to replace it wholesale with a definition of the same name.
#[derive(Clone)]
pub struct Function {
    /// Symbol name of the function.
    pub name: String,

    pub signature: Signature,

    pub flags: FunctionFlags,

    pub linkage: Linkage,

    /// Stack slots allocated in this function.
    pub stack_slots: PrimaryMap<StackSlot, StackSlotData>,

    /// The primary definition of all instructions, blocks and values.
    pub dfg: DataFlowGraph,

    /// Program order of blocks and instructions.
    pub layout: Layout,
}

impl Default for Function {
    fn default() -> Self {
        Self::with_name_signature("", Signature::default())
    }
}

impl Function {
    /// Create a named function with a signature and no body.
    pub fn with_name_signature(name: impl Into<String>, signature: Signature) -> Self {
        Self {
            name: name.into(),
            signature,
            flags: FunctionFlags::default(),
            linkage: Linkage::default(),
            stack_slots: PrimaryMap::new(),
            dfg: DataFlowGraph::new(),
            layout: Layout::new(),
        }
    }

    /// Is this a declaration (signature only, no body)?
    pub fn is_declaration(&self) -> bool {
        self.layout.entry_block().is_none()
    }

    /// Create a stack slot of `size` bytes.
    pub fn create_stack_slot(&mut self, data: StackSlotData) -> StackSlot {
        self.stack_slots.push(data)
    }

    /// The parameter values of this function: the entry block's parameters.
    pub fn params(&self) -> &[Value] {
        match self.layout.entry_block() {
            Some(entry) => self.dfg.block_params(entry),
            None => &[],
        }
    }

    /// Number of instructions currently placed in the body.
    pub fn instruction_count(&self) -> usize {
        self.layout.num_insts()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        crate::write::write_function(f, self)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
