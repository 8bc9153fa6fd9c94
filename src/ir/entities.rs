//! IR entity references.
//!
//! Entities are compact 32-bit typed indices into tables owned by the
//! enclosing [`Function`](super::Function) or [`Module`](super::Module).
//! They are cheap to copy and keep the in-memory representation small; an
//! invalid (reserved) encoding exists for use with `PackedOption`.

use cranelift_entity::entity_impl;

/// An opaque reference to a basic block in a function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to an SSA value.
///
/// Values are either block parameters, instruction results, or aliases
/// created when a pass redirects every use of one value to another.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// An opaque reference to an instruction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// An opaque reference to a stack slot.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackSlot(u32);
entity_impl!(StackSlot, "ss");

/// An opaque reference to a function in a module.
///
/// Unlike per-function external-function tables, function references are
/// module-wide: a call instruction names the callee directly. This is what
/// lets the linker override a declaration with a runtime definition without
/// touching any call site.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Func(u32);
entity_impl!(Func, "fn");

/// An opaque reference to a global variable in a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Global(u32);
entity_impl!(Global, "gv");

/// An opaque reference to a named struct type in a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructId(u32);
entity_impl!(StructId, "struct");

/// An opaque reference to a jump table used by `br_table`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JumpTable(u32);
entity_impl!(JumpTable, "jt");
