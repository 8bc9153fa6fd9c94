//! Intermediate representation of modules and functions.

mod builder;
mod dfg;
mod entities;
mod function;
mod instructions;
mod layout;
mod module;
mod types;

pub use self::builder::FunctionBuilder;
pub use self::dfg::{BlockData, DataFlowGraph, ValueDef};
pub use self::entities::{Block, Func, Global, Inst, JumpTable, StackSlot, StructId, Value};
pub use self::function::{Function, FunctionFlags, Linkage, Signature, StackSlotData};
pub use self::instructions::{
    BlockCall, InstructionData, IntCC, JumpTableData, Opcode, ValueList, ValueListPool,
};
pub use self::layout::Layout;
pub use self::module::{
    normalized_triple, GlobalData, GlobalInit, GlobalType, Module, StructField, StructType,
};
pub use self::types::Type;
