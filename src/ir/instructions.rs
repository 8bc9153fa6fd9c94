//! Instruction opcodes and in-memory instruction formats.

use core::fmt;
use core::str::FromStr;

use cranelift_entity::{EntityList, ListPool};

use super::entities::{Block, Func, Global, JumpTable, StackSlot, Value};
use super::types::Type;

/// Some instructions use an external list of argument values because there
/// is not enough space in the compact `InstructionData` struct. The lists
/// are stored in a memory pool owned by the data flow graph.
pub type ValueList = EntityList<Value>;

/// Memory pool for holding value lists. See `ValueList`.
pub type ValueListPool = ListPool<Value>;

/// An integer comparison condition code.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum IntCC {
    Equal,
    NotEqual,
    SignedLessThan,
    SignedGreaterThanOrEqual,
    SignedGreaterThan,
    SignedLessThanOrEqual,
    UnsignedLessThan,
    UnsignedGreaterThanOrEqual,
    UnsignedGreaterThan,
    UnsignedLessThanOrEqual,
}

impl IntCC {
    /// Evaluate the condition on two width-normalised payloads.
    ///
    /// `bits` is the operand width; signed comparisons sign-extend the
    /// payloads before comparing.
    pub fn evaluate(self, lhs: u64, rhs: u64, bits: u32) -> bool {
        let sext = |v: u64| -> i64 {
            if bits == 64 {
                v as i64
            } else {
                let shift = 64 - bits;
                ((v << shift) as i64) >> shift
            }
        };
        match self {
            Self::Equal => lhs == rhs,
            Self::NotEqual => lhs != rhs,
            Self::UnsignedLessThan => lhs < rhs,
            Self::UnsignedGreaterThanOrEqual => lhs >= rhs,
            Self::UnsignedGreaterThan => lhs > rhs,
            Self::UnsignedLessThanOrEqual => lhs <= rhs,
            Self::SignedLessThan => sext(lhs) < sext(rhs),
            Self::SignedGreaterThanOrEqual => sext(lhs) >= sext(rhs),
            Self::SignedGreaterThan => sext(lhs) > sext(rhs),
            Self::SignedLessThanOrEqual => sext(lhs) <= sext(rhs),
        }
    }

    /// The condition with its operands swapped.
    pub fn swap_args(self) -> Self {
        match self {
            Self::Equal => Self::Equal,
            Self::NotEqual => Self::NotEqual,
            Self::SignedLessThan => Self::SignedGreaterThan,
            Self::SignedGreaterThanOrEqual => Self::SignedLessThanOrEqual,
            Self::SignedGreaterThan => Self::SignedLessThan,
            Self::SignedLessThanOrEqual => Self::SignedGreaterThanOrEqual,
            Self::UnsignedLessThan => Self::UnsignedGreaterThan,
            Self::UnsignedGreaterThanOrEqual => Self::UnsignedLessThanOrEqual,
            Self::UnsignedGreaterThan => Self::UnsignedLessThan,
            Self::UnsignedLessThanOrEqual => Self::UnsignedGreaterThanOrEqual,
        }
    }
}

impl fmt::Display for IntCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Equal => "eq",
            Self::NotEqual => "ne",
            Self::SignedLessThan => "slt",
            Self::SignedGreaterThanOrEqual => "sge",
            Self::SignedGreaterThan => "sgt",
            Self::SignedLessThanOrEqual => "sle",
            Self::UnsignedLessThan => "ult",
            Self::UnsignedGreaterThanOrEqual => "uge",
            Self::UnsignedGreaterThan => "ugt",
            Self::UnsignedLessThanOrEqual => "ule",
        };
        f.write_str(s)
    }
}

impl FromStr for IntCC {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s {
            "eq" => Self::Equal,
            "ne" => Self::NotEqual,
            "slt" => Self::SignedLessThan,
            "sge" => Self::SignedGreaterThanOrEqual,
            "sgt" => Self::SignedGreaterThan,
            "sle" => Self::SignedLessThanOrEqual,
            "ult" => Self::UnsignedLessThan,
            "uge" => Self::UnsignedGreaterThanOrEqual,
            "ugt" => Self::UnsignedGreaterThan,
            "ule" => Self::UnsignedLessThanOrEqual,
            _ => return Err(()),
        })
    }
}

/// An instruction opcode.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Opcode {
    Iconst,
    Iadd,
    Isub,
    Imul,
    Udiv,
    Sdiv,
    Urem,
    Srem,
    Band,
    Bor,
    Bxor,
    Bnot,
    Ineg,
    Ishl,
    Ushr,
    Sshr,
    Icmp,
    Select,
    Uextend,
    Sextend,
    Ireduce,
    Load,
    Store,
    StackAddr,
    GlobalAddr,
    FuncAddr,
    Call,
    Jump,
    Brif,
    BrTable,
    Return,
}

impl Opcode {
    /// True for instructions that must end a basic block.
    pub fn is_terminator(self) -> bool {
        matches!(self, Self::Jump | Self::Brif | Self::BrTable | Self::Return)
    }

    /// True for instructions that transfer control to another block.
    pub fn is_branch(self) -> bool {
        matches!(self, Self::Jump | Self::Brif | Self::BrTable)
    }

    /// Can this instruction read from memory?
    pub fn can_load(self) -> bool {
        self == Self::Load
    }

    /// Can this instruction write to memory?
    pub fn can_store(self) -> bool {
        self == Self::Store
    }

    pub fn is_call(self) -> bool {
        self == Self::Call
    }

    /// Binary integer opcodes where the operand order does not matter.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Iadd | Self::Imul | Self::Band | Self::Bor | Self::Bxor
        )
    }

    /// True for instructions whose only observable effect is their result
    /// value. Pure instructions with unused results are dead code; whether a
    /// call is removable additionally depends on the callee and is decided
    /// by `inst_predicates`.
    pub fn is_pure(self) -> bool {
        !matches!(
            self,
            Self::Store | Self::Call | Self::Jump | Self::Brif | Self::BrTable | Self::Return
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Iconst => "iconst",
            Self::Iadd => "iadd",
            Self::Isub => "isub",
            Self::Imul => "imul",
            Self::Udiv => "udiv",
            Self::Sdiv => "sdiv",
            Self::Urem => "urem",
            Self::Srem => "srem",
            Self::Band => "band",
            Self::Bor => "bor",
            Self::Bxor => "bxor",
            Self::Bnot => "bnot",
            Self::Ineg => "ineg",
            Self::Ishl => "ishl",
            Self::Ushr => "ushr",
            Self::Sshr => "sshr",
            Self::Icmp => "icmp",
            Self::Select => "select",
            Self::Uextend => "uextend",
            Self::Sextend => "sextend",
            Self::Ireduce => "ireduce",
            Self::Load => "load",
            Self::Store => "store",
            Self::StackAddr => "stack_addr",
            Self::GlobalAddr => "global_addr",
            Self::FuncAddr => "func_addr",
            Self::Call => "call",
            Self::Jump => "jump",
            Self::Brif => "brif",
            Self::BrTable => "br_table",
            Self::Return => "return",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A destination block together with the arguments passed to its parameters.
///
/// The block and the arguments share a single pooled list: the first element
/// is the block encoded as a value, the remaining elements are real values.
/// This keeps `InstructionData` compact and `Copy`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlockCall {
    values: EntityList<Value>,
}

impl BlockCall {
    fn value_to_block(val: Value) -> Block {
        use cranelift_entity::EntityRef;
        Block::new(val.index())
    }

    fn block_to_value(block: Block) -> Value {
        use cranelift_entity::EntityRef;
        Value::new(block.index())
    }

    /// Construct a `BlockCall` with the given block and arguments.
    pub fn new(block: Block, args: &[Value], pool: &mut ValueListPool) -> Self {
        let mut values = ValueList::default();
        values.push(Self::block_to_value(block), pool);
        values.extend(args.iter().copied(), pool);
        Self { values }
    }

    /// The destination block of this call.
    pub fn block(&self, pool: &ValueListPool) -> Block {
        let val = self.values.first(pool).unwrap();
        Self::value_to_block(val)
    }

    /// Replace the destination block.
    pub fn set_block(&mut self, block: Block, pool: &mut ValueListPool) {
        *self.values.get_mut(0, pool).unwrap() = Self::block_to_value(block);
    }

    /// The arguments of this block call.
    pub fn args_slice<'a>(&self, pool: &'a ValueListPool) -> &'a [Value] {
        &self.values.as_slice(pool)[1..]
    }

    /// Mutable access to the arguments of this block call.
    pub fn args_slice_mut<'a>(&'a mut self, pool: &'a mut ValueListPool) -> &'a mut [Value] {
        &mut self.values.as_mut_slice(pool)[1..]
    }

    /// Append an argument.
    pub fn append_argument(&mut self, arg: Value, pool: &mut ValueListPool) {
        self.values.push(arg, pool);
    }

    /// Remove the argument at `ix`.
    pub fn remove_arg(&mut self, ix: usize, pool: &mut ValueListPool) {
        self.values.remove(1 + ix, pool);
    }

    /// Deep-clone the underlying list in the same pool.
    pub fn deep_clone(&self, pool: &mut ValueListPool) -> Self {
        Self {
            values: self.values.deep_clone(pool),
        }
    }
}

/// A jump table: the ordered destinations of a `br_table`, plus the default.
#[derive(Clone, Debug, PartialEq)]
pub struct JumpTableData {
    default: BlockCall,
    table: Vec<BlockCall>,
}

impl JumpTableData {
    pub fn new(default: BlockCall, table: Vec<BlockCall>) -> Self {
        Self { default, table }
    }

    pub fn default_block(&self) -> BlockCall {
        self.default
    }

    pub fn default_block_mut(&mut self) -> &mut BlockCall {
        &mut self.default
    }

    pub fn as_slice(&self) -> &[BlockCall] {
        &self.table
    }

    pub fn as_mut_slice(&mut self) -> &mut [BlockCall] {
        &mut self.table
    }

    /// All branch destinations, the default first.
    pub fn all_branches(&self) -> impl Iterator<Item = &BlockCall> {
        core::iter::once(&self.default).chain(self.table.iter())
    }

    pub fn all_branches_mut(&mut self) -> impl Iterator<Item = &mut BlockCall> {
        core::iter::once(&mut self.default).chain(self.table.iter_mut())
    }
}

/// The contents of an instruction.
///
/// Variants are compact and `Copy`; variable-length operand lists live in
/// the data flow graph's value-list pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum InstructionData {
    /// `iconst.ty imm`
    UnaryImm {
        opcode: Opcode,
        ty: Type,
        imm: i64,
    },
    /// `uextend.ty x` / `sextend.ty x` / `ireduce.ty x` / `bnot x` / `ineg x`
    Unary {
        opcode: Opcode,
        ty: Type,
        arg: Value,
    },
    /// `iadd x, y` and friends
    Binary {
        opcode: Opcode,
        args: [Value; 2],
    },
    /// `icmp cc x, y` — produces an `i8` that is 0 or 1
    IntCompare {
        opcode: Opcode,
        cond: IntCC,
        args: [Value; 2],
    },
    /// `select c, x, y`
    Ternary {
        opcode: Opcode,
        args: [Value; 3],
    },
    /// `load.ty addr+offset`
    Load {
        opcode: Opcode,
        ty: Type,
        arg: Value,
        offset: i32,
    },
    /// `store.ty data, addr+offset`; args are `[data, addr]`
    Store {
        opcode: Opcode,
        ty: Type,
        args: [Value; 2],
        offset: i32,
    },
    /// `stack_addr ss+offset`
    StackAddr {
        opcode: Opcode,
        slot: StackSlot,
        offset: i32,
    },
    /// `global_addr @g`
    GlobalAddr {
        opcode: Opcode,
        global: Global,
    },
    /// `func_addr @f`
    FuncAddr {
        opcode: Opcode,
        func: Func,
    },
    /// `call @f(args...)`
    Call {
        opcode: Opcode,
        func: Func,
        args: ValueList,
    },
    /// `jump block(args...)`
    Jump {
        opcode: Opcode,
        destination: BlockCall,
    },
    /// `brif c, block_then(args...), block_else(args...)`
    Brif {
        opcode: Opcode,
        arg: Value,
        blocks: [BlockCall; 2],
    },
    /// `br_table x, default, [block0, block1, ...]`
    BranchTable {
        opcode: Opcode,
        arg: Value,
        table: JumpTable,
    },
    /// `return (args...)`
    MultiAry {
        opcode: Opcode,
        args: ValueList,
    },
}

impl InstructionData {
    /// The opcode of this instruction.
    pub fn opcode(&self) -> Opcode {
        match *self {
            Self::UnaryImm { opcode, .. }
            | Self::Unary { opcode, .. }
            | Self::Binary { opcode, .. }
            | Self::IntCompare { opcode, .. }
            | Self::Ternary { opcode, .. }
            | Self::Load { opcode, .. }
            | Self::Store { opcode, .. }
            | Self::StackAddr { opcode, .. }
            | Self::GlobalAddr { opcode, .. }
            | Self::FuncAddr { opcode, .. }
            | Self::Call { opcode, .. }
            | Self::Jump { opcode, .. }
            | Self::Brif { opcode, .. }
            | Self::BranchTable { opcode, .. }
            | Self::MultiAry { opcode, .. } => opcode,
        }
    }

    /// The fixed value arguments of this instruction.
    ///
    /// Branch arguments are not included; they belong to the block calls.
    pub fn arguments<'a>(&'a self, pool: &'a ValueListPool) -> &'a [Value] {
        match self {
            Self::UnaryImm { .. }
            | Self::StackAddr { .. }
            | Self::GlobalAddr { .. }
            | Self::FuncAddr { .. } => &[],
            Self::Unary { arg, .. } | Self::Load { arg, .. } => core::slice::from_ref(arg),
            Self::Binary { args, .. } | Self::IntCompare { args, .. } | Self::Store { args, .. } => {
                args
            }
            Self::Ternary { args, .. } => args,
            Self::Call { args, .. } | Self::MultiAry { args, .. } => args.as_slice(pool),
            Self::Jump { .. } => &[],
            Self::Brif { arg, .. } | Self::BranchTable { arg, .. } => core::slice::from_ref(arg),
        }
    }

    /// Mutable access to the fixed value arguments of this instruction.
    pub fn arguments_mut<'a>(&'a mut self, pool: &'a mut ValueListPool) -> &'a mut [Value] {
        match self {
            Self::UnaryImm { .. }
            | Self::StackAddr { .. }
            | Self::GlobalAddr { .. }
            | Self::FuncAddr { .. } => &mut [],
            Self::Unary { arg, .. } | Self::Load { arg, .. } => core::slice::from_mut(arg),
            Self::Binary { args, .. } | Self::IntCompare { args, .. } | Self::Store { args, .. } => {
                args
            }
            Self::Ternary { args, .. } => args,
            Self::Call { args, .. } | Self::MultiAry { args, .. } => args.as_mut_slice(pool),
            Self::Jump { .. } => &mut [],
            Self::Brif { arg, .. } | Self::BranchTable { arg, .. } => core::slice::from_mut(arg),
        }
    }

    /// The block calls of this instruction, if it is a branch.
    ///
    /// `br_table` destinations live in the jump table and are not returned
    /// here; callers must consult the table separately.
    pub fn branch_destinations(&self) -> &[BlockCall] {
        match self {
            Self::Jump { destination, .. } => core::slice::from_ref(destination),
            Self::Brif { blocks, .. } => blocks,
            _ => &[],
        }
    }

    /// Mutable access to the block calls of this instruction.
    pub fn branch_destinations_mut(&mut self) -> &mut [BlockCall] {
        match self {
            Self::Jump { destination, .. } => core::slice::from_mut(destination),
            Self::Brif { blocks, .. } => blocks,
            _ => &mut [],
        }
    }

    /// For loads and stores: the address operand, offset and accessed type.
    pub fn memory_access(&self) -> Option<(Value, i32, Type)> {
        match *self {
            Self::Load {
                ty, arg, offset, ..
            } => Some((arg, offset, ty)),
            Self::Store {
                ty, args, offset, ..
            } => Some((args[1], offset, ty)),
            _ => None,
        }
    }

    /// For stores: the stored data operand.
    pub fn store_data(&self) -> Option<Value> {
        match *self {
            Self::Store { args, .. } => Some(args[0]),
            _ => None,
        }
    }
}
