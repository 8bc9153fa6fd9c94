//! A convenience builder for constructing function bodies.
//!
//! Used by the parser, the runtime blob and the test suite. Passes mostly
//! edit the data flow graph and layout directly.

use super::dfg::DataFlowGraph;
use super::entities::{Block, Func, Global, Inst, StackSlot, Value};
use super::function::Function;
use super::instructions::{
    BlockCall, InstructionData, IntCC, JumpTableData, Opcode, ValueList,
};
use super::types::Type;

/// Builds instructions at the end of a current block.
pub struct FunctionBuilder<'a> {
    pub func: &'a mut Function,
    block: Option<Block>,
}

impl<'a> FunctionBuilder<'a> {
    pub fn new(func: &'a mut Function) -> Self {
        Self { func, block: None }
    }

    /// Create a new block and append it to the layout.
    pub fn create_block(&mut self) -> Block {
        let block = self.func.dfg.make_block();
        self.func.layout.append_block(block);
        block
    }

    /// Direct subsequent instructions to the end of `block`.
    pub fn switch_to_block(&mut self, block: Block) {
        self.block = Some(block);
    }

    /// The block under construction.
    pub fn current_block(&self) -> Block {
        self.block.expect("no current block")
    }

    pub fn append_block_param(&mut self, block: Block, ty: Type) -> Value {
        self.func.dfg.append_block_param(block, ty)
    }

    fn dfg(&mut self) -> &mut DataFlowGraph {
        &mut self.func.dfg
    }

    fn insert(&mut self, data: InstructionData) -> Inst {
        let block = self.current_block();
        let inst = self.func.dfg.make_inst(data);
        self.func.layout.append_inst(inst, block);
        inst
    }

    fn insert_with_result(&mut self, data: InstructionData, ty: Type) -> Value {
        let inst = self.insert(data);
        self.func.dfg.make_inst_results(inst, &[ty])[0]
    }

    pub fn iconst(&mut self, ty: Type, imm: i64) -> Value {
        self.insert_with_result(
            InstructionData::UnaryImm {
                opcode: Opcode::Iconst,
                ty,
                imm,
            },
            ty,
        )
    }

    pub fn binary(&mut self, opcode: Opcode, x: Value, y: Value) -> Value {
        let ty = self.func.dfg.value_type(x);
        self.insert_with_result(
            InstructionData::Binary {
                opcode,
                args: [x, y],
            },
            ty,
        )
    }

    pub fn iadd(&mut self, x: Value, y: Value) -> Value {
        self.binary(Opcode::Iadd, x, y)
    }

    pub fn isub(&mut self, x: Value, y: Value) -> Value {
        self.binary(Opcode::Isub, x, y)
    }

    pub fn imul(&mut self, x: Value, y: Value) -> Value {
        self.binary(Opcode::Imul, x, y)
    }

    pub fn band(&mut self, x: Value, y: Value) -> Value {
        self.binary(Opcode::Band, x, y)
    }

    pub fn bor(&mut self, x: Value, y: Value) -> Value {
        self.binary(Opcode::Bor, x, y)
    }

    pub fn bxor(&mut self, x: Value, y: Value) -> Value {
        self.binary(Opcode::Bxor, x, y)
    }

    pub fn urem(&mut self, x: Value, y: Value) -> Value {
        self.binary(Opcode::Urem, x, y)
    }

    pub fn unary(&mut self, opcode: Opcode, ty: Type, arg: Value) -> Value {
        self.insert_with_result(InstructionData::Unary { opcode, ty, arg }, ty)
    }

    pub fn uextend(&mut self, ty: Type, arg: Value) -> Value {
        self.unary(Opcode::Uextend, ty, arg)
    }

    pub fn sextend(&mut self, ty: Type, arg: Value) -> Value {
        self.unary(Opcode::Sextend, ty, arg)
    }

    pub fn ireduce(&mut self, ty: Type, arg: Value) -> Value {
        self.unary(Opcode::Ireduce, ty, arg)
    }

    pub fn icmp(&mut self, cond: IntCC, x: Value, y: Value) -> Value {
        self.insert_with_result(
            InstructionData::IntCompare {
                opcode: Opcode::Icmp,
                cond,
                args: [x, y],
            },
            Type::I8,
        )
    }

    pub fn select(&mut self, c: Value, x: Value, y: Value) -> Value {
        let ty = self.func.dfg.value_type(x);
        self.insert_with_result(
            InstructionData::Ternary {
                opcode: Opcode::Select,
                args: [c, x, y],
            },
            ty,
        )
    }

    pub fn load(&mut self, ty: Type, addr: Value, offset: i32) -> Value {
        self.insert_with_result(
            InstructionData::Load {
                opcode: Opcode::Load,
                ty,
                arg: addr,
                offset,
            },
            ty,
        )
    }

    pub fn store(&mut self, ty: Type, data: Value, addr: Value, offset: i32) -> Inst {
        self.insert(InstructionData::Store {
            opcode: Opcode::Store,
            ty,
            args: [data, addr],
            offset,
        })
    }

    pub fn stack_addr(&mut self, slot: StackSlot, offset: i32) -> Value {
        self.insert_with_result(
            InstructionData::StackAddr {
                opcode: Opcode::StackAddr,
                slot,
                offset,
            },
            Type::Ptr,
        )
    }

    pub fn global_addr(&mut self, global: Global) -> Value {
        self.insert_with_result(
            InstructionData::GlobalAddr {
                opcode: Opcode::GlobalAddr,
                global,
            },
            Type::Ptr,
        )
    }

    pub fn func_addr(&mut self, func: Func) -> Value {
        self.insert_with_result(
            InstructionData::FuncAddr {
                opcode: Opcode::FuncAddr,
                func,
            },
            Type::Ptr,
        )
    }

    /// Call `callee`. The callee's return types must be supplied because
    /// the builder has no module in scope.
    pub fn call(&mut self, callee: Func, args: &[Value], returns: &[Type]) -> Inst {
        let args = ValueList::from_slice(args, &mut self.dfg().value_lists);
        let inst = self.insert(InstructionData::Call {
            opcode: Opcode::Call,
            func: callee,
            args,
        });
        self.func.dfg.make_inst_results(inst, returns);
        inst
    }

    pub fn jump(&mut self, dest: Block, args: &[Value]) -> Inst {
        let destination = BlockCall::new(dest, args, &mut self.dfg().value_lists);
        self.insert(InstructionData::Jump {
            opcode: Opcode::Jump,
            destination,
        })
    }

    pub fn brif(
        &mut self,
        c: Value,
        then_dest: Block,
        then_args: &[Value],
        else_dest: Block,
        else_args: &[Value],
    ) -> Inst {
        let then_call = BlockCall::new(then_dest, then_args, &mut self.dfg().value_lists);
        let else_call = BlockCall::new(else_dest, else_args, &mut self.dfg().value_lists);
        self.insert(InstructionData::Brif {
            opcode: Opcode::Brif,
            arg: c,
            blocks: [then_call, else_call],
        })
    }

    pub fn br_table(&mut self, index: Value, default: Block, targets: &[Block]) -> Inst {
        let default = BlockCall::new(default, &[], &mut self.dfg().value_lists);
        let table: Vec<BlockCall> = targets
            .iter()
            .map(|&b| BlockCall::new(b, &[], &mut self.func.dfg.value_lists))
            .collect();
        let table = self.func.dfg.make_jump_table(JumpTableData::new(default, table));
        self.insert(InstructionData::BranchTable {
            opcode: Opcode::BrTable,
            arg: index,
            table,
        })
    }

    pub fn ret(&mut self, args: &[Value]) -> Inst {
        let args = ValueList::from_slice(args, &mut self.dfg().value_lists);
        self.insert(InstructionData::MultiAry {
            opcode: Opcode::Return,
            args,
        })
    }
}
