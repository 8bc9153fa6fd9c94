//! Converting IR to text.
//!
//! The printer emits the same syntax the parser accepts, so a printed
//! module can be read back; the round trip yields a structurally identical
//! module (entity renumbering aside, printing resolves value aliases).

use core::fmt;

use crate::ir::{
    Block, Function, FunctionFlags, GlobalInit, GlobalType, InstructionData, Linkage, Module,
    Opcode, StructField,
};

/// Write the entire module.
pub fn write_module(w: &mut dyn fmt::Write, module: &Module) -> fmt::Result {
    writeln!(w, "module {}", module.name)?;
    writeln!(w, "target {}", module.triple)?;

    if module.structs.len() > 0 {
        writeln!(w)?;
    }
    for (_, st) in module.structs.iter() {
        write!(w, "type %{} = struct {{ ", st.name)?;
        for (i, field) in st.fields.iter().enumerate() {
            if i > 0 {
                write!(w, ", ")?;
            }
            match field {
                StructField::Scalar(ty) => write!(w, "{ty}")?,
                StructField::Array(ty, n) => write!(w, "[{n} x {ty}]")?,
                StructField::Named(id) => write!(w, "%{}", module.structs[*id].name)?,
            }
        }
        writeln!(w, " }}")?;
    }

    if module.globals.len() > 0 {
        writeln!(w)?;
    }
    for (_, g) in module.globals.iter() {
        write_linkage(w, g.linkage)?;
        write!(w, "global ")?;
        if g.constant {
            write!(w, "const ")?;
        }
        write!(w, "@{} : ", g.name)?;
        match g.ty {
            GlobalType::Scalar(ty) => write!(w, "{ty}")?,
            GlobalType::Bytes(n) => write!(w, "bytes {n}")?,
        }
        match &g.init {
            None => {}
            Some(GlobalInit::Int(v)) => write!(w, " = {v}")?,
            Some(GlobalInit::Zero) => write!(w, " = zero")?,
            Some(GlobalInit::Bytes(bytes)) => {
                write!(w, " = \"")?;
                for b in bytes {
                    write!(w, "{b:02x}")?;
                }
                write!(w, "\"")?;
            }
        }
        writeln!(w)?;
    }

    for (_, func) in module.functions.iter() {
        writeln!(w)?;
        if func.is_declaration() {
            write_linkage(w, func.linkage)?;
            write!(w, "declare @{}{}", func.name, func.signature)?;
            write_flags(w, &func.flags)?;
            writeln!(w)?;
        } else {
            write_function_with_module(w, func, Some(module))?;
        }
    }
    Ok(())
}

fn write_linkage(w: &mut dyn fmt::Write, linkage: Linkage) -> fmt::Result {
    match linkage {
        Linkage::Public => Ok(()),
        Linkage::Local => write!(w, "local "),
        Linkage::Weak => write!(w, "weak "),
    }
}

fn write_flags(w: &mut dyn fmt::Write, flags: &FunctionFlags) -> fmt::Result {
    if flags.always_inline {
        write!(w, " alwaysinline")?;
    }
    if flags.no_inline {
        write!(w, " noinline")?;
    }
    if flags.optimize_none {
        write!(w, " optnone")?;
    }
    if flags.inline_asm {
        write!(w, " asm")?;
    }
    if flags.allocator {
        write!(w, " allocator")?;
    }
    if flags.readnone {
        write!(w, " readnone")?;
    }
    Ok(())
}

/// Write a function definition without module context (callee and global
/// references are printed as entity numbers).
pub fn write_function(w: &mut dyn fmt::Write, func: &Function) -> fmt::Result {
    write_function_with_module(w, func, None)
}

fn write_function_with_module(
    w: &mut dyn fmt::Write,
    func: &Function,
    module: Option<&Module>,
) -> fmt::Result {
    write_linkage(w, func.linkage)?;
    write!(w, "function @{}{}", func.name, func.signature)?;
    write_flags(w, &func.flags)?;
    writeln!(w, " {{")?;
    for (slot, data) in func.stack_slots.iter() {
        writeln!(w, "    {slot} = stack_slot {}", data.size)?;
    }
    for block in func.layout.blocks() {
        write_block_header(w, func, block)?;
        for &inst in func.layout.block_insts(block) {
            write!(w, "    ")?;
            write_inst(w, func, module, inst)?;
            writeln!(w)?;
        }
    }
    writeln!(w, "}}")
}

fn write_block_header(w: &mut dyn fmt::Write, func: &Function, block: Block) -> fmt::Result {
    write!(w, "{block}")?;
    let params = func.dfg.block_params(block);
    if !params.is_empty() {
        write!(w, "(")?;
        for (i, &param) in params.iter().enumerate() {
            if i > 0 {
                write!(w, ", ")?;
            }
            write!(w, "{param}: {}", func.dfg.value_type(param))?;
        }
        write!(w, ")")?;
    }
    writeln!(w, ":")
}

fn callee_name(module: Option<&Module>, func_id: crate::ir::Func) -> String {
    match module {
        Some(m) => format!("@{}", m.functions[func_id].name),
        None => format!("{func_id}"),
    }
}

fn global_name(module: Option<&Module>, global: crate::ir::Global) -> String {
    match module {
        Some(m) => format!("@{}", m.globals[global].name),
        None => format!("{global}"),
    }
}

fn offset_suffix(offset: i32) -> String {
    match offset {
        0 => String::new(),
        n if n > 0 => format!("+{n}"),
        n => format!("{n}"),
    }
}

/// Write one instruction, results included.
pub fn write_inst(
    w: &mut dyn fmt::Write,
    func: &Function,
    module: Option<&Module>,
    inst: crate::ir::Inst,
) -> fmt::Result {
    let pool = &func.dfg.value_lists;
    let results = func.dfg.inst_results(inst);
    if !results.is_empty() {
        for (i, r) in results.iter().enumerate() {
            if i > 0 {
                write!(w, ", ")?;
            }
            write!(w, "{r}")?;
        }
        write!(w, " = ")?;
    }

    let rv = |v: crate::ir::Value| func.dfg.resolve_aliases(v);
    let data = &func.dfg.insts[inst];
    match *data {
        InstructionData::UnaryImm { opcode, ty, imm } => {
            write!(w, "{opcode}.{ty} {imm}")?;
        }
        InstructionData::Unary { opcode, ty, arg } => match opcode {
            Opcode::Uextend | Opcode::Sextend | Opcode::Ireduce => {
                write!(w, "{opcode}.{ty} {}", rv(arg))?
            }
            _ => write!(w, "{opcode} {}", rv(arg))?,
        },
        InstructionData::Binary { opcode, args } => {
            write!(w, "{opcode} {}, {}", rv(args[0]), rv(args[1]))?;
        }
        InstructionData::IntCompare { cond, args, .. } => {
            write!(w, "icmp {cond} {}, {}", rv(args[0]), rv(args[1]))?;
        }
        InstructionData::Ternary { opcode, args } => {
            write!(
                w,
                "{opcode} {}, {}, {}",
                rv(args[0]),
                rv(args[1]),
                rv(args[2])
            )?;
        }
        InstructionData::Load {
            ty, arg, offset, ..
        } => {
            write!(w, "load.{ty} {}{}", rv(arg), offset_suffix(offset))?;
        }
        InstructionData::Store {
            ty, args, offset, ..
        } => {
            write!(
                w,
                "store.{ty} {}, {}{}",
                rv(args[0]),
                rv(args[1]),
                offset_suffix(offset)
            )?;
        }
        InstructionData::StackAddr { slot, offset, .. } => {
            write!(w, "stack_addr {slot}{}", offset_suffix(offset))?;
        }
        InstructionData::GlobalAddr { global, .. } => {
            write!(w, "global_addr {}", global_name(module, global))?;
        }
        InstructionData::FuncAddr { func: f, .. } => {
            write!(w, "func_addr {}", callee_name(module, f))?;
        }
        InstructionData::Call { func: f, args, .. } => {
            write!(w, "call {}(", callee_name(module, f))?;
            for (i, &arg) in args.as_slice(pool).iter().enumerate() {
                if i > 0 {
                    write!(w, ", ")?;
                }
                write!(w, "{}", rv(arg))?;
            }
            write!(w, ")")?;
        }
        InstructionData::Jump { destination, .. } => {
            write!(w, "jump ")?;
            write_block_call(w, func, destination)?;
        }
        InstructionData::Brif { arg, blocks, .. } => {
            write!(w, "brif {}, ", rv(arg))?;
            write_block_call(w, func, blocks[0])?;
            write!(w, ", ")?;
            write_block_call(w, func, blocks[1])?;
        }
        InstructionData::BranchTable { arg, table, .. } => {
            let jt = &func.dfg.jump_tables[table];
            write!(w, "br_table {}, ", rv(arg))?;
            write_block_call(w, func, jt.default_block())?;
            write!(w, ", [")?;
            for (i, &call) in jt.as_slice().iter().enumerate() {
                if i > 0 {
                    write!(w, ", ")?;
                }
                write_block_call(w, func, call)?;
            }
            write!(w, "]")?;
        }
        InstructionData::MultiAry { opcode, args } => {
            write!(w, "{opcode}")?;
            for (i, &arg) in args.as_slice(pool).iter().enumerate() {
                write!(w, "{}{}", if i == 0 { " " } else { ", " }, rv(arg))?;
            }
        }
    }
    Ok(())
}

fn write_block_call(
    w: &mut dyn fmt::Write,
    func: &Function,
    call: crate::ir::BlockCall,
) -> fmt::Result {
    let pool = &func.dfg.value_lists;
    write!(w, "{}", call.block(pool))?;
    let args = call.args_slice(pool);
    if !args.is_empty() {
        write!(w, "(")?;
        for (i, &arg) in args.iter().enumerate() {
            if i > 0 {
                write!(w, ", ")?;
            }
            write!(w, "{}", func.dfg.resolve_aliases(arg))?;
        }
        write!(w, ")")?;
    }
    Ok(())
}

/// Render one instruction to a `String`, for logs and error messages.
pub fn inst_to_string(func: &Function, module: Option<&Module>, inst: crate::ir::Inst) -> String {
    let mut s = String::new();
    let _ = write_inst(&mut s, func, module, inst);
    s
}

/// Render a whole module to a `String`.
pub fn module_to_string(module: &Module) -> String {
    let mut s = String::new();
    let _ = write_module(&mut s, module);
    s
}
