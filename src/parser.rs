//! Parser for the textual IR format.
//!
//! The format is line oriented. A module consists of `module`/`target`
//! directives, `type` definitions, `global` definitions, `declare` lines and
//! `function` bodies. Instruction syntax mirrors the printer in
//! [`crate::write`]; see the test fixtures for examples.
//!
//! Values must be defined textually before they are used. The printer emits
//! blocks in layout order, which satisfies this for every module the
//! pipeline itself produces.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Location, ParseError, ParseResult};
use crate::ir::{
    Block, BlockCall, Func, Function, FunctionBuilder, FunctionFlags, GlobalData, GlobalInit,
    GlobalType, InstructionData, IntCC, JumpTableData, Linkage, Module, Opcode, Signature,
    StackSlot, StackSlotData, StructField, StructType, Type, Value,
};

/// Parse a module from a file on disk.
pub fn parse_file(path: &Path) -> crate::Result<Module> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| crate::Error::io(format!("could not read {}", path.display()), err))?;
    parse_module(&text).map_err(|err| crate::Error::Parse {
        path: path.to_path_buf(),
        err,
    })
}

/// Parse a module from text.
pub fn parse_module(text: &str) -> ParseResult<Module> {
    Parser::new(text).parse()
}

fn err<T>(line: usize, msg: impl Into<String>) -> ParseResult<T> {
    Err(parse_error(line, msg))
}

fn parse_error(line: usize, msg: impl Into<String>) -> ParseError {
    ParseError {
        location: Location { line_number: line },
        message: msg.into(),
    }
}

/// One token of a line.
#[derive(Debug, Clone, PartialEq)]
enum Tok {
    /// Bare identifier, including opcodes, type names and keywords.
    Ident(String),
    /// `@name`
    Sym(String),
    /// `%name`
    TypeName(String),
    /// Integer literal (decimal or hex, no sign).
    Num(u64),
    /// `"..."` — used for hex byte images.
    Str(String),
    Punct(char),
}

fn tokenize(line: &str, line_no: usize) -> ParseResult<Vec<Tok>> {
    let bytes = line.as_bytes();
    let mut toks = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ';' => break,
            c if c.is_whitespace() => i += 1,
            '"' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end] as char != '"' {
                    end += 1;
                }
                if end >= bytes.len() {
                    return err(line_no, "unterminated string");
                }
                toks.push(Tok::Str(line[start..end].to_string()));
                i = end + 1;
            }
            '@' | '%' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() {
                    let c2 = bytes[end] as char;
                    if c2.is_ascii_alphanumeric() || c2 == '_' || c2 == '.' || c2 == '$' {
                        end += 1;
                    } else {
                        break;
                    }
                }
                if end == start {
                    return err(line_no, format!("empty name after '{c}'"));
                }
                let name = line[start..end].to_string();
                toks.push(if c == '@' {
                    Tok::Sym(name)
                } else {
                    Tok::TypeName(name)
                });
                i = end;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                let mut end = i;
                while end < bytes.len() && (bytes[end] as char).is_ascii_alphanumeric() {
                    end += 1;
                }
                let text = &line[start..end];
                let value = if let Some(hex) =
                    text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))
                {
                    u64::from_str_radix(hex, 16)
                } else {
                    text.parse::<u64>()
                };
                match value {
                    Ok(v) => toks.push(Tok::Num(v)),
                    Err(_) => return err(line_no, format!("bad number '{text}'")),
                }
                i = end;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                let mut end = i;
                while end < bytes.len() {
                    let c2 = bytes[end] as char;
                    if c2.is_ascii_alphanumeric() || c2 == '_' {
                        end += 1;
                    } else {
                        break;
                    }
                }
                toks.push(Tok::Ident(line[start..end].to_string()));
                i = end;
            }
            '(' | ')' | '{' | '}' | '[' | ']' | ',' | ':' | '=' | '+' | '-' | '>' | '.' => {
                toks.push(Tok::Punct(c));
                i += 1;
            }
            other => return err(line_no, format!("unexpected character '{other}'")),
        }
    }
    Ok(toks)
}

/// Token stream over one line.
struct Line {
    toks: Vec<Tok>,
    pos: usize,
    no: usize,
}

impl Line {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn done(&self) -> bool {
        self.pos >= self.toks.len()
    }

    fn expect_punct(&mut self, c: char) -> ParseResult<()> {
        match self.next() {
            Some(Tok::Punct(p)) if p == c => Ok(()),
            other => err(self.no, format!("expected '{c}', got {other:?}")),
        }
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if matches!(self.peek(), Some(Tok::Punct(p)) if *p == c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> ParseResult<String> {
        match self.next() {
            Some(Tok::Ident(s)) => Ok(s),
            other => err(self.no, format!("expected identifier, got {other:?}")),
        }
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Ident(s)) if s == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self) -> ParseResult<String> {
        match self.next() {
            Some(Tok::Sym(s)) => Ok(s),
            other => err(self.no, format!("expected '@name', got {other:?}")),
        }
    }

    /// Parse an integer with an optional leading minus.
    fn expect_int(&mut self) -> ParseResult<i64> {
        let neg = self.eat_punct('-');
        match self.next() {
            Some(Tok::Num(v)) => {
                let v = v as i64;
                Ok(if neg { v.wrapping_neg() } else { v })
            }
            other => err(self.no, format!("expected number, got {other:?}")),
        }
    }

    fn expect_type(&mut self) -> ParseResult<Type> {
        let s = self.expect_ident()?;
        s.parse()
            .map_err(|()| parse_error(self.no, format!("unknown type '{s}'")))
    }

    /// Optional `+off` / `-off` suffix.
    fn parse_offset(&mut self) -> ParseResult<i32> {
        if self.eat_punct('+') {
            Ok(self.expect_int()? as i32)
        } else if self.eat_punct('-') {
            Ok(-(self.expect_int()? as i32))
        } else {
            Ok(0)
        }
    }
}

struct FuncHeader {
    name: String,
    signature: Signature,
    flags: FunctionFlags,
    linkage: Linkage,
    /// Line index range of the body, exclusive of the closing brace.
    body: std::ops::Range<usize>,
    header_line: usize,
}

struct Parser<'a> {
    lines: Vec<&'a str>,
    module: Module,
    headers: Vec<(Func, FuncHeader)>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().collect(),
            module: Module::new("module"),
            headers: Vec::new(),
        }
    }

    fn line(&self, idx: usize) -> ParseResult<Line> {
        Ok(Line {
            toks: tokenize(self.lines[idx], idx + 1)?,
            pos: 0,
            no: idx + 1,
        })
    }

    fn parse(mut self) -> ParseResult<Module> {
        self.scan_top_level()?;
        // Bodies are parsed after every module-level name is known, so
        // calls may reference functions declared later in the file (and
        // functions may call themselves).
        let headers = std::mem::take(&mut self.headers);
        for (func_id, header) in headers {
            let mut func =
                Function::with_name_signature(header.name.clone(), header.signature.clone());
            func.flags = header.flags;
            func.linkage = header.linkage;
            self.parse_body(&header, &mut func)?;
            self.module.functions[func_id] = func;
        }
        Ok(self.module)
    }

    fn scan_top_level(&mut self) -> ParseResult<()> {
        let mut idx = 0;
        while idx < self.lines.len() {
            let mut line = self.line(idx)?;
            if line.done() {
                idx += 1;
                continue;
            }
            let linkage = if line.eat_ident("weak") {
                Linkage::Weak
            } else if line.eat_ident("local") {
                Linkage::Local
            } else {
                Linkage::Public
            };
            let word = line.expect_ident()?;
            match word.as_str() {
                "module" => {
                    self.module.name = match line.next() {
                        Some(Tok::Ident(s)) => s,
                        Some(Tok::Sym(s)) => s,
                        other => return err(idx + 1, format!("bad module name {other:?}")),
                    };
                }
                "target" => {
                    let raw = self.lines[idx].trim().trim_start_matches("target").trim();
                    self.module.triple = raw
                        .parse()
                        .map_err(|_| parse_error(idx + 1, format!("bad target triple '{raw}'")))?;
                }
                "type" => self.parse_struct_def(&mut line)?,
                "global" => self.parse_global(&mut line, linkage)?,
                "declare" => {
                    let (name, signature, flags) = parse_func_sig(&mut line)?;
                    if self.module.func_by_name(&name).is_some() {
                        return err(idx + 1, format!("duplicate function @{name}"));
                    }
                    let mut func = Function::with_name_signature(name, signature);
                    func.flags = flags;
                    func.linkage = linkage;
                    self.module.declare_function(func);
                }
                "function" => {
                    let (name, signature, flags) = parse_func_sig(&mut line)?;
                    line.expect_punct('{')?;
                    let body_start = idx + 1;
                    let mut end = body_start;
                    loop {
                        if end >= self.lines.len() {
                            return err(idx + 1, format!("unterminated function @{name}"));
                        }
                        if self.lines[end].trim() == "}" {
                            break;
                        }
                        end += 1;
                    }
                    if self.module.func_by_name(&name).is_some() {
                        return err(idx + 1, format!("duplicate function @{name}"));
                    }
                    let mut func = Function::with_name_signature(name.clone(), signature.clone());
                    func.flags = flags;
                    func.linkage = linkage;
                    let func_id = self.module.declare_function(func);
                    self.headers.push((
                        func_id,
                        FuncHeader {
                            name,
                            signature,
                            flags,
                            linkage,
                            body: body_start..end,
                            header_line: idx + 1,
                        },
                    ));
                    idx = end;
                }
                other => return err(idx + 1, format!("unknown directive '{other}'")),
            }
            idx += 1;
        }
        Ok(())
    }

    /// `%name` referenced in a field list: resolve, creating a shell that a
    /// later `type` line fills in.
    fn struct_ref(&mut self, name: &str) -> crate::ir::StructId {
        match self.module.struct_by_name(name) {
            Some(id) => id,
            None => self.module.declare_struct(StructType {
                name: name.to_string(),
                fields: Vec::new(),
            }),
        }
    }

    fn parse_struct_def(&mut self, line: &mut Line) -> ParseResult<()> {
        let name = match line.next() {
            Some(Tok::TypeName(s)) => s,
            other => return err(line.no, format!("expected '%name', got {other:?}")),
        };
        line.expect_punct('=')?;
        let kw = line.expect_ident()?;
        if kw != "struct" {
            return err(line.no, format!("expected 'struct', got '{kw}'"));
        }
        line.expect_punct('{')?;
        let mut fields = Vec::new();
        if !line.eat_punct('}') {
            loop {
                fields.push(self.parse_field(line)?);
                if line.eat_punct('}') {
                    break;
                }
                line.expect_punct(',')?;
            }
        }
        if fields.is_empty() {
            return err(line.no, format!("struct %{name} has no fields"));
        }
        let id = self.struct_ref(&name);
        if !self.module.structs[id].fields.is_empty() {
            return err(line.no, format!("duplicate struct type %{name}"));
        }
        self.module.structs[id].fields = fields;
        Ok(())
    }

    fn parse_field(&mut self, line: &mut Line) -> ParseResult<StructField> {
        match line.peek() {
            Some(Tok::TypeName(_)) => {
                let Some(Tok::TypeName(name)) = line.next() else {
                    unreachable!()
                };
                Ok(StructField::Named(self.struct_ref(&name)))
            }
            Some(Tok::Punct('[')) => {
                line.expect_punct('[')?;
                let count = line.expect_int()? as u32;
                if !line.eat_ident("x") {
                    return err(line.no, "expected 'x' in array field");
                }
                let ty = line.expect_type()?;
                line.expect_punct(']')?;
                Ok(StructField::Array(ty, count))
            }
            _ => Ok(StructField::Scalar(line.expect_type()?)),
        }
    }

    fn parse_global(&mut self, line: &mut Line, linkage: Linkage) -> ParseResult<()> {
        let constant = line.eat_ident("const");
        let name = line.expect_sym()?;
        line.expect_punct(':')?;
        let ty = if line.eat_ident("bytes") {
            GlobalType::Bytes(line.expect_int()? as u32)
        } else {
            GlobalType::Scalar(line.expect_type()?)
        };
        let init = if line.eat_punct('=') {
            Some(match line.peek() {
                Some(Tok::Ident(s)) if s == "zero" => {
                    line.next();
                    GlobalInit::Zero
                }
                Some(Tok::Str(_)) => {
                    let Some(Tok::Str(hex)) = line.next() else {
                        unreachable!()
                    };
                    if hex.len() % 2 != 0 {
                        return err(line.no, "odd number of hex digits in byte image");
                    }
                    let mut bytes = Vec::with_capacity(hex.len() / 2);
                    for pair in hex.as_bytes().chunks(2) {
                        let pair = core::str::from_utf8(pair).unwrap();
                        match u8::from_str_radix(pair, 16) {
                            Ok(b) => bytes.push(b),
                            Err(_) => return err(line.no, format!("bad hex byte '{pair}'")),
                        }
                    }
                    GlobalInit::Bytes(bytes)
                }
                _ => GlobalInit::Int(line.expect_int()?),
            })
        } else {
            None
        };
        if let Some(GlobalInit::Bytes(bytes)) = &init {
            if bytes.len() as u32 != ty.size() {
                return err(
                    line.no,
                    format!(
                        "byte initializer has {} bytes, type needs {}",
                        bytes.len(),
                        ty.size()
                    ),
                );
            }
        }
        if self.module.global_by_name(&name).is_some() {
            return err(line.no, format!("duplicate global @{name}"));
        }
        self.module.declare_global(GlobalData {
            name,
            ty,
            init,
            linkage,
            constant,
        });
        Ok(())
    }

    fn parse_body(&self, header: &FuncHeader, func: &mut Function) -> ParseResult<()> {
        let mut blocks: HashMap<String, Block> = HashMap::new();
        let mut values: HashMap<String, Value> = HashMap::new();
        let mut slots: HashMap<String, StackSlot> = HashMap::new();
        let mut current: Option<Block> = None;

        // Branches may target blocks whose header appears later in the
        // text, so pre-create every block mentioned anywhere in the body.
        for idx in header.body.clone() {
            for tok in tokenize(self.lines[idx], idx + 1)? {
                if let Tok::Ident(word) = tok {
                    if word.len() > 5
                        && word.starts_with("block")
                        && word[5..].chars().all(|c| c.is_ascii_digit())
                    {
                        blocks.entry(word).or_insert_with(|| func.dfg.make_block());
                    }
                }
            }
        }

        for idx in header.body.clone() {
            let mut line = self.line(idx)?;
            if line.done() {
                continue;
            }
            if let Some(Tok::Ident(word)) = line.peek() {
                // Block header: `blockN:` or `blockN(v0: ty, ...):`.
                if blocks.contains_key(word) && self.lines[idx].trim_end().ends_with(':') {
                    let word = word.clone();
                    line.next();
                    let block = blocks[&word];
                    if func.layout.is_block_inserted(block) {
                        return err(idx + 1, format!("duplicate block {word}"));
                    }
                    func.layout.append_block(block);
                    if line.eat_punct('(') {
                        loop {
                            let pname = line.expect_ident()?;
                            line.expect_punct(':')?;
                            let ty = line.expect_type()?;
                            let value = func.dfg.append_block_param(block, ty);
                            if values.insert(pname.clone(), value).is_some() {
                                return err(idx + 1, format!("redefinition of {pname}"));
                            }
                            if line.eat_punct(')') {
                                break;
                            }
                            line.expect_punct(',')?;
                        }
                    }
                    line.expect_punct(':')?;
                    current = Some(block);
                    continue;
                }
                // Stack slot: `ssN = stack_slot SIZE`.
                if word.starts_with("ss") && line.toks.get(1) == Some(&Tok::Punct('=')) {
                    let word = line.expect_ident()?;
                    line.expect_punct('=')?;
                    let kw = line.expect_ident()?;
                    if kw != "stack_slot" {
                        return err(idx + 1, format!("expected 'stack_slot', got '{kw}'"));
                    }
                    let size = line.expect_int()? as u32;
                    let slot = func.create_stack_slot(StackSlotData::new(size));
                    slots.insert(word, slot);
                    continue;
                }
            }
            let Some(block) = current else {
                return err(idx + 1, "instruction outside of a block");
            };
            self.parse_inst(&mut line, func, block, &blocks, &mut values, &slots)?;
        }

        for (name, &block) in &blocks {
            if !func.layout.is_block_inserted(block) {
                return err(
                    header.header_line,
                    format!("block {name} is referenced but never defined"),
                );
            }
        }

        // Each block must end in exactly one terminator.
        for block in func.layout.block_order() {
            let insts = func.layout.block_insts(block);
            match insts.last() {
                None => return err(header.header_line, format!("block {block} is empty")),
                Some(&last) => {
                    if !func.dfg.insts[last].opcode().is_terminator() {
                        return err(
                            header.header_line,
                            format!("block {block} does not end in a terminator"),
                        );
                    }
                }
            }
            for &inst in &insts[..insts.len() - 1] {
                if func.dfg.insts[inst].opcode().is_terminator() {
                    return err(
                        header.header_line,
                        format!("terminator in the middle of {block}"),
                    );
                }
            }
        }

        // Every branch must pass exactly as many arguments as its target
        // declares parameters.
        for block in func.layout.block_order() {
            for &inst in func.layout.block_insts(block) {
                let mut branch_calls: Vec<crate::ir::BlockCall> = func.dfg.insts[inst]
                    .branch_destinations()
                    .to_vec();
                if let crate::ir::InstructionData::BranchTable { table, .. } = func.dfg.insts[inst]
                {
                    branch_calls.extend(func.dfg.jump_tables[table].all_branches().copied());
                }
                for call in branch_calls {
                    let target = call.block(&func.dfg.value_lists);
                    let want = func.dfg.num_block_params(target);
                    let got = call.args_slice(&func.dfg.value_lists).len();
                    if want != got {
                        return err(
                            header.header_line,
                            format!(
                                "branch to {target} passes {got} arguments, block has {want} parameters"
                            ),
                        );
                    }
                }
            }
        }

        if let Some(entry) = func.layout.entry_block() {
            let param_tys: Vec<Type> = func
                .dfg
                .block_params(entry)
                .iter()
                .map(|&v| func.dfg.value_type(v))
                .collect();
            if param_tys != header.signature.params {
                return err(
                    header.header_line,
                    "entry block parameters do not match the function signature",
                );
            }
        } else {
            return err(header.header_line, "function body has no blocks");
        }
        Ok(())
    }

    fn parse_value(&self, line: &mut Line, values: &HashMap<String, Value>) -> ParseResult<Value> {
        let name = line.expect_ident()?;
        values
            .get(&name)
            .copied()
            .ok_or_else(|| parse_error(line.no, format!("use of undefined value {name}")))
    }

    fn parse_block_call(
        &self,
        line: &mut Line,
        func: &mut Function,
        blocks: &HashMap<String, Block>,
        values: &HashMap<String, Value>,
    ) -> ParseResult<BlockCall> {
        let name = line.expect_ident()?;
        let Some(&block) = blocks.get(&name) else {
            return err(line.no, format!("unknown block {name}"));
        };
        let mut args = Vec::new();
        if line.eat_punct('(') {
            loop {
                args.push(self.parse_value(line, values)?);
                if line.eat_punct(')') {
                    break;
                }
                line.expect_punct(',')?;
            }
        }
        Ok(BlockCall::new(block, &args, &mut func.dfg.value_lists))
    }

    fn parse_inst(
        &self,
        line: &mut Line,
        func: &mut Function,
        block: Block,
        blocks: &HashMap<String, Block>,
        values: &mut HashMap<String, Value>,
        slots: &HashMap<String, StackSlot>,
    ) -> ParseResult<()> {
        // Optional result list: `vN [, vN]* = `.
        let mut result_names: Vec<String> = Vec::new();
        {
            let mut probe = line.pos;
            let mut names = Vec::new();
            loop {
                match line.toks.get(probe) {
                    Some(Tok::Ident(s)) if s.starts_with('v') => {
                        names.push(s.clone());
                        probe += 1;
                        match line.toks.get(probe) {
                            Some(Tok::Punct(',')) => probe += 1,
                            Some(Tok::Punct('=')) => {
                                result_names = names;
                                line.pos = probe + 1;
                                break;
                            }
                            _ => break,
                        }
                    }
                    _ => break,
                }
            }
        }

        let opcode_word = line.expect_ident()?;
        let ann_ty = if line.eat_punct('.') {
            Some(line.expect_type()?)
        } else {
            None
        };
        let need_ty = |line: &Line, ty: Option<Type>| {
            ty.ok_or_else(|| parse_error(line.no, format!("{opcode_word} needs a type annotation")))
        };

        let mut b = FunctionBuilder::new(func);
        b.switch_to_block(block);

        let mut results: Vec<Value> = Vec::new();
        match opcode_word.as_str() {
            "iconst" => {
                let ty = need_ty(line, ann_ty)?;
                let imm = line.expect_int()?;
                results.push(b.iconst(ty, imm));
            }
            "uextend" | "sextend" | "ireduce" => {
                let ty = need_ty(line, ann_ty)?;
                let arg = self.parse_value(line, values)?;
                let op = match opcode_word.as_str() {
                    "uextend" => Opcode::Uextend,
                    "sextend" => Opcode::Sextend,
                    _ => Opcode::Ireduce,
                };
                results.push(b.unary(op, ty, arg));
            }
            "bnot" | "ineg" => {
                let arg = self.parse_value(line, values)?;
                let ty = b.func.dfg.value_type(arg);
                let op = if opcode_word == "bnot" {
                    Opcode::Bnot
                } else {
                    Opcode::Ineg
                };
                results.push(b.unary(op, ty, arg));
            }
            "iadd" | "isub" | "imul" | "udiv" | "sdiv" | "urem" | "srem" | "band" | "bor"
            | "bxor" | "ishl" | "ushr" | "sshr" => {
                let op = match opcode_word.as_str() {
                    "iadd" => Opcode::Iadd,
                    "isub" => Opcode::Isub,
                    "imul" => Opcode::Imul,
                    "udiv" => Opcode::Udiv,
                    "sdiv" => Opcode::Sdiv,
                    "urem" => Opcode::Urem,
                    "srem" => Opcode::Srem,
                    "band" => Opcode::Band,
                    "bor" => Opcode::Bor,
                    "bxor" => Opcode::Bxor,
                    "ishl" => Opcode::Ishl,
                    "ushr" => Opcode::Ushr,
                    _ => Opcode::Sshr,
                };
                let x = self.parse_value(line, values)?;
                line.expect_punct(',')?;
                let y = self.parse_value(line, values)?;
                results.push(b.binary(op, x, y));
            }
            "icmp" => {
                let cc_word = line.expect_ident()?;
                let cond: IntCC = cc_word
                    .parse()
                    .map_err(|()| parse_error(line.no, format!("unknown condition '{cc_word}'")))?;
                let x = self.parse_value(line, values)?;
                line.expect_punct(',')?;
                let y = self.parse_value(line, values)?;
                results.push(b.icmp(cond, x, y));
            }
            "select" => {
                let c = self.parse_value(line, values)?;
                line.expect_punct(',')?;
                let x = self.parse_value(line, values)?;
                line.expect_punct(',')?;
                let y = self.parse_value(line, values)?;
                results.push(b.select(c, x, y));
            }
            "load" => {
                let ty = need_ty(line, ann_ty)?;
                let addr = self.parse_value(line, values)?;
                let offset = line.parse_offset()?;
                results.push(b.load(ty, addr, offset));
            }
            "store" => {
                let ty = need_ty(line, ann_ty)?;
                let data = self.parse_value(line, values)?;
                line.expect_punct(',')?;
                let addr = self.parse_value(line, values)?;
                let offset = line.parse_offset()?;
                b.store(ty, data, addr, offset);
            }
            "stack_addr" => {
                let name = line.expect_ident()?;
                let Some(&slot) = slots.get(&name) else {
                    return err(line.no, format!("unknown stack slot {name}"));
                };
                let offset = line.parse_offset()?;
                results.push(b.stack_addr(slot, offset));
            }
            "global_addr" => {
                let sym = line.expect_sym()?;
                let Some(global) = self.module.global_by_name(&sym) else {
                    return err(line.no, format!("unknown global @{sym}"));
                };
                results.push(b.global_addr(global));
            }
            "func_addr" => {
                let sym = line.expect_sym()?;
                let Some(f) = self.module.func_by_name(&sym) else {
                    return err(line.no, format!("unknown function @{sym}"));
                };
                results.push(b.func_addr(f));
            }
            "call" => {
                let sym = line.expect_sym()?;
                let Some(callee) = self.module.func_by_name(&sym) else {
                    return err(line.no, format!("unknown function @{sym}"));
                };
                line.expect_punct('(')?;
                let mut args = Vec::new();
                if !line.eat_punct(')') {
                    loop {
                        args.push(self.parse_value(line, values)?);
                        if line.eat_punct(')') {
                            break;
                        }
                        line.expect_punct(',')?;
                    }
                }
                let sig = &self.module.functions[callee].signature;
                if args.len() != sig.params.len() {
                    return err(
                        line.no,
                        format!(
                            "call to @{sym} has {} arguments, signature needs {}",
                            args.len(),
                            sig.params.len()
                        ),
                    );
                }
                let returns = sig.returns.clone();
                let inst = b.call(callee, &args, &returns);
                results.extend(b.func.dfg.inst_results(inst).iter().copied());
            }
            "jump" => {
                let call = self.parse_block_call(line, b.func, blocks, values)?;
                let inst = b.func.dfg.make_inst(InstructionData::Jump {
                    opcode: Opcode::Jump,
                    destination: call,
                });
                b.func.layout.append_inst(inst, block);
            }
            "brif" => {
                let c = self.parse_value(line, values)?;
                line.expect_punct(',')?;
                let then_call = self.parse_block_call(line, b.func, blocks, values)?;
                line.expect_punct(',')?;
                let else_call = self.parse_block_call(line, b.func, blocks, values)?;
                let inst = b.func.dfg.make_inst(InstructionData::Brif {
                    opcode: Opcode::Brif,
                    arg: c,
                    blocks: [then_call, else_call],
                });
                b.func.layout.append_inst(inst, block);
            }
            "br_table" => {
                let x = self.parse_value(line, values)?;
                line.expect_punct(',')?;
                let default = self.parse_block_call(line, b.func, blocks, values)?;
                line.expect_punct(',')?;
                line.expect_punct('[')?;
                let mut table = Vec::new();
                if !line.eat_punct(']') {
                    loop {
                        table.push(self.parse_block_call(line, b.func, blocks, values)?);
                        if line.eat_punct(']') {
                            break;
                        }
                        line.expect_punct(',')?;
                    }
                }
                let jt = b.func.dfg.make_jump_table(JumpTableData::new(default, table));
                let inst = b.func.dfg.make_inst(InstructionData::BranchTable {
                    opcode: Opcode::BrTable,
                    arg: x,
                    table: jt,
                });
                b.func.layout.append_inst(inst, block);
            }
            "return" => {
                let mut args = Vec::new();
                while !line.done() {
                    args.push(self.parse_value(line, values)?);
                    if !line.eat_punct(',') {
                        break;
                    }
                }
                b.ret(&args);
            }
            other => return err(line.no, format!("unknown instruction '{other}'")),
        }

        if results.len() != result_names.len() {
            return err(
                line.no,
                format!(
                    "instruction produces {} results but {} were named",
                    results.len(),
                    result_names.len()
                ),
            );
        }
        for (name, value) in result_names.into_iter().zip(results) {
            if values.insert(name.clone(), value).is_some() {
                return err(line.no, format!("redefinition of {name}"));
            }
        }
        if !line.done() {
            return err(line.no, format!("trailing tokens: {:?}", line.peek()));
        }
        Ok(())
    }
}

/// `@name(ty, ...) [-> ty, ...] [flagwords]`
fn parse_func_sig(line: &mut Line) -> ParseResult<(String, Signature, FunctionFlags)> {
    let name = line.expect_sym()?;
    line.expect_punct('(')?;
    let mut params = Vec::new();
    if !line.eat_punct(')') {
        loop {
            params.push(line.expect_type()?);
            if line.eat_punct(')') {
                break;
            }
            line.expect_punct(',')?;
        }
    }
    let mut returns = Vec::new();
    if line.eat_punct('-') {
        line.expect_punct('>')?;
        loop {
            returns.push(line.expect_type()?);
            if !line.eat_punct(',') {
                break;
            }
        }
    }
    let mut flags = FunctionFlags::default();
    while let Some(Tok::Ident(w)) = line.peek() {
        let w = w.clone();
        match w.as_str() {
            "alwaysinline" => flags.always_inline = true,
            "noinline" => flags.no_inline = true,
            "optnone" => flags.optimize_none = true,
            "asm" => flags.inline_asm = true,
            "allocator" => flags.allocator = true,
            "readnone" => flags.readnone = true,
            other => return err(line.no, format!("unknown attribute '{other}'")),
        }
        line.next();
    }
    Ok((name, Signature::new(params, returns), flags))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_module() {
        let text = r#"
module squanchy
target x86_64-unknown-linux-gnu

type %mem = struct { ptr, i64 }
type %inst = struct { %mem, i32 }

global const @w2c_env_size : i32 = 56
global @buf : bytes 8 = zero
global @blob : bytes 4 = "deadbeef"

declare @calloc(i64, i64) -> ptr allocator

function @add(i32, i32) -> i32 {
block0(v0: i32, v1: i32):
    v2 = iadd v0, v1
    return v2
}
"#;
        let m = parse_module(text).expect("parses");
        assert_eq!(m.name, "squanchy");
        assert_eq!(m.structs.len(), 2);
        let inst_ty = m.struct_by_name("inst").unwrap();
        assert_eq!(m.struct_size(inst_ty), 24);
        let blob = m.global_by_name("blob").unwrap();
        assert_eq!(
            m.globals[blob].init,
            Some(GlobalInit::Bytes(vec![0xde, 0xad, 0xbe, 0xef]))
        );
        let calloc = m.func_by_name("calloc").unwrap();
        assert!(m.functions[calloc].flags.allocator);
        assert!(m.functions[calloc].is_declaration());
        let add = m.func_by_name("add").unwrap();
        assert_eq!(m.functions[add].instruction_count(), 2);
    }

    #[test]
    fn parse_control_flow() {
        let text = r#"
module m
function @f(i32) -> i32 {
block0(v0: i32):
    v1 = iconst.i32 0
    v2 = icmp eq v0, v1
    brif v2, block1, block2(v0)
block1:
    v3 = iconst.i32 42
    jump block2(v3)
block2(v4: i32):
    return v4
}
"#;
        let m = parse_module(text).expect("parses");
        let f = m.func_by_name("f").unwrap();
        let func = &m.functions[f];
        assert_eq!(func.layout.num_blocks(), 3);
        assert_eq!(func.instruction_count(), 6);
    }

    #[test]
    fn recursion_parses() {
        let text = r#"
module m
function @fac(i32) -> i32 {
block0(v0: i32):
    v1 = iconst.i32 1
    v2 = icmp ule v0, v1
    brif v2, block1, block2
block1:
    return v1
block2:
    v3 = isub v0, v1
    v4 = call @fac(v3)
    v5 = imul v0, v4
    return v5
}
"#;
        let m = parse_module(text).expect("parses");
        let f = m.func_by_name("fac").unwrap();
        assert_eq!(m.functions[f].instruction_count(), 8);
    }

    #[test]
    fn undefined_value_is_an_error() {
        let text = "module m\nfunction @f() {\nblock0:\n    v1 = iadd v9, v9\n    return\n}\n";
        let e = parse_module(text).unwrap_err();
        assert!(e.message.contains("undefined value"));
    }

    #[test]
    fn call_arity_checked() {
        let text =
            "module m\ndeclare @g(i32) -> i32\nfunction @f() {\nblock0:\n    v0 = call @g()\n    return\n}\n";
        let e = parse_module(text).unwrap_err();
        assert!(e.message.contains("arguments"));
    }

    #[test]
    fn stack_slots_and_memory() {
        let text = r#"
module m
function @f() -> i32 {
    ss0 = stack_slot 16
block0:
    v0 = stack_addr ss0
    v1 = iconst.i32 7
    store.i32 v1, v0+8
    v2 = load.i32 v0+8
    return v2
}
"#;
        let m = parse_module(text).expect("parses");
        let f = m.func_by_name("f").unwrap();
        let func = &m.functions[f];
        assert_eq!(func.stack_slots.len(), 1);
        assert_eq!(func.instruction_count(), 5);
    }
}
