//! A module: the unit of work of the pipeline.
//!
//! A module owns named struct types, globals and functions, and carries the
//! target triple both input and runtime are normalised to before linking.

use core::fmt;

use cranelift_entity::PrimaryMap;
use target_lexicon::Triple;

use super::entities::{Func, Global, StructId};
use super::function::{Function, Linkage};
use super::types::Type;

/// A field of a named struct type.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StructField {
    Scalar(Type),
    /// `[count x ty]`
    Array(Type, u32),
    /// A nested named struct.
    Named(StructId),
}

/// A named struct type.
///
/// Only the size and alignment of a struct ever matter to the pipeline (the
/// lifted code addresses fields by byte offset), but the fields are kept for
/// printing and for computing that size with C layout rules.
#[derive(Clone, PartialEq, Debug)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<StructField>,
}

/// The initializer of a global.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum GlobalInit {
    /// A scalar integer constant.
    Int(i64),
    /// An explicit byte image.
    Bytes(Vec<u8>),
    /// All zeroes.
    Zero,
}

/// The type of a global: a scalar or an opaque byte blob.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GlobalType {
    Scalar(Type),
    Bytes(u32),
}

impl GlobalType {
    pub fn size(self) -> u32 {
        match self {
            Self::Scalar(ty) => ty.bytes(),
            Self::Bytes(n) => n,
        }
    }
}

/// A global variable.
#[derive(Clone, PartialEq, Debug)]
pub struct GlobalData {
    pub name: String,
    pub ty: GlobalType,
    /// `None` for external declarations.
    pub init: Option<GlobalInit>,
    pub linkage: Linkage,
    /// Constant globals can be folded into their readers.
    pub constant: bool,
}

impl GlobalData {
    pub fn is_declaration(&self) -> bool {
        self.init.is_none()
    }

    /// Read a scalar of type `ty` at byte offset `offset` from a constant
    /// initializer, little-endian. Returns `None` for non-constant globals,
    /// declarations and out-of-bounds reads.
    pub fn read_int(&self, offset: u32, ty: Type) -> Option<u64> {
        if !self.constant || !ty.is_int() {
            return None;
        }
        let size = self.ty.size();
        if offset + ty.bytes() > size {
            return None;
        }
        match self.init.as_ref()? {
            GlobalInit::Zero => Some(0),
            GlobalInit::Int(v) => {
                // Scalar globals are only readable at offset zero with the
                // matching width.
                if offset == 0 && ty.bytes() == size {
                    Some(ty.wrap(*v as u64))
                } else {
                    None
                }
            }
            GlobalInit::Bytes(bytes) => {
                let mut buf = [0u8; 8];
                let start = offset as usize;
                let len = ty.bytes() as usize;
                buf[..len].copy_from_slice(bytes.get(start..start + len)?);
                Some(ty.wrap(u64::from_le_bytes(buf)))
            }
        }
    }
}

/// An IR module.
#[derive(Clone)]
pub struct Module {
    /// Module name; informational only.
    pub name: String,

    /// Target triple. Both the input and the runtime module are re-tagged
    /// to one fixed triple by the loader so they link without layout
    /// conflicts.
    pub triple: Triple,

    pub structs: PrimaryMap<StructId, StructType>,
    pub globals: PrimaryMap<Global, GlobalData>,
    pub functions: PrimaryMap<Func, Function>,
}

impl Module {
    /// Create an empty module with the fixed pipeline triple.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triple: normalized_triple(),
            structs: PrimaryMap::new(),
            globals: PrimaryMap::new(),
            functions: PrimaryMap::new(),
        }
    }

    /// Look up a function by symbol name.
    pub fn func_by_name(&self, name: &str) -> Option<Func> {
        self.functions
            .iter()
            .find(|(_, f)| f.name == name)
            .map(|(id, _)| id)
    }

    /// Look up a global by symbol name.
    pub fn global_by_name(&self, name: &str) -> Option<Global> {
        self.globals
            .iter()
            .find(|(_, g)| g.name == name)
            .map(|(id, _)| id)
    }

    /// Look up a struct type by name (without the leading `%`).
    pub fn struct_by_name(&self, name: &str) -> Option<StructId> {
        self.structs
            .iter()
            .find(|(_, s)| s.name == name)
            .map(|(id, _)| id)
    }

    /// Add a function, returning its id.
    pub fn declare_function(&mut self, func: Function) -> Func {
        debug_assert!(
            self.func_by_name(&func.name).is_none(),
            "duplicate function {}",
            func.name
        );
        self.functions.push(func)
    }

    /// Add a global, returning its id.
    pub fn declare_global(&mut self, data: GlobalData) -> Global {
        debug_assert!(
            self.global_by_name(&data.name).is_none(),
            "duplicate global {}",
            data.name
        );
        self.globals.push(data)
    }

    /// Add a named struct type, returning its id.
    pub fn declare_struct(&mut self, ty: StructType) -> StructId {
        self.structs.push(ty)
    }

    /// Alignment of a struct in bytes, with C layout rules.
    pub fn struct_align(&self, id: StructId) -> u32 {
        self.structs[id]
            .fields
            .iter()
            .map(|f| self.field_align(f))
            .max()
            .unwrap_or(1)
    }

    fn field_align(&self, field: &StructField) -> u32 {
        match field {
            StructField::Scalar(ty) | StructField::Array(ty, _) => ty.bytes(),
            StructField::Named(id) => self.struct_align(*id),
        }
    }

    fn field_size(&self, field: &StructField) -> u32 {
        match field {
            StructField::Scalar(ty) => ty.bytes(),
            StructField::Array(ty, n) => ty.bytes() * n,
            StructField::Named(id) => self.struct_size(*id),
        }
    }

    /// Size of a struct in bytes, with C layout rules (natural alignment,
    /// tail padding to the struct's own alignment).
    pub fn struct_size(&self, id: StructId) -> u32 {
        let mut offset = 0u32;
        for field in &self.structs[id].fields {
            let align = self.field_align(field);
            offset = offset.next_multiple_of(align);
            offset += self.field_size(field);
        }
        let align = self.struct_align(id);
        offset.next_multiple_of(align).max(1)
    }

    /// Byte offset of field `index` of a struct.
    pub fn struct_field_offset(&self, id: StructId, index: usize) -> u32 {
        let mut offset = 0u32;
        for (i, field) in self.structs[id].fields.iter().enumerate() {
            let align = self.field_align(field);
            offset = offset.next_multiple_of(align);
            if i == index {
                return offset;
            }
            offset += self.field_size(field);
        }
        panic!("field index {index} out of bounds for {}", self.structs[id].name);
    }

    /// Total number of placed instructions across all definitions.
    pub fn instruction_count(&self) -> usize {
        self.functions
            .values()
            .map(|f| f.instruction_count())
            .sum()
    }

    /// Temporarily take a function body out of the module so that passes
    /// can mutate it while reading the module. Pair with [`put_function`].
    ///
    /// [`put_function`]: Self::put_function
    pub fn take_function(&mut self, id: Func) -> Function {
        core::mem::take(&mut self.functions[id])
    }

    /// Put a function taken with [`take_function`] back in place.
    ///
    /// [`take_function`]: Self::take_function
    pub fn put_function(&mut self, id: Func, func: Function) {
        self.functions[id] = func;
    }

    /// Iterate over the ids of all function definitions.
    pub fn defined_functions(&self) -> Vec<Func> {
        self.functions
            .iter()
            .filter(|(_, f)| !f.is_declaration())
            .map(|(id, _)| id)
            .collect()
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new("module")
    }
}

/// The fixed triple all modules are normalised to before linking.
pub fn normalized_triple() -> Triple {
    "x86_64-unknown-linux-gnu"
        .parse()
        .expect("fixed triple parses")
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        crate::write::write_module(f, self)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_layout() {
        let mut m = Module::new("t");
        // struct { ptr, i64, i64, i64, i8 } -> 40 bytes, align 8.
        let mem = m.declare_struct(StructType {
            name: "wasm_rt_memory_t".to_string(),
            fields: vec![
                StructField::Scalar(Type::Ptr),
                StructField::Scalar(Type::I64),
                StructField::Scalar(Type::I64),
                StructField::Scalar(Type::I64),
                StructField::Scalar(Type::I8),
            ],
        });
        assert_eq!(m.struct_align(mem), 8);
        assert_eq!(m.struct_size(mem), 40);
        assert_eq!(m.struct_field_offset(mem, 3), 24);

        // Nested structs and arrays.
        let outer = m.declare_struct(StructType {
            name: "w2c_squanchy".to_string(),
            fields: vec![
                StructField::Named(mem),
                StructField::Scalar(Type::I32),
                StructField::Array(Type::I8, 5),
            ],
        });
        assert_eq!(m.struct_size(outer), 56);
        assert_eq!(m.struct_field_offset(outer, 1), 40);
    }

    #[test]
    fn const_global_reads() {
        let g = GlobalData {
            name: "g".to_string(),
            ty: GlobalType::Bytes(8),
            init: Some(GlobalInit::Bytes(vec![1, 0, 0, 0, 0xff, 0, 0, 0])),
            linkage: Linkage::Public,
            constant: true,
        };
        assert_eq!(g.read_int(0, Type::I32), Some(1));
        assert_eq!(g.read_int(4, Type::I8), Some(0xff));
        assert_eq!(g.read_int(6, Type::I32), None);

        let z = GlobalData {
            name: "z".to_string(),
            ty: GlobalType::Scalar(Type::I32),
            init: Some(GlobalInit::Int(56)),
            linkage: Linkage::Public,
            constant: true,
        };
        assert_eq!(z.read_int(0, Type::I32), Some(56));
        assert_eq!(z.read_int(0, Type::I16), None);
    }
}
