use crate::debugger::address::GlobalAddress;
use crate::debugger::error::Error;
use gimli::Range;
use std::path::PathBuf;
use std::sync::Arc;

/// Source code point, a row of a line number program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Place {
    pub file: PathBuf,
    pub line_number: u64,
    pub address: GlobalAddress,
    pub is_stmt: bool,
}

/// Function description taken from the debug information.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    /// Fully qualified name, e.g. `main.main` or `net/http.(*Client).Get`.
    pub name: String,
    pub ranges: Vec<Range>,
}

impl Function {
    pub fn entry(&self) -> GlobalAddress {
        GlobalAddress::from(
            self.ranges
                .iter()
                .map(|r| r.begin)
                .min()
                .unwrap_or_default(),
        )
    }

    pub fn contains(&self, pc: GlobalAddress) -> bool {
        pc.in_ranges(&self.ranges)
    }

    /// Package part of the qualified name. The first dot after the last
    /// slash separates the package path from the local name.
    pub fn package_name(&self) -> &str {
        let start = self.name.rfind('/').map(|i| i + 1).unwrap_or(0);
        match self.name[start..].find('.') {
            Some(i) => &self.name[..start + i],
            None => &self.name,
        }
    }
}

/// Opaque reference to a type inside the debug information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRef(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub offset: usize,
    pub type_ref: TypeRef,
}

/// Shape of a type, the Go kinds the evaluator distinguishes between.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Int,
    Uint,
    Float,
    Complex,
    Bool,
    Pointer(Option<TypeRef>),
    Array { elem: TypeRef, len: i64 },
    Slice { elem: TypeRef },
    String,
    Struct { fields: Vec<Field> },
    /// Go map. `hash` references the runtime hash table struct the map
    /// header points at, its layout drives map iteration.
    Map {
        key: TypeRef,
        value: TypeRef,
        hash: TypeRef,
    },
    Chan,
    Func,
    Interface,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeMeta {
    pub name: Option<String>,
    pub byte_size: u64,
    pub kind: TypeKind,
}

impl TypeMeta {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unknown>")
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        match &self.kind {
            TypeKind::Struct { fields } => fields.iter().find(|f| f.name == name),
            _ => None,
        }
    }
}

/// Where a variable value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarLocation {
    /// Offset from the frame base (the call frame address).
    FrameOffset(i64),
    /// Fixed address in the object file namespace.
    Static(GlobalAddress),
    /// Location description the debugger does not evaluate.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableMeta {
    pub name: String,
    pub type_ref: Option<TypeRef>,
    pub location: VarLocation,
}

/// The symbol and line oracle. Answers address-to-source questions from
/// DWARF-like debug data; the debugger core never parses debug sections
/// itself.
pub trait DebugInfo {
    fn function_by_name(&self, name: &str) -> Option<Function>;

    fn function_by_pc(&self, pc: GlobalAddress) -> Option<Function>;

    /// Source place covering the given address.
    fn place_from_pc(&self, pc: GlobalAddress) -> Option<Place>;

    /// Statement places registered for a file line.
    fn places_for_line(&self, file: &str, line: u64) -> Vec<Place>;

    /// All line table rows inside the function ranges, address ordered.
    fn function_places(&self, function: &Function) -> Vec<Place>;

    /// Address of a non-debug symbol (runtime internals are found this way).
    fn symbol_address(&self, name: &str) -> Option<GlobalAddress>;

    fn type_by_name(&self, name: &str) -> Option<TypeRef>;

    fn type_meta(&self, type_ref: TypeRef) -> Result<Arc<TypeMeta>, Error>;

    /// Variables (locals and arguments) visible at the address.
    fn scope_variables(&self, pc: GlobalAddress) -> Vec<VariableMeta>;

    /// Package level variable by fully qualified name (`main.culprit`).
    fn global_variable(&self, name: &str) -> Option<VariableMeta>;

    /// Frame description: offset of the call frame address from the stack
    /// pointer at `pc`.
    fn cfa_offset(&self, pc: GlobalAddress) -> Result<i64, Error>;
}
