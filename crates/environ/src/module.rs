//! The in-memory module representation consumed by the compiler.
//!
//! Index spaces follow the usual wasm convention: the function index space
//! covers imported functions first, then locally defined ones, and similarly
//! for globals. Entity references are `u32` newtypes so cross-references stay
//! compact and type-safe.

use core::fmt;

use cranelift_entity::{entity_impl, PrimaryMap};
use rustc_hash::FxHashMap;

use crate::Operator;

/// An index into the module's function index space (imports first).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncIndex(u32);
entity_impl!(FuncIndex, "f");

/// An index into the locally defined functions of a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefinedFuncIndex(u32);
entity_impl!(DefinedFuncIndex, "df");

/// An index into the module's type section.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeIndex(u32);
entity_impl!(TypeIndex, "ty");

/// An index into the module's global index space (imports first).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalIndex(u32);
entity_impl!(GlobalIndex, "g");

/// An index into the module's table index space.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableIndex(u32);
entity_impl!(TableIndex, "t");

/// A wasm value type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    V128,
}

impl ValType {
    /// Number of u64 slots this type occupies in the flat param/result buffer
    /// exchanged with the host.
    pub fn slot_count(self) -> usize {
        match self {
            ValType::V128 => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::V128 => "v128",
        };
        f.write_str(s)
    }
}

/// A function signature: parameter and result types.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncType {
    pub fn new(params: Vec<ValType>, results: Vec<ValType>) -> Self {
        Self { params, results }
    }

    /// Slots needed for a flat u64 param/result exchange buffer:
    /// `max(params, results)` with v128 counting double.
    pub fn param_result_slots(&self) -> usize {
        let p: usize = self.params.iter().map(|t| t.slot_count()).sum();
        let r: usize = self.results.iter().map(|t| t.slot_count()).sum();
        p.max(r)
    }
}

/// The shape of a linear memory, in 64 KiB wasm pages.
#[derive(Copy, Clone, Debug)]
pub struct MemoryPlan {
    pub minimum: u32,
    pub maximum: Option<u32>,
    /// Whether the memory is satisfied by an import rather than defined here.
    pub imported: bool,
    pub shared: bool,
}

/// Bytes per wasm page.
pub const WASM_PAGE_SIZE: u64 = 65536;

/// How a global is initialized at instantiation time.
#[derive(Copy, Clone, Debug)]
pub enum GlobalInit {
    I32(i32),
    I64(i64),
    /// Bit pattern of an f32.
    F32(u32),
    /// Bit pattern of an f64.
    F64(u64),
    V128(u128),
    /// A funcref global pointing at a function of this module, or null.
    FuncRef(Option<FuncIndex>),
    /// Copy the value of an imported global.
    GetGlobal(GlobalIndex),
}

/// A global variable declaration.
#[derive(Copy, Clone, Debug)]
pub struct Global {
    pub ty: ValType,
    pub mutable: bool,
    pub initializer: GlobalInit,
}

/// A table declaration. Tables hold funcrefs.
#[derive(Copy, Clone, Debug)]
pub struct Table {
    pub minimum: u32,
    pub maximum: Option<u32>,
}

/// An active element segment: initializes `table` at `offset` with function
/// references (`None` leaves the slot null).
#[derive(Clone, Debug)]
pub struct ElementSegment {
    pub table: TableIndex,
    pub offset: u32,
    pub entries: Vec<Option<FuncIndex>>,
}

/// An active data segment for the module's memory.
#[derive(Clone, Debug)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// An imported function: module/field names plus its declared type.
#[derive(Clone, Debug)]
pub struct FunctionImport {
    pub module: String,
    pub field: String,
    pub ty: TypeIndex,
}

/// What a module export refers to.
#[derive(Copy, Clone, Debug)]
pub enum Export {
    Function(FuncIndex),
    Memory,
    Global(GlobalIndex),
    Table(TableIndex),
}

/// The body of a locally defined function: extra locals (run-length encoded
/// as in the binary format) and the already-decoded operator sequence.
#[derive(Clone, Debug, Default)]
pub struct FunctionBody {
    pub locals: Vec<(u32, ValType)>,
    pub operators: Vec<Operator>,
}

/// Stable module identity used as the compiled-module and cache key.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ModuleId(pub Vec<u8>);

impl ModuleId {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// A validated wasm module, immutable once compilation begins.
#[derive(Default)]
pub struct Module {
    pub id: ModuleId,
    /// The module name from the name section, if any.
    pub name: Option<String>,
    pub types: PrimaryMap<TypeIndex, FuncType>,
    /// Type of every function in the index space, imports included.
    pub functions: PrimaryMap<FuncIndex, TypeIndex>,
    pub imported_functions: Vec<FunctionImport>,
    pub memory: Option<MemoryPlan>,
    pub globals: PrimaryMap<GlobalIndex, Global>,
    pub num_imported_globals: usize,
    pub tables: PrimaryMap<TableIndex, Table>,
    pub elements: Vec<ElementSegment>,
    pub data: Vec<DataSegment>,
    pub code: PrimaryMap<DefinedFuncIndex, FunctionBody>,
    pub exports: FxHashMap<String, Export>,
    /// Function names from the name section.
    pub function_names: FxHashMap<FuncIndex, String>,
}

impl Default for ModuleId {
    fn default() -> Self {
        ModuleId(Vec::new())
    }
}

impl Module {
    pub fn new(id: ModuleId) -> Self {
        Module {
            id,
            ..Default::default()
        }
    }

    pub fn num_imported_functions(&self) -> usize {
        self.imported_functions.len()
    }

    pub fn num_defined_functions(&self) -> usize {
        self.code.len()
    }

    pub fn num_defined_globals(&self) -> usize {
        self.globals.len() - self.num_imported_globals
    }

    pub fn is_imported_function(&self, index: FuncIndex) -> bool {
        index.as_u32() < self.imported_functions.len() as u32
    }

    pub fn is_imported_global(&self, index: GlobalIndex) -> bool {
        index.as_u32() < self.num_imported_globals as u32
    }

    /// Translate a function-space index into a defined-function index.
    /// Returns `None` for imported functions.
    pub fn defined_func_index(&self, index: FuncIndex) -> Option<DefinedFuncIndex> {
        index
            .as_u32()
            .checked_sub(self.imported_functions.len() as u32)
            .map(DefinedFuncIndex::from_u32)
    }

    /// The inverse of [`Module::defined_func_index`].
    pub fn func_index(&self, defined: DefinedFuncIndex) -> FuncIndex {
        FuncIndex::from_u32(defined.as_u32() + self.imported_functions.len() as u32)
    }

    pub fn func_type(&self, index: FuncIndex) -> &FuncType {
        &self.types[self.functions[index]]
    }

    /// The display name of a function for backtraces:
    /// the name-section entry, or `$N` when absent.
    pub fn function_name(&self, index: FuncIndex) -> String {
        match self.function_names.get(&index) {
            Some(name) => name.clone(),
            None => format!("${}", index.as_u32()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defined_index_translation() {
        let mut m = Module::new(ModuleId::from_bytes(b"m"));
        let ty = m.types.push(FuncType::default());
        m.imported_functions.push(FunctionImport {
            module: "env".to_string(),
            field: "f".to_string(),
            ty,
        });
        m.functions.push(ty); // the import
        m.functions.push(ty); // one local function
        m.code.push(FunctionBody::default());

        let import = FuncIndex::from_u32(0);
        let local = FuncIndex::from_u32(1);
        assert!(m.is_imported_function(import));
        assert_eq!(m.defined_func_index(import), None);
        assert_eq!(
            m.defined_func_index(local),
            Some(DefinedFuncIndex::from_u32(0))
        );
        assert_eq!(m.func_index(DefinedFuncIndex::from_u32(0)), local);
    }

    #[test]
    fn param_result_slots_count_v128_twice() {
        let ty = FuncType::new(vec![ValType::I32, ValType::V128], vec![ValType::I64]);
        assert_eq!(ty.param_result_slots(), 3);
    }
}
