//! Byte layout of the per-instance module context.
//!
//! Compiled code addresses everything it needs at run time (memory base and
//! length, globals, tables, type ids, imported-function descriptors) as
//! constant offsets from the module-context pointer it receives on entry.
//! This schema is computed once per module at compile time and is the single
//! source of truth for both the code generator (which bakes the offsets into
//! instructions) and the runtime (which populates the buffer at
//! instantiation).
//!
//! Layout, in order, all fields 8-byte aligned, total size 16-byte aligned:
//!
//! ```text
//! [ local memory base ptr, local memory length ]      16 bytes (if defined)
//! [ imported memory descr ptr, exporter ctx ptr ]     16 bytes (if imported)
//! [ global slots, 16 bytes each                  ]    16 * num_globals
//! [ table descriptor pointers                    ]    8 * num_tables
//! [ type-id array pointer                        ]    8 (if any table)
//! [ imported function descriptors                ]    24 * num_imported_funcs
//! ```
//!
//! Imported globals occupy a full 16-byte slot like local ones, but only the
//! first 8 bytes are used: a pointer to the exporting instance's slot.

use crate::{GlobalIndex, Module, TableIndex};

/// Size of one imported-function descriptor:
/// `(executable_ptr, callee_context_ptr, type_id)`; see
/// [`ModuleContextOffsets::imported_function`].
pub const IMPORTED_FUNCTION_RECORD_SIZE: u32 = 24;

/// Size of one global slot. v128-sized so every global type fits.
pub const GLOBAL_SLOT_SIZE: u32 = 16;

/// The module-context layout schema for one module.
#[derive(Clone, Debug)]
pub struct ModuleContextOffsets {
    local_memory: Option<u32>,
    imported_memory: Option<u32>,
    globals: u32,
    num_globals: u32,
    tables: u32,
    num_tables: u32,
    type_ids: Option<u32>,
    imported_functions: u32,
    num_imported_functions: u32,
    size: u32,
}

impl ModuleContextOffsets {
    pub fn new(module: &Module) -> Self {
        let mut offset = 0u32;
        let mut local_memory = None;
        let mut imported_memory = None;
        match &module.memory {
            Some(plan) if plan.imported => {
                imported_memory = Some(offset);
                offset += 16;
            }
            Some(_) => {
                local_memory = Some(offset);
                offset += 16;
            }
            None => {}
        }

        let globals = offset;
        let num_globals = module.globals.len() as u32;
        offset += num_globals * GLOBAL_SLOT_SIZE;

        let tables = offset;
        let num_tables = module.tables.len() as u32;
        offset += num_tables * 8;

        let type_ids = if num_tables > 0 {
            let o = offset;
            offset += 8;
            Some(o)
        } else {
            None
        };

        let imported_functions = offset;
        let num_imported_functions = module.num_imported_functions() as u32;
        offset += num_imported_functions * IMPORTED_FUNCTION_RECORD_SIZE;

        let size = (offset + 15) & !15;
        Self {
            local_memory,
            imported_memory,
            globals,
            num_globals,
            tables,
            num_tables,
            type_ids,
            imported_functions,
            num_imported_functions,
            size,
        }
    }

    /// Total buffer size in bytes, 16-byte aligned.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Offset of the locally defined memory's base pointer.
    pub fn local_memory_base(&self) -> Option<u32> {
        self.local_memory
    }

    /// Offset of the locally defined memory's byte length.
    pub fn local_memory_len(&self) -> Option<u32> {
        self.local_memory.map(|o| o + 8)
    }

    /// Offset of the pointer to the exporting instance's
    /// `(base, len)` memory descriptor.
    pub fn imported_memory_descriptor(&self) -> Option<u32> {
        self.imported_memory
    }

    /// Offset of the pointer to the exporting instance's module context.
    pub fn imported_memory_owner_ctx(&self) -> Option<u32> {
        self.imported_memory.map(|o| o + 8)
    }

    /// Offset of the 16-byte slot for `index`. For imported globals the slot
    /// holds a pointer to the exporter's slot in its first 8 bytes.
    pub fn global_slot(&self, index: GlobalIndex) -> u32 {
        debug_assert!(index.as_u32() < self.num_globals);
        self.globals + index.as_u32() * GLOBAL_SLOT_SIZE
    }

    /// Offset of the pointer to the [`TableDescriptor`] for `index`.
    ///
    /// [`TableDescriptor`]: crate::TableDescriptor
    pub fn table_ptr(&self, index: TableIndex) -> u32 {
        debug_assert!(index.as_u32() < self.num_tables);
        self.tables + index.as_u32() * 8
    }

    /// Offset of the pointer to the instance's type-id array.
    pub fn type_ids_ptr(&self) -> Option<u32> {
        self.type_ids
    }

    /// Offsets of the `(executable, callee_ctx, type_id)` record for imported
    /// function `index`.
    pub fn imported_function(&self, index: u32) -> ImportedFunctionOffsets {
        debug_assert!(index < self.num_imported_functions);
        let base = self.imported_functions + index * IMPORTED_FUNCTION_RECORD_SIZE;
        ImportedFunctionOffsets {
            executable: base,
            module_ctx: base + 8,
            type_id: base + 16,
        }
    }

    pub fn num_imported_functions(&self) -> u32 {
        self.num_imported_functions
    }
}

/// Field offsets within one imported-function descriptor.
#[derive(Copy, Clone, Debug)]
pub struct ImportedFunctionOffsets {
    pub executable: u32,
    pub module_ctx: u32,
    pub type_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        FuncType, FunctionImport, Global, GlobalInit, MemoryPlan, Module, ModuleId, Table,
        TypeIndex, ValType,
    };

    fn module_with_shape(imported_memory: bool) -> Module {
        let mut m = Module::new(ModuleId::from_bytes(b"shape"));
        let ty = m.types.push(FuncType::default());
        for _ in 0..2 {
            m.imported_functions.push(FunctionImport {
                module: "env".to_string(),
                field: "f".to_string(),
                ty,
            });
            m.functions.push(ty);
        }
        m.memory = Some(MemoryPlan {
            minimum: 1,
            maximum: None,
            imported: imported_memory,
            shared: false,
        });
        for _ in 0..3 {
            m.globals.push(Global {
                ty: ValType::I64,
                mutable: true,
                initializer: GlobalInit::I64(0),
            });
        }
        m.tables.push(Table {
            minimum: 10,
            maximum: None,
        });
        let _ = TypeIndex::from_u32(0);
        m
    }

    #[test]
    fn layout_is_dense_and_aligned() {
        let m = module_with_shape(false);
        let offs = ModuleContextOffsets::new(&m);
        assert_eq!(offs.local_memory_base(), Some(0));
        assert_eq!(offs.local_memory_len(), Some(8));
        assert_eq!(offs.imported_memory_descriptor(), None);
        assert_eq!(offs.global_slot(GlobalIndex::from_u32(0)), 16);
        assert_eq!(offs.global_slot(GlobalIndex::from_u32(2)), 48);
        assert_eq!(offs.table_ptr(TableIndex::from_u32(0)), 64);
        assert_eq!(offs.type_ids_ptr(), Some(72));
        let f0 = offs.imported_function(0);
        assert_eq!(f0.executable, 80);
        assert_eq!(f0.module_ctx, 88);
        assert_eq!(f0.type_id, 96);
        let f1 = offs.imported_function(1);
        assert_eq!(f1.executable, 104);
        assert_eq!(offs.size() % 16, 0);
        assert!(offs.size() >= 128);
    }

    #[test]
    fn imported_memory_uses_indirection_words() {
        let m = module_with_shape(true);
        let offs = ModuleContextOffsets::new(&m);
        assert_eq!(offs.local_memory_base(), None);
        assert_eq!(offs.imported_memory_descriptor(), Some(0));
        assert_eq!(offs.imported_memory_owner_ctx(), Some(8));
    }
}
