//! Module-building helpers for the engine tests.

use std::sync::Arc;

use kestrel_environ::{
    ElementSegment, FuncIndex, FuncType, FunctionBody, FunctionImport, MemoryPlan, Module,
    ModuleId, Operator, Table, TableIndex, TypeIndex, ValType,
};
use kestrel_runtime::{Engine, EngineConfig};

pub fn engine() -> Engine {
    let _ = env_logger::builder().is_test(true).try_init();
    let machine = kestrel_codegen::lookup(&"aarch64-unknown-linux-gnu".parse().unwrap()).unwrap();
    Engine::with_machine(EngineConfig::default(), machine).unwrap()
}

pub fn engine_with(config: EngineConfig) -> Engine {
    let _ = env_logger::builder().is_test(true).try_init();
    let machine = kestrel_codegen::lookup(&"aarch64-unknown-linux-gnu".parse().unwrap()).unwrap();
    Engine::with_machine(config, machine).unwrap()
}

/// A builder for test modules, mirroring the shape decoding would produce.
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(id: &[u8]) -> ModuleBuilder {
        ModuleBuilder {
            module: Module::new(ModuleId::from_bytes(id)),
        }
    }

    pub fn ty(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> TypeIndex {
        self.module.types.push(FuncType::new(params, results))
    }

    pub fn import_func(&mut self, module: &str, field: &str, ty: TypeIndex) -> FuncIndex {
        debug_assert!(
            self.module.code.is_empty(),
            "imports precede defined functions"
        );
        self.module.imported_functions.push(FunctionImport {
            module: module.to_string(),
            field: field.to_string(),
            ty,
        });
        self.module.functions.push(ty)
    }

    pub fn func(&mut self, ty: TypeIndex, ops: Vec<Operator>) -> FuncIndex {
        let fi = self.module.functions.push(ty);
        self.module.code.push(FunctionBody {
            locals: vec![],
            operators: ops,
        });
        fi
    }

    pub fn func_with_locals(
        &mut self,
        ty: TypeIndex,
        locals: Vec<(u32, ValType)>,
        ops: Vec<Operator>,
    ) -> FuncIndex {
        let fi = self.module.functions.push(ty);
        self.module.code.push(FunctionBody {
            locals,
            operators: ops,
        });
        fi
    }

    pub fn name_func(&mut self, f: FuncIndex, name: &str) {
        self.module.function_names.insert(f, name.to_string());
    }

    pub fn memory(&mut self, minimum: u32, maximum: Option<u32>) {
        self.module.memory = Some(MemoryPlan {
            minimum,
            maximum,
            imported: false,
            shared: false,
        });
    }

    pub fn table(&mut self, minimum: u32) -> TableIndex {
        self.module.tables.push(Table {
            minimum,
            maximum: None,
        })
    }

    pub fn elements(&mut self, table: TableIndex, offset: u32, entries: Vec<Option<FuncIndex>>) {
        self.module.elements.push(ElementSegment {
            table,
            offset,
            entries,
        });
    }

    /// Direct access for shapes the helpers do not cover.
    pub fn build_module_mut(&mut self) -> &mut Module {
        &mut self.module
    }

    pub fn build(self) -> Arc<Module> {
        Arc::new(self.module)
    }
}
