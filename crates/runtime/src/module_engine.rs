//! Per-instance module engines: the module-context buffer, memories, tables,
//! globals and import resolution.

use std::sync::{Arc, Mutex};

use log::trace;

use kestrel_environ::{
    CompileError, FuncIndex, FuncType, FunctionInstance, GlobalInit, MemoryPlan, Module, ModuleContextOffsets,
    TableDescriptor, TableIndex, Trap, TypeId, WASM_PAGE_SIZE,
};

use crate::call_engine::CallEngine;
use crate::code_memory::CodeMemory;
use crate::engine::{CompiledModule, Engine};
use crate::error::RuntimeError;
use crate::host::HostFunction;

/// The per-instance module context: an aligned, pinned byte buffer whose
/// layout was fixed at compile time. Written during instantiation and import
/// resolution (single-threaded by contract) and by memory growth under the
/// memory lock; read by native code in between, while the writers are
/// quiescent.
pub(crate) struct CtxBytes {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for CtxBytes {}
unsafe impl Sync for CtxBytes {}

impl CtxBytes {
    fn new(len: usize) -> CtxBytes {
        let layout = std::alloc::Layout::from_size_align(len.max(16), 16).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "module context allocation failed");
        CtxBytes { ptr, len: len.max(16) }
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.ptr
    }

    /// Write a little-endian u64 at `offset`.
    pub(crate) unsafe fn write_u64(&self, offset: u32, value: u64) {
        debug_assert!(offset as usize + 8 <= self.len);
        unsafe {
            (self.ptr.add(offset as usize) as *mut u64).write_unaligned(value);
        }
    }

    pub(crate) unsafe fn read_u64(&self, offset: u32) -> u64 {
        debug_assert!(offset as usize + 8 <= self.len);
        unsafe { (self.ptr.add(offset as usize) as *const u64).read_unaligned() }
    }

    unsafe fn write_u128(&self, offset: u32, value: u128) {
        debug_assert!(offset as usize + 16 <= self.len);
        unsafe {
            (self.ptr.add(offset as usize) as *mut u128).write_unaligned(value);
        }
    }
}

impl Drop for CtxBytes {
    fn drop(&mut self) {
        let layout = std::alloc::Layout::from_size_align(self.len, 16).unwrap();
        unsafe { std::alloc::dealloc(self.ptr, layout) };
    }
}

/// A linear memory owned by an instance.
pub struct MemoryInstance {
    buffer: Vec<u8>,
    maximum: Option<u32>,
}

impl MemoryInstance {
    fn new(plan: &MemoryPlan) -> MemoryInstance {
        MemoryInstance {
            buffer: vec![0; plan.minimum as usize * WASM_PAGE_SIZE as usize],
            maximum: plan.maximum,
        }
    }

    pub fn size_pages(&self) -> u32 {
        (self.buffer.len() as u64 / WASM_PAGE_SIZE) as u32
    }

    /// Grow by `delta` pages, returning the old page count or -1.
    fn grow(&mut self, delta: u32) -> i32 {
        let old = self.size_pages();
        let new = match old.checked_add(delta) {
            Some(n) => n,
            None => return -1,
        };
        if let Some(max) = self.maximum {
            if new > max {
                return -1;
            }
        }
        if u64::from(new) * WASM_PAGE_SIZE > usize::MAX as u64 {
            return -1;
        }
        self.buffer
            .resize(new as usize * WASM_PAGE_SIZE as usize, 0);
        old as i32
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    fn base_len(&self) -> (u64, u64) {
        (self.buffer.as_ptr() as u64, self.buffer.len() as u64)
    }
}

/// One table plus the descriptor native code dereferences.
struct TableStorage {
    descriptor: Box<TableDescriptor>,
    /// Keeps the element buffer alive; the descriptor points into it.
    _elems: Box<[*const FunctionInstance]>,
}

unsafe impl Send for TableStorage {}
unsafe impl Sync for TableStorage {}

/// The stable array of function-reference records for this instance.
/// Records are written during instantiation and import resolution, while no
/// native code of this instance runs; afterwards they are read-only.
struct FunctionTable(Box<[core::cell::UnsafeCell<FunctionInstance>]>);

unsafe impl Send for FunctionTable {}
unsafe impl Sync for FunctionTable {}

impl FunctionTable {
    fn ptr(&self, index: usize) -> *const FunctionInstance {
        self.0[index].get() as *const FunctionInstance
    }

    /// Fill one record. Only called while no native code runs in this
    /// instance and no concurrent reader exists.
    unsafe fn fill(&self, index: usize, fi: FunctionInstance) {
        unsafe {
            *self.0[index].get() = fi;
        }
    }

    unsafe fn get(&self, index: usize) -> FunctionInstance {
        let fi = unsafe { &*self.0[index].get() };
        FunctionInstance {
            executable: fi.executable,
            module_ctx: fi.module_ctx,
            type_id: fi.type_id,
        }
    }
}

/// An element-segment entry whose function is imported and not yet resolved.
struct PendingElement {
    table: usize,
    slot: usize,
    function: FuncIndex,
}

pub(crate) enum InstanceKind {
    Wasm {
        compiled: Arc<CompiledModule>,
        memory: Option<Mutex<MemoryInstance>>,
        /// The instance exporting our memory, once resolved.
        memory_owner: Mutex<Option<ModuleEngine>>,
        tables: Vec<TableStorage>,
        #[allow(dead_code)]
        type_ids: Box<[u64]>,
        pending_elements: Mutex<Vec<PendingElement>>,
        /// Exporters we hold alive.
        imports: Mutex<Vec<ModuleEngine>>,
    },
    Host {
        #[allow(dead_code)]
        code: CodeMemory,
        functions: Vec<HostFunction>,
    },
}

pub(crate) struct ModuleEngineInner {
    pub(crate) engine: Engine,
    pub(crate) module: Arc<Module>,
    pub(crate) ctx: CtxBytes,
    pub(crate) kind: InstanceKind,
    functions: FunctionTable,
    pub(crate) closed: Mutex<Option<String>>,
}

/// A module instance's engine: owns the context buffer, memory, tables and
/// function references, and mints call engines for its functions.
#[derive(Clone)]
pub struct ModuleEngine {
    pub(crate) inner: Arc<ModuleEngineInner>,
}

impl Engine {
    /// Instantiate `module`, which must have been compiled by this engine.
    pub fn new_module_engine(&self, module: &Arc<Module>) -> Result<ModuleEngine, CompileError> {
        let compiled = self.compiled(&module.id).ok_or_else(|| {
            CompileError::InvalidModule("module has not been compiled".to_string())
        })?;
        let offsets = ModuleContextOffsets::new(module);
        let ctx = CtxBytes::new(offsets.size() as usize);

        // Memory.
        let memory = match &module.memory {
            Some(plan) if !plan.imported => {
                let mem = MemoryInstance::new(plan);
                let (base, len) = mem.base_len();
                unsafe {
                    ctx.write_u64(offsets.local_memory_base().unwrap(), base);
                    ctx.write_u64(offsets.local_memory_len().unwrap(), len);
                }
                Some(Mutex::new(mem))
            }
            _ => None,
        };

        // Data segments.
        if let Some(mem) = &memory {
            let mut mem = mem.lock().unwrap();
            for seg in &module.data {
                let start = seg.offset as usize;
                let end = start + seg.bytes.len();
                if end > mem.buffer.len() {
                    return Err(CompileError::InvalidModule(format!(
                        "data segment [{start}, {end}) out of bounds"
                    )));
                }
                mem.buffer[start..end].copy_from_slice(&seg.bytes);
            }
        }

        // Type ids.
        let type_ids: Box<[u64]> = module
            .types
            .values()
            .map(|ty| u64::from(self.type_id(ty).0))
            .collect();
        if let Some(off) = offsets.type_ids_ptr() {
            unsafe { ctx.write_u64(off, type_ids.as_ptr() as u64) };
        }

        // Function-reference records: local functions now, imports at
        // resolution.
        let functions = FunctionTable(
            module
                .functions
                .keys()
                .map(|_| {
                    core::cell::UnsafeCell::new(FunctionInstance {
                        executable: core::ptr::null(),
                        module_ctx: core::ptr::null_mut(),
                        type_id: 0,
                    })
                })
                .collect(),
        );
        for (fi, &ty) in module.functions.iter() {
            if let Some(def) = module.defined_func_index(fi) {
                let type_id = u64::from(self.type_id(&module.types[ty]).0);
                unsafe {
                    functions.fill(
                        fi.as_u32() as usize,
                        FunctionInstance {
                            executable: compiled.entry_ptr(def.as_u32() as usize),
                            module_ctx: ctx.base(),
                            type_id,
                        },
                    );
                }
            }
        }

        // Globals.
        for (gi, global) in module.globals.iter() {
            if module.is_imported_global(gi) {
                continue;
            }
            let slot = offsets.global_slot(gi);
            let value: u128 = match global.initializer {
                GlobalInit::I32(v) => v as u32 as u128,
                GlobalInit::I64(v) => v as u64 as u128,
                GlobalInit::F32(bits) => bits as u128,
                GlobalInit::F64(bits) => bits as u128,
                GlobalInit::V128(v) => v,
                GlobalInit::FuncRef(None) => 0,
                GlobalInit::FuncRef(Some(f)) => {
                    functions.ptr(f.as_u32() as usize) as u64 as u128
                }
                GlobalInit::GetGlobal(_) => 0, // resolved with the import
            };
            unsafe { ctx.write_u128(slot, value) };
        }

        // Tables and active element segments.
        let mut tables = Vec::with_capacity(module.tables.len());
        let mut pending = Vec::new();
        for (ti, table) in module.tables.iter() {
            let elems: Box<[*const FunctionInstance]> =
                vec![core::ptr::null(); table.minimum as usize].into();
            let descriptor = Box::new(TableDescriptor {
                len: u64::from(table.minimum),
                elems: elems.as_ptr() as *mut *const FunctionInstance,
            });
            unsafe {
                ctx.write_u64(offsets.table_ptr(ti), &*descriptor as *const _ as u64);
            }
            tables.push(TableStorage {
                descriptor,
                _elems: elems,
            });
        }
        for seg in &module.elements {
            let storage = &tables[seg.table.as_u32() as usize];
            for (k, entry) in seg.entries.iter().enumerate() {
                let Some(f) = entry else { continue };
                let slot = seg.offset as usize + k;
                if slot >= storage.descriptor.len as usize {
                    return Err(CompileError::InvalidModule(format!(
                        "element segment entry {slot} out of table bounds"
                    )));
                }
                if module.is_imported_function(*f) {
                    pending.push(PendingElement {
                        table: seg.table.as_u32() as usize,
                        slot,
                        function: *f,
                    });
                } else {
                    unsafe {
                        *storage.descriptor.elems.add(slot) =
                            functions.ptr(f.as_u32() as usize);
                    }
                }
            }
        }

        let inner = Arc::new(ModuleEngineInner {
            engine: self.clone(),
            module: module.clone(),
            ctx,
            kind: InstanceKind::Wasm {
                compiled,
                memory,
                memory_owner: Mutex::new(None),
                tables,
                type_ids,
                pending_elements: Mutex::new(pending),
                imports: Mutex::new(Vec::new()),
            },
            functions,
            closed: Mutex::new(None),
        });
        self.register_instance(inner.ctx.base() as usize, &inner);
        trace!("instantiated {:?}", module.name);
        Ok(ModuleEngine { inner })
    }
}

impl Engine {
    /// Build a host module from a table of named host functions. The module
    /// compiles to one host-call trampoline per function.
    pub fn new_host_module(
        &self,
        name: &str,
        host_functions: Vec<HostFunction>,
    ) -> Result<ModuleEngine, CompileError> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static HOST_MODULE_COUNTER: AtomicU64 = AtomicU64::new(0);

        // A synthetic module so backtraces and import resolution have names
        // and types to work with.
        let counter = HOST_MODULE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut id = name.as_bytes().to_vec();
        id.extend_from_slice(b"#host#");
        id.extend_from_slice(&counter.to_le_bytes());
        let mut module = Module::new(kestrel_environ::ModuleId(id));
        module.name = Some(name.to_string());

        let mut trampolines = Vec::with_capacity(host_functions.len());
        for (i, f) in host_functions.iter().enumerate() {
            let ty = module.types.push(f.ty.clone());
            let fi = module.functions.push(ty);
            module.function_names.insert(fi, f.name.clone());
            let module_function = matches!(f.kind, crate::host::HostFuncKind::WithModule(_));
            trampolines.push(self.0.machine.compile_host_call_trampoline(
                i as u32,
                &f.ty,
                module_function,
            )?);
        }

        let mut offsets = Vec::with_capacity(trampolines.len());
        let mut at = 0usize;
        for t in &trampolines {
            offsets.push(at);
            at += (t.len() + 15) & !15;
        }
        let mut code = CodeMemory::with_capacity(at.max(16))?;
        {
            let image = code.as_mut_slice();
            for (t, &off) in trampolines.iter().zip(&offsets) {
                image[off..off + t.len()].copy_from_slice(t);
            }
        }
        code.publish()?;

        let ctx = CtxBytes::new(16);
        let functions = FunctionTable(
            host_functions
                .iter()
                .map(|_| {
                    core::cell::UnsafeCell::new(FunctionInstance {
                        executable: core::ptr::null(),
                        module_ctx: core::ptr::null_mut(),
                        type_id: 0,
                    })
                })
                .collect(),
        );
        for (i, f) in host_functions.iter().enumerate() {
            let type_id = u64::from(self.type_id(&f.ty).0);
            unsafe {
                functions.fill(
                    i,
                    FunctionInstance {
                        executable: code.base().add(offsets[i]),
                        module_ctx: ctx.base(),
                        type_id,
                    },
                );
            }
        }

        let inner = Arc::new(ModuleEngineInner {
            engine: self.clone(),
            module: Arc::new(module),
            ctx,
            kind: InstanceKind::Host {
                code,
                functions: host_functions,
            },
            functions,
            closed: Mutex::new(None),
        });
        self.register_instance(inner.ctx.base() as usize, &inner);
        Ok(ModuleEngine { inner })
    }
}

impl ModuleEngine {
    pub fn module(&self) -> &Arc<Module> {
        &self.inner.module
    }

    pub(crate) fn ctx_ptr(&self) -> *mut u8 {
        self.inner.ctx.base()
    }

    /// A callable for locally defined function `index`.
    pub fn new_function(&self, index: FuncIndex) -> Result<CallEngine, CompileError> {
        let InstanceKind::Wasm { compiled, .. } = &self.inner.kind else {
            return Err(CompileError::InvalidModule(
                "host modules have no compiled functions".to_string(),
            ));
        };
        let def = self.inner.module.defined_func_index(index).ok_or_else(|| {
            CompileError::InvalidModule(format!(
                "function {index:?} is imported; call it through its exporter"
            ))
        })?;
        let ty = self.inner.module.func_type(index).clone();
        Ok(CallEngine::new(
            self.clone(),
            ty,
            compiled.preamble_ptr(def.as_u32() as usize),
            compiled.entry_ptr(def.as_u32() as usize),
        ))
    }

    /// A callable for the exported function named `name`.
    pub fn exported_function(&self, name: &str) -> Result<CallEngine, CompileError> {
        match self.inner.module.exports.get(name) {
            Some(kestrel_environ::Export::Function(i)) => self.new_function(*i),
            _ => Err(CompileError::InvalidModule(format!(
                "no exported function {name:?}"
            ))),
        }
    }

    /// Fill the 24-byte descriptor for imported function `index` from the
    /// function `remote_index` of `exporter`.
    pub fn resolve_imported_function(
        &self,
        index: u32,
        remote_index: FuncIndex,
        exporter: &ModuleEngine,
    ) -> Result<(), CompileError> {
        let InstanceKind::Wasm {
            compiled,
            pending_elements,
            imports,
            ..
        } = &self.inner.kind
        else {
            return Err(CompileError::InvalidModule(
                "host modules import nothing".to_string(),
            ));
        };
        let import = self
            .inner
            .module
            .imported_functions
            .get(index as usize)
            .ok_or_else(|| {
                CompileError::InvalidModule(format!("no function import slot {index}"))
            })?;
        let declared = &self.inner.module.types[import.ty];
        let remote = exporter.function_instance(remote_index)?;
        let declared_id = u64::from(self.inner.engine.type_id(declared).0);
        if declared_id != remote.type_id {
            return Err(CompileError::InvalidModule(format!(
                "import {}.{} signature mismatch",
                import.module, import.field
            )));
        }

        let d = compiled.offsets.imported_function(index);
        unsafe {
            self.inner.ctx.write_u64(d.executable, remote.executable as u64);
            self.inner.ctx.write_u64(d.module_ctx, remote.module_ctx as u64);
            self.inner.ctx.write_u64(d.type_id, declared_id);
            self.inner.functions.fill(
                FuncIndex::from_u32(index).as_u32() as usize,
                FunctionInstance {
                    executable: remote.executable,
                    module_ctx: remote.module_ctx,
                    type_id: declared_id,
                },
            );
        }

        // Element-segment entries waiting on this import.
        let mut pending = pending_elements.lock().unwrap();
        let InstanceKind::Wasm { tables, .. } = &self.inner.kind else {
            unreachable!()
        };
        pending.retain(|p| {
            if p.function.as_u32() != index {
                return true;
            }
            unsafe {
                *tables[p.table].descriptor.elems.add(p.slot) =
                    self.inner.functions.ptr(index as usize);
            }
            false
        });
        imports.lock().unwrap().push(exporter.clone());
        Ok(())
    }

    /// Point this instance's imported-memory words at the exporter's memory.
    pub fn resolve_imported_memory(&self, exporter: &ModuleEngine) -> Result<(), CompileError> {
        let InstanceKind::Wasm {
            compiled,
            memory_owner,
            imports,
            ..
        } = &self.inner.kind
        else {
            return Err(CompileError::InvalidModule(
                "host modules import nothing".to_string(),
            ));
        };
        let descriptor = compiled.offsets.imported_memory_descriptor().ok_or_else(|| {
            CompileError::InvalidModule("module does not import memory".to_string())
        })?;
        let pair = exporter.memory_pair_ptr()?;
        unsafe {
            self.inner.ctx.write_u64(descriptor, pair);
            self.inner.ctx.write_u64(
                compiled.offsets.imported_memory_owner_ctx().unwrap(),
                exporter.ctx_ptr() as u64,
            );
        }
        *memory_owner.lock().unwrap() = Some(exporter.clone());
        imports.lock().unwrap().push(exporter.clone());
        Ok(())
    }

    /// The address of the `(base, len)` pair describing this instance's
    /// memory, chasing import indirections to the owner.
    fn memory_pair_ptr(&self) -> Result<u64, CompileError> {
        let InstanceKind::Wasm { compiled, .. } = &self.inner.kind else {
            return Err(CompileError::InvalidModule(
                "host modules have no memory".to_string(),
            ));
        };
        if let Some(off) = compiled.offsets.local_memory_base() {
            Ok(self.ctx_ptr() as u64 + u64::from(off))
        } else if let Some(off) = compiled.offsets.imported_memory_descriptor() {
            let pair = unsafe { self.inner.ctx.read_u64(off) };
            if pair == 0 {
                return Err(CompileError::InvalidModule(
                    "imported memory not resolved yet".to_string(),
                ));
            }
            Ok(pair)
        } else {
            Err(CompileError::InvalidModule(
                "module has no memory".to_string(),
            ))
        }
    }

    /// Grow this instance's memory (or its imported owner's) by `delta`
    /// pages. Returns the previous size in pages, or -1.
    pub(crate) fn grow_memory(&self, delta: u32) -> i32 {
        match &self.inner.kind {
            InstanceKind::Wasm {
                memory: Some(memory),
                compiled,
                ..
            } => {
                let mut mem = memory.lock().unwrap();
                let old = mem.grow(delta);
                if old >= 0 {
                    let (base, len) = mem.base_len();
                    unsafe {
                        self.inner
                            .ctx
                            .write_u64(compiled.offsets.local_memory_base().unwrap(), base);
                        self.inner
                            .ctx
                            .write_u64(compiled.offsets.local_memory_len().unwrap(), len);
                    }
                }
                old
            }
            InstanceKind::Wasm { memory_owner, .. } => {
                let owner = memory_owner.lock().unwrap().clone();
                match owner {
                    Some(owner) => owner.grow_memory(delta),
                    None => -1,
                }
            }
            InstanceKind::Host { .. } => -1,
        }
    }

    /// Read/write views of this instance's own memory, for embedder setup
    /// and tests.
    pub fn with_memory<R>(&self, f: impl FnOnce(&mut MemoryInstance) -> R) -> Option<R> {
        match &self.inner.kind {
            InstanceKind::Wasm {
                memory: Some(memory),
                ..
            } => Some(f(&mut memory.lock().unwrap())),
            _ => None,
        }
    }

    /// The function-reference record for `index`, for tables and funcref
    /// globals. The returned pointer round-trips through a 64-bit table
    /// element.
    pub fn function_instance_reference(&self, index: FuncIndex) -> u64 {
        self.inner.functions.ptr(index.as_u32() as usize) as u64
    }

    fn function_instance(&self, index: FuncIndex) -> Result<FunctionInstance, CompileError> {
        let fi = unsafe { self.inner.functions.get(index.as_u32() as usize) };
        if fi.executable.is_null() {
            return Err(CompileError::InvalidModule(format!(
                "function {index:?} of the exporter is not resolved"
            )));
        }
        Ok(fi)
    }

    /// Host-side `call_indirect`: a callable for the table element at
    /// `offset` checked against `type_id`.
    pub fn lookup_function(
        &self,
        table: TableIndex,
        type_id: TypeId,
        offset: u32,
    ) -> Result<CallEngine, RuntimeError> {
        let InstanceKind::Wasm { tables, .. } = &self.inner.kind else {
            return Err(RuntimeError::Closed("host module".to_string()));
        };
        let storage = &tables[table.as_u32() as usize];
        if u64::from(offset) >= storage.descriptor.len {
            return Err(RuntimeError::Trap {
                trap: Trap::TableOutOfBounds,
                backtrace: Default::default(),
            });
        }
        let elem = unsafe { *storage.descriptor.elems.add(offset as usize) };
        if elem.is_null() {
            return Err(RuntimeError::Trap {
                trap: Trap::IndirectCallNullPointer,
                backtrace: Default::default(),
            });
        }
        let fi = unsafe { &*elem };
        if fi.type_id != u64::from(type_id.0) {
            return Err(RuntimeError::Trap {
                trap: Trap::IndirectCallTypeMismatch,
                backtrace: Default::default(),
            });
        }
        // Map the executable back to its module to find the preamble and
        // signature.
        let target = self
            .inner
            .engine
            .module_of_addr(fi.executable as usize)
            .ok_or_else(|| RuntimeError::Closed("table element is not wasm code".to_string()))?;
        let def = target
            .function_index_of(fi.executable as usize)
            .expect("address inside module maps to a function");
        let index = target.module.func_index(
            kestrel_environ::DefinedFuncIndex::from_u32(def as u32),
        );
        let ty = target.module.func_type(index).clone();
        let target_instance = self
            .inner
            .engine
            .instance_of_ctx(fi.module_ctx as usize)
            .ok_or_else(|| RuntimeError::Closed("table element instance is gone".to_string()))?;
        Ok(CallEngine::new(
            ModuleEngine {
                inner: target_instance,
            },
            ty,
            target.preamble_ptr(def),
            fi.executable,
        ))
    }

    /// Close this instance with `reason`; in-flight calls observe it at the
    /// next termination check, new calls fail immediately.
    pub fn close_with(&self, reason: impl Into<String>) {
        *self.inner.closed.lock().unwrap() = Some(reason.into());
    }

    pub(crate) fn closed_reason(&self) -> Option<String> {
        self.inner.closed.lock().unwrap().clone()
    }

    pub(crate) fn host_functions(&self) -> Option<&[HostFunction]> {
        match &self.inner.kind {
            InstanceKind::Host { functions, .. } => Some(functions),
            _ => None,
        }
    }

    pub(crate) fn compiled(&self) -> Option<&Arc<CompiledModule>> {
        match &self.inner.kind {
            InstanceKind::Wasm { compiled, .. } => Some(compiled),
            _ => None,
        }
    }

    /// Resolve an imported global to the exporter's slot.
    pub fn resolve_imported_global(
        &self,
        index: kestrel_environ::GlobalIndex,
        exporter: &ModuleEngine,
        exporter_index: kestrel_environ::GlobalIndex,
    ) -> Result<(), CompileError> {
        let InstanceKind::Wasm { compiled, imports, .. } = &self.inner.kind else {
            return Err(CompileError::InvalidModule(
                "host modules import nothing".to_string(),
            ));
        };
        if !self.inner.module.is_imported_global(index) {
            return Err(CompileError::InvalidModule(format!(
                "global {index:?} is not imported"
            )));
        }
        let exporter_compiled = exporter.compiled().ok_or_else(|| {
            CompileError::InvalidModule("global exporter is not a wasm instance".to_string())
        })?;
        let remote_slot = exporter.ctx_ptr() as u64
            + u64::from(exporter_compiled.offsets.global_slot(exporter_index));
        unsafe {
            self.inner
                .ctx
                .write_u64(compiled.offsets.global_slot(index), remote_slot);
        }
        // Initialize local globals that copy this import's value.
        for (gi, global) in self.inner.module.globals.iter() {
            if self.inner.module.is_imported_global(gi) {
                continue;
            }
            if let GlobalInit::GetGlobal(src) = global.initializer {
                if src == index {
                    let value = unsafe { (remote_slot as *const u128).read_unaligned() };
                    unsafe {
                        self.inner
                            .ctx
                            .write_u128(compiled.offsets.global_slot(gi), value)
                    };
                }
            }
        }
        imports.lock().unwrap().push(exporter.clone());
        Ok(())
    }

    pub(crate) fn func_type_of(&self, ty: &FuncType) -> TypeId {
        self.inner.engine.type_id(ty)
    }
}
