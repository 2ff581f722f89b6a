//! The engine: compilation orchestration, the compiled-module table, shared
//! helper functions, and the wait/notify registry.

use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;

use log::{debug, warn};
use rustc_hash::FxHashMap;

use kestrel_codegen::{link_image, plan_image, CompiledFunction, Machine};
use kestrel_environ::{
    BuiltinFunctionIndex, CompileError, ExitCode, FuncType, Module, ModuleContextOffsets,
    ModuleId, TypeId,
};
use kestrel_frontend::{translate_function, TranslationConfig};
use kestrel_ssa::{layout_blocks, passes, DominatorTree, Function, LoopAnalysis, Type};

use crate::cache::{self, Cache, CacheEntry, CachedFunction, Deserialized};
use crate::code_memory::CodeMemory;
use crate::module_engine::ModuleEngineInner;

/// Engine-wide configuration.
pub struct EngineConfig {
    /// Emit termination checks at loop back-edges so long-running guest code
    /// can be cancelled.
    pub ensure_termination: bool,
    /// Guest stack ceiling, in u64 units. Growth beyond this reports a stack
    /// overflow.
    pub call_stack_ceiling: usize,
    /// Initial guest stack size, in u64 units.
    pub initial_stack_size: usize,
    /// Optional compiled-module cache.
    pub cache: Option<Arc<dyn Cache>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ensure_termination: false,
            call_stack_ceiling: 5_000_000,
            initial_stack_size: 512,
            cache: None,
        }
    }
}

/// The compiled form of one module.
pub struct CompiledModule {
    pub(crate) module: Arc<Module>,
    pub(crate) code: CodeMemory,
    pub(crate) functions: Vec<CachedFunction>,
    pub(crate) offsets: ModuleContextOffsets,
}

impl CompiledModule {
    pub(crate) fn base(&self) -> usize {
        self.code.base() as usize
    }

    /// The host-entry address of defined function `i`.
    pub(crate) fn preamble_ptr(&self, i: usize) -> *const u8 {
        unsafe { self.code.base().add(self.functions[i].offset as usize) }
    }

    /// The guest-entry address of defined function `i`, past the preamble.
    pub(crate) fn entry_ptr(&self, i: usize) -> *const u8 {
        unsafe {
            self.code
                .base()
                .add((self.functions[i].offset + self.functions[i].preamble_size) as usize)
        }
    }

    /// The unique defined function whose body covers `addr`, per the offset
    /// table. Trailing trampoline regions are attributed to their function.
    pub(crate) fn function_index_of(&self, addr: usize) -> Option<usize> {
        if !self.code.contains(addr) {
            return None;
        }
        let off = (addr - self.base()) as u32;
        let i = self.functions.partition_point(|f| f.offset <= off);
        i.checked_sub(1)
    }
}

/// The engine's shared helper executables, compiled once per engine.
pub(crate) struct SharedFunctions {
    code: CodeMemory,
    stack_grow: u32,
    memory_grow: u32,
    check_exit: u32,
    wait32: u32,
    wait64: u32,
    notify: u32,
    resume: u32,
}

impl SharedFunctions {
    fn compile(machine: &dyn Machine) -> Result<SharedFunctions, CompileError> {
        let mut parts: Vec<Vec<u8>> = Vec::new();
        let mut offsets = Vec::new();
        let mut push = |parts: &mut Vec<Vec<u8>>, offsets: &mut Vec<u32>, bytes: Vec<u8>| {
            let off = parts.iter().map(|p| p.len() as u32).sum::<u32>();
            let off = (off + 15) & !15;
            offsets.push(off);
            let prev: u32 = parts.iter().map(|p| p.len() as u32).sum();
            if off > prev {
                parts.push(vec![0; (off - prev) as usize]);
            }
            parts.push(bytes);
        };
        push(&mut parts, &mut offsets, machine.compile_stack_grow_sequence());
        push(
            &mut parts,
            &mut offsets,
            machine.compile_builtin_trampoline(ExitCode::GROW_MEMORY, &[Type::I32], &[Type::I32]),
        );
        push(
            &mut parts,
            &mut offsets,
            machine.compile_builtin_trampoline(ExitCode::CHECK_MODULE_EXIT_CODE, &[], &[]),
        );
        push(
            &mut parts,
            &mut offsets,
            machine.compile_builtin_trampoline(
                ExitCode::call_builtin_function(BuiltinFunctionIndex::MemoryAtomicWait32),
                &[Type::I64, Type::I32, Type::I64],
                &[Type::I32],
            ),
        );
        push(
            &mut parts,
            &mut offsets,
            machine.compile_builtin_trampoline(
                ExitCode::call_builtin_function(BuiltinFunctionIndex::MemoryAtomicWait64),
                &[Type::I64, Type::I64, Type::I64],
                &[Type::I32],
            ),
        );
        push(
            &mut parts,
            &mut offsets,
            machine.compile_builtin_trampoline(
                ExitCode::call_builtin_function(BuiltinFunctionIndex::MemoryAtomicNotify),
                &[Type::I64, Type::I32],
                &[Type::I32],
            ),
        );
        push(&mut parts, &mut offsets, machine.compile_resume_stub());

        let total: usize = parts.iter().map(|p| p.len()).sum();
        let mut code = CodeMemory::with_capacity(total)?;
        let image = code.as_mut_slice();
        let mut at = 0;
        for p in &parts {
            image[at..at + p.len()].copy_from_slice(p);
            at += p.len();
        }
        code.publish()?;
        Ok(SharedFunctions {
            code,
            stack_grow: offsets[0],
            memory_grow: offsets[1],
            check_exit: offsets[2],
            wait32: offsets[3],
            wait64: offsets[4],
            notify: offsets[5],
            resume: offsets[6],
        })
    }

    fn ptr(&self, off: u32) -> u64 {
        self.code.base() as u64 + u64::from(off)
    }

    pub(crate) fn stack_grow_ptr(&self) -> u64 {
        self.ptr(self.stack_grow)
    }
    pub(crate) fn memory_grow_ptr(&self) -> u64 {
        self.ptr(self.memory_grow)
    }
    pub(crate) fn check_exit_ptr(&self) -> u64 {
        self.ptr(self.check_exit)
    }
    pub(crate) fn wait32_ptr(&self) -> u64 {
        self.ptr(self.wait32)
    }
    pub(crate) fn wait64_ptr(&self) -> u64 {
        self.ptr(self.wait64)
    }
    pub(crate) fn notify_ptr(&self) -> u64 {
        self.ptr(self.notify)
    }
    pub(crate) fn resume_ptr(&self) -> u64 {
        self.ptr(self.resume)
    }
}

#[derive(Default)]
struct CompiledModules {
    by_id: FxHashMap<ModuleId, Arc<CompiledModule>>,
    /// Sorted by executable base address for O(log n) address lookup.
    sorted: Vec<Arc<CompiledModule>>,
}

impl CompiledModules {
    fn insert(&mut self, cm: Arc<CompiledModule>) {
        self.by_id.insert(cm.module.id.clone(), cm.clone());
        let at = self.sorted.partition_point(|m| m.base() < cm.base());
        self.sorted.insert(at, cm);
    }

    fn remove(&mut self, id: &ModuleId) {
        if let Some(cm) = self.by_id.remove(id) {
            let base = cm.base();
            if let Some(at) = self
                .sorted
                .binary_search_by_key(&base, |m| m.base())
                .ok()
            {
                self.sorted.remove(at);
            }
        }
    }

    fn of_addr(&self, addr: usize) -> Option<Arc<CompiledModule>> {
        let i = self.sorted.partition_point(|m| m.base() <= addr);
        let cm = self.sorted.get(i.checked_sub(1)?)?;
        cm.code.contains(addr).then(|| cm.clone())
    }
}

#[derive(Default)]
struct TypeRegistry {
    ids: FxHashMap<FuncType, u32>,
}

/// Waiters parked by `memory.atomic.wait*`, keyed by absolute address.
#[derive(Default)]
pub(crate) struct WaitMap {
    entries: Mutex<FxHashMap<u64, Arc<WaitEntry>>>,
}

struct WaitEntry {
    lock: Mutex<u64>,
    cond: Condvar,
}

impl WaitMap {
    /// Park until notified or timed out. `still_expected` re-checks the
    /// memory cell under the entry lock. Returns the wasm result code:
    /// 0 woken, 1 value mismatch, 2 timed out.
    pub(crate) fn wait(
        &self,
        addr: u64,
        still_expected: impl FnOnce() -> bool,
        timeout_ns: i64,
    ) -> i32 {
        let entry = {
            let mut map = self.entries.lock().unwrap();
            map.entry(addr)
                .or_insert_with(|| {
                    Arc::new(WaitEntry {
                        lock: Mutex::new(0),
                        cond: Condvar::new(),
                    })
                })
                .clone()
        };
        let generation = entry.lock.lock().unwrap();
        if !still_expected() {
            return 1;
        }
        let start_gen = *generation;
        if timeout_ns < 0 {
            let mut g = generation;
            while *g == start_gen {
                g = entry.cond.wait(g).unwrap();
            }
            0
        } else {
            let deadline = Duration::from_nanos(timeout_ns as u64);
            let (g, result) = entry.cond.wait_timeout(generation, deadline).unwrap();
            if *g != start_gen {
                0
            } else if result.timed_out() {
                2
            } else {
                0
            }
        }
    }

    /// Wake up to `count` waiters at `addr`; returns how many were woken at
    /// most (all parked waiters are released together).
    pub(crate) fn notify(&self, addr: u64, count: u32) -> i32 {
        let entry = {
            let map = self.entries.lock().unwrap();
            map.get(&addr).cloned()
        };
        let Some(entry) = entry else { return 0 };
        let mut generation = entry.lock.lock().unwrap();
        *generation += 1;
        entry.cond.notify_all();
        drop(generation);
        count.min(i32::MAX as u32) as i32
    }
}

pub(crate) struct EngineInner {
    pub(crate) machine: Box<dyn Machine>,
    pub(crate) config: EngineConfig,
    version: String,
    pub(crate) shared: SharedFunctions,
    compiled: RwLock<CompiledModules>,
    types: Mutex<TypeRegistry>,
    /// Module-context pointer → instance, for exit-code dispatch.
    pub(crate) instances: Mutex<FxHashMap<usize, Weak<ModuleEngineInner>>>,
    pub(crate) waiters: WaitMap,
}

/// The compilation and execution engine. Cheap to clone; all clones share
/// the compiled-module table and the helper executables.
#[derive(Clone)]
pub struct Engine(pub(crate) Arc<EngineInner>);

impl Engine {
    /// An engine targeting the host architecture.
    pub fn new(config: EngineConfig) -> Result<Engine, CompileError> {
        let machine = kestrel_codegen::native()?;
        Engine::with_machine(config, machine)
    }

    /// An engine with an explicit back end; compilation-only workflows can
    /// cross-compile with this.
    pub fn with_machine(
        config: EngineConfig,
        machine: Box<dyn Machine>,
    ) -> Result<Engine, CompileError> {
        let shared = SharedFunctions::compile(machine.as_ref())?;
        Ok(Engine(Arc::new(EngineInner {
            machine,
            config,
            version: env!("CARGO_PKG_VERSION").to_string(),
            shared,
            compiled: RwLock::new(CompiledModules::default()),
            types: Mutex::new(TypeRegistry::default()),
            instances: Mutex::new(FxHashMap::default()),
            waiters: WaitMap::default(),
        })))
    }

    /// Canonical id for a function type; equal ids mean `call_indirect`
    /// accepts the target.
    pub fn type_id(&self, ty: &FuncType) -> TypeId {
        let mut reg = self.0.types.lock().unwrap();
        let next = reg.ids.len() as u32;
        TypeId(*reg.ids.entry(ty.clone()).or_insert(next))
    }

    /// Compile the module's local functions. Idempotent per module identity;
    /// consults and populates the configured cache.
    pub fn compile_module(&self, module: Arc<Module>) -> Result<(), CompileError> {
        {
            let compiled = self.0.compiled.read().unwrap();
            if compiled.by_id.contains_key(&module.id) {
                return Ok(());
            }
        }

        if let Some(entry) = self.consult_cache(&module)? {
            let cm = self.materialize(module.clone(), entry)?;
            self.0.compiled.write().unwrap().insert(Arc::new(cm));
            return Ok(());
        }

        let cm = self.compile_fresh(&module)?;
        if let Some(cache) = &self.0.config.cache {
            let entry = CacheEntry {
                functions: cm.functions.clone(),
                executable: unsafe {
                    core::slice::from_raw_parts(cm.code.base(), cm.code.len()).to_vec()
                },
            };
            cache.add(&module.id, &cache::serialize(&self.0.version, &entry));
        }
        self.0.compiled.write().unwrap().insert(Arc::new(cm));
        Ok(())
    }

    fn consult_cache(&self, module: &Arc<Module>) -> Result<Option<CacheEntry>, CompileError> {
        let Some(cache) = &self.0.config.cache else {
            return Ok(None);
        };
        let Some(bytes) = cache.get(&module.id) else {
            return Ok(None);
        };
        match cache::deserialize(&self.0.version, &bytes) {
            Ok(Deserialized::Ok(entry)) => {
                debug!("compiled-module cache hit for {:?}", module.name);
                Ok(Some(entry))
            }
            Ok(Deserialized::Stale) => {
                warn!("stale cache entry for {:?}, deleting", module.name);
                cache.delete(&module.id);
                Ok(None)
            }
            Err(e) => Err(CompileError::Cache(e)),
        }
    }

    fn materialize(
        &self,
        module: Arc<Module>,
        entry: CacheEntry,
    ) -> Result<CompiledModule, CompileError> {
        if entry.functions.len() != module.num_defined_functions() {
            return Err(CompileError::Cache(format!(
                "entry has {} functions, module has {}",
                entry.functions.len(),
                module.num_defined_functions()
            )));
        }
        let offsets = ModuleContextOffsets::new(&module);
        let mut code = CodeMemory::with_capacity(entry.executable.len())?;
        code.as_mut_slice()[..entry.executable.len()].copy_from_slice(&entry.executable);
        code.publish()?;
        Ok(CompiledModule {
            module,
            code,
            functions: entry.functions,
            offsets,
        })
    }

    fn compile_fresh(&self, module: &Arc<Module>) -> Result<CompiledModule, CompileError> {
        let offsets = ModuleContextOffsets::new(module);
        let translation = TranslationConfig {
            ensure_termination: self.0.config.ensure_termination,
        };

        let mut compiled: Vec<CompiledFunction> = Vec::new();
        let mut func = Function::new();
        for index in module.code.keys() {
            func.clear();
            translate_function(module, &offsets, index, translation, &mut func)?;
            passes::run_passes(&mut func);
            let dt = DominatorTree::compute(&func);
            let la = LoopAnalysis::compute(&func, &dt);
            layout_blocks(&mut func, &dt, &la);
            debug!("lowered {}:\n{}", func.name, func.display());
            compiled.push(self.0.machine.compile_function(&func, true)?);
        }

        let num_imports = module.num_imported_functions() as u32;
        let resolve = |target: u32| target.checked_sub(num_imports);
        let patcher = self.0.machine.reloc_patcher();
        let layout = plan_image(patcher, &compiled, &resolve)?;
        let mut code = CodeMemory::with_capacity(layout.total_size as usize)?;
        link_image(patcher, &compiled, &layout, &resolve, code.as_mut_slice())?;
        code.publish()?;

        let functions = layout
            .functions
            .iter()
            .map(|f| CachedFunction {
                offset: f.offset,
                preamble_size: f.preamble_size,
            })
            .collect();
        Ok(CompiledModule {
            module: module.clone(),
            code,
            functions,
            offsets,
        })
    }

    pub fn compiled_module_count(&self) -> usize {
        self.0.compiled.read().unwrap().by_id.len()
    }

    /// Drop the compiled module; its executable is unmapped when the last
    /// instance using it goes away.
    pub fn delete_compiled_module(&self, id: &ModuleId) {
        self.0.compiled.write().unwrap().remove(id);
    }

    /// Drop every compiled module.
    pub fn close(&self) {
        let mut compiled = self.0.compiled.write().unwrap();
        compiled.by_id.clear();
        compiled.sorted.clear();
    }

    pub(crate) fn compiled(&self, id: &ModuleId) -> Option<Arc<CompiledModule>> {
        self.0.compiled.read().unwrap().by_id.get(id).cloned()
    }

    /// The compiled module whose executable contains `addr`, if any. Used
    /// from the backtrace path and safe to call concurrently with execution.
    pub(crate) fn module_of_addr(&self, addr: usize) -> Option<Arc<CompiledModule>> {
        self.0.compiled.read().unwrap().of_addr(addr)
    }

    pub(crate) fn instance_of_ctx(&self, ctx: usize) -> Option<Arc<ModuleEngineInner>> {
        self.0.instances.lock().unwrap().get(&ctx)?.upgrade()
    }

    pub(crate) fn register_instance(&self, ctx: usize, inner: &Arc<ModuleEngineInner>) {
        let mut map = self.0.instances.lock().unwrap();
        map.retain(|_, w| w.strong_count() > 0);
        map.insert(ctx, Arc::downgrade(inner));
    }

    /// The symbolic frame for an address inside compiled code, if any.
    /// Useful to embedders rendering their own diagnostics.
    pub fn symbolic_frame(&self, addr: usize) -> Option<String> {
        let cm = self.module_of_addr(addr)?;
        let def = cm.function_index_of(addr)?;
        let index = cm
            .module
            .func_index(kestrel_environ::DefinedFuncIndex::from_u32(def as u32));
        Some(crate::backtrace::format_frame_of(&cm.module, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fabricate a compiled module with a real mapping and a synthetic
    /// offset table. Address assertions compare orderings and containment
    /// only, never absolute addresses.
    fn fake_module(tag: &[u8], func_offsets: &[(u32, u32)], size: usize) -> Arc<CompiledModule> {
        let module = Arc::new(Module::new(ModuleId::from_bytes(tag)));
        let code = CodeMemory::with_capacity(size).unwrap();
        Arc::new(CompiledModule {
            offsets: ModuleContextOffsets::new(&module),
            module,
            code,
            functions: func_offsets
                .iter()
                .map(|&(offset, preamble_size)| CachedFunction {
                    offset,
                    preamble_size,
                })
                .collect(),
        })
    }

    #[test]
    fn sorted_table_contains_and_orders() {
        let mut table = CompiledModules::default();
        let a = fake_module(b"a", &[(0, 0)], 4096);
        let b = fake_module(b"b", &[(0, 0)], 4096);
        let c = fake_module(b"c", &[(0, 0)], 4096);
        for m in [a.clone(), b.clone(), c.clone()] {
            table.insert(m);
        }
        assert!(table.sorted.windows(2).all(|w| w[0].base() < w[1].base()));

        for m in [&a, &b, &c] {
            let inside = m.base() + 16;
            let found = table.of_addr(inside).expect("address inside a module");
            assert!(Arc::ptr_eq(&found, m));
            let last = m.base() + m.code.len() - 1;
            assert!(Arc::ptr_eq(&table.of_addr(last).unwrap(), m));
        }

        table.remove(&b.module.id);
        assert_eq!(table.sorted.len(), 2);
        assert!(table
            .of_addr(b.base() + 16)
            .is_none_or(|m| !Arc::ptr_eq(&m, &b)));
    }

    #[test]
    fn function_index_lookup_is_by_containing_range() {
        let m = fake_module(b"f", &[(0, 32), (128, 32), (512, 0)], 4096);
        let base = m.base();
        assert_eq!(m.function_index_of(base), Some(0));
        assert_eq!(m.function_index_of(base + 127), Some(0));
        assert_eq!(m.function_index_of(base + 128), Some(1));
        assert_eq!(m.function_index_of(base + 511), Some(1));
        assert_eq!(m.function_index_of(base + 600), Some(2));
        assert_eq!(m.function_index_of(base + 4096), None);
    }

    #[test]
    fn wait_map_value_mismatch_and_notify() {
        let map = WaitMap::default();
        // A mismatched expected value returns 1 without blocking.
        assert_eq!(map.wait(0x1000, || false, -1), 1);
        // A timed wait on a quiet address times out with 2.
        assert_eq!(map.wait(0x1000, || true, 1_000_000), 2);
        // Notifying a quiet address wakes nobody.
        assert_eq!(map.notify(0x2000, 7), 0);
    }
}
