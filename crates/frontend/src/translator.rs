//! The operator-by-operator translation state machine.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use kestrel_environ::{
    exec_ctx, function_instance, table_descriptor, AtomicRmwOp as WasmRmwOp, BlockType,
    CompileError, DefinedFuncIndex, FuncIndex, GlobalIndex, MemArg, Module, ModuleContextOffsets,
    Operator, TableIndex, TypeIndex, ValType,
};
use kestrel_ssa::{
    AtomicRmwOp, Block, FloatCC, FunctionBuilder, IntCC, Opcode, TrapCode, Type, Value, Variable,
    VecLanes,
};

use crate::control::ControlFrame;
use crate::{valtype, wasm_signature, TranslationConfig};

type Sig = kestrel_ssa::Sig;

/// Reusable translation state for one function at a time.
pub struct FuncTranslator {
    stack: Vec<Value>,
    control: Vec<ControlFrame>,
    locals: Vec<Variable>,
    trap_blocks: Vec<(TrapCode, Block)>,
    /// Cached `(block, base, len)` of the linear memory; only valid while we
    /// stay in `block` and no call intervenes.
    mem_cache: Option<(Block, Value, Value)>,
    reachable: bool,
    unreachable_depth: u32,
    module_ctx: Value,
    sig_cache: FxHashMap<TypeIndex, Sig>,
    func_refs: FxHashMap<FuncIndex, kestrel_ssa::FuncRef>,
}

impl FuncTranslator {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            control: Vec::new(),
            locals: Vec::new(),
            trap_blocks: Vec::new(),
            mem_cache: None,
            reachable: true,
            unreachable_depth: 0,
            module_ctx: Value::from_u32(0),
            sig_cache: FxHashMap::default(),
            func_refs: FxHashMap::default(),
        }
    }

    pub fn translate(
        &mut self,
        module: &Module,
        offsets: &ModuleContextOffsets,
        index: DefinedFuncIndex,
        config: TranslationConfig,
        func: &mut kestrel_ssa::Function,
    ) -> Result<(), CompileError> {
        self.clear();

        let func_index = module.func_index(index);
        let ty = module.func_type(func_index).clone();
        func.name = module.function_name(func_index);
        func.signature = wasm_signature(&ty);

        let mut fb = FunctionBuilder::new(func);
        let entry = fb.create_block();
        fb.switch_to_block(entry);
        let param_tys = fb.func.signature.params.clone();
        let mut entry_params = Vec::with_capacity(param_tys.len());
        for t in param_tys {
            entry_params.push(fb.func.append_block_param(entry, t));
        }
        fb.seal_block(entry);
        self.module_ctx = entry_params[0];

        // Wasm locals: parameters first, then zero-initialized declarations.
        for (i, &t) in ty.params.iter().enumerate() {
            let var = fb.declare_variable(valtype(t));
            fb.def_var(var, entry_params[i + 1]);
            self.locals.push(var);
        }
        let body = &module.code[index];
        for &(count, t) in &body.locals {
            for _ in 0..count {
                let sty = valtype(t);
                let var = fb.declare_variable(sty);
                let zero = match sty {
                    Type::I32 | Type::I64 => fb.iconst(sty, 0),
                    Type::F32 => fb.f32const(0),
                    Type::F64 => fb.f64const(0),
                    Type::V128 => fb.vconst(0),
                };
                fb.def_var(var, zero);
                self.locals.push(var);
            }
        }

        // The function body is one implicit block frame ending at `return`.
        let exit = fb.create_block();
        for &t in &ty.results {
            fb.func.append_block_param(exit, valtype(t));
        }
        self.control.push(ControlFrame::Block {
            end: exit,
            num_results: ty.results.len(),
            original_stack: 0,
        });

        for op in &body.operators {
            self.translate_operator(module, offsets, config, &mut fb, op)?;
        }
        if !self.control.is_empty() {
            return Err(CompileError::InvalidModule(
                "function body ended with open control frames".to_string(),
            ));
        }
        if self.reachable {
            let args: SmallVec<[Value; 4]> = self.stack.drain(..).collect();
            debug_assert_eq!(args.len(), ty.results.len());
            fb.return_(&args);
        }

        // Materialize the shared trap blocks.
        for &(code, block) in &self.trap_blocks {
            fb.switch_to_block(block);
            fb.trap(code);
            fb.seal_block(block);
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.stack.clear();
        self.control.clear();
        self.locals.clear();
        self.trap_blocks.clear();
        self.mem_cache = None;
        self.reachable = true;
        self.unreachable_depth = 0;
        self.sig_cache.clear();
        self.func_refs.clear();
    }

    // ---- stack helpers ----

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn pop2(&mut self) -> (Value, Value) {
        let b = self.pop();
        let a = self.pop();
        (a, b)
    }

    fn popn(&mut self, n: usize) -> SmallVec<[Value; 4]> {
        let at = self.stack.len() - n;
        self.stack.drain(at..).collect()
    }

    fn peekn(&self, n: usize) -> SmallVec<[Value; 4]> {
        self.stack[self.stack.len() - n..].iter().copied().collect()
    }

    // ---- trap helpers ----

    fn trap_block(&mut self, fb: &mut FunctionBuilder, code: TrapCode) -> Block {
        if let Some(&(_, b)) = self.trap_blocks.iter().find(|&&(c, _)| c == code) {
            return b;
        }
        let b = fb.create_block();
        self.trap_blocks.push((code, b));
        b
    }

    /// Trap when `cond` is non-zero.
    fn trap_if(&mut self, fb: &mut FunctionBuilder, cond: Value, code: TrapCode) {
        let block = self.trap_block(fb, code);
        fb.brnz(cond, block, &[]);
    }

    /// Trap when `cond` is zero.
    fn trap_if_zero(&mut self, fb: &mut FunctionBuilder, cond: Value, code: TrapCode) {
        let block = self.trap_block(fb, code);
        fb.brz(cond, block, &[]);
    }

    // ---- signatures and callees ----

    fn type_sig(&mut self, fb: &mut FunctionBuilder, module: &Module, ty: TypeIndex) -> Sig {
        if let Some(&sig) = self.sig_cache.get(&ty) {
            return sig;
        }
        let sig = fb.func.import_signature(wasm_signature(&module.types[ty]));
        self.sig_cache.insert(ty, sig);
        sig
    }

    fn func_ref(
        &mut self,
        fb: &mut FunctionBuilder,
        module: &Module,
        index: FuncIndex,
    ) -> kestrel_ssa::FuncRef {
        if let Some(&fr) = self.func_refs.get(&index) {
            return fr;
        }
        let sig = self.type_sig(fb, module, module.functions[index]);
        let fr = fb.func.import_function(index.as_u32(), sig);
        self.func_refs.insert(index, fr);
        fr
    }

    // ---- memory helpers ----

    fn memory_base_len(
        &mut self,
        fb: &mut FunctionBuilder,
        offsets: &ModuleContextOffsets,
    ) -> Result<(Value, Value), CompileError> {
        let cur = fb.current_block();
        if let Some((block, base, len)) = self.mem_cache {
            if block == cur {
                return Ok((base, len));
            }
        }
        let ctx = self.module_ctx;
        let (base, len) = if let Some(off) = offsets.local_memory_base() {
            let base = fb.load(Opcode::Load, Type::I64, ctx, off);
            let len = fb.load(Opcode::Load, Type::I64, ctx, off + 8);
            (base, len)
        } else if let Some(off) = offsets.imported_memory_descriptor() {
            let descr = fb.load(Opcode::Load, Type::I64, ctx, off);
            let base = fb.load(Opcode::Load, Type::I64, descr, 0);
            let len = fb.load(Opcode::Load, Type::I64, descr, 8);
            (base, len)
        } else {
            return Err(CompileError::InvalidModule(
                "memory access in a module without memory".to_string(),
            ));
        };
        self.mem_cache = Some((cur, base, len));
        Ok((base, len))
    }

    fn invalidate_memory_cache(&mut self) {
        self.mem_cache = None;
    }

    /// Bounds-check a memory access and return the dynamic base+index
    /// address; the static part of the offset is applied by the access
    /// itself.
    fn prepare_addr(
        &mut self,
        fb: &mut FunctionBuilder,
        offsets: &ModuleContextOffsets,
        memarg: MemArg,
        size: u32,
    ) -> Result<(Value, u32), CompileError> {
        let static_offset = u32::try_from(memarg.offset)
            .map_err(|_| CompileError::InvalidModule("memory offset exceeds u32".to_string()))?;
        let idx32 = self.pop();
        let idx = fb.unary(Opcode::UextendI32, Type::I64, idx32);
        let (base, len) = self.memory_base_len(fb, offsets)?;
        let upper = fb.iconst(Type::I64, memarg.offset + size as u64);
        let end = fb.binary(Opcode::Iadd, Type::I64, idx, upper);
        let oob = fb.icmp(IntCC::Ugt, end, len);
        self.trap_if(fb, oob, TrapCode::MemoryOutOfBounds);
        let addr = fb.binary(Opcode::Iadd, Type::I64, base, idx);
        Ok((addr, static_offset))
    }

    /// Like [`Self::prepare_addr`] but folds the static offset in and checks
    /// natural alignment, as the acquire/release instructions require.
    fn prepare_atomic_addr(
        &mut self,
        fb: &mut FunctionBuilder,
        offsets: &ModuleContextOffsets,
        memarg: MemArg,
        size: u32,
    ) -> Result<Value, CompileError> {
        let (addr, static_offset) = self.prepare_addr(fb, offsets, memarg, size)?;
        let addr = if static_offset != 0 {
            let off = fb.iconst(Type::I64, static_offset as u64);
            fb.binary(Opcode::Iadd, Type::I64, addr, off)
        } else {
            addr
        };
        let mask = fb.iconst(Type::I64, (size - 1) as u64);
        let misaligned = fb.binary(Opcode::Band, Type::I64, addr, mask);
        self.trap_if(fb, misaligned, TrapCode::MemoryOutOfBounds);
        Ok(addr)
    }

    /// Call one of the engine trampolines whose entry address lives in the
    /// execution context at `tramp_offset`.
    fn call_builtin(
        &mut self,
        fb: &mut FunctionBuilder,
        tramp_offset: u32,
        sig: Sig,
        args: &[Value],
    ) -> SmallVec<[Value; 2]> {
        let exec_ctx = fb.get_exec_ctx();
        let tramp = fb.load(Opcode::Load, Type::I64, exec_ctx, tramp_offset);
        let mut full: SmallVec<[Value; 6]> = SmallVec::new();
        full.push(tramp);
        full.push(self.module_ctx);
        full.extend_from_slice(args);
        let inst = fb.call_indirect(sig, &full);
        self.invalidate_memory_cache();
        fb.func.inst_results(inst).iter().copied().collect()
    }

    fn builtin_sig(&mut self, fb: &mut FunctionBuilder, params: &[Type], results: &[Type]) -> Sig {
        // Builtin signatures are few; a linear scan through the interned
        // signatures keeps the cache simple.
        let mut sig_params = vec![Type::I64];
        sig_params.extend_from_slice(params);
        let sig = kestrel_ssa::Signature::new(sig_params, results.to_vec());
        for (existing, data) in fb.func.sigs.iter() {
            if *data == sig {
                return existing;
            }
        }
        fb.func.import_signature(sig)
    }

    // ---- control flow ----

    fn blocktype(module: &Module, ty: BlockType) -> (Vec<ValType>, Vec<ValType>) {
        match ty {
            BlockType::Empty => (Vec::new(), Vec::new()),
            BlockType::Value(t) => (Vec::new(), vec![t]),
            BlockType::Func(ti) => {
                let ft = &module.types[ti];
                (ft.params.clone(), ft.results.clone())
            }
        }
    }

    fn frame(&self, depth: u32) -> &ControlFrame {
        &self.control[self.control.len() - 1 - depth as usize]
    }

    /// Create the intermediate block a `br_table` case jumps through, since
    /// jump-table edges themselves cannot carry arguments.
    fn br_table_case(&mut self, fb: &mut FunctionBuilder, depth: u32) -> Block {
        let (dest, argc) = self.frame(depth).br_destination();
        let args = self.peekn(argc);
        let case = fb.create_block();
        let here = fb.current_block();
        fb.switch_to_block(case);
        fb.jump(dest, &args);
        fb.switch_to_block(here);
        case
    }

    fn end_frame(&mut self, fb: &mut FunctionBuilder) {
        let frame = self.control.pop().expect("control stack underflow");
        if self.reachable {
            let args = self.popn(frame.num_results());
            fb.jump(frame.end_block(), &args);
        }
        if let ControlFrame::If {
            end,
            else_block,
            ref else_params,
            else_seen: false,
            ..
        } = frame
        {
            // `if` without `else`: the else arm forwards the parameters.
            let params = else_params.clone();
            fb.switch_to_block(else_block);
            fb.jump(end, &params);
        }
        if let ControlFrame::Loop { header, .. } = frame {
            fb.seal_block(header);
        }
        self.stack.truncate(frame.original_stack());
        let end = frame.end_block();
        fb.switch_to_block(end);
        fb.seal_block(end);
        let params: SmallVec<[Value; 4]> = fb.func.block_params(end)
            [..frame.num_results()]
            .iter()
            .copied()
            .collect();
        self.stack.extend(params);
        self.reachable = !fb.func.block_preds(end).is_empty();
    }

    // ---- the big match ----

    fn translate_operator(
        &mut self,
        module: &Module,
        offsets: &ModuleContextOffsets,
        config: TranslationConfig,
        fb: &mut FunctionBuilder,
        op: &Operator,
    ) -> Result<(), CompileError> {
        use Operator as O;

        if !self.reachable {
            match op {
                O::Block { .. } | O::Loop { .. } | O::If { .. } => self.unreachable_depth += 1,
                O::End => {
                    if self.unreachable_depth > 0 {
                        self.unreachable_depth -= 1;
                    } else {
                        self.end_frame(fb);
                    }
                }
                O::Else => {
                    if self.unreachable_depth == 0 {
                        self.resume_at_else(fb);
                    }
                }
                _ => {}
            }
            return Ok(());
        }

        match op {
            // ---- control flow ----
            O::Unreachable => {
                let block = self.trap_block(fb, TrapCode::Unreachable);
                fb.jump(block, &[]);
                self.reachable = false;
            }
            O::Nop => {}
            O::Block { ty } => {
                let (params, results) = Self::blocktype(module, *ty);
                let end = fb.create_block();
                for &t in &results {
                    fb.func.append_block_param(end, valtype(t));
                }
                self.control.push(ControlFrame::Block {
                    end,
                    num_results: results.len(),
                    original_stack: self.stack.len() - params.len(),
                });
            }
            O::Loop { ty } => {
                let (params, results) = Self::blocktype(module, *ty);
                let header = fb.create_block();
                for &t in &params {
                    fb.func.append_block_param(header, valtype(t));
                }
                let end = fb.create_block();
                for &t in &results {
                    fb.func.append_block_param(end, valtype(t));
                }
                let args = self.popn(params.len());
                fb.jump(header, &args);
                fb.switch_to_block(header);
                let header_params: SmallVec<[Value; 4]> =
                    fb.func.block_params(header).iter().copied().collect();
                self.stack.extend(header_params);
                self.control.push(ControlFrame::Loop {
                    header,
                    end,
                    num_params: params.len(),
                    num_results: results.len(),
                    original_stack: self.stack.len() - params.len(),
                });
                if config.ensure_termination {
                    let sig = self.builtin_sig(fb, &[], &[]);
                    self.call_builtin(
                        fb,
                        exec_ctx::CHECK_MODULE_EXIT_CODE_TRAMPOLINE,
                        sig,
                        &[],
                    );
                }
            }
            O::If { ty } => {
                let (params, results) = Self::blocktype(module, *ty);
                let cond = self.pop();
                let else_params = self.peekn(params.len()).to_vec();
                let end = fb.create_block();
                for &t in &results {
                    fb.func.append_block_param(end, valtype(t));
                }
                let else_block = fb.create_block();
                fb.brz(cond, else_block, &[]);
                let then_block = fb.create_block();
                fb.jump(then_block, &[]);
                fb.switch_to_block(then_block);
                fb.seal_block(then_block);
                fb.seal_block(else_block);
                self.control.push(ControlFrame::If {
                    end,
                    else_block,
                    else_params,
                    num_results: results.len(),
                    original_stack: self.stack.len() - params.len(),
                    else_seen: false,
                });
            }
            O::Else => {
                let (end, num_results) = match self.control.last() {
                    Some(ControlFrame::If {
                        end, num_results, ..
                    }) => (*end, *num_results),
                    _ => panic!("else outside of if"),
                };
                let args = self.popn(num_results);
                fb.jump(end, &args);
                self.resume_at_else(fb);
            }
            O::End => self.end_frame(fb),
            O::Br { depth } => {
                let (dest, argc) = self.frame(*depth).br_destination();
                let args = self.peekn(argc);
                fb.jump(dest, &args);
                self.reachable = false;
            }
            O::BrIf { depth } => {
                let cond = self.pop();
                let (dest, argc) = self.frame(*depth).br_destination();
                let args = self.peekn(argc);
                fb.brnz(cond, dest, &args);
            }
            O::BrTable { targets, default } => {
                let index = self.pop();
                let mut cases = Vec::with_capacity(targets.len());
                for &d in targets {
                    cases.push(self.br_table_case(fb, d));
                }
                let default_case = self.br_table_case(fb, *default);
                let all: Vec<Block> = cases.iter().copied().chain([default_case]).collect();
                fb.br_table(index, cases, default_case);
                for b in all {
                    fb.seal_block(b);
                }
                self.reachable = false;
            }
            O::Return => {
                let frame = &self.control[0];
                let args = self.peekn(frame.num_results());
                fb.return_(&args);
                self.reachable = false;
            }
            O::Call { function } => {
                let ty = module.func_type(*function).clone();
                let args = self.popn(ty.params.len());
                let results: SmallVec<[Value; 4]>;
                if module.is_imported_function(*function) {
                    let d = offsets.imported_function(function.as_u32());
                    let ctx = self.module_ctx;
                    let code = fb.load(Opcode::Load, Type::I64, ctx, d.executable);
                    let callee_ctx = fb.load(Opcode::Load, Type::I64, ctx, d.module_ctx);
                    let sig = self.type_sig(fb, module, module.functions[*function]);
                    let mut full: SmallVec<[Value; 8]> = SmallVec::new();
                    full.push(code);
                    full.push(callee_ctx);
                    full.extend_from_slice(&args);
                    let inst = fb.call_indirect(sig, &full);
                    results = fb.func.inst_results(inst).iter().copied().collect();
                } else {
                    let fr = self.func_ref(fb, module, *function);
                    let mut full: SmallVec<[Value; 8]> = SmallVec::new();
                    full.push(self.module_ctx);
                    full.extend_from_slice(&args);
                    let inst = fb.call(fr, &full);
                    results = fb.func.inst_results(inst).iter().copied().collect();
                }
                self.invalidate_memory_cache();
                self.stack.extend(results);
            }
            O::CallIndirect { ty, table } => {
                self.translate_call_indirect(module, offsets, fb, *ty, *table)?;
            }

            // ---- parametric ----
            O::Drop => {
                self.pop();
            }
            O::Select => {
                let cond = self.pop();
                let (a, b) = self.pop2();
                let v = fb.select(cond, a, b);
                self.push(v);
            }

            // ---- locals and globals ----
            O::LocalGet { index } => {
                let v = fb.use_var(self.locals[*index as usize]);
                self.push(v);
            }
            O::LocalSet { index } => {
                let v = self.pop();
                fb.def_var(self.locals[*index as usize], v);
            }
            O::LocalTee { index } => {
                let v = *self.stack.last().expect("value stack underflow");
                fb.def_var(self.locals[*index as usize], v);
            }
            O::GlobalGet { index } => {
                let v = self.global_load(fb, offsets, module, *index);
                self.push(v);
            }
            O::GlobalSet { index } => {
                let v = self.pop();
                self.global_store(fb, offsets, module, *index, v);
            }

            // ---- memory ----
            O::I32Load { memarg } => self.mem_load(fb, offsets, *memarg, Opcode::Load, Type::I32, 4)?,
            O::I64Load { memarg } => self.mem_load(fb, offsets, *memarg, Opcode::Load, Type::I64, 8)?,
            O::F32Load { memarg } => self.mem_load(fb, offsets, *memarg, Opcode::Load, Type::F32, 4)?,
            O::F64Load { memarg } => self.mem_load(fb, offsets, *memarg, Opcode::Load, Type::F64, 8)?,
            O::I32Load8S { memarg } => self.mem_load(fb, offsets, *memarg, Opcode::Sload8, Type::I32, 1)?,
            O::I32Load8U { memarg } => self.mem_load(fb, offsets, *memarg, Opcode::Uload8, Type::I32, 1)?,
            O::I32Load16S { memarg } => self.mem_load(fb, offsets, *memarg, Opcode::Sload16, Type::I32, 2)?,
            O::I32Load16U { memarg } => self.mem_load(fb, offsets, *memarg, Opcode::Uload16, Type::I32, 2)?,
            O::I64Load8S { memarg } => self.mem_load(fb, offsets, *memarg, Opcode::Sload8, Type::I64, 1)?,
            O::I64Load8U { memarg } => self.mem_load(fb, offsets, *memarg, Opcode::Uload8, Type::I64, 1)?,
            O::I64Load16S { memarg } => self.mem_load(fb, offsets, *memarg, Opcode::Sload16, Type::I64, 2)?,
            O::I64Load16U { memarg } => self.mem_load(fb, offsets, *memarg, Opcode::Uload16, Type::I64, 2)?,
            O::I64Load32S { memarg } => self.mem_load(fb, offsets, *memarg, Opcode::Sload32, Type::I64, 4)?,
            O::I64Load32U { memarg } => self.mem_load(fb, offsets, *memarg, Opcode::Uload32, Type::I64, 4)?,
            O::V128Load { memarg } => self.mem_load(fb, offsets, *memarg, Opcode::Load, Type::V128, 16)?,
            O::I32Store { memarg } => self.mem_store(fb, offsets, *memarg, Opcode::Store, 4)?,
            O::I64Store { memarg } => self.mem_store(fb, offsets, *memarg, Opcode::Store, 8)?,
            O::F32Store { memarg } => self.mem_store(fb, offsets, *memarg, Opcode::Store, 4)?,
            O::F64Store { memarg } => self.mem_store(fb, offsets, *memarg, Opcode::Store, 8)?,
            O::V128Store { memarg } => self.mem_store(fb, offsets, *memarg, Opcode::Store, 16)?,
            O::I32Store8 { memarg } => self.mem_store(fb, offsets, *memarg, Opcode::Istore8, 1)?,
            O::I32Store16 { memarg } => self.mem_store(fb, offsets, *memarg, Opcode::Istore16, 2)?,
            O::I64Store8 { memarg } => self.mem_store(fb, offsets, *memarg, Opcode::Istore8, 1)?,
            O::I64Store16 { memarg } => self.mem_store(fb, offsets, *memarg, Opcode::Istore16, 2)?,
            O::I64Store32 { memarg } => self.mem_store(fb, offsets, *memarg, Opcode::Istore32, 4)?,
            O::MemorySize => {
                let (_, len) = self.memory_base_len(fb, offsets)?;
                let shift = fb.iconst(Type::I64, 16);
                let pages = fb.binary(Opcode::Ushr, Type::I64, len, shift);
                let v = fb.unary(Opcode::Ireduce, Type::I32, pages);
                self.push(v);
            }
            O::MemoryGrow => {
                let delta = self.pop();
                let sig = self.builtin_sig(fb, &[Type::I32], &[Type::I32]);
                let results =
                    self.call_builtin(fb, exec_ctx::MEMORY_GROW_TRAMPOLINE, sig, &[delta]);
                self.push(results[0]);
            }

            // ---- constants ----
            O::I32Const { value } => {
                let v = fb.iconst(Type::I32, *value as u32 as u64);
                self.push(v);
            }
            O::I64Const { value } => {
                let v = fb.iconst(Type::I64, *value as u64);
                self.push(v);
            }
            O::F32Const { bits } => {
                let v = fb.f32const(*bits);
                self.push(v);
            }
            O::F64Const { bits } => {
                let v = fb.f64const(*bits);
                self.push(v);
            }
            O::V128Const { bytes } => {
                let v = fb.vconst(u128::from_le_bytes(*bytes));
                self.push(v);
            }

            // ---- comparisons ----
            O::I32Eqz => self.eqz(fb, Type::I32),
            O::I64Eqz => self.eqz(fb, Type::I64),
            O::I32Eq | O::I64Eq => self.icmp(fb, IntCC::Eq),
            O::I32Ne | O::I64Ne => self.icmp(fb, IntCC::Ne),
            O::I32LtS | O::I64LtS => self.icmp(fb, IntCC::Slt),
            O::I32LtU | O::I64LtU => self.icmp(fb, IntCC::Ult),
            O::I32GtS | O::I64GtS => self.icmp(fb, IntCC::Sgt),
            O::I32GtU | O::I64GtU => self.icmp(fb, IntCC::Ugt),
            O::I32LeS | O::I64LeS => self.icmp(fb, IntCC::Sle),
            O::I32LeU | O::I64LeU => self.icmp(fb, IntCC::Ule),
            O::I32GeS | O::I64GeS => self.icmp(fb, IntCC::Sge),
            O::I32GeU | O::I64GeU => self.icmp(fb, IntCC::Uge),
            O::F32Eq | O::F64Eq => self.fcmp(fb, FloatCC::Eq),
            O::F32Ne | O::F64Ne => self.fcmp(fb, FloatCC::Ne),
            O::F32Lt | O::F64Lt => self.fcmp(fb, FloatCC::Lt),
            O::F32Gt | O::F64Gt => self.fcmp(fb, FloatCC::Gt),
            O::F32Le | O::F64Le => self.fcmp(fb, FloatCC::Le),
            O::F32Ge | O::F64Ge => self.fcmp(fb, FloatCC::Ge),

            // ---- integer arithmetic ----
            O::I32Clz => self.unop(fb, Opcode::Clz, Type::I32),
            O::I64Clz => self.unop(fb, Opcode::Clz, Type::I64),
            O::I32Ctz => self.unop(fb, Opcode::Ctz, Type::I32),
            O::I64Ctz => self.unop(fb, Opcode::Ctz, Type::I64),
            O::I32Popcnt => self.unop(fb, Opcode::Popcnt, Type::I32),
            O::I64Popcnt => self.unop(fb, Opcode::Popcnt, Type::I64),
            O::I32Add => self.binop(fb, Opcode::Iadd, Type::I32),
            O::I64Add => self.binop(fb, Opcode::Iadd, Type::I64),
            O::I32Sub => self.binop(fb, Opcode::Isub, Type::I32),
            O::I64Sub => self.binop(fb, Opcode::Isub, Type::I64),
            O::I32Mul => self.binop(fb, Opcode::Imul, Type::I32),
            O::I64Mul => self.binop(fb, Opcode::Imul, Type::I64),
            O::I32DivS => self.div_s(fb, Type::I32),
            O::I64DivS => self.div_s(fb, Type::I64),
            O::I32DivU => self.div_rem_u(fb, Opcode::Udiv, Type::I32),
            O::I64DivU => self.div_rem_u(fb, Opcode::Udiv, Type::I64),
            O::I32RemS => self.div_rem_u(fb, Opcode::Srem, Type::I32),
            O::I64RemS => self.div_rem_u(fb, Opcode::Srem, Type::I64),
            O::I32RemU => self.div_rem_u(fb, Opcode::Urem, Type::I32),
            O::I64RemU => self.div_rem_u(fb, Opcode::Urem, Type::I64),
            O::I32And => self.binop(fb, Opcode::Band, Type::I32),
            O::I64And => self.binop(fb, Opcode::Band, Type::I64),
            O::I32Or => self.binop(fb, Opcode::Bor, Type::I32),
            O::I64Or => self.binop(fb, Opcode::Bor, Type::I64),
            O::I32Xor => self.binop(fb, Opcode::Bxor, Type::I32),
            O::I64Xor => self.binop(fb, Opcode::Bxor, Type::I64),
            O::I32Shl => self.binop(fb, Opcode::Ishl, Type::I32),
            O::I64Shl => self.binop(fb, Opcode::Ishl, Type::I64),
            O::I32ShrS => self.binop(fb, Opcode::Sshr, Type::I32),
            O::I64ShrS => self.binop(fb, Opcode::Sshr, Type::I64),
            O::I32ShrU => self.binop(fb, Opcode::Ushr, Type::I32),
            O::I64ShrU => self.binop(fb, Opcode::Ushr, Type::I64),
            O::I32Rotl => self.binop(fb, Opcode::Rotl, Type::I32),
            O::I64Rotl => self.binop(fb, Opcode::Rotl, Type::I64),
            O::I32Rotr => self.binop(fb, Opcode::Rotr, Type::I32),
            O::I64Rotr => self.binop(fb, Opcode::Rotr, Type::I64),

            // ---- float arithmetic ----
            O::F32Abs => self.unop(fb, Opcode::Fabs, Type::F32),
            O::F64Abs => self.unop(fb, Opcode::Fabs, Type::F64),
            O::F32Neg => self.unop(fb, Opcode::Fneg, Type::F32),
            O::F64Neg => self.unop(fb, Opcode::Fneg, Type::F64),
            O::F32Ceil => self.unop(fb, Opcode::Ceil, Type::F32),
            O::F64Ceil => self.unop(fb, Opcode::Ceil, Type::F64),
            O::F32Floor => self.unop(fb, Opcode::Floor, Type::F32),
            O::F64Floor => self.unop(fb, Opcode::Floor, Type::F64),
            O::F32Trunc => self.unop(fb, Opcode::Trunc, Type::F32),
            O::F64Trunc => self.unop(fb, Opcode::Trunc, Type::F64),
            O::F32Nearest => self.unop(fb, Opcode::Nearest, Type::F32),
            O::F64Nearest => self.unop(fb, Opcode::Nearest, Type::F64),
            O::F32Sqrt => self.unop(fb, Opcode::Fsqrt, Type::F32),
            O::F64Sqrt => self.unop(fb, Opcode::Fsqrt, Type::F64),
            O::F32Add => self.binop(fb, Opcode::Fadd, Type::F32),
            O::F64Add => self.binop(fb, Opcode::Fadd, Type::F64),
            O::F32Sub => self.binop(fb, Opcode::Fsub, Type::F32),
            O::F64Sub => self.binop(fb, Opcode::Fsub, Type::F64),
            O::F32Mul => self.binop(fb, Opcode::Fmul, Type::F32),
            O::F64Mul => self.binop(fb, Opcode::Fmul, Type::F64),
            O::F32Div => self.binop(fb, Opcode::Fdiv, Type::F32),
            O::F64Div => self.binop(fb, Opcode::Fdiv, Type::F64),
            O::F32Min => self.binop(fb, Opcode::Fmin, Type::F32),
            O::F64Min => self.binop(fb, Opcode::Fmin, Type::F64),
            O::F32Max => self.binop(fb, Opcode::Fmax, Type::F32),
            O::F64Max => self.binop(fb, Opcode::Fmax, Type::F64),
            O::F32Copysign => self.copysign(fb, Type::F32),
            O::F64Copysign => self.copysign(fb, Type::F64),

            // ---- conversions ----
            O::I32WrapI64 => self.unop(fb, Opcode::Ireduce, Type::I32),
            O::I64ExtendI32S => self.unop(fb, Opcode::SextendI32, Type::I64),
            O::I64ExtendI32U => self.unop(fb, Opcode::UextendI32, Type::I64),
            O::I32Extend8S => self.unop(fb, Opcode::ExtendS8, Type::I32),
            O::I32Extend16S => self.unop(fb, Opcode::ExtendS16, Type::I32),
            O::I64Extend8S => self.unop(fb, Opcode::ExtendS8, Type::I64),
            O::I64Extend16S => self.unop(fb, Opcode::ExtendS16, Type::I64),
            O::I64Extend32S => self.unop(fb, Opcode::ExtendS32, Type::I64),

            O::I32TruncF32S => self.trunc(fb, Type::I32, true, f32b(-2147483648.0), f32b(2147483648.0)),
            O::I32TruncF32U => self.trunc(fb, Type::I32, false, f32b(-1.0), f32b(4294967296.0)),
            O::I32TruncF64S => self.trunc(fb, Type::I32, true, f64b(-2147483648.0), f64b(2147483648.0)),
            O::I32TruncF64U => self.trunc(fb, Type::I32, false, f64b(-1.0), f64b(4294967296.0)),
            O::I64TruncF32S => self.trunc(fb, Type::I64, true, f32b(-9223372036854775808.0), f32b(9223372036854775808.0)),
            O::I64TruncF32U => self.trunc(fb, Type::I64, false, f32b(-1.0), f32b(18446744073709551616.0)),
            O::I64TruncF64S => self.trunc(fb, Type::I64, true, f64b(-9223372036854775808.0), f64b(9223372036854775808.0)),
            O::I64TruncF64U => self.trunc(fb, Type::I64, false, f64b(-1.0), f64b(18446744073709551616.0)),

            O::I32TruncSatF32S | O::I32TruncSatF64S => self.unop(fb, Opcode::FcvtToSintSat, Type::I32),
            O::I32TruncSatF32U | O::I32TruncSatF64U => self.unop(fb, Opcode::FcvtToUintSat, Type::I32),
            O::I64TruncSatF32S | O::I64TruncSatF64S => self.unop(fb, Opcode::FcvtToSintSat, Type::I64),
            O::I64TruncSatF32U | O::I64TruncSatF64U => self.unop(fb, Opcode::FcvtToUintSat, Type::I64),

            O::F32ConvertI32S | O::F32ConvertI64S => self.unop(fb, Opcode::FcvtFromSint, Type::F32),
            O::F32ConvertI32U | O::F32ConvertI64U => self.unop(fb, Opcode::FcvtFromUint, Type::F32),
            O::F64ConvertI32S | O::F64ConvertI64S => self.unop(fb, Opcode::FcvtFromSint, Type::F64),
            O::F64ConvertI32U | O::F64ConvertI64U => self.unop(fb, Opcode::FcvtFromUint, Type::F64),
            O::F32DemoteF64 => self.unop(fb, Opcode::Fdemote, Type::F32),
            O::F64PromoteF32 => self.unop(fb, Opcode::Fpromote, Type::F64),
            O::I32ReinterpretF32 => self.unop(fb, Opcode::Bitcast, Type::I32),
            O::I64ReinterpretF64 => self.unop(fb, Opcode::Bitcast, Type::I64),
            O::F32ReinterpretI32 => self.unop(fb, Opcode::Bitcast, Type::F32),
            O::F64ReinterpretI64 => self.unop(fb, Opcode::Bitcast, Type::F64),

            // ---- SIMD ----
            O::I8x16Splat => self.splat(fb, VecLanes::I8x16),
            O::I16x8Splat => self.splat(fb, VecLanes::I16x8),
            O::I32x4Splat => self.splat(fb, VecLanes::I32x4),
            O::I64x2Splat => self.splat(fb, VecLanes::I64x2),
            O::F32x4Splat => self.splat(fb, VecLanes::F32x4),
            O::F64x2Splat => self.splat(fb, VecLanes::F64x2),
            O::I32x4ExtractLane { lane } => self.extract(fb, VecLanes::I32x4, *lane),
            O::I64x2ExtractLane { lane } => self.extract(fb, VecLanes::I64x2, *lane),
            O::F32x4ExtractLane { lane } => self.extract(fb, VecLanes::F32x4, *lane),
            O::F64x2ExtractLane { lane } => self.extract(fb, VecLanes::F64x2, *lane),
            O::I32x4ReplaceLane { lane } => {
                let (vec, scalar) = self.pop2();
                let v = fb.insert_lane(VecLanes::I32x4, *lane, vec, scalar);
                self.push(v);
            }
            O::I8x16Add => self.vbinop(fb, Opcode::Viadd, VecLanes::I8x16),
            O::I16x8Add => self.vbinop(fb, Opcode::Viadd, VecLanes::I16x8),
            O::I32x4Add => self.vbinop(fb, Opcode::Viadd, VecLanes::I32x4),
            O::I64x2Add => self.vbinop(fb, Opcode::Viadd, VecLanes::I64x2),
            O::I8x16Sub => self.vbinop(fb, Opcode::Visub, VecLanes::I8x16),
            O::I16x8Sub => self.vbinop(fb, Opcode::Visub, VecLanes::I16x8),
            O::I32x4Sub => self.vbinop(fb, Opcode::Visub, VecLanes::I32x4),
            O::I64x2Sub => self.vbinop(fb, Opcode::Visub, VecLanes::I64x2),
            O::V128And => self.binop(fb, Opcode::Band, Type::V128),
            O::V128Or => self.binop(fb, Opcode::Bor, Type::V128),
            O::V128Xor => self.binop(fb, Opcode::Bxor, Type::V128),

            // ---- atomics ----
            O::I32AtomicLoad { memarg } => {
                let addr = self.prepare_atomic_addr(fb, offsets, *memarg, 4)?;
                let v = fb.atomic_load(Type::I32, addr);
                self.push(v);
            }
            O::I64AtomicLoad { memarg } => {
                let addr = self.prepare_atomic_addr(fb, offsets, *memarg, 8)?;
                let v = fb.atomic_load(Type::I64, addr);
                self.push(v);
            }
            O::I32AtomicStore { memarg } => {
                let value = self.pop();
                let addr = self.prepare_atomic_addr(fb, offsets, *memarg, 4)?;
                fb.atomic_store(Type::I32, value, addr);
            }
            O::I64AtomicStore { memarg } => {
                let value = self.pop();
                let addr = self.prepare_atomic_addr(fb, offsets, *memarg, 8)?;
                fb.atomic_store(Type::I64, value, addr);
            }
            O::I32AtomicRmw { op, memarg } => self.rmw(fb, offsets, *op, *memarg, Type::I32, 4)?,
            O::I64AtomicRmw { op, memarg } => self.rmw(fb, offsets, *op, *memarg, Type::I64, 8)?,
            O::I32AtomicRmwCmpxchg { memarg } => self.cmpxchg(fb, offsets, *memarg, Type::I32, 4)?,
            O::I64AtomicRmwCmpxchg { memarg } => self.cmpxchg(fb, offsets, *memarg, Type::I64, 8)?,
            O::AtomicFence => fb.fence(),
            O::MemoryAtomicWait32 { memarg } => {
                let timeout = self.pop();
                let expected = self.pop();
                let addr = self.prepare_atomic_addr(fb, offsets, *memarg, 4)?;
                let sig = self.builtin_sig(
                    fb,
                    &[Type::I64, Type::I32, Type::I64],
                    &[Type::I32],
                );
                let results = self.call_builtin(
                    fb,
                    exec_ctx::MEMORY_WAIT32_TRAMPOLINE,
                    sig,
                    &[addr, expected, timeout],
                );
                self.push(results[0]);
            }
            O::MemoryAtomicWait64 { memarg } => {
                let timeout = self.pop();
                let expected = self.pop();
                let addr = self.prepare_atomic_addr(fb, offsets, *memarg, 8)?;
                let sig = self.builtin_sig(
                    fb,
                    &[Type::I64, Type::I64, Type::I64],
                    &[Type::I32],
                );
                let results = self.call_builtin(
                    fb,
                    exec_ctx::MEMORY_WAIT64_TRAMPOLINE,
                    sig,
                    &[addr, expected, timeout],
                );
                self.push(results[0]);
            }
            O::MemoryAtomicNotify { memarg } => {
                let count = self.pop();
                let addr = self.prepare_atomic_addr(fb, offsets, *memarg, 4)?;
                let sig = self.builtin_sig(fb, &[Type::I64, Type::I32], &[Type::I32]);
                let results = self.call_builtin(
                    fb,
                    exec_ctx::MEMORY_NOTIFY_TRAMPOLINE,
                    sig,
                    &[addr, count],
                );
                self.push(results[0]);
            }
        }
        Ok(())
    }

    /// Switch translation to the else arm of the innermost `if` frame.
    fn resume_at_else(&mut self, fb: &mut FunctionBuilder) {
        let (else_block, else_params, original_stack) = match self.control.last_mut() {
            Some(ControlFrame::If {
                else_block,
                else_params,
                original_stack,
                else_seen,
                ..
            }) => {
                *else_seen = true;
                (*else_block, else_params.clone(), *original_stack)
            }
            _ => panic!("else outside of if"),
        };
        self.stack.truncate(original_stack);
        self.stack.extend(else_params);
        fb.switch_to_block(else_block);
        self.reachable = true;
        self.unreachable_depth = 0;
    }

    // ---- small lowering helpers ----

    fn unop(&mut self, fb: &mut FunctionBuilder, opcode: Opcode, ty: Type) {
        let a = self.pop();
        let v = fb.unary(opcode, ty, a);
        self.push(v);
    }

    fn binop(&mut self, fb: &mut FunctionBuilder, opcode: Opcode, ty: Type) {
        let (a, b) = self.pop2();
        let v = fb.binary(opcode, ty, a, b);
        self.push(v);
    }

    fn vbinop(&mut self, fb: &mut FunctionBuilder, opcode: Opcode, lanes: VecLanes) {
        let (a, b) = self.pop2();
        let v = fb.vec_binary(opcode, lanes, a, b);
        self.push(v);
    }

    fn icmp(&mut self, fb: &mut FunctionBuilder, cc: IntCC) {
        let (a, b) = self.pop2();
        let v = fb.icmp(cc, a, b);
        self.push(v);
    }

    fn fcmp(&mut self, fb: &mut FunctionBuilder, cc: FloatCC) {
        let (a, b) = self.pop2();
        let v = fb.fcmp(cc, a, b);
        self.push(v);
    }

    fn eqz(&mut self, fb: &mut FunctionBuilder, ty: Type) {
        let a = self.pop();
        let zero = fb.iconst(ty, 0);
        let v = fb.icmp(IntCC::Eq, a, zero);
        self.push(v);
    }

    fn splat(&mut self, fb: &mut FunctionBuilder, lanes: VecLanes) {
        let a = self.pop();
        let v = fb.splat(lanes, a);
        self.push(v);
    }

    fn extract(&mut self, fb: &mut FunctionBuilder, lanes: VecLanes, lane: u8) {
        let a = self.pop();
        let v = fb.extract_lane(lanes, lane, a);
        self.push(v);
    }

    fn div_s(&mut self, fb: &mut FunctionBuilder, ty: Type) {
        let (a, b) = self.pop2();
        self.trap_if_zero(fb, b, TrapCode::IntegerDivisionByZero);
        let min = match ty {
            Type::I32 => 0x8000_0000u64,
            _ => 0x8000_0000_0000_0000u64,
        };
        let minus_one = match ty {
            Type::I32 => 0xffff_ffffu64,
            _ => u64::MAX,
        };
        let min = fb.iconst(ty, min);
        let minus_one = fb.iconst(ty, minus_one);
        let lhs_min = fb.icmp(IntCC::Eq, a, min);
        let rhs_m1 = fb.icmp(IntCC::Eq, b, minus_one);
        let overflow = fb.binary(Opcode::Band, Type::I32, lhs_min, rhs_m1);
        self.trap_if(fb, overflow, TrapCode::IntegerOverflow);
        let v = fb.binary(Opcode::Sdiv, ty, a, b);
        self.push(v);
    }

    /// Unsigned division and both remainders: only the zero-divisor guard.
    fn div_rem_u(&mut self, fb: &mut FunctionBuilder, opcode: Opcode, ty: Type) {
        let (a, b) = self.pop2();
        self.trap_if_zero(fb, b, TrapCode::IntegerDivisionByZero);
        let v = fb.binary(opcode, ty, a, b);
        self.push(v);
    }

    /// Copysign via the integer units: magnitude of `a` with sign of `b`.
    fn copysign(&mut self, fb: &mut FunctionBuilder, ty: Type) {
        let (a, b) = self.pop2();
        let ity = if ty == Type::F32 { Type::I32 } else { Type::I64 };
        let sign_mask = match ty {
            Type::F32 => 0x8000_0000u64,
            _ => 0x8000_0000_0000_0000u64,
        };
        let ia = fb.unary(Opcode::Bitcast, ity, a);
        let ib = fb.unary(Opcode::Bitcast, ity, b);
        let mask = fb.iconst(ity, sign_mask);
        let mag_mask = fb.iconst(ity, !sign_mask & mask_bits(ity));
        let sign = fb.binary(Opcode::Band, ity, ib, mask);
        let mag = fb.binary(Opcode::Band, ity, ia, mag_mask);
        let combined = fb.binary(Opcode::Bor, ity, mag, sign);
        let v = fb.unary(Opcode::Bitcast, ty, combined);
        self.push(v);
    }

    /// Trapping float→int conversion: NaN check, then range check, then the
    /// plain conversion.
    fn trunc(
        &mut self,
        fb: &mut FunctionBuilder,
        ty: Type,
        signed: bool,
        lo: FloatConst,
        hi: FloatConst,
    ) {
        let x = self.pop();
        let nan = fb.fcmp(FloatCC::Ne, x, x);
        self.trap_if(fb, nan, TrapCode::InvalidConversionToInteger);
        let lo = lo.emit(fb);
        let hi = hi.emit(fb);
        let lo_ok = if signed {
            fb.fcmp(FloatCC::Ge, x, lo)
        } else {
            fb.fcmp(FloatCC::Gt, x, lo)
        };
        let hi_ok = fb.fcmp(FloatCC::Lt, x, hi);
        let in_range = fb.binary(Opcode::Band, Type::I32, lo_ok, hi_ok);
        self.trap_if_zero(fb, in_range, TrapCode::IntegerOverflow);
        let opcode = if signed {
            Opcode::FcvtToSint
        } else {
            Opcode::FcvtToUint
        };
        let v = fb.unary(opcode, ty, x);
        self.push(v);
    }

    fn rmw(
        &mut self,
        fb: &mut FunctionBuilder,
        offsets: &ModuleContextOffsets,
        op: WasmRmwOp,
        memarg: MemArg,
        ty: Type,
        size: u32,
    ) -> Result<(), CompileError> {
        let operand = self.pop();
        let addr = self.prepare_atomic_addr(fb, offsets, memarg, size)?;
        let op = match op {
            WasmRmwOp::Add => AtomicRmwOp::Add,
            WasmRmwOp::Sub => AtomicRmwOp::Sub,
            WasmRmwOp::And => AtomicRmwOp::And,
            WasmRmwOp::Or => AtomicRmwOp::Or,
            WasmRmwOp::Xor => AtomicRmwOp::Xor,
            WasmRmwOp::Xchg => AtomicRmwOp::Xchg,
        };
        let v = fb.atomic_rmw(op, ty, addr, operand);
        self.push(v);
        Ok(())
    }

    fn cmpxchg(
        &mut self,
        fb: &mut FunctionBuilder,
        offsets: &ModuleContextOffsets,
        memarg: MemArg,
        ty: Type,
        size: u32,
    ) -> Result<(), CompileError> {
        let replacement = self.pop();
        let expected = self.pop();
        let addr = self.prepare_atomic_addr(fb, offsets, memarg, size)?;
        let v = fb.atomic_cas(ty, addr, expected, replacement);
        self.push(v);
        Ok(())
    }

    fn mem_load(
        &mut self,
        fb: &mut FunctionBuilder,
        offsets: &ModuleContextOffsets,
        memarg: MemArg,
        opcode: Opcode,
        ty: Type,
        size: u32,
    ) -> Result<(), CompileError> {
        let (addr, off) = self.prepare_addr(fb, offsets, memarg, size)?;
        let v = fb.load(opcode, ty, addr, off);
        self.push(v);
        Ok(())
    }

    fn mem_store(
        &mut self,
        fb: &mut FunctionBuilder,
        offsets: &ModuleContextOffsets,
        memarg: MemArg,
        opcode: Opcode,
        size: u32,
    ) -> Result<(), CompileError> {
        let value = self.pop();
        let (addr, off) = self.prepare_addr(fb, offsets, memarg, size)?;
        fb.store(opcode, value, addr, off);
        Ok(())
    }

    fn global_load(
        &mut self,
        fb: &mut FunctionBuilder,
        offsets: &ModuleContextOffsets,
        module: &Module,
        index: GlobalIndex,
    ) -> Value {
        let ty = valtype(module.globals[index].ty);
        let slot = offsets.global_slot(index);
        let ctx = self.module_ctx;
        if module.is_imported_global(index) {
            let p = fb.load(Opcode::Load, Type::I64, ctx, slot);
            fb.load(Opcode::Load, ty, p, 0)
        } else {
            fb.load(Opcode::Load, ty, ctx, slot)
        }
    }

    fn global_store(
        &mut self,
        fb: &mut FunctionBuilder,
        offsets: &ModuleContextOffsets,
        module: &Module,
        index: GlobalIndex,
        value: Value,
    ) {
        debug_assert!(module.globals[index].mutable, "store to immutable global");
        let slot = offsets.global_slot(index);
        let ctx = self.module_ctx;
        if module.is_imported_global(index) {
            let p = fb.load(Opcode::Load, Type::I64, ctx, slot);
            fb.store(Opcode::Store, value, p, 0);
        } else {
            fb.store(Opcode::Store, value, ctx, slot);
        }
    }

    fn translate_call_indirect(
        &mut self,
        module: &Module,
        offsets: &ModuleContextOffsets,
        fb: &mut FunctionBuilder,
        ty: TypeIndex,
        table: TableIndex,
    ) -> Result<(), CompileError> {
        let idx32 = self.pop();
        let ctx = self.module_ctx;
        let table_ptr = fb.load(Opcode::Load, Type::I64, ctx, offsets.table_ptr(table));
        let len = fb.load(Opcode::Load, Type::I64, table_ptr, table_descriptor::LEN);
        let idx = fb.unary(Opcode::UextendI32, Type::I64, idx32);
        let oob = fb.icmp(IntCC::Uge, idx, len);
        self.trap_if(fb, oob, TrapCode::TableOutOfBounds);

        let elems = fb.load(Opcode::Load, Type::I64, table_ptr, table_descriptor::ELEMS);
        let three = fb.iconst(Type::I64, 3);
        let byte_off = fb.binary(Opcode::Ishl, Type::I64, idx, three);
        let slot = fb.binary(Opcode::Iadd, Type::I64, elems, byte_off);
        let elem = fb.load(Opcode::Load, Type::I64, slot, 0);
        self.trap_if_zero(fb, elem, TrapCode::IndirectCallNullPointer);

        let type_ids_off = offsets.type_ids_ptr().ok_or_else(|| {
            CompileError::InvalidModule("call_indirect in a module without tables".to_string())
        })?;
        let type_ids = fb.load(Opcode::Load, Type::I64, ctx, type_ids_off);
        let actual = fb.load(Opcode::Load, Type::I64, elem, function_instance::TYPE_ID);
        let expected = fb.load(Opcode::Load, Type::I64, type_ids, ty.as_u32() * 8);
        let mismatch = fb.icmp(IntCC::Ne, actual, expected);
        self.trap_if(fb, mismatch, TrapCode::IndirectCallTypeMismatch);

        let code = fb.load(Opcode::Load, Type::I64, elem, function_instance::EXECUTABLE);
        let callee_ctx = fb.load(Opcode::Load, Type::I64, elem, function_instance::MODULE_CTX);
        let sig = self.type_sig(fb, module, ty);
        let num_params = module.types[ty].params.len();
        let args = self.popn(num_params);
        let mut full: SmallVec<[Value; 8]> = SmallVec::new();
        full.push(code);
        full.push(callee_ctx);
        full.extend_from_slice(&args);
        let inst = fb.call_indirect(sig, &full);
        let results: SmallVec<[Value; 4]> = fb.func.inst_results(inst).iter().copied().collect();
        self.invalidate_memory_cache();
        self.stack.extend(results);
        Ok(())
    }
}

impl Default for FuncTranslator {
    fn default() -> Self {
        Self::new()
    }
}

fn mask_bits(ty: Type) -> u64 {
    match ty {
        Type::I32 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

/// A float bound for the conversion range checks, kept as bits so constants
/// survive exactly.
#[derive(Copy, Clone)]
enum FloatConst {
    F32(u32),
    F64(u64),
}

impl FloatConst {
    fn emit(self, fb: &mut FunctionBuilder) -> Value {
        match self {
            FloatConst::F32(bits) => fb.f32const(bits),
            FloatConst::F64(bits) => fb.f64const(bits),
        }
    }
}

fn f32b(v: f32) -> FloatConst {
    FloatConst::F32(v.to_bits())
}

fn f64b(v: f64) -> FloatConst {
    FloatConst::F64(v.to_bits())
}
