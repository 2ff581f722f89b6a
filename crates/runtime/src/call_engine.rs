//! Call engines: guest-stack ownership, the native entry, and the exit-code
//! dispatch loop.

use std::panic::{catch_unwind, AssertUnwindSafe};

use log::trace;

use kestrel_environ::{exec_ctx, BuiltinFunctionIndex, ExitCode, ExitKind, FuncType, Trap};

use crate::backtrace;
use crate::error::{RuntimeError, WasmBacktrace};
use crate::exec_context::ExecutionContext;
use crate::host::HostFuncKind;
use crate::module_engine::ModuleEngine;

/// The generated host-entry preamble's signature:
/// `(exec_ctx, module_ctx, param_result_ptr, guest_stack_top)`.
type EntryFn = unsafe extern "C" fn(*mut ExecutionContext, *mut u8, *mut u64, *mut u8);
/// The resume stub: `(exec_ctx)`.
type ResumeFn = unsafe extern "C" fn(*mut ExecutionContext);

/// One callable function of one instance. Owns the guest stack and the
/// execution context; not safe for concurrent calls, which the `&mut`
/// receivers enforce.
pub struct CallEngine {
    module: ModuleEngine,
    ty: FuncType,
    preamble: *const u8,
    /// The guest-entry address past the preamble; what guest-to-guest calls
    /// use, kept for table round-trips.
    #[allow(dead_code)]
    executable: *const u8,
    param_result_slots: usize,
    /// Guest stack storage; u128 units keep the top 16-byte aligned.
    stack: Vec<u128>,
    exec_ctx: Box<ExecutionContext>,
}

unsafe impl Send for CallEngine {}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine").finish_non_exhaustive()
    }
}

impl CallEngine {
    pub(crate) fn new(
        module: ModuleEngine,
        ty: FuncType,
        preamble: *const u8,
        executable: *const u8,
    ) -> CallEngine {
        let slots = ty.param_result_slots();
        let config_bytes = module.inner.engine.0.config.initial_stack_size * 8;
        let stack_bytes = (config_bytes.max(slots * 16 + 48) + 15) & !15;
        CallEngine {
            module,
            ty,
            preamble,
            executable,
            param_result_slots: slots,
            stack: vec![0u128; stack_bytes / 16],
            exec_ctx: ExecutionContext::new(),
        }
    }

    pub fn ty(&self) -> &FuncType {
        &self.ty
    }

    /// Number of u64 slots `call_with_stack` requires.
    pub fn param_result_slots(&self) -> usize {
        self.param_result_slots
    }

    fn stack_bottom(&self) -> u64 {
        self.stack.as_ptr() as u64
    }

    fn stack_top(&self) -> u64 {
        self.stack_bottom() + (self.stack.len() * 16) as u64
    }

    /// Call with flat u64 parameters (v128 values occupy two slots) and get
    /// the result slots back.
    pub fn call(&mut self, params: &[u64]) -> Result<Vec<u64>, RuntimeError> {
        let expected: usize = self.ty.params.iter().map(|t| t.slot_count()).sum();
        if params.len() != expected {
            return Err(RuntimeError::ParamArity {
                expected,
                got: params.len(),
            });
        }
        let mut slice = vec![0u64; self.param_result_slots.max(params.len())];
        slice[..params.len()].copy_from_slice(params);
        self.call_with_stack(&mut slice)?;
        let results: usize = self.ty.results.iter().map(|t| t.slot_count()).sum();
        slice.truncate(results);
        Ok(slice)
    }

    /// Call with a caller-provided parameter/result buffer, which must hold
    /// at least [`CallEngine::param_result_slots`] slots.
    pub fn call_with_stack(&mut self, param_result: &mut [u64]) -> Result<(), RuntimeError> {
        if param_result.len() < self.param_result_slots {
            return Err(RuntimeError::ParamArity {
                expected: self.param_result_slots,
                got: param_result.len(),
            });
        }
        if let Some(reason) = self.module.closed_reason() {
            return Err(RuntimeError::Closed(reason));
        }

        let shared = &self.module.inner.engine.0.shared;
        self.exec_ctx.exit_code = 0;
        self.exec_ctx.stack_bottom = self.stack_bottom();
        self.exec_ctx.stack_grow_sequence = shared.stack_grow_ptr();
        self.exec_ctx.memory_grow_trampoline = shared.memory_grow_ptr();
        self.exec_ctx.check_module_exit_code_trampoline = shared.check_exit_ptr();
        self.exec_ctx.memory_wait32_trampoline = shared.wait32_ptr();
        self.exec_ctx.memory_wait64_trampoline = shared.wait64_ptr();
        self.exec_ctx.memory_notify_trampoline = shared.notify_ptr();

        let entry: EntryFn = unsafe { core::mem::transmute(self.preamble) };
        let exec_ptr: *mut ExecutionContext = &mut *self.exec_ctx;
        unsafe {
            entry(
                exec_ptr,
                self.module.ctx_ptr(),
                param_result.as_mut_ptr(),
                self.stack_top() as *mut u8,
            );
        }
        let result = self.dispatch_loop();
        // The engine stays reusable after an error.
        self.exec_ctx.exit_code = 0;
        result
    }

    fn dispatch_loop(&mut self) -> Result<(), RuntimeError> {
        loop {
            let code = ExitCode::from_bits(self.exec_ctx.exit_code as u32);
            trace!("exit code {:?}", code.kind());
            match code.kind() {
                ExitKind::Ok => return Ok(()),
                ExitKind::GrowStack => {
                    self.grow_stack()?;
                    self.reenter();
                }
                ExitKind::GrowMemory => {
                    let caller = self.caller_instance()?;
                    let delta = self.exec_ctx.host_call_stack[0] as u32;
                    let result = caller.grow_memory(delta);
                    self.exec_ctx.host_call_stack[0] = result as u32 as u64;
                    self.reenter();
                }
                ExitKind::CallHostFunction | ExitKind::CallHostModuleFunction => {
                    self.dispatch_host_call(code)?;
                    self.reenter();
                }
                ExitKind::CallBuiltinFunction => {
                    self.dispatch_builtin(code)?;
                    self.reenter();
                }
                ExitKind::CheckModuleExitCode => {
                    let caller = self.caller_instance()?;
                    if let Some(reason) = caller.closed_reason() {
                        return Err(RuntimeError::Closed(reason));
                    }
                    self.reenter();
                }
                _ => {
                    let trap = Trap::from_exit_code(code).expect("trap exit kind");
                    let backtrace = backtrace::capture(
                        &self.module.inner.engine,
                        &[self.exec_ctx.host_call_return_address],
                        self.exec_ctx.frame_pointer_before_host_call,
                        self.exec_ctx.stack_pointer_before_host_call,
                        self.stack_top(),
                        None,
                    );
                    return Err(RuntimeError::Trap { trap, backtrace });
                }
            }
        }
    }

    fn reenter(&mut self) {
        let shared = &self.module.inner.engine.0.shared;
        let resume: ResumeFn =
            unsafe { core::mem::transmute(shared.resume_ptr() as usize as *const u8) };
        self.exec_ctx.exit_code = 0;
        let exec_ptr: *mut ExecutionContext = &mut *self.exec_ctx;
        unsafe { resume(exec_ptr) };
    }

    /// The instance whose code performed the current exit.
    fn caller_instance(&self) -> Result<ModuleEngine, RuntimeError> {
        let ctx = self.exec_ctx.caller_module_context as usize;
        // Exits from this engine's own code never store the context; fall
        // back to the owning instance.
        if ctx == 0 || ctx == self.module.ctx_ptr() as usize {
            return Ok(self.module.clone());
        }
        self.module
            .inner
            .engine
            .instance_of_ctx(ctx)
            .map(|inner| ModuleEngine { inner })
            .ok_or_else(|| RuntimeError::Closed("calling instance is gone".to_string()))
    }

    fn dispatch_host_call(&mut self, code: ExitCode) -> Result<(), RuntimeError> {
        let callee = self.caller_instance()?;
        let index = code.index() as usize;
        let functions = callee
            .host_functions()
            .ok_or_else(|| RuntimeError::Closed("host call into a wasm module".to_string()))?;
        let f = &functions[index];
        let param_slots: usize = f.ty.params.iter().map(|t| t.slot_count()).sum();
        let result_slots: usize = f.ty.results.iter().map(|t| t.slot_count()).sum();
        let used = param_slots.max(result_slots);
        let slice = &mut self.exec_ctx.host_call_stack[..used];

        let invoked = match &f.kind {
            HostFuncKind::Plain(func) => {
                catch_unwind(AssertUnwindSafe(|| func(slice)))
            }
            HostFuncKind::WithModule(func) => {
                catch_unwind(AssertUnwindSafe(|| func(&callee, slice)))
            }
        };
        match invoked {
            Ok(()) => Ok(()),
            Err(payload) => {
                let message = panic_message(&payload);
                let leaf = backtrace::format_frame_of(
                    &callee.inner.module,
                    kestrel_environ::FuncIndex::from_u32(index as u32),
                );
                let backtrace = backtrace::capture(
                    &self.module.inner.engine,
                    &[self.exec_ctx.host_call_stack[exec_ctx::HOST_CALL_STACK_SLOTS as usize - 1]],
                    self.exec_ctx.frame_pointer_before_host_call,
                    self.exec_ctx.stack_pointer_before_host_call,
                    self.stack_top(),
                    Some(leaf),
                );
                Err(RuntimeError::HostPanic { message, backtrace })
            }
        }
    }

    fn dispatch_builtin(&mut self, code: ExitCode) -> Result<(), RuntimeError> {
        let engine = &self.module.inner.engine;
        let builtin = BuiltinFunctionIndex::from_u32(code.index())
            .ok_or_else(|| RuntimeError::Closed(format!("unknown builtin {}", code.index())))?;
        let stack = &mut self.exec_ctx.host_call_stack;
        match builtin {
            BuiltinFunctionIndex::MemoryAtomicWait32 => {
                let addr = stack[0];
                let expected = stack[1] as u32;
                let timeout = stack[2] as i64;
                let result = engine.0.waiters.wait(
                    addr,
                    || unsafe { (addr as *const u32).read_volatile() } == expected,
                    timeout,
                );
                stack[0] = result as u32 as u64;
            }
            BuiltinFunctionIndex::MemoryAtomicWait64 => {
                let addr = stack[0];
                let expected = stack[1];
                let timeout = stack[2] as i64;
                let result = engine.0.waiters.wait(
                    addr,
                    || unsafe { (addr as *const u64).read_volatile() } == expected,
                    timeout,
                );
                stack[0] = result as u32 as u64;
            }
            BuiltinFunctionIndex::MemoryAtomicNotify => {
                let addr = stack[0];
                let count = stack[1] as u32;
                let woken = engine.0.waiters.notify(addr, count);
                stack[0] = woken as u32 as u64;
            }
        }
        Ok(())
    }

    /// Replace the guest stack with a larger one, preserving the active
    /// region and re-basing the frame-pointer chain by the move delta.
    fn grow_stack(&mut self) -> Result<(), RuntimeError> {
        let required = self.exec_ctx.stack_grow_required_size as usize;
        let old_bytes = self.stack.len() * 16;
        let ceiling = self.module.inner.engine.0.config.call_stack_ceiling * 8;
        let new_bytes = ((old_bytes * 2 + required) + 15) & !15;
        if new_bytes > ceiling {
            return Err(RuntimeError::Trap {
                trap: Trap::StackOverflow,
                backtrace: WasmBacktrace::default(),
            });
        }
        trace!("growing guest stack {old_bytes} -> {new_bytes} bytes");

        let old_bottom = self.stack_bottom();
        let old_top = self.stack_top();
        let sp = self.exec_ctx.stack_pointer_before_host_call;
        debug_assert!(sp >= old_bottom && sp <= old_top);
        let active = (old_top - sp) as usize;

        let mut new_stack = vec![0u128; new_bytes / 16];
        let new_top = new_stack.as_mut_ptr() as u64 + new_bytes as u64;
        let new_sp = new_top - active as u64;
        unsafe {
            core::ptr::copy_nonoverlapping(sp as *const u8, new_sp as *mut u8, active);
        }
        let delta = new_top.wrapping_sub(old_top);
        let in_old_active = |v: u64| v >= sp && v < old_top;

        // Re-base the frame-pointer register and the chain inside the copied
        // region. Frame records that point outside the old stack (the host
        // frame at the bottom of the chain) are left alone.
        let fp = self.exec_ctx.frame_pointer_before_host_call;
        let mut cur = if in_old_active(fp) {
            self.exec_ctx.frame_pointer_before_host_call = fp.wrapping_add(delta);
            self.exec_ctx.frame_pointer_before_host_call
        } else {
            0
        };
        while cur >= new_sp && cur + 8 < new_top {
            let saved = unsafe { (cur as *const u64).read() };
            if !in_old_active(saved) {
                break;
            }
            let rebased = saved.wrapping_add(delta);
            unsafe { (cur as *mut u64).write(rebased) };
            cur = rebased;
        }

        self.exec_ctx.stack_pointer_before_host_call = new_sp;
        self.exec_ctx.stack_bottom = new_stack.as_ptr() as u64;
        self.stack = new_stack;
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "host function panicked".to_string()
    }
}
