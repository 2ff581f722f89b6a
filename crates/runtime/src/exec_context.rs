//! The execution context: the fixed-layout structure native code addresses
//! through its pinned register.

use kestrel_environ::exec_ctx;

/// One per call engine. Field order is frozen; the offset constants in
/// `kestrel-environ` are the contract with generated code and the tests
/// below re-assert every one of them.
#[repr(C, align(16))]
pub struct ExecutionContext {
    pub exit_code: u64,
    pub caller_module_context: u64,
    pub original_frame_pointer: u64,
    pub original_stack_pointer: u64,
    pub host_return_address: u64,
    pub stack_grow_required_size: u64,
    pub stack_pointer_before_host_call: u64,
    pub frame_pointer_before_host_call: u64,
    pub host_call_return_address: u64,
    pub stack_bottom: u64,
    pub stack_grow_sequence: u64,
    pub memory_grow_trampoline: u64,
    pub check_module_exit_code_trampoline: u64,
    pub memory_wait32_trampoline: u64,
    pub memory_wait64_trampoline: u64,
    pub memory_notify_trampoline: u64,
    pub param_result_ptr: u64,
    _pad: u64,
    /// Register save area: argument registers across stack growth, plus the
    /// host/guest callee-saved banks for boundary crossings.
    pub saved_registers: [u8; 64 * 16],
    /// Marshalling area for host-call parameters and results.
    pub host_call_stack: [u64; 128],
}

impl ExecutionContext {
    pub fn new() -> Box<ExecutionContext> {
        // Large arrays make a stack-allocated zeroed struct wasteful; build
        // it in place.
        let mut ctx: Box<ExecutionContext> = unsafe {
            let layout = std::alloc::Layout::new::<ExecutionContext>();
            let raw = std::alloc::alloc_zeroed(layout) as *mut ExecutionContext;
            assert!(!raw.is_null(), "execution context allocation failed");
            Box::from_raw(raw)
        };
        ctx.exit_code = 0;
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{align_of, offset_of, size_of};

    #[test]
    fn offsets_match_the_generated_code_contract() {
        assert_eq!(offset_of!(ExecutionContext, exit_code) as u32, exec_ctx::EXIT_CODE);
        assert_eq!(
            offset_of!(ExecutionContext, caller_module_context) as u32,
            exec_ctx::CALLER_MODULE_CONTEXT
        );
        assert_eq!(
            offset_of!(ExecutionContext, original_frame_pointer) as u32,
            exec_ctx::ORIGINAL_FRAME_POINTER
        );
        assert_eq!(
            offset_of!(ExecutionContext, original_stack_pointer) as u32,
            exec_ctx::ORIGINAL_STACK_POINTER
        );
        assert_eq!(
            offset_of!(ExecutionContext, host_return_address) as u32,
            exec_ctx::HOST_RETURN_ADDRESS
        );
        assert_eq!(
            offset_of!(ExecutionContext, stack_grow_required_size) as u32,
            exec_ctx::STACK_GROW_REQUIRED_SIZE
        );
        assert_eq!(
            offset_of!(ExecutionContext, stack_pointer_before_host_call) as u32,
            exec_ctx::STACK_POINTER_BEFORE_HOST_CALL
        );
        assert_eq!(
            offset_of!(ExecutionContext, frame_pointer_before_host_call) as u32,
            exec_ctx::FRAME_POINTER_BEFORE_HOST_CALL
        );
        assert_eq!(
            offset_of!(ExecutionContext, host_call_return_address) as u32,
            exec_ctx::HOST_CALL_RETURN_ADDRESS
        );
        assert_eq!(
            offset_of!(ExecutionContext, stack_bottom) as u32,
            exec_ctx::STACK_BOTTOM
        );
        assert_eq!(
            offset_of!(ExecutionContext, stack_grow_sequence) as u32,
            exec_ctx::STACK_GROW_SEQUENCE
        );
        assert_eq!(
            offset_of!(ExecutionContext, memory_grow_trampoline) as u32,
            exec_ctx::MEMORY_GROW_TRAMPOLINE
        );
        assert_eq!(
            offset_of!(ExecutionContext, check_module_exit_code_trampoline) as u32,
            exec_ctx::CHECK_MODULE_EXIT_CODE_TRAMPOLINE
        );
        assert_eq!(
            offset_of!(ExecutionContext, memory_wait32_trampoline) as u32,
            exec_ctx::MEMORY_WAIT32_TRAMPOLINE
        );
        assert_eq!(
            offset_of!(ExecutionContext, memory_wait64_trampoline) as u32,
            exec_ctx::MEMORY_WAIT64_TRAMPOLINE
        );
        assert_eq!(
            offset_of!(ExecutionContext, memory_notify_trampoline) as u32,
            exec_ctx::MEMORY_NOTIFY_TRAMPOLINE
        );
        assert_eq!(
            offset_of!(ExecutionContext, param_result_ptr) as u32,
            exec_ctx::PARAM_RESULT_PTR
        );
        assert_eq!(
            offset_of!(ExecutionContext, saved_registers) as u32,
            exec_ctx::SAVED_REGISTERS
        );
        assert_eq!(
            offset_of!(ExecutionContext, host_call_stack) as u32,
            exec_ctx::HOST_CALL_STACK
        );
        assert_eq!(size_of::<ExecutionContext>() as u32, exec_ctx::SIZE);
        assert_eq!(align_of::<ExecutionContext>(), 16);
    }
}
