//! The AArch64 back end.

pub(crate) mod abi;
pub(crate) mod args;
pub(crate) mod emit;
pub(crate) mod inst;
pub(crate) mod lower;
pub(crate) mod regs;
pub(crate) mod trampolines;

use kestrel_environ::{CompileError, ExitCode, FuncType};
use kestrel_ssa as ssa;

use crate::buffer::CodeBuffer;
use crate::reloc::{RelocPatcher, TRAMPOLINE_SIZE};
use crate::{regalloc, CompiledFunction, Machine};

/// The AArch64 [`Machine`] implementation.
pub struct AArch64;

impl Machine for AArch64 {
    fn compile_function(
        &self,
        func: &ssa::Function,
        want_preamble: bool,
    ) -> Result<CompiledFunction, CompileError> {
        let mut buffer = CodeBuffer::new();
        let mut vcode = lower::lower_function(func, &mut buffer)?;
        let ra = regalloc::run(&mut vcode);
        let frame = abi::FrameLayout::new(&ra, vcode.out_args_size);
        abi::apply_frame(&mut vcode, &frame);

        let preamble_size = if want_preamble {
            let abi_sig = abi::ABISig::compute(&func.signature);
            let body = vcode.blocks[0].label;
            // Slot offsets of the wasm-level parameters in the flat buffer.
            let mut slots = Vec::new();
            let mut slot = 0u32;
            for &ty in func.signature.params.iter().skip(1) {
                slots.push((ty, slot));
                slot += if ty == ssa::Type::V128 { 2 } else { 1 };
            }
            abi::emit_preamble(&abi_sig, &slots, body, &mut buffer);
            buffer.cur_offset()
        } else {
            0
        };

        abi::emit_body(&vcode, &frame, &mut buffer);
        let (body, relocs) = buffer.finalize()?;
        Ok(CompiledFunction {
            body,
            relocs,
            preamble_size,
        })
    }

    fn compile_host_call_trampoline(
        &self,
        index: u32,
        ty: &FuncType,
        module_function: bool,
    ) -> Result<Vec<u8>, CompileError> {
        trampolines::compile_host_call_trampoline(index, ty, module_function)
    }

    fn compile_builtin_trampoline(
        &self,
        code: ExitCode,
        params: &[ssa::Type],
        results: &[ssa::Type],
    ) -> Vec<u8> {
        trampolines::compile_builtin_trampoline(code, params, results)
    }

    fn compile_stack_grow_sequence(&self) -> Vec<u8> {
        trampolines::compile_stack_grow_sequence()
    }

    fn compile_resume_stub(&self) -> Vec<u8> {
        trampolines::compile_resume_stub()
    }

    fn reloc_patcher(&self) -> &dyn RelocPatcher {
        &AArch64Patcher
    }
}

/// Branch patching for the engine's relocation resolver.
pub struct AArch64Patcher;

impl RelocPatcher for AArch64Patcher {
    /// `bl` reaches ±128 MiB.
    fn call_range(&self) -> i64 {
        1 << 27
    }

    fn patch_call(&self, code: &mut [u8], at: usize, disp: i64) {
        debug_assert_eq!(disp % 4, 0);
        debug_assert!(disp.unsigned_abs() < (1 << 27));
        let word = 0x9400_0000u32 | (((disp / 4) as u32) & 0x03ff_ffff);
        code[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }

    /// `adrp x16, page; add x16, x16, #lo12; br x16; nop`: reaches ±4 GiB
    /// and stays position-independent as long as the image base is
    /// page-aligned, which an mmap always is.
    fn write_trampoline(&self, buf: &mut [u8], at: u32, target: u32) {
        debug_assert_eq!(buf.len(), TRAMPOLINE_SIZE as usize);
        let page_delta = (i64::from(target) >> 12) - (i64::from(at) >> 12);
        let pd = page_delta as u32;
        let immlo = pd & 3;
        let immhi = (pd >> 2) & ((1 << 19) - 1);
        let adrp = (1u32 << 31) | (0b10000 << 24) | (immlo << 29) | (immhi << 5) | 16;
        let add = 0x9100_0000u32 | ((target & 0xfff) << 10) | (16 << 5) | 16;
        buf[0..4].copy_from_slice(&adrp.to_le_bytes());
        buf[4..8].copy_from_slice(&add.to_le_bytes());
        buf[8..12].copy_from_slice(&0xD61F_0200u32.to_le_bytes());
        buf[12..16].copy_from_slice(&0xD503_201Fu32.to_le_bytes());
    }
}
