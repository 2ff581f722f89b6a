//! Machine back ends for the Kestrel compiler.
//!
//! The crate exposes an ISA-agnostic [`Machine`] facade: lower an SSA
//! function, allocate registers, and encode a position-independent body plus
//! relocation records; generate the engine trampolines; and resolve
//! relocations into a final executable image. One back end is implemented,
//! AArch64; [`lookup`] rejects other targets with a typed error.

pub mod aarch64;
mod buffer;
mod reg;
mod regalloc;
mod reloc;
mod vcode;

#[cfg(test)]
mod tests;

use kestrel_environ::{CompileError, ExitCode, FuncType, ValType};
use kestrel_ssa as ssa;
use target_lexicon::{Architecture, Triple};

pub use buffer::Reloc;
pub use reloc::{
    link_image, plan_image, ImageLayout, LaidOutFunction, RelocPatcher, TRAMPOLINE_SIZE,
};

/// One compiled function: encoded body, unresolved calls, and the size of
/// the host-entry preamble at its head.
pub struct CompiledFunction {
    pub body: Vec<u8>,
    pub relocs: Vec<Reloc>,
    pub preamble_size: u32,
}

/// An ISA back end.
pub trait Machine: Send + Sync {
    /// Compile one function to machine code. With `want_preamble`, the body
    /// is prefixed by the host-entry preamble.
    fn compile_function(
        &self,
        func: &ssa::Function,
        want_preamble: bool,
    ) -> Result<CompiledFunction, CompileError>;

    /// One trampoline bridging a guest call to host function `index`.
    fn compile_host_call_trampoline(
        &self,
        index: u32,
        ty: &FuncType,
        module_function: bool,
    ) -> Result<Vec<u8>, CompileError>;

    /// A fixed-signature engine builtin trampoline exiting with `code`.
    fn compile_builtin_trampoline(
        &self,
        code: ExitCode,
        params: &[ssa::Type],
        results: &[ssa::Type],
    ) -> Vec<u8>;

    /// The shared stack-grow call sequence used by every prologue.
    fn compile_stack_grow_sequence(&self) -> Vec<u8>;

    /// The host→guest resume stub the dispatch loop re-enters through.
    fn compile_resume_stub(&self) -> Vec<u8>;

    /// The relocation hooks for this ISA.
    fn reloc_patcher(&self) -> &dyn RelocPatcher;
}

/// Select the back end for a target triple.
pub fn lookup(triple: &Triple) -> Result<Box<dyn Machine>, CompileError> {
    match triple.architecture {
        Architecture::Aarch64(_) => Ok(Box::new(aarch64::AArch64)),
        other => Err(CompileError::UnsupportedTarget(other.to_string())),
    }
}

/// The back end for the host this process runs on.
pub fn native() -> Result<Box<dyn Machine>, CompileError> {
    lookup(&Triple::host())
}

/// The SSA-level signature of a wasm function type: the callee's module
/// context leads, then the wasm parameters.
pub fn wasm_abi_signature(ty: &FuncType) -> ssa::Signature {
    fn v(t: ValType) -> ssa::Type {
        match t {
            ValType::I32 => ssa::Type::I32,
            ValType::I64 => ssa::Type::I64,
            ValType::F32 => ssa::Type::F32,
            ValType::F64 => ssa::Type::F64,
            ValType::V128 => ssa::Type::V128,
        }
    }
    let mut params = Vec::with_capacity(ty.params.len() + 1);
    params.push(ssa::Type::I64);
    params.extend(ty.params.iter().map(|&t| v(t)));
    ssa::Signature::new(params, ty.results.iter().map(|&t| v(t)).collect())
}
