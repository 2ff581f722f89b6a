//! Lowering from wasm bytecode to SSA.
//!
//! One [`FuncTranslator`] turns one decoded function body into an
//! [`ssa::Function`]. The translation mirrors the wasm operand stack with a
//! stack of SSA values, tracks wasm locals as builder variables, and lowers
//! structured control flow to blocks with explicit block arguments. Runtime
//! checks (memory bounds, table bounds, division guards, conversion guards)
//! are made explicit here; the machine back end never inserts checks of its
//! own.
//!
//! Calling convention seen at this level: every function takes its
//! module-context pointer as a leading `i64` parameter, and calls pass the
//! callee's context the same way. The execution-context pointer lives in a
//! pinned register and is materialized with `get_exec_ctx` only to reach the
//! engine trampolines.

mod control;
#[cfg(test)]
mod tests;
mod translator;

use kestrel_environ as environ;
use kestrel_ssa as ssa;

use environ::{CompileError, DefinedFuncIndex, FuncType, Module, ModuleContextOffsets, ValType};

pub use translator::FuncTranslator;

/// Compile-time options that affect lowering.
#[derive(Copy, Clone, Debug, Default)]
pub struct TranslationConfig {
    /// Emit a termination check at every loop header so long-running guest
    /// code periodically yields to the host.
    pub ensure_termination: bool,
}

pub(crate) fn valtype(ty: ValType) -> ssa::Type {
    match ty {
        ValType::I32 => ssa::Type::I32,
        ValType::I64 => ssa::Type::I64,
        ValType::F32 => ssa::Type::F32,
        ValType::F64 => ssa::Type::F64,
        ValType::V128 => ssa::Type::V128,
    }
}

/// The SSA signature of a wasm function: module context first, then the wasm
/// parameters.
pub fn wasm_signature(ty: &FuncType) -> ssa::Signature {
    let mut params = Vec::with_capacity(ty.params.len() + 1);
    params.push(ssa::Type::I64);
    params.extend(ty.params.iter().map(|&t| valtype(t)));
    let returns = ty.results.iter().map(|&t| valtype(t)).collect();
    ssa::Signature::new(params, returns)
}

/// Translate the body of `index` into `func`.
pub fn translate_function(
    module: &Module,
    offsets: &ModuleContextOffsets,
    index: DefinedFuncIndex,
    config: TranslationConfig,
    func: &mut ssa::Function,
) -> Result<(), CompileError> {
    let mut translator = FuncTranslator::new();
    translator.translate(module, offsets, index, config, func)
}
