//! Compile-time errors.

use thiserror::Error;

/// An error rejecting a module before any executable is produced.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The module uses an operator outside the implemented subset.
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(&'static str),
    /// The module violates an input invariant the producer should have held.
    #[error("invalid module: {0}")]
    InvalidModule(String),
    /// A host-function signature the trampoline generator cannot marshal.
    #[error("host function signature too large: {0} value slots")]
    SignatureTooLarge(usize),
    /// More host functions than the exit-code payload can index.
    #[error("host function index {0} out of range")]
    HostFunctionIndexOutOfRange(u32),
    /// Instruction selection or encoding failed; a compiler bug, not a user
    /// error.
    #[error("code generation: {0}")]
    Codegen(String),
    /// Allocating or protecting executable memory failed.
    #[error("executable memory: {0}")]
    Memory(String),
    /// A corrupt compiled-module cache entry.
    #[error("compiled-module cache: {0}")]
    Cache(String),
    /// The target is not supported by any compiled-in back end.
    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),
}
