//! Shared data model for the Kestrel compiler and runtime.
//!
//! This crate defines the in-memory representation of a validated Wasm module
//! (the compiler's input), the byte-layout schema of the per-instance module
//! context, the execution-context layout both sides of the native boundary
//! agree on, and the exit-code protocol compiled code uses to return control
//! to the host.
//!
//! Nothing in here allocates executable memory or looks at bytecode encodings;
//! decoding and validation happen upstream and hand us a [`Module`].

mod error;
mod exec_context;
mod exit_code;
mod module;
mod offsets;
mod operators;
mod trap;

pub use error::*;
pub use exec_context::*;
pub use exit_code::*;
pub use module::*;
pub use offsets::*;
pub use operators::*;
pub use trap::*;

/// A function type id, canonicalized per engine.
///
/// Two function types compare equal for `call_indirect` purposes iff their
/// ids are equal; the engine interns structurally equal [`FuncType`]s to the
/// same id so the check compiles to a single integer comparison.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TypeId(pub u32);
