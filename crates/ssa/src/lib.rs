//! SSA intermediate representation for the Kestrel compiler.
//!
//! The IR is a conventional SSA form with one twist inherited from its
//! consumers: φ nodes are represented as *block parameters*, and every branch
//! carries the values it passes as explicit block arguments. The front end
//! never builds φs by hand; it declares variables and lets
//! [`FunctionBuilder`] place parameters on demand using incremental SSA
//! construction (Braun et al., "Simple and Efficient Construction of Static
//! Single Assignment Form"), with unsealed blocks accumulating incomplete φs
//! that are resolved when the block's predecessor set is finalized.
//!
//! A function flows through three stages:
//!
//! 1. construction via [`FunctionBuilder`],
//! 2. [`passes::run_passes`]: folding, branch simplification, dead-code and
//!    trivial-φ removal,
//! 3. [`layout::layout_blocks`]: the linear block order handed to the
//!    machine back end.

mod builder;
mod domtree;
mod function;
mod instructions;
mod layout;
mod loops;
pub mod passes;
mod types;
mod write;

pub use builder::*;
pub use domtree::*;
pub use function::*;
pub use instructions::*;
pub use layout::*;
pub use loops::*;
pub use types::*;
pub use write::*;

use cranelift_entity::entity_impl;

/// An SSA value: a block parameter or an instruction result.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// A basic block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An instruction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// A signature referenced by call instructions.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sig(u32);
entity_impl!(Sig, "sig");

/// A reference to an external (callee) function declared in a function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncRef(u32);
entity_impl!(FuncRef, "fn");

/// A jump table used by `br_table`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JumpTable(u32);
entity_impl!(JumpTable, "jt");

/// A frontend variable tracked by the SSA builder.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable(u32);
entity_impl!(Variable, "var");
