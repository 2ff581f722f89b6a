//! AArch64 register file and the conventions compiled code lives by.
//!
//! x0 is pinned to the execution-context pointer for the whole lifetime of
//! guest code: prologues, trampolines and exit sequences all address the
//! execution context through it, and the allocator never hands it out.
//! x1 carries the callee's module context at every call boundary.
//! x16/x17 are emitter scratch, never allocated. x18 is left to the
//! platform. Wasm arguments travel in x2..x7 and v0..v7, results the same.

use crate::reg::{Reg, RegClass, Writable};

pub fn xreg(num: u8) -> Reg {
    debug_assert!(num < 31);
    Reg::real(RegClass::Int, num)
}

pub fn writable_xreg(num: u8) -> Writable<Reg> {
    Writable::from_reg(xreg(num))
}

pub fn vreg(num: u8) -> Reg {
    debug_assert!(num < 32);
    Reg::real(RegClass::Float, num)
}

pub fn writable_vreg(num: u8) -> Writable<Reg> {
    Writable::from_reg(vreg(num))
}

/// The pinned execution-context register.
pub fn exec_ctx_reg() -> Reg {
    xreg(0)
}

/// The module-context argument register.
pub fn module_ctx_reg() -> Reg {
    xreg(1)
}

/// Emitter scratch; also the long-jump trampoline scratch.
pub fn spilltmp_reg() -> Reg {
    xreg(16)
}

pub fn writable_spilltmp_reg() -> Writable<Reg> {
    writable_xreg(16)
}

/// Second emitter scratch.
pub fn tmp2_reg() -> Reg {
    xreg(17)
}

pub fn writable_tmp2_reg() -> Writable<Reg> {
    writable_xreg(17)
}

pub fn fp_reg() -> Reg {
    xreg(29)
}

pub fn link_reg() -> Reg {
    xreg(30)
}

/// XSP. Shares encoding 31 with XZR; which one an instruction means is
/// context-dependent, so the distinction lives in the `Inst` variants.
pub fn stack_reg() -> Reg {
    Reg::real(RegClass::Int, 31)
}

pub fn zero_reg() -> Reg {
    Reg::real(RegClass::Int, 31)
}

/// Integer argument/result registers, in order.
pub const INT_ARG_REGS: [u8; 6] = [2, 3, 4, 5, 6, 7];

/// Float argument/result registers, in order.
pub const FLOAT_ARG_REGS: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

/// Allocatable integer registers. Argument registers stay out of the pool;
/// they only appear in the fixed moves around entry and call sites, so the
/// allocator never has to reason about them.
pub const INT_ALLOCATABLE: [u8; 18] =
    [8, 9, 10, 11, 12, 13, 14, 15, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28];

/// Allocatable float registers. All are treated as caller-saved: values live
/// across calls are spilled rather than kept in v8..v15, whose upper halves
/// the C ABI would not preserve anyway.
pub const FLOAT_ALLOCATABLE: [u8; 16] =
    [16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31];

/// Whether an integer register is preserved across internal calls.
pub fn is_int_callee_saved(enc: u8) -> bool {
    (19..=28).contains(&enc)
}
