//! The exit-code protocol.
//!
//! Native code returns control to the host by storing one of these values in
//! the execution context's exit-code field and running the exit sequence.
//! The kind lives in the low byte; host-call exits carry the callee's
//! function index in the remaining high bits.

/// The kind of a structured exit.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ExitKind {
    Ok = 0,
    GrowStack = 1,
    GrowMemory = 2,
    CallHostFunction = 3,
    CallHostModuleFunction = 4,
    CheckModuleExitCode = 5,
    Unreachable = 6,
    MemoryOutOfBounds = 7,
    TableOutOfBounds = 8,
    IndirectCallNullPointer = 9,
    IndirectCallTypeMismatch = 10,
    IntegerOverflow = 11,
    IntegerDivisionByZero = 12,
    InvalidConversionToInteger = 13,
    /// A call to one of the engine-provided builtins (atomic wait/notify).
    CallBuiltinFunction = 14,
}

/// Index space of the engine builtins reachable through
/// [`ExitKind::CallBuiltinFunction`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum BuiltinFunctionIndex {
    MemoryAtomicWait32 = 0,
    MemoryAtomicWait64 = 1,
    MemoryAtomicNotify = 2,
}

impl BuiltinFunctionIndex {
    pub fn from_u32(index: u32) -> Option<Self> {
        Some(match index {
            0 => Self::MemoryAtomicWait32,
            1 => Self::MemoryAtomicWait64,
            2 => Self::MemoryAtomicNotify,
            _ => return None,
        })
    }
}

/// A tagged exit code: kind plus optional 24-bit payload.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ExitCode(u32);

impl ExitCode {
    pub const OK: ExitCode = ExitCode(ExitKind::Ok as u32);
    pub const GROW_STACK: ExitCode = ExitCode(ExitKind::GrowStack as u32);
    pub const GROW_MEMORY: ExitCode = ExitCode(ExitKind::GrowMemory as u32);
    pub const CHECK_MODULE_EXIT_CODE: ExitCode = ExitCode(ExitKind::CheckModuleExitCode as u32);
    pub const UNREACHABLE: ExitCode = ExitCode(ExitKind::Unreachable as u32);
    pub const MEMORY_OUT_OF_BOUNDS: ExitCode = ExitCode(ExitKind::MemoryOutOfBounds as u32);
    pub const TABLE_OUT_OF_BOUNDS: ExitCode = ExitCode(ExitKind::TableOutOfBounds as u32);
    pub const INDIRECT_CALL_NULL_POINTER: ExitCode =
        ExitCode(ExitKind::IndirectCallNullPointer as u32);
    pub const INDIRECT_CALL_TYPE_MISMATCH: ExitCode =
        ExitCode(ExitKind::IndirectCallTypeMismatch as u32);
    pub const INTEGER_OVERFLOW: ExitCode = ExitCode(ExitKind::IntegerOverflow as u32);
    pub const INTEGER_DIVISION_BY_ZERO: ExitCode =
        ExitCode(ExitKind::IntegerDivisionByZero as u32);
    pub const INVALID_CONVERSION_TO_INTEGER: ExitCode =
        ExitCode(ExitKind::InvalidConversionToInteger as u32);

    /// An exit requesting a call to host function `index` of the callee host
    /// module.
    pub fn call_host_function(index: u32) -> ExitCode {
        debug_assert!(index < 1 << 24);
        ExitCode(ExitKind::CallHostFunction as u32 | index << 8)
    }

    /// Like [`ExitCode::call_host_function`] but for host functions that
    /// receive the calling module instance.
    pub fn call_host_module_function(index: u32) -> ExitCode {
        debug_assert!(index < 1 << 24);
        ExitCode(ExitKind::CallHostModuleFunction as u32 | index << 8)
    }

    /// An exit requesting an engine builtin.
    pub fn call_builtin_function(index: BuiltinFunctionIndex) -> ExitCode {
        ExitCode(ExitKind::CallBuiltinFunction as u32 | (index as u32) << 8)
    }

    pub fn from_bits(bits: u32) -> ExitCode {
        ExitCode(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn kind(self) -> ExitKind {
        match self.0 as u8 {
            0 => ExitKind::Ok,
            1 => ExitKind::GrowStack,
            2 => ExitKind::GrowMemory,
            3 => ExitKind::CallHostFunction,
            4 => ExitKind::CallHostModuleFunction,
            5 => ExitKind::CheckModuleExitCode,
            6 => ExitKind::Unreachable,
            7 => ExitKind::MemoryOutOfBounds,
            8 => ExitKind::TableOutOfBounds,
            9 => ExitKind::IndirectCallNullPointer,
            10 => ExitKind::IndirectCallTypeMismatch,
            11 => ExitKind::IntegerOverflow,
            12 => ExitKind::IntegerDivisionByZero,
            13 => ExitKind::InvalidConversionToInteger,
            14 => ExitKind::CallBuiltinFunction,
            k => panic!("unknown exit code kind {k}"),
        }
    }

    /// The host-function index carried by `CallHostFunction`-kind exits.
    pub fn index(self) -> u32 {
        self.0 >> 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_call_round_trip() {
        let code = ExitCode::call_host_function(42);
        assert_eq!(code.kind(), ExitKind::CallHostFunction);
        assert_eq!(code.index(), 42);
        let code = ExitCode::call_host_module_function((1 << 24) - 1);
        assert_eq!(code.kind(), ExitKind::CallHostModuleFunction);
        assert_eq!(code.index(), (1 << 24) - 1);
    }
}
