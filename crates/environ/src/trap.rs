//! Runtime trap kinds.

use thiserror::Error;

use crate::{ExitCode, ExitKind};

/// A wasm runtime trap. The display strings are part of the embedder-visible
/// contract and must not change.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Error)]
pub enum Trap {
    #[error("wasm error: unreachable")]
    Unreachable,
    #[error("wasm error: out of bounds memory access")]
    MemoryOutOfBounds,
    #[error("wasm error: invalid table access")]
    TableOutOfBounds,
    #[error("wasm error: invalid table access")]
    IndirectCallNullPointer,
    #[error("wasm error: indirect call type mismatch")]
    IndirectCallTypeMismatch,
    #[error("wasm error: integer overflow")]
    IntegerOverflow,
    #[error("wasm error: integer divide by zero")]
    IntegerDivisionByZero,
    #[error("wasm error: invalid conversion to integer")]
    InvalidConversionToInteger,
    #[error("wasm error: stack overflow")]
    StackOverflow,
}

impl Trap {
    /// The trap corresponding to a trap-kind exit code, if any.
    pub fn from_exit_code(code: ExitCode) -> Option<Trap> {
        Some(match code.kind() {
            ExitKind::Unreachable => Trap::Unreachable,
            ExitKind::MemoryOutOfBounds => Trap::MemoryOutOfBounds,
            ExitKind::TableOutOfBounds => Trap::TableOutOfBounds,
            ExitKind::IndirectCallNullPointer => Trap::IndirectCallNullPointer,
            ExitKind::IndirectCallTypeMismatch => Trap::IndirectCallTypeMismatch,
            ExitKind::IntegerOverflow => Trap::IntegerOverflow,
            ExitKind::IntegerDivisionByZero => Trap::IntegerDivisionByZero,
            ExitKind::InvalidConversionToInteger => Trap::InvalidConversionToInteger,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_stable() {
        assert_eq!(
            Trap::IntegerDivisionByZero.to_string(),
            "wasm error: integer divide by zero"
        );
        assert_eq!(
            Trap::IndirectCallNullPointer.to_string(),
            "wasm error: invalid table access"
        );
        assert_eq!(Trap::StackOverflow.to_string(), "wasm error: stack overflow");
    }

    #[test]
    fn trap_exit_codes_map() {
        assert_eq!(
            Trap::from_exit_code(ExitCode::UNREACHABLE),
            Some(Trap::Unreachable)
        );
        assert_eq!(Trap::from_exit_code(ExitCode::OK), None);
        assert_eq!(
            Trap::from_exit_code(ExitCode::call_host_function(3)),
            None
        );
    }
}
