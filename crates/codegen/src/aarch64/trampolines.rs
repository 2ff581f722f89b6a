//! Engine trampolines: the generated code on both sides of every structured
//! exit.
//!
//! Everything here is straight-line code entered with the execution context
//! pinned in x0. An *exit* stores an exit code plus the guest sp/fp and a
//! continuation address into the execution context, then restores the host's
//! sp/fp and branches to the saved host return address; from the host's
//! point of view the original entry call simply returns. The host handles
//! the exit and re-enters through the resume stub, which records the new
//! host state and branches to the saved continuation.

use kestrel_ssa::Type;
use smallvec::SmallVec;

use kestrel_environ::{exec_ctx, CompileError, ExitCode, FuncType, ValType};

use crate::buffer::{CodeBuffer, LabelUse};
use crate::reg::{Reg, RegClass, Writable};

use super::abi::{ABIArg, ABISig};
use super::args::{AMode, OperandSize};
use super::inst::Inst;
use super::regs::*;

/// Host-call scratch slot reserved for the guest's link register across the
/// host round trip.
const LR_SLOT: u32 = exec_ctx::HOST_CALL_STACK_SLOTS - 1;

/// Marshallable value slots per signature; the rest of the scratch area is
/// ours for bookkeeping.
const MAX_SIG_SLOTS: usize = (exec_ctx::HOST_CALL_STACK_SLOTS - 8) as usize;

fn store_ctx(reg: Reg, offset: u32, sink: &mut CodeBuffer) {
    Inst::Store64 {
        rd: reg,
        mem: AMode::reg_offset(exec_ctx_reg(), i64::from(offset)),
    }
    .emit(sink);
}

fn load_ctx(reg: Writable<Reg>, offset: u32, sink: &mut CodeBuffer) {
    Inst::ULoad64 {
        rd: reg,
        mem: AMode::reg_offset(exec_ctx_reg(), i64::from(offset)),
    }
    .emit(sink);
}

/// Store the exit code, the guest continuation (a forward label) and guest
/// sp/fp, then return to the host.
fn emit_exit(code: ExitCode, cont: crate::buffer::Label, sink: &mut CodeBuffer) {
    use super::emit::{emit_load_callee_saved, emit_store_callee_saved, GUEST_SAVE_BASE, HOST_SAVE_BASE};
    let x16 = Writable::from_reg(spilltmp_reg());
    // The guest's callee-saved registers must survive the host round trip;
    // the host's were parked at entry (or at the last resume) and are
    // restored before returning into the host frame.
    emit_store_callee_saved(GUEST_SAVE_BASE, sink);
    emit_load_callee_saved(HOST_SAVE_BASE, sink);
    for i in Inst::load_constant(x16, u64::from(code.bits())) {
        i.emit(sink);
    }
    store_ctx(x16.to_reg(), exec_ctx::EXIT_CODE, sink);
    // Continuation.
    sink.use_label(cont, LabelUse::Adr21);
    sink.put4(super::emit::enc_adr(0, 16)); // adr x16, cont
    store_ctx(x16.to_reg(), exec_ctx::HOST_CALL_RETURN_ADDRESS, sink);
    // Guest stack state.
    Inst::Mov {
        size: OperandSize::Size64,
        rd: x16,
        rm: stack_reg(),
    }
    .emit(sink);
    store_ctx(x16.to_reg(), exec_ctx::STACK_POINTER_BEFORE_HOST_CALL, sink);
    store_ctx(fp_reg(), exec_ctx::FRAME_POINTER_BEFORE_HOST_CALL, sink);
    // Back to the host.
    load_ctx(x16, exec_ctx::ORIGINAL_STACK_POINTER, sink);
    Inst::Mov {
        size: OperandSize::Size64,
        rd: Writable::from_reg(stack_reg()),
        rm: x16.to_reg(),
    }
    .emit(sink);
    load_ctx(Writable::from_reg(fp_reg()), exec_ctx::ORIGINAL_FRAME_POINTER, sink);
    load_ctx(x16, exec_ctx::HOST_RETURN_ADDRESS, sink);
    sink.put4(0b1101011_0000_11111_000000_00000_00000 | (16 << 5)); // br x16
}

/// The host→guest resume stub:
/// `extern "C" fn(exec_ctx)`. Saves the current host frame (so the next exit
/// returns into *this* call), restores the guest sp/fp and jumps to the
/// recorded continuation.
pub fn compile_resume_stub() -> Vec<u8> {
    use super::emit::{emit_load_callee_saved, emit_store_callee_saved, GUEST_SAVE_BASE, HOST_SAVE_BASE};
    let mut sink = CodeBuffer::new();
    let x16 = Writable::from_reg(spilltmp_reg());
    Inst::Mov {
        size: OperandSize::Size64,
        rd: x16,
        rm: stack_reg(),
    }
    .emit(&mut sink);
    store_ctx(x16.to_reg(), exec_ctx::ORIGINAL_STACK_POINTER, &mut sink);
    store_ctx(fp_reg(), exec_ctx::ORIGINAL_FRAME_POINTER, &mut sink);
    store_ctx(link_reg(), exec_ctx::HOST_RETURN_ADDRESS, &mut sink);
    emit_store_callee_saved(HOST_SAVE_BASE, &mut sink);
    emit_load_callee_saved(GUEST_SAVE_BASE, &mut sink);
    load_ctx(x16, exec_ctx::STACK_POINTER_BEFORE_HOST_CALL, &mut sink);
    Inst::Mov {
        size: OperandSize::Size64,
        rd: Writable::from_reg(stack_reg()),
        rm: x16.to_reg(),
    }
    .emit(&mut sink);
    load_ctx(
        Writable::from_reg(fp_reg()),
        exec_ctx::FRAME_POINTER_BEFORE_HOST_CALL,
        &mut sink,
    );
    load_ctx(x16, exec_ctx::HOST_CALL_RETURN_ADDRESS, &mut sink);
    sink.put4(0b1101011_0000_11111_000000_00000_00000 | (16 << 5)); // br x16
    finish(sink)
}

/// The shared stack-grow call sequence, invoked from function prologues via
/// `blr` with every argument register still live. Saves the live register
/// file into the context save area, performs a GrowStack exit, and restores
/// everything after resume. x17 carries the caller's own return address (the
/// prologue parks it there) and is preserved like the rest.
pub fn compile_stack_grow_sequence() -> Vec<u8> {
    let mut sink = CodeBuffer::new();
    let saved: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 17];
    let base = i64::from(exec_ctx::SAVED_REGISTERS);
    for (i, &r) in saved.iter().enumerate() {
        Inst::Store64 {
            rd: xreg(r),
            mem: AMode::reg_offset(exec_ctx_reg(), base + 16 * i as i64),
        }
        .emit(&mut sink);
    }
    Inst::Store64 {
        rd: link_reg(),
        mem: AMode::reg_offset(exec_ctx_reg(), base + 16 * 8),
    }
    .emit(&mut sink);
    for v in 0..8u8 {
        Inst::FpuStore128 {
            rd: vreg(v),
            mem: AMode::reg_offset(exec_ctx_reg(), base + 16 * (9 + i64::from(v))),
        }
        .emit(&mut sink);
    }

    let cont = sink.new_label();
    emit_exit(ExitCode::GROW_STACK, cont, &mut sink);
    sink.bind_label(cont);

    for (i, &r) in saved.iter().enumerate() {
        Inst::ULoad64 {
            rd: writable_xreg(r),
            mem: AMode::reg_offset(exec_ctx_reg(), base + 16 * i as i64),
        }
        .emit(&mut sink);
    }
    Inst::ULoad64 {
        rd: writable_xreg(30),
        mem: AMode::reg_offset(exec_ctx_reg(), base + 16 * 8),
    }
    .emit(&mut sink);
    for v in 0..8u8 {
        Inst::FpuLoad128 {
            rd: writable_vreg(v),
            mem: AMode::reg_offset(exec_ctx_reg(), base + 16 * (9 + i64::from(v))),
        }
        .emit(&mut sink);
    }
    Inst::Ret.emit(&mut sink);
    finish(sink)
}

/// A fixed-shape builtin trampoline: marshal the integer/float arguments
/// into the host-call scratch area, exit with `code`, and on resume load the
/// results back into the result registers. Used for memory.grow, the
/// termination check, and the atomic wait/notify builtins.
pub fn compile_builtin_trampoline(code: ExitCode, params: &[Type], results: &[Type]) -> Vec<u8> {
    let mut sink = CodeBuffer::new();
    let sig = builtin_abi(params, results);

    store_ctx(module_ctx_reg(), exec_ctx::CALLER_MODULE_CONTEXT, &mut sink);
    store_ctx(
        link_reg(),
        exec_ctx::HOST_CALL_STACK + LR_SLOT * 8,
        &mut sink,
    );
    // All builtin arguments fit in registers.
    let mut slot = 0u32;
    for arg in sig.args.iter().skip(1) {
        let ABIArg::Reg(r, ty) = *arg else {
            unreachable!("builtin argument on the stack")
        };
        emit_scratch_store(r, ty, slot, &mut sink);
        slot += 1;
    }

    let cont = sink.new_label();
    emit_exit(code, cont, &mut sink);
    sink.bind_label(cont);

    let mut slot = 0u32;
    for ret in &sig.rets {
        let ABIArg::Reg(r, ty) = *ret else {
            unreachable!("builtin result on the stack")
        };
        emit_scratch_load(Writable::from_reg(r), ty, slot, &mut sink);
        slot += 1;
    }
    load_ctx(
        writable_xreg(30),
        exec_ctx::HOST_CALL_STACK + LR_SLOT * 8,
        &mut sink,
    );
    Inst::Ret.emit(&mut sink);
    finish(sink)
}

/// One host-call trampoline for host function `index` with wasm type `ty`.
/// Entered exactly like a wasm function (x0 exec ctx, x1 the host module's
/// context, arguments in their ABI locations); marshals every argument into
/// the host-call scratch area and exits so the dispatch loop can run the
/// host closure.
pub fn compile_host_call_trampoline(
    index: u32,
    ty: &FuncType,
    module_function: bool,
) -> Result<Vec<u8>, CompileError> {
    let slots = flat_slots(ty);
    if slots.param_slots > MAX_SIG_SLOTS || slots.result_slots > MAX_SIG_SLOTS {
        return Err(CompileError::SignatureTooLarge(
            slots.param_slots.max(slots.result_slots),
        ));
    }
    if index >= 1 << 24 {
        return Err(CompileError::HostFunctionIndexOutOfRange(index));
    }
    let code = if module_function {
        ExitCode::call_host_module_function(index)
    } else {
        ExitCode::call_host_function(index)
    };

    let mut sink = CodeBuffer::new();
    let sig = ABISig::compute(&crate::wasm_abi_signature(ty));
    let x16 = Writable::from_reg(spilltmp_reg());

    store_ctx(module_ctx_reg(), exec_ctx::CALLER_MODULE_CONTEXT, &mut sink);
    store_ctx(
        link_reg(),
        exec_ctx::HOST_CALL_STACK + LR_SLOT * 8,
        &mut sink,
    );

    // Arguments: registers straight into the scratch area, stack arguments
    // through x16. The incoming stack area begins at our entry sp.
    let mut slot = 0u32;
    for (i, arg) in sig.args.iter().enumerate().skip(1) {
        let vty = valtype(ty.params[i - 1]);
        match *arg {
            ABIArg::Reg(r, _) => emit_scratch_store(r, vty, slot, &mut sink),
            ABIArg::Stack(off, _) => {
                match vty {
                    Type::V128 => {
                        Inst::FpuLoad128 {
                            rd: Writable::from_reg(vreg(31)),
                            mem: AMode::SPOffset { off: i64::from(off) },
                        }
                        .emit(&mut sink);
                        emit_scratch_store(vreg(31), vty, slot, &mut sink);
                    }
                    _ => {
                        Inst::ULoad64 {
                            rd: x16,
                            mem: AMode::SPOffset { off: i64::from(off) },
                        }
                        .emit(&mut sink);
                        emit_scratch_store(x16.to_reg(), Type::I64, slot, &mut sink);
                    }
                }
            }
        }
        slot += slot_count(vty);
    }

    let cont = sink.new_label();
    emit_exit(code, cont, &mut sink);
    sink.bind_label(cont);

    // Results: from the scratch area back into ABI locations.
    let mut slot = 0u32;
    for (i, ret) in sig.rets.iter().enumerate() {
        let vty = valtype(ty.results[i]);
        match *ret {
            ABIArg::Reg(r, _) => emit_scratch_load(Writable::from_reg(r), vty, slot, &mut sink),
            ABIArg::Stack(off, _) => match vty {
                Type::V128 => {
                    emit_scratch_load(Writable::from_reg(vreg(31)), vty, slot, &mut sink);
                    Inst::FpuStore128 {
                        rd: vreg(31),
                        mem: AMode::SPOffset { off: i64::from(off) },
                    }
                    .emit(&mut sink);
                }
                _ => {
                    emit_scratch_load(x16, Type::I64, slot, &mut sink);
                    Inst::Store64 {
                        rd: x16.to_reg(),
                        mem: AMode::SPOffset { off: i64::from(off) },
                    }
                    .emit(&mut sink);
                }
            },
        }
        slot += slot_count(vty);
    }
    load_ctx(
        writable_xreg(30),
        exec_ctx::HOST_CALL_STACK + LR_SLOT * 8,
        &mut sink,
    );
    Inst::Ret.emit(&mut sink);
    Ok(finish(sink))
}

fn emit_scratch_store(r: Reg, ty: Type, slot: u32, sink: &mut CodeBuffer) {
    let off = i64::from(exec_ctx::HOST_CALL_STACK + slot * 8);
    let mem = AMode::reg_offset(exec_ctx_reg(), off);
    let inst = match (r.class(), ty) {
        (RegClass::Int, _) => Inst::Store64 { rd: r, mem },
        (RegClass::Float, Type::F32) => Inst::FpuStore32 { rd: r, mem },
        (RegClass::Float, Type::V128) => Inst::FpuStore128 { rd: r, mem },
        (RegClass::Float, _) => Inst::FpuStore64 { rd: r, mem },
    };
    inst.emit(sink);
}

fn emit_scratch_load(r: Writable<Reg>, ty: Type, slot: u32, sink: &mut CodeBuffer) {
    let off = i64::from(exec_ctx::HOST_CALL_STACK + slot * 8);
    let mem = AMode::reg_offset(exec_ctx_reg(), off);
    let inst = match (r.to_reg().class(), ty) {
        (RegClass::Int, _) => Inst::ULoad64 { rd: r, mem },
        (RegClass::Float, Type::F32) => Inst::FpuLoad32 { rd: r, mem },
        (RegClass::Float, Type::V128) => Inst::FpuLoad128 { rd: r, mem },
        (RegClass::Float, _) => Inst::FpuLoad64 { rd: r, mem },
    };
    inst.emit(sink);
}

fn builtin_abi(params: &[Type], results: &[Type]) -> ABISig {
    let mut sig_params = vec![Type::I64];
    sig_params.extend_from_slice(params);
    ABISig::compute(&kestrel_ssa::Signature::new(sig_params, results.to_vec()))
}

struct FlatSlots {
    param_slots: usize,
    result_slots: usize,
}

fn flat_slots(ty: &FuncType) -> FlatSlots {
    FlatSlots {
        param_slots: ty.params.iter().map(|t| t.slot_count()).sum(),
        result_slots: ty.results.iter().map(|t| t.slot_count()).sum(),
    }
}

fn slot_count(ty: Type) -> u32 {
    match ty {
        Type::V128 => 2,
        _ => 1,
    }
}

fn valtype(ty: ValType) -> Type {
    match ty {
        ValType::I32 => Type::I32,
        ValType::I64 => Type::I64,
        ValType::F32 => Type::F32,
        ValType::F64 => Type::F64,
        ValType::V128 => Type::V128,
    }
}

fn finish(sink: CodeBuffer) -> Vec<u8> {
    let (bytes, relocs) = sink
        .finalize()
        .expect("trampoline labels are all bound");
    debug_assert!(relocs.is_empty());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_stub_is_straight_line() {
        let bytes = compile_resume_stub();
        assert!(!bytes.is_empty());
        assert_eq!(bytes.len() % 4, 0);
        // Ends in `br x16`.
        let last = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        assert_eq!(last, 0xD61F0200);
    }

    #[test]
    fn stack_grow_sequence_round_trips_registers() {
        let bytes = compile_stack_grow_sequence();
        // Ends in ret after restoring.
        let last = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        assert_eq!(last, 0xD65F03C0);
    }

    #[test]
    fn oversized_host_signature_is_rejected() {
        let ty = FuncType::new(vec![ValType::I64; 200], vec![]);
        assert!(matches!(
            compile_host_call_trampoline(0, &ty, false),
            Err(CompileError::SignatureTooLarge(_))
        ));
    }

    #[test]
    fn host_index_overflow_is_rejected() {
        let ty = FuncType::new(vec![], vec![]);
        assert!(matches!(
            compile_host_call_trampoline(1 << 24, &ty, false),
            Err(CompileError::HostFunctionIndexOutOfRange(_))
        ));
    }
}
