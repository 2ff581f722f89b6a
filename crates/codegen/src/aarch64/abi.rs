//! Calling convention, frame layout and function assembly.
//!
//! Internal convention: x0 is the pinned execution context and is never an
//! argument; x1 carries the callee's module context; wasm values travel in
//! x2..x7 and v0..v7, both for parameters and for results; the overflow goes
//! on the stack at the caller's stack pointer, results sharing the same area
//! as arguments. Frames look like:
//!
//! ```text
//! | incoming stack args / stack results |  <- fp + 16
//! | saved fp | saved lr                 |  <- fp
//! | callee-saved registers              |
//! | spill slots                         |
//! | outgoing args of calls              |  <- sp
//! ```

use kestrel_ssa::Type;
use smallvec::SmallVec;

use kestrel_environ::exec_ctx;

use crate::buffer::{CodeBuffer, Label, LabelUse};
use crate::reg::{Reg, RegClass, Writable};
use crate::regalloc::RegAllocOutput;
use crate::vcode::VCode;

use super::args::{AMode, Cond, Imm12, OperandSize};
use super::inst::{ALUOp, Inst};
use super::regs::*;

/// Where one ABI value lives at a call boundary.
#[derive(Copy, Clone, Debug)]
pub enum ABIArg {
    Reg(Reg, Type),
    /// Byte offset into the stack-argument area.
    Stack(u32, Type),
}

/// A signature resolved to concrete locations.
pub struct ABISig {
    /// Locations of the SSA-level parameters, module context first.
    pub args: Vec<ABIArg>,
    pub rets: Vec<ABIArg>,
    /// Size of the shared stack argument/result area, 16-byte aligned.
    pub stack_area: u32,
}

impl ABISig {
    pub fn compute(sig: &kestrel_ssa::Signature) -> ABISig {
        let args = Self::assign(&sig.params, true);
        let rets = Self::assign(&sig.returns, false);
        let stack = |v: &[ABIArg]| {
            v.iter()
                .map(|a| match a {
                    ABIArg::Stack(off, ty) => off + ty_bytes(*ty),
                    _ => 0,
                })
                .max()
                .unwrap_or(0)
        };
        let stack_area = (stack(&args).max(stack(&rets)) + 15) & !15;
        ABISig {
            args,
            rets,
            stack_area,
        }
    }

    fn assign(types: &[Type], with_ctx: bool) -> Vec<ABIArg> {
        let mut out = Vec::with_capacity(types.len());
        let mut next_int = 0;
        let mut next_float = 0;
        let mut stack = 0u32;
        for (i, &ty) in types.iter().enumerate() {
            if with_ctx && i == 0 {
                debug_assert_eq!(ty, Type::I64);
                out.push(ABIArg::Reg(module_ctx_reg(), ty));
                continue;
            }
            let loc = if ty.is_int() {
                if next_int < INT_ARG_REGS.len() {
                    let r = xreg(INT_ARG_REGS[next_int]);
                    next_int += 1;
                    ABIArg::Reg(r, ty)
                } else {
                    let bytes = ty_bytes(ty);
                    stack = align_to(stack, bytes);
                    let off = stack;
                    stack += bytes;
                    ABIArg::Stack(off, ty)
                }
            } else if next_float < FLOAT_ARG_REGS.len() {
                let r = vreg(FLOAT_ARG_REGS[next_float]);
                next_float += 1;
                ABIArg::Reg(r, ty)
            } else {
                let bytes = ty_bytes(ty);
                stack = align_to(stack, bytes);
                let off = stack;
                stack += bytes;
                ABIArg::Stack(off, ty)
            };
            out.push(loc);
        }
        out
    }
}

pub fn ty_bytes(ty: Type) -> u32 {
    match ty {
        Type::V128 => 16,
        _ => 8,
    }
}

fn align_to(v: u32, align: u32) -> u32 {
    (v + align - 1) & !(align - 1)
}

/// The final frame sizes of one function.
#[derive(Copy, Clone, Debug)]
pub struct FrameLayout {
    pub callee_saved: [u8; 10],
    pub num_callee_saved: usize,
    pub cs_size: u32,
    pub spill_size: u32,
    pub out_args_size: u32,
}

impl FrameLayout {
    pub fn new(ra: &RegAllocOutput, out_args_size: u32) -> FrameLayout {
        let mut callee_saved = [0u8; 10];
        for (i, &r) in ra.clobbered_callee_saved.iter().enumerate() {
            callee_saved[i] = r;
        }
        FrameLayout {
            callee_saved,
            num_callee_saved: ra.clobbered_callee_saved.len(),
            cs_size: align_to(ra.clobbered_callee_saved.len() as u32 * 8, 16),
            spill_size: ra.spill_size,
            out_args_size: align_to(out_args_size, 16),
        }
    }

    /// Bytes subtracted from sp after the frame record is pushed.
    pub fn frame_size(&self) -> u32 {
        self.cs_size + self.spill_size + self.out_args_size
    }

    /// Total guest-stack bytes one activation needs, for the overflow check.
    pub fn total_size(&self) -> u32 {
        self.frame_size() + 16
    }
}

/// Rewrite spill-slot pseudo addresses into frame-pointer offsets.
pub fn apply_frame(vcode: &mut VCode, frame: &FrameLayout) {
    let spill_base = -(i64::from(frame.cs_size) + i64::from(frame.spill_size));
    for block in vcode.blocks.iter_mut() {
        for inst in block.insts.iter_mut() {
            inst.map_amodes(&mut |mem| {
                if let AMode::SpillOffset { off } = *mem {
                    *mem = AMode::FPOffset {
                        off: spill_base + i64::from(off),
                    };
                }
            });
        }
    }
}

/// Emit the prologue: guest-stack overflow check, frame record, callee-saved
/// saves, frame allocation.
pub fn emit_prologue(frame: &FrameLayout, sink: &mut CodeBuffer) {
    let x0 = exec_ctx_reg();
    let x16 = Writable::from_reg(spilltmp_reg());
    let x17 = Writable::from_reg(tmp2_reg());
    let total = u64::from(frame.total_size());

    // Stack limit check: sp - total < stack_bottom ? grow : continue.
    Inst::ULoad64 {
        rd: x16,
        mem: AMode::reg_offset(x0, i64::from(exec_ctx::STACK_BOTTOM)),
    }
    .emit(sink);
    Inst::Mov {
        size: OperandSize::Size64,
        rd: x17,
        rm: stack_reg(),
    }
    .emit(sink);
    if let Some(imm12) = Imm12::maybe_from_u64(total) {
        Inst::AluRRImm12 {
            op: ALUOp::Sub,
            size: OperandSize::Size64,
            rd: x17,
            rn: x17.to_reg(),
            imm12,
        }
        .emit(sink);
    } else {
        // A frame this large fails the check against any sane stack anyway,
        // but stay correct.
        for i in Inst::load_constant(x16, total) {
            i.emit(sink);
        }
        Inst::AluRRR {
            op: ALUOp::Sub,
            size: OperandSize::Size64,
            rd: x17,
            rn: x17.to_reg(),
            rm: x16.to_reg(),
        }
        .emit(sink);
        Inst::ULoad64 {
            rd: x16,
            mem: AMode::reg_offset(x0, i64::from(exec_ctx::STACK_BOTTOM)),
        }
        .emit(sink);
    }
    Inst::AluRRR {
        op: ALUOp::SubS,
        size: OperandSize::Size64,
        rd: Writable::from_reg(zero_reg()),
        rn: x17.to_reg(),
        rm: x16.to_reg(),
    }
    .emit(sink);
    let ok = sink.new_label();
    sink.use_label(ok, LabelUse::Branch19);
    sink.put4(0x54000000 | Cond::Hs.bits());
    // Grow: record the required size and call the shared sequence. The
    // caller's return address rides in x17 across the round trip; the
    // sequence preserves it in the register save area.
    Inst::mov64(x17, link_reg()).emit(sink);
    for i in Inst::load_constant(x16, total + 64) {
        i.emit(sink);
    }
    Inst::Store64 {
        rd: x16.to_reg(),
        mem: AMode::reg_offset(x0, i64::from(exec_ctx::STACK_GROW_REQUIRED_SIZE)),
    }
    .emit(sink);
    Inst::ULoad64 {
        rd: x16,
        mem: AMode::reg_offset(x0, i64::from(exec_ctx::STACK_GROW_SEQUENCE)),
    }
    .emit(sink);
    Inst::CallInd {
        rn: x16.to_reg(),
        uses: SmallVec::new(),
        defs: SmallVec::new(),
    }
    .emit(sink);
    Inst::Mov {
        size: OperandSize::Size64,
        rd: Writable::from_reg(link_reg()),
        rm: x17.to_reg(),
    }
    .emit(sink);
    sink.bind_label(ok);

    // Frame record.
    Inst::PushPair {
        rt: fp_reg(),
        rt2: link_reg(),
    }
    .emit(sink);
    Inst::Mov {
        size: OperandSize::Size64,
        rd: Writable::from_reg(fp_reg()),
        rm: stack_reg(),
    }
    .emit(sink);
    let frame_size = u64::from(frame.frame_size());
    if frame_size > 0 {
        emit_sp_adjust(ALUOp::Sub, frame_size, sink);
    }
    for i in 0..frame.num_callee_saved {
        let r = frame.callee_saved[i];
        Inst::Store64 {
            rd: xreg(r),
            mem: AMode::FPOffset {
                off: -8 * (i as i64 + 1),
            },
        }
        .emit(sink);
    }
}

/// Emit the epilogue and return.
pub fn emit_epilogue(frame: &FrameLayout, sink: &mut CodeBuffer) {
    for i in 0..frame.num_callee_saved {
        let r = frame.callee_saved[i];
        Inst::ULoad64 {
            rd: writable_xreg(r),
            mem: AMode::FPOffset {
                off: -8 * (i as i64 + 1),
            },
        }
        .emit(sink);
    }
    Inst::Mov {
        size: OperandSize::Size64,
        rd: Writable::from_reg(stack_reg()),
        rm: fp_reg(),
    }
    .emit(sink);
    Inst::PopPair {
        rt: Writable::from_reg(fp_reg()),
        rt2: Writable::from_reg(link_reg()),
    }
    .emit(sink);
    Inst::Ret.emit(sink);
}

fn emit_sp_adjust(op: ALUOp, bytes: u64, sink: &mut CodeBuffer) {
    if let Some(imm12) = Imm12::maybe_from_u64(bytes) {
        Inst::AluRRImm12 {
            op,
            size: OperandSize::Size64,
            rd: Writable::from_reg(stack_reg()),
            rn: stack_reg(),
            imm12,
        }
        .emit(sink);
    } else {
        for i in Inst::load_constant(Writable::from_reg(spilltmp_reg()), bytes) {
            i.emit(sink);
        }
        // sub/add sp, sp, x16 via the extended form (sp-safe).
        Inst::AluRRRExtend {
            op,
            size: OperandSize::Size64,
            rd: Writable::from_reg(stack_reg()),
            rn: stack_reg(),
            rm: spilltmp_reg(),
            extend: super::args::ExtendOp::Lsl,
        }
        .emit(sink);
    }
}

/// Emit the host-entry preamble. Called as
/// `extern "C" fn(exec_ctx, module_ctx, param_result_ptr, stack_top)`:
/// saves the host's sp/fp/lr into the execution context, switches onto the
/// guest stack, marshals parameters from the flat u64 buffer into their ABI
/// locations, calls the body, writes results back, and returns to the host.
pub fn emit_preamble(sig: &ABISig, value_slots: &[(Type, u32)], body: Label, sink: &mut CodeBuffer) {
    let x0 = exec_ctx_reg();
    let x2 = xreg(2);
    let x16 = Writable::from_reg(spilltmp_reg());
    let x17 = Writable::from_reg(tmp2_reg());

    // Save host state.
    Inst::Mov {
        size: OperandSize::Size64,
        rd: x16,
        rm: stack_reg(),
    }
    .emit(sink);
    Inst::Store64 {
        rd: x16.to_reg(),
        mem: AMode::reg_offset(x0, i64::from(exec_ctx::ORIGINAL_STACK_POINTER)),
    }
    .emit(sink);
    Inst::Store64 {
        rd: fp_reg(),
        mem: AMode::reg_offset(x0, i64::from(exec_ctx::ORIGINAL_FRAME_POINTER)),
    }
    .emit(sink);
    Inst::Store64 {
        rd: link_reg(),
        mem: AMode::reg_offset(x0, i64::from(exec_ctx::HOST_RETURN_ADDRESS)),
    }
    .emit(sink);
    Inst::Store64 {
        rd: x2,
        mem: AMode::reg_offset(x0, i64::from(exec_ctx::PARAM_RESULT_PTR)),
    }
    .emit(sink);
    // The body's prologue/epilogue pairs preserve the callee-saved
    // registers on the normal return path, but trap exits bypass every
    // epilogue, so the host's registers are parked here and restored by the
    // exit sequences.
    super::emit::emit_store_callee_saved(super::emit::HOST_SAVE_BASE, sink);
    // Switch to the guest stack and reserve the outgoing argument area.
    Inst::Mov {
        size: OperandSize::Size64,
        rd: Writable::from_reg(stack_reg()),
        rm: xreg(3),
    }
    .emit(sink);
    if sig.stack_area > 0 {
        emit_sp_adjust(ALUOp::Sub, u64::from(sig.stack_area), sink);
    }

    // Marshal parameters. `value_slots` pairs each SSA parameter (after the
    // module context) with its slot offset in the flat buffer; x2 still
    // holds the buffer while we read arguments that do not overwrite it yet,
    // so go through x17 for the buffer pointer instead.
    Inst::mov64(x17, x2).emit(sink);
    let buf = x17.to_reg();
    for (i, arg) in sig.args.iter().enumerate().skip(1) {
        let (ty, slot) = value_slots[i - 1];
        let off = i64::from(slot) * 8;
        match *arg {
            ABIArg::Reg(r, _) => emit_buf_load(r, ty, buf, off, sink),
            ABIArg::Stack(stack_off, _) => {
                emit_buf_load(x16.to_reg(), ty, buf, off, sink);
                let st = match ty {
                    Type::V128 => Inst::FpuStore128 {
                        rd: x16.to_reg(),
                        mem: AMode::SPOffset {
                            off: i64::from(stack_off),
                        },
                    },
                    _ => Inst::Store64 {
                        rd: x16.to_reg(),
                        mem: AMode::SPOffset {
                            off: i64::from(stack_off),
                        },
                    },
                };
                st.emit(sink);
            }
        }
    }

    // Call the body.
    sink.use_label(body, LabelUse::Branch26);
    sink.put4(0b100101 << 26);

    // Write results back to the buffer.
    Inst::ULoad64 {
        rd: x17,
        mem: AMode::reg_offset(x0, i64::from(exec_ctx::PARAM_RESULT_PTR)),
    }
    .emit(sink);
    let mut slot = 0u32;
    for ret in &sig.rets {
        let ty = match *ret {
            ABIArg::Reg(_, ty) | ABIArg::Stack(_, ty) => ty,
        };
        let off = i64::from(slot) * 8;
        match *ret {
            ABIArg::Reg(r, _) => emit_buf_store(r, ty, x17.to_reg(), off, sink),
            ABIArg::Stack(stack_off, _) => {
                let ld = match ty {
                    Type::V128 => Inst::FpuLoad128 {
                        rd: Writable::from_reg(vreg(31)),
                        mem: AMode::SPOffset {
                            off: i64::from(stack_off),
                        },
                    },
                    _ => Inst::ULoad64 {
                        rd: x16,
                        mem: AMode::SPOffset {
                            off: i64::from(stack_off),
                        },
                    },
                };
                ld.emit(sink);
                match ty {
                    Type::V128 => emit_buf_store(vreg(31), ty, x17.to_reg(), off, sink),
                    _ => emit_buf_store(x16.to_reg(), Type::I64, x17.to_reg(), off, sink),
                }
            }
        }
        slot += if ty == Type::V128 { 2 } else { 1 };
    }

    // Restore host state and return.
    Inst::ULoad64 {
        rd: x16,
        mem: AMode::reg_offset(x0, i64::from(exec_ctx::ORIGINAL_STACK_POINTER)),
    }
    .emit(sink);
    Inst::Mov {
        size: OperandSize::Size64,
        rd: Writable::from_reg(stack_reg()),
        rm: x16.to_reg(),
    }
    .emit(sink);
    Inst::ULoad64 {
        rd: Writable::from_reg(fp_reg()),
        mem: AMode::reg_offset(x0, i64::from(exec_ctx::ORIGINAL_FRAME_POINTER)),
    }
    .emit(sink);
    Inst::ULoad64 {
        rd: x16,
        mem: AMode::reg_offset(x0, i64::from(exec_ctx::HOST_RETURN_ADDRESS)),
    }
    .emit(sink);
    sink.put4(0b1101011_0000_11111_000000_00000_00000 | (16 << 5)); // br x16
}

/// Load one value from the flat u64 buffer into a register.
fn emit_buf_load(r: Reg, ty: Type, buf: Reg, off: i64, sink: &mut CodeBuffer) {
    let inst = match (r.class(), ty) {
        (RegClass::Int, _) => Inst::ULoad64 {
            rd: Writable::from_reg(r),
            mem: AMode::RegOffset { rn: buf, off },
        },
        (RegClass::Float, Type::F32) => Inst::FpuLoad32 {
            rd: Writable::from_reg(r),
            mem: AMode::RegOffset { rn: buf, off },
        },
        (RegClass::Float, Type::V128) => Inst::FpuLoad128 {
            rd: Writable::from_reg(r),
            mem: AMode::RegOffset { rn: buf, off },
        },
        (RegClass::Float, _) => Inst::FpuLoad64 {
            rd: Writable::from_reg(r),
            mem: AMode::RegOffset { rn: buf, off },
        },
    };
    inst.emit(sink);
}

/// Store one value from a register into the flat u64 buffer.
fn emit_buf_store(r: Reg, ty: Type, buf: Reg, off: i64, sink: &mut CodeBuffer) {
    let inst = match (r.class(), ty) {
        (RegClass::Int, _) => Inst::Store64 {
            rd: r,
            mem: AMode::RegOffset { rn: buf, off },
        },
        (RegClass::Float, Type::F32) => Inst::FpuStore32 {
            rd: r,
            mem: AMode::RegOffset { rn: buf, off },
        },
        (RegClass::Float, Type::V128) => Inst::FpuStore128 {
            rd: r,
            mem: AMode::RegOffset { rn: buf, off },
        },
        (RegClass::Float, _) => Inst::FpuStore64 {
            rd: r,
            mem: AMode::RegOffset { rn: buf, off },
        },
    };
    inst.emit(sink);
}

/// Emit all blocks of a lowered function, expanding `Ret` into the epilogue
/// and eliding jumps to the fallthrough block.
pub fn emit_body(vcode: &VCode, frame: &FrameLayout, sink: &mut CodeBuffer) {
    for (bi, block) in vcode.blocks.iter().enumerate() {
        sink.bind_label(block.label);
        if bi == 0 {
            emit_prologue(frame, sink);
        }
        let next_label = vcode.blocks.get(bi + 1).map(|b| b.label);
        for (ii, inst) in block.insts.iter().enumerate() {
            let last = ii == block.insts.len() - 1;
            match inst {
                Inst::Ret => emit_epilogue(frame, sink),
                Inst::Jump { dest } if last && Some(*dest) == next_label => {}
                _ => inst.emit(sink),
            }
        }
    }
}
