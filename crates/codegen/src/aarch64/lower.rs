//! Instruction selection: SSA to virtual-register machine code.
//!
//! Lowering walks the layout order once. Block arguments become parallel
//! moves into the target block's parameter registers, emitted before the
//! branch; integer compares feeding a single branch fuse into `cmp` +
//! `b.cond`. All i32 values keep their upper 32 bits zero, which the
//! selection below relies on for addressing, conditional branches and
//! 64-bit selects.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use kestrel_environ::{CompileError, ExitCode};
use kestrel_ssa::{
    self as ssa, AtomicRmwOp, InstData, Opcode, TrapCode, Type, ValueDef, VecLanes,
};

use crate::buffer::{CodeBuffer, Label};
use crate::reg::{Reg, RegClass, Writable};
use crate::vcode::{VCode, VCodeBlock};

use super::abi::{ABIArg, ABISig};
use super::args::{AMode, Cond, Imm12, ImmLogic, OperandSize};
use super::inst::*;
use super::regs::*;

pub(crate) fn lower_function(
    func: &ssa::Function,
    buffer: &mut CodeBuffer,
) -> Result<VCode, CompileError> {
    let mut lowerer = Lowerer::new(func, buffer);
    lowerer.run()?;
    Ok(lowerer.vcode)
}

struct Lowerer<'a> {
    func: &'a ssa::Function,
    buffer: &'a mut CodeBuffer,
    vcode: VCode,
    value_regs: FxHashMap<ssa::Value, Reg>,
    use_counts: FxHashMap<ssa::Value, u32>,
    fused: FxHashSet<ssa::Inst>,
    block_index: FxHashMap<ssa::Block, usize>,
    block_labels: Vec<Label>,
    cur: Vec<Inst>,
}

impl<'a> Lowerer<'a> {
    fn new(func: &'a ssa::Function, buffer: &'a mut CodeBuffer) -> Self {
        Self {
            func,
            buffer,
            vcode: VCode::new(),
            value_regs: FxHashMap::default(),
            use_counts: FxHashMap::default(),
            fused: FxHashSet::default(),
            block_index: FxHashMap::default(),
            block_labels: Vec::new(),
            cur: Vec::new(),
        }
    }

    fn run(&mut self) -> Result<(), CompileError> {
        let layout: Vec<ssa::Block> = self.func.layout_order().to_vec();
        for (i, &b) in layout.iter().enumerate() {
            self.block_index.insert(b, i);
            let label = self.buffer.new_label();
            self.block_labels.push(label);
        }

        // Use counts drive compare/branch fusion.
        for &b in &layout {
            for &inst in self.func.block_insts(b) {
                for v in self.func.inst_args(inst) {
                    *self.use_counts.entry(v).or_insert(0) += 1;
                }
            }
        }
        // Mark compares consumed by exactly one branch in the same block.
        for &b in &layout {
            for &inst in self.func.block_insts(b) {
                let arg = match self.func.inst_data(inst) {
                    InstData::Brz { arg, .. } | InstData::Brnz { arg, .. } => *arg,
                    _ => continue,
                };
                if self.use_counts.get(&arg) != Some(&1) {
                    continue;
                }
                if let ValueDef::Result(def, 0) = self.func.value_def(arg) {
                    let same_block = self.func.block_insts(b).contains(&def);
                    if same_block
                        && matches!(
                            self.func.inst_data(def),
                            InstData::IntCompare { .. } | InstData::FloatCompare { .. }
                        )
                    {
                        self.fused.insert(def);
                    }
                }
            }
        }

        for (i, &b) in layout.iter().enumerate() {
            self.cur = Vec::new();
            if i == 0 {
                self.lower_entry_moves(b);
            }
            for &inst in self.func.block_insts(b) {
                if self.fused.contains(&inst) {
                    continue;
                }
                self.lower_inst(inst)?;
            }
            let mut succs = Vec::new();
            for &inst in self.func.block_insts(b) {
                for t in self.func.branch_targets(inst) {
                    let ti = self.block_index[&t];
                    if !succs.contains(&ti) {
                        succs.push(ti);
                    }
                }
            }
            let block = VCodeBlock {
                label: self.block_labels[i],
                insts: std::mem::take(&mut self.cur),
                succs,
            };
            self.vcode.blocks.push(block);
        }
        Ok(())
    }

    // ---- registers ----

    fn value_reg(&mut self, v: ssa::Value) -> Reg {
        if let Some(&r) = self.value_regs.get(&v) {
            return r;
        }
        let ty = self.func.value_type(v);
        let r = self.fresh(ty);
        self.value_regs.insert(v, r);
        r
    }

    fn fresh(&mut self, ty: Type) -> Reg {
        let (class, bytes) = match ty {
            Type::I32 | Type::I64 => (RegClass::Int, 8u8),
            Type::F32 | Type::F64 => (RegClass::Float, 8),
            Type::V128 => (RegClass::Float, 16),
        };
        let ci = VCode::class_index(class);
        let idx = self.vcode.num_vregs[ci];
        self.vcode.num_vregs[ci] += 1;
        self.vcode.vreg_bytes[ci].push(bytes);
        Reg::virt(class, idx)
    }

    fn result_reg(&mut self, inst: ssa::Inst) -> Writable<Reg> {
        let v = self.func.first_result(inst);
        Writable::from_reg(self.value_reg(v))
    }

    fn emit(&mut self, inst: Inst) {
        self.cur.push(inst);
    }

    fn emit_all(&mut self, insts: SmallVec<[Inst; 4]>) {
        self.cur.extend(insts);
    }

    fn label_of(&self, b: ssa::Block) -> Label {
        self.block_labels[self.block_index[&b]]
    }

    // ---- entry ----

    fn lower_entry_moves(&mut self, entry: ssa::Block) {
        let abi = ABISig::compute(&self.func.signature);
        let params: Vec<ssa::Value> = self.func.block_params(entry).to_vec();
        for (i, &p) in params.iter().enumerate() {
            let dst = Writable::from_reg(self.value_reg(p));
            let ty = self.func.value_type(p);
            match abi.args[i] {
                ABIArg::Reg(r, _) => self.emit_move(dst, r, ty),
                ABIArg::Stack(off, _) => {
                    let mem = AMode::FPOffset {
                        off: 16 + i64::from(off),
                    };
                    let inst = match ty {
                        Type::V128 => Inst::FpuLoad128 { rd: dst, mem },
                        Type::F32 | Type::F64 => Inst::FpuLoad64 { rd: dst, mem },
                        _ => Inst::ULoad64 { rd: dst, mem },
                    };
                    self.emit(inst);
                }
            }
        }
    }

    fn emit_move(&mut self, dst: Writable<Reg>, src: Reg, ty: Type) {
        if dst.to_reg() == src {
            return;
        }
        let inst = match ty {
            Type::I32 | Type::I64 => Inst::mov64(dst, src),
            Type::F32 | Type::F64 => Inst::FpuMove64 { rd: dst, rn: src },
            Type::V128 => Inst::FpuMove128 { rd: dst, rn: src },
        };
        self.emit(inst);
    }

    // ---- branch argument moves ----

    fn emit_branch_moves(&mut self, inst: ssa::Inst, target: ssa::Block) {
        let args: Vec<ssa::Value> = self.func.branch_args(inst).to_vec();
        if args.is_empty() {
            return;
        }
        let params: Vec<ssa::Value> = self.func.block_params(target).to_vec();
        debug_assert_eq!(args.len(), params.len());
        let mut moves: Vec<(Reg, Reg, Type)> = Vec::new();
        for (&p, &a) in params.iter().zip(&args) {
            let ty = self.func.value_type(p);
            let dst = self.value_reg(p);
            let src = self.value_reg(a);
            if dst != src {
                moves.push((dst, src, ty));
            }
        }
        self.emit_parallel_moves(moves);
    }

    /// Sequentialize a parallel move set, breaking cycles through a fresh
    /// temporary.
    fn emit_parallel_moves(&mut self, mut pending: Vec<(Reg, Reg, Type)>) {
        while !pending.is_empty() {
            if let Some(i) = pending
                .iter()
                .position(|&(dst, _, _)| !pending.iter().any(|&(_, src, _)| src == dst))
            {
                let (dst, src, ty) = pending.remove(i);
                self.emit_move(Writable::from_reg(dst), src, ty);
            } else {
                // Every destination is also a pending source: a cycle. Park
                // one destination's current value in a temporary.
                let (dst, _, ty) = pending[0];
                let tmp = self.fresh(ty);
                self.emit_move(Writable::from_reg(tmp), dst, ty);
                for m in pending.iter_mut() {
                    if m.1 == dst {
                        m.1 = tmp;
                    }
                }
            }
        }
    }

    // ---- instruction lowering ----

    fn lower_inst(&mut self, inst: ssa::Inst) -> Result<(), CompileError> {
        match self.func.inst_data(inst).clone() {
            InstData::Nop => {}
            InstData::GetExecCtx => {
                let rd = self.result_reg(inst);
                self.emit(Inst::mov64(rd, exec_ctx_reg()));
            }
            InstData::Iconst { imm, .. } => {
                let rd = self.result_reg(inst);
                self.emit_all(Inst::load_constant(rd, imm));
            }
            InstData::F32const { bits } => {
                let rd = self.result_reg(inst);
                let tmp = Writable::from_reg(self.fresh(Type::I64));
                self.emit_all(Inst::load_constant(tmp, u64::from(bits)));
                self.emit(Inst::MovToFpu {
                    size32: true,
                    rd,
                    rn: tmp.to_reg(),
                });
            }
            InstData::F64const { bits } => {
                let rd = self.result_reg(inst);
                let tmp = Writable::from_reg(self.fresh(Type::I64));
                self.emit_all(Inst::load_constant(tmp, bits));
                self.emit(Inst::MovToFpu {
                    size32: false,
                    rd,
                    rn: tmp.to_reg(),
                });
            }
            InstData::Vconst { bits } => {
                let rd = self.result_reg(inst);
                let lo = bits as u64;
                let hi = (bits >> 64) as u64;
                let tmp = Writable::from_reg(self.fresh(Type::I64));
                self.emit_all(Inst::load_constant(tmp, lo));
                self.emit(Inst::MovToFpu {
                    size32: false,
                    rd,
                    rn: tmp.to_reg(),
                });
                self.emit_all(Inst::load_constant(tmp, hi));
                self.emit(Inst::MovToVec {
                    rd,
                    rn: tmp.to_reg(),
                    idx: 1,
                    size: VecSize::Size64x2,
                });
            }
            InstData::Unary { opcode, ty, arg } => self.lower_unary(inst, opcode, ty, arg)?,
            InstData::Binary { opcode, ty, args } => self.lower_binary(inst, opcode, ty, args)?,
            InstData::IntCompare { cond, args } => {
                let size = op_size(self.func.value_type(args[0]));
                let rn = self.value_reg(args[0]);
                let rm = self.value_reg(args[1]);
                let rd = self.result_reg(inst);
                self.emit(Inst::AluRRR {
                    op: ALUOp::SubS,
                    size,
                    rd: Writable::from_reg(zero_reg()),
                    rn,
                    rm,
                });
                self.emit(Inst::CSet {
                    rd,
                    cond: Cond::from_intcc(cond),
                });
            }
            InstData::FloatCompare { cond, args } => {
                let size32 = self.func.value_type(args[0]) == Type::F32;
                let rn = self.value_reg(args[0]);
                let rm = self.value_reg(args[1]);
                let rd = self.result_reg(inst);
                self.emit(Inst::FpuCmp { size32, rn, rm });
                self.emit(Inst::CSet {
                    rd,
                    cond: Cond::from_floatcc(cond),
                });
            }
            InstData::Select { args } => self.lower_select(inst, args),
            InstData::Load {
                opcode,
                ty,
                addr,
                offset,
            } => {
                let rn = self.value_reg(addr);
                let rd = self.result_reg(inst);
                let mem = AMode::RegOffset {
                    rn,
                    off: i64::from(offset),
                };
                let inst = match (opcode, ty) {
                    (Opcode::Load, Type::I32) => Inst::ULoad32 { rd, mem },
                    (Opcode::Load, Type::I64) => Inst::ULoad64 { rd, mem },
                    (Opcode::Load, Type::F32) => Inst::FpuLoad32 { rd, mem },
                    (Opcode::Load, Type::F64) => Inst::FpuLoad64 { rd, mem },
                    (Opcode::Load, Type::V128) => Inst::FpuLoad128 { rd, mem },
                    (Opcode::Uload8, _) => Inst::ULoad8 { rd, mem },
                    (Opcode::Sload8, ty) => Inst::SLoad8 {
                        rd,
                        mem,
                        size: op_size(ty),
                    },
                    (Opcode::Uload16, _) => Inst::ULoad16 { rd, mem },
                    (Opcode::Sload16, ty) => Inst::SLoad16 {
                        rd,
                        mem,
                        size: op_size(ty),
                    },
                    (Opcode::Uload32, _) => Inst::ULoad32 { rd, mem },
                    (Opcode::Sload32, _) => Inst::SLoad32 { rd, mem },
                    _ => unreachable!("bad load opcode"),
                };
                self.emit(inst);
            }
            InstData::Store {
                opcode,
                args,
                offset,
            } => {
                let value_ty = self.func.value_type(args[0]);
                let rd = self.value_reg(args[0]);
                let rn = self.value_reg(args[1]);
                let mem = AMode::RegOffset {
                    rn,
                    off: i64::from(offset),
                };
                let inst = match (opcode, value_ty) {
                    (Opcode::Store, Type::I32) => Inst::Store32 { rd, mem },
                    (Opcode::Store, Type::I64) => Inst::Store64 { rd, mem },
                    (Opcode::Store, Type::F32) => Inst::FpuStore32 { rd, mem },
                    (Opcode::Store, Type::F64) => Inst::FpuStore64 { rd, mem },
                    (Opcode::Store, Type::V128) => Inst::FpuStore128 { rd, mem },
                    (Opcode::Istore8, _) => Inst::Store8 { rd, mem },
                    (Opcode::Istore16, _) => Inst::Store16 { rd, mem },
                    (Opcode::Istore32, _) => Inst::Store32 { rd, mem },
                    _ => unreachable!("bad store opcode"),
                };
                self.emit(inst);
            }
            InstData::Splat { lanes, arg } => {
                let rd = self.result_reg(inst);
                let rn = self.value_reg(arg);
                let size = vec_size(lanes);
                match lanes {
                    VecLanes::F32x4 | VecLanes::F64x2 => {
                        self.emit(Inst::VecDupFromFpu { rd, rn, size })
                    }
                    _ => self.emit(Inst::VecDup { rd, rn, size }),
                }
            }
            InstData::ExtractLane { lanes, lane, arg } => {
                let rd = self.result_reg(inst);
                let rn = self.value_reg(arg);
                match lanes {
                    VecLanes::F32x4 => self.emit(Inst::FpuDupLane {
                        rd,
                        rn,
                        idx: lane,
                        size32: true,
                    }),
                    VecLanes::F64x2 => self.emit(Inst::FpuDupLane {
                        rd,
                        rn,
                        idx: lane,
                        size32: false,
                    }),
                    _ => self.emit(Inst::MovFromVec {
                        rd,
                        rn,
                        idx: lane,
                        size: vec_size(lanes),
                    }),
                }
            }
            InstData::InsertLane { lanes, lane, args } => {
                let rd = self.result_reg(inst);
                let vec = self.value_reg(args[0]);
                let scalar = self.value_reg(args[1]);
                self.emit(Inst::FpuMove128 { rd, rn: vec });
                self.emit(Inst::MovToVec {
                    rd,
                    rn: scalar,
                    idx: lane,
                    size: vec_size(lanes),
                });
            }
            InstData::VecBinary {
                opcode,
                lanes,
                args,
            } => {
                let rd = self.result_reg(inst);
                let rn = self.value_reg(args[0]);
                let rm = self.value_reg(args[1]);
                let op = match opcode {
                    Opcode::Viadd => VecALUOp::Add,
                    Opcode::Visub => VecALUOp::Sub,
                    _ => unreachable!("bad vector opcode"),
                };
                self.emit(Inst::VecRRR {
                    op,
                    size: vec_size(lanes),
                    rd,
                    rn,
                    rm,
                });
            }
            InstData::AtomicLoad { ty, addr } => {
                let rt = self.result_reg(inst);
                let rn = self.value_reg(addr);
                self.emit(Inst::AtomicLoad {
                    size: op_size(ty),
                    rt,
                    rn,
                });
            }
            InstData::AtomicStore { ty, args } => {
                let rt = self.value_reg(args[0]);
                let rn = self.value_reg(args[1]);
                self.emit(Inst::AtomicStore {
                    size: op_size(ty),
                    rt,
                    rn,
                });
            }
            InstData::AtomicRmw { op, ty, args } => {
                let size = op_size(ty);
                let rn = self.value_reg(args[0]);
                let operand = self.value_reg(args[1]);
                let rt = self.result_reg(inst);
                let (lse, rs) = match op {
                    AtomicRmwOp::Add => (AtomicRMWOp::Add, operand),
                    AtomicRmwOp::Sub => {
                        let neg = Writable::from_reg(self.fresh(ty));
                        self.emit(Inst::AluRRR {
                            op: ALUOp::Sub,
                            size,
                            rd: neg,
                            rn: zero_reg(),
                            rm: operand,
                        });
                        (AtomicRMWOp::Add, neg.to_reg())
                    }
                    AtomicRmwOp::And => {
                        let not = Writable::from_reg(self.fresh(ty));
                        self.emit(Inst::AluRRR {
                            op: ALUOp::OrrNot,
                            size,
                            rd: not,
                            rn: zero_reg(),
                            rm: operand,
                        });
                        (AtomicRMWOp::Clr, not.to_reg())
                    }
                    AtomicRmwOp::Or => (AtomicRMWOp::Set, operand),
                    AtomicRmwOp::Xor => (AtomicRMWOp::Eor, operand),
                    AtomicRmwOp::Xchg => (AtomicRMWOp::Swp, operand),
                };
                self.emit(Inst::AtomicRMW {
                    op: lse,
                    size,
                    rs,
                    rt,
                    rn,
                });
            }
            InstData::AtomicCas { ty, args } => {
                let size = op_size(ty);
                let rn = self.value_reg(args[0]);
                let expected = self.value_reg(args[1]);
                let replacement = self.value_reg(args[2]);
                let rs = self.result_reg(inst);
                self.emit(Inst::mov64(rs, expected));
                self.emit(Inst::AtomicCAS {
                    size,
                    rs,
                    rt: replacement,
                    rn,
                });
            }
            InstData::Fence => self.emit(Inst::Fence),
            InstData::Jump { dest, .. } => {
                self.emit_branch_moves(inst, dest);
                let dest = self.label_of(dest);
                self.emit(Inst::Jump { dest });
            }
            InstData::Brz { arg, dest, .. } | InstData::Brnz { arg, dest, .. } => {
                let brz = matches!(self.func.inst_data(inst), InstData::Brz { .. });
                self.emit_branch_moves(inst, dest);
                let taken = self.label_of(dest);
                let kind = self.branch_kind(arg, brz);
                self.emit(Inst::CondBr { taken, kind });
            }
            InstData::BrTable { arg, table } => {
                let data = self.func.jump_tables[table].clone();
                if data.targets.len() >= 4096 {
                    return Err(CompileError::Codegen(format!(
                        "jump table with {} entries",
                        data.targets.len()
                    )));
                }
                let ridx = self.value_reg(arg);
                let targets: Vec<Label> =
                    data.targets.iter().map(|&t| self.label_of(t)).collect();
                let default = self.label_of(data.default);
                self.emit(Inst::JTSequence {
                    ridx,
                    targets,
                    default,
                });
            }
            InstData::Call { func: fref, args } => {
                let data = self.func.ext_funcs[fref].clone();
                let sig = self.func.sigs[data.sig].clone();
                let args: Vec<ssa::Value> =
                    args.as_slice(&self.func.value_pool).to_vec();
                let abi = ABISig::compute(&sig);
                let uses = self.lower_call_args(&abi, &args);
                let defs = call_result_regs(&abi);
                self.emit(Inst::Call {
                    index: data.index,
                    uses,
                    defs,
                });
                self.lower_call_results(&abi, inst);
            }
            InstData::CallIndirect { sig, args } => {
                let sig = self.func.sigs[sig].clone();
                let args: Vec<ssa::Value> =
                    args.as_slice(&self.func.value_pool).to_vec();
                let target = self.value_reg(args[0]);
                let abi = ABISig::compute(&sig);
                let uses = self.lower_call_args(&abi, &args[1..]);
                let defs = call_result_regs(&abi);
                self.emit(Inst::CallInd {
                    rn: target,
                    uses,
                    defs,
                });
                self.lower_call_results(&abi, inst);
            }
            InstData::Return { args } => {
                let args: Vec<ssa::Value> =
                    args.as_slice(&self.func.value_pool).to_vec();
                let abi = ABISig::compute(&self.func.signature);
                for (i, &a) in args.iter().enumerate() {
                    let ty = self.func.value_type(a);
                    let src = self.value_reg(a);
                    match abi.rets[i] {
                        ABIArg::Reg(r, _) => self.emit_move(Writable::from_reg(r), src, ty),
                        ABIArg::Stack(off, _) => {
                            let mem = AMode::FPOffset {
                                off: 16 + i64::from(off),
                            };
                            let st = match ty {
                                Type::V128 => Inst::FpuStore128 { rd: src, mem },
                                Type::F32 | Type::F64 => Inst::FpuStore64 { rd: src, mem },
                                _ => Inst::Store64 { rd: src, mem },
                            };
                            self.emit(st);
                        }
                    }
                }
                self.emit(Inst::Ret);
            }
            InstData::Trap { code } => {
                self.emit(Inst::ExitSequence {
                    code: trap_exit_code(code).bits(),
                });
            }
        }
        Ok(())
    }

    fn branch_kind(&mut self, arg: ssa::Value, brz: bool) -> CondBrKind {
        if let ValueDef::Result(def, 0) = self.func.value_def(arg) {
            if self.fused.contains(&def) {
                match self.func.inst_data(def).clone() {
                    InstData::IntCompare { cond, args } => {
                        let size = op_size(self.func.value_type(args[0]));
                        let rn = self.value_reg(args[0]);
                        let rm = self.value_reg(args[1]);
                        self.emit(Inst::AluRRR {
                            op: ALUOp::SubS,
                            size,
                            rd: Writable::from_reg(zero_reg()),
                            rn,
                            rm,
                        });
                        let cond = Cond::from_intcc(cond);
                        return CondBrKind::Cond(if brz { cond.invert() } else { cond });
                    }
                    InstData::FloatCompare { cond, args } => {
                        let size32 = self.func.value_type(args[0]) == Type::F32;
                        let rn = self.value_reg(args[0]);
                        let rm = self.value_reg(args[1]);
                        self.emit(Inst::FpuCmp { size32, rn, rm });
                        let cond = Cond::from_floatcc(cond);
                        return CondBrKind::Cond(if brz { cond.invert() } else { cond });
                    }
                    _ => unreachable!(),
                }
            }
        }
        let reg = self.value_reg(arg);
        if brz {
            CondBrKind::Zero(reg)
        } else {
            CondBrKind::NotZero(reg)
        }
    }

    fn lower_call_args(
        &mut self,
        abi: &ABISig,
        args: &[ssa::Value],
    ) -> SmallVec<[Reg; 8]> {
        debug_assert_eq!(abi.args.len(), args.len());
        let mut uses: SmallVec<[Reg; 8]> = SmallVec::new();
        for (&a, loc) in args.iter().zip(&abi.args) {
            let ty = self.func.value_type(a);
            let src = self.value_reg(a);
            match *loc {
                ABIArg::Reg(r, _) => {
                    self.emit_move(Writable::from_reg(r), src, ty);
                    uses.push(r);
                }
                ABIArg::Stack(off, _) => {
                    let mem = AMode::SPOffset {
                        off: i64::from(off),
                    };
                    let st = match ty {
                        Type::V128 => Inst::FpuStore128 { rd: src, mem },
                        Type::F32 | Type::F64 => Inst::FpuStore64 { rd: src, mem },
                        _ => Inst::Store64 { rd: src, mem },
                    };
                    self.emit(st);
                }
            }
        }
        self.vcode.out_args_size = self.vcode.out_args_size.max(abi.stack_area);
        uses
    }

    fn lower_call_results(&mut self, abi: &ABISig, inst: ssa::Inst) {
        let results: Vec<ssa::Value> = self.func.inst_results(inst).to_vec();
        for (&v, loc) in results.iter().zip(&abi.rets) {
            let ty = self.func.value_type(v);
            let dst = Writable::from_reg(self.value_reg(v));
            match *loc {
                ABIArg::Reg(r, _) => self.emit_move(dst, r, ty),
                ABIArg::Stack(off, _) => {
                    let mem = AMode::SPOffset {
                        off: i64::from(off),
                    };
                    let ld = match ty {
                        Type::V128 => Inst::FpuLoad128 { rd: dst, mem },
                        Type::F32 | Type::F64 => Inst::FpuLoad64 { rd: dst, mem },
                        _ => Inst::ULoad64 { rd: dst, mem },
                    };
                    self.emit(ld);
                }
            }
        }
    }

    fn lower_select(&mut self, inst: ssa::Inst, args: [ssa::Value; 3]) {
        let ty = self.func.value_type(args[1]);
        let cond = self.value_reg(args[0]);
        let then = self.value_reg(args[1]);
        let els = self.value_reg(args[2]);
        let rd = self.result_reg(inst);
        match ty {
            Type::I32 | Type::I64 => {
                self.emit_cmp_zero(cond);
                self.emit(Inst::CSel {
                    size: OperandSize::Size64,
                    rd,
                    cond: Cond::Ne,
                    rn: then,
                    rm: els,
                });
            }
            Type::F32 | Type::F64 => {
                self.emit_cmp_zero(cond);
                self.emit(Inst::FpuCSel {
                    size32: ty == Type::F32,
                    rd,
                    cond: Cond::Ne,
                    rn: then,
                    rm: els,
                });
            }
            Type::V128 => {
                // Branchless: build an all-ones/all-zero mask from the
                // condition and blend.
                let bit = Writable::from_reg(self.fresh(Type::I64));
                self.emit_cmp_zero(cond);
                self.emit(Inst::CSet { rd: bit, cond: Cond::Ne });
                let mask64 = Writable::from_reg(self.fresh(Type::I64));
                self.emit(Inst::AluRRR {
                    op: ALUOp::Sub,
                    size: OperandSize::Size64,
                    rd: mask64,
                    rn: zero_reg(),
                    rm: bit.to_reg(),
                });
                let mask = Writable::from_reg(self.fresh(Type::V128));
                self.emit(Inst::VecDup {
                    rd: mask,
                    rn: mask64.to_reg(),
                    size: VecSize::Size64x2,
                });
                let take_then = Writable::from_reg(self.fresh(Type::V128));
                self.emit(Inst::VecRRR {
                    op: VecALUOp::And,
                    size: VecSize::Size8x16,
                    rd: take_then,
                    rn: then,
                    rm: mask.to_reg(),
                });
                let take_else = Writable::from_reg(self.fresh(Type::V128));
                self.emit(Inst::VecRRR {
                    op: VecALUOp::Bic,
                    size: VecSize::Size8x16,
                    rd: take_else,
                    rn: els,
                    rm: mask.to_reg(),
                });
                self.emit(Inst::VecRRR {
                    op: VecALUOp::Orr,
                    size: VecSize::Size8x16,
                    rd,
                    rn: take_then.to_reg(),
                    rm: take_else.to_reg(),
                });
            }
        }
    }

    fn emit_cmp_zero(&mut self, reg: Reg) {
        self.emit(Inst::AluRRImm12 {
            op: ALUOp::SubS,
            size: OperandSize::Size64,
            rd: Writable::from_reg(zero_reg()),
            rn: reg,
            imm12: Imm12::zero(),
        });
    }

    fn lower_unary(
        &mut self,
        inst: ssa::Inst,
        opcode: Opcode,
        ty: Type,
        arg: ssa::Value,
    ) -> Result<(), CompileError> {
        let rd = self.result_reg(inst);
        let rn = self.value_reg(arg);
        let src_ty = self.func.value_type(arg);
        match opcode {
            Opcode::Clz => self.emit(Inst::BitRR {
                op: BitOp::Clz,
                size: op_size(ty),
                rd,
                rn,
            }),
            Opcode::Ctz => {
                let tmp = Writable::from_reg(self.fresh(ty));
                self.emit(Inst::BitRR {
                    op: BitOp::RBit,
                    size: op_size(ty),
                    rd: tmp,
                    rn,
                });
                self.emit(Inst::BitRR {
                    op: BitOp::Clz,
                    size: op_size(ty),
                    rd,
                    rn: tmp.to_reg(),
                });
            }
            Opcode::Popcnt => {
                let v = Writable::from_reg(self.fresh(Type::F64));
                self.emit(Inst::MovToFpu {
                    size32: false,
                    rd: v,
                    rn,
                });
                self.emit(Inst::VecCnt {
                    rd: v,
                    rn: v.to_reg(),
                });
                self.emit(Inst::VecAddv8 {
                    rd: v,
                    rn: v.to_reg(),
                });
                self.emit(Inst::MovFromVec {
                    rd,
                    rn: v.to_reg(),
                    idx: 0,
                    size: VecSize::Size8x16,
                });
            }
            Opcode::UextendI32 => self.emit(Inst::Extend {
                rd,
                rn,
                signed: false,
                from_bits: 32,
                to_bits: 64,
            }),
            Opcode::SextendI32 => self.emit(Inst::Extend {
                rd,
                rn,
                signed: true,
                from_bits: 32,
                to_bits: 64,
            }),
            Opcode::Ireduce => self.emit(Inst::Mov {
                size: OperandSize::Size32,
                rd,
                rm: rn,
            }),
            Opcode::ExtendS8 => self.emit(Inst::Extend {
                rd,
                rn,
                signed: true,
                from_bits: 8,
                to_bits: ty.bits() as u8,
            }),
            Opcode::ExtendS16 => self.emit(Inst::Extend {
                rd,
                rn,
                signed: true,
                from_bits: 16,
                to_bits: ty.bits() as u8,
            }),
            Opcode::ExtendS32 => self.emit(Inst::Extend {
                rd,
                rn,
                signed: true,
                from_bits: 32,
                to_bits: 64,
            }),
            Opcode::Fabs | Opcode::Fneg | Opcode::Fsqrt
            | Opcode::Ceil | Opcode::Floor | Opcode::Trunc | Opcode::Nearest => {
                let op = match opcode {
                    Opcode::Fabs => FpuOp1::Abs,
                    Opcode::Fneg => FpuOp1::Neg,
                    Opcode::Fsqrt => FpuOp1::Sqrt,
                    Opcode::Ceil => FpuOp1::RintP,
                    Opcode::Floor => FpuOp1::RintM,
                    Opcode::Trunc => FpuOp1::RintZ,
                    Opcode::Nearest => FpuOp1::RintN,
                    _ => unreachable!(),
                };
                self.emit(Inst::FpuRR {
                    op,
                    size32: ty == Type::F32,
                    rd,
                    rn,
                });
            }
            Opcode::Fpromote => self.emit(Inst::FpuRR {
                op: FpuOp1::Cvt32To64,
                size32: true,
                rd,
                rn,
            }),
            Opcode::Fdemote => self.emit(Inst::FpuRR {
                op: FpuOp1::Cvt64To32,
                size32: false,
                rd,
                rn,
            }),
            Opcode::FcvtToSint | Opcode::FcvtToSintSat => {
                let op = fpu_to_int(src_ty, ty, true);
                self.emit(Inst::FpuToInt { op, rd, rn });
            }
            Opcode::FcvtToUint | Opcode::FcvtToUintSat => {
                let op = fpu_to_int(src_ty, ty, false);
                self.emit(Inst::FpuToInt { op, rd, rn });
            }
            Opcode::FcvtFromSint => {
                let op = int_to_fpu(src_ty, ty, true);
                self.emit(Inst::IntToFpu { op, rd, rn });
            }
            Opcode::FcvtFromUint => {
                let op = int_to_fpu(src_ty, ty, false);
                self.emit(Inst::IntToFpu { op, rd, rn });
            }
            Opcode::Bitcast => match (src_ty.is_int(), ty.is_int()) {
                (true, false) => self.emit(Inst::MovToFpu {
                    size32: ty == Type::F32,
                    rd,
                    rn,
                }),
                (false, true) => self.emit(Inst::MovFromFpu {
                    size32: src_ty == Type::F32,
                    rd,
                    rn,
                }),
                _ => {
                    return Err(CompileError::Codegen(format!(
                        "bitcast {src_ty} -> {ty}"
                    )))
                }
            },
            other => {
                return Err(CompileError::Codegen(format!(
                    "unary opcode {other} cannot be lowered"
                )))
            }
        }
        Ok(())
    }

    fn lower_binary(
        &mut self,
        inst: ssa::Inst,
        opcode: Opcode,
        ty: Type,
        args: [ssa::Value; 2],
    ) -> Result<(), CompileError> {
        let rd = self.result_reg(inst);

        // v128 bitwise ops share the integer opcodes.
        if ty == Type::V128 {
            let rn = self.value_reg(args[0]);
            let rm = self.value_reg(args[1]);
            let op = match opcode {
                Opcode::Band => VecALUOp::And,
                Opcode::Bor => VecALUOp::Orr,
                Opcode::Bxor => VecALUOp::Eor,
                other => {
                    return Err(CompileError::Codegen(format!(
                        "binary opcode {other} on v128"
                    )))
                }
            };
            self.emit(Inst::VecRRR {
                op,
                size: VecSize::Size8x16,
                rd,
                rn,
                rm,
            });
            return Ok(());
        }
        if ty.is_float() {
            let rn = self.value_reg(args[0]);
            let rm = self.value_reg(args[1]);
            let op = match opcode {
                Opcode::Fadd => FpuOp2::Add,
                Opcode::Fsub => FpuOp2::Sub,
                Opcode::Fmul => FpuOp2::Mul,
                Opcode::Fdiv => FpuOp2::Div,
                Opcode::Fmin => FpuOp2::Min,
                Opcode::Fmax => FpuOp2::Max,
                other => {
                    return Err(CompileError::Codegen(format!(
                        "binary opcode {other} on {ty}"
                    )))
                }
            };
            self.emit(Inst::FpuRRR {
                op,
                size32: ty == Type::F32,
                rd,
                rn,
                rm,
            });
            return Ok(());
        }

        let size = op_size(ty);
        let bits = ty.bits() as u64;
        let rn = self.value_reg(args[0]);
        let const_rhs = self.iconst_arg(args[1]);

        match opcode {
            Opcode::Iadd | Opcode::Isub => {
                let op = if opcode == Opcode::Iadd {
                    ALUOp::Add
                } else {
                    ALUOp::Sub
                };
                if let Some(imm) = const_rhs.and_then(Imm12::maybe_from_u64) {
                    self.emit(Inst::AluRRImm12 {
                        op,
                        size,
                        rd,
                        rn,
                        imm12: imm,
                    });
                } else {
                    let rm = self.value_reg(args[1]);
                    self.emit(Inst::AluRRR { op, size, rd, rn, rm });
                }
            }
            Opcode::Imul => {
                let rm = self.value_reg(args[1]);
                self.emit(Inst::AluRRRR {
                    op: ALUOp3::MAdd,
                    size,
                    rd,
                    rn,
                    rm,
                    ra: zero_reg(),
                });
            }
            Opcode::Udiv | Opcode::Sdiv => {
                let rm = self.value_reg(args[1]);
                let op = if opcode == Opcode::Udiv {
                    ALUOp::UDiv
                } else {
                    ALUOp::SDiv
                };
                self.emit(Inst::AluRRR { op, size, rd, rn, rm });
            }
            Opcode::Urem | Opcode::Srem => {
                let rm = self.value_reg(args[1]);
                let op = if opcode == Opcode::Urem {
                    ALUOp::UDiv
                } else {
                    ALUOp::SDiv
                };
                let quot = Writable::from_reg(self.fresh(ty));
                self.emit(Inst::AluRRR {
                    op,
                    size,
                    rd: quot,
                    rn,
                    rm,
                });
                // rem = rn - quot * rm
                self.emit(Inst::AluRRRR {
                    op: ALUOp3::MSub,
                    size,
                    rd,
                    rn: quot.to_reg(),
                    rm,
                    ra: rn,
                });
            }
            Opcode::Band | Opcode::Bor | Opcode::Bxor => {
                let op = match opcode {
                    Opcode::Band => ALUOp::And,
                    Opcode::Bor => ALUOp::Orr,
                    _ => ALUOp::Eor,
                };
                let imml = const_rhs.and_then(|c| ImmLogic::maybe_from_u64(c, size));
                if let Some(imml) = imml {
                    self.emit(Inst::AluRRImmLogic {
                        op,
                        size,
                        rd,
                        rn,
                        imml,
                    });
                } else {
                    let rm = self.value_reg(args[1]);
                    self.emit(Inst::AluRRR { op, size, rd, rn, rm });
                }
            }
            Opcode::Ishl | Opcode::Ushr | Opcode::Sshr | Opcode::Rotr => {
                let op = match opcode {
                    Opcode::Ishl => ALUOp::Lsl,
                    Opcode::Ushr => ALUOp::Lsr,
                    Opcode::Sshr => ALUOp::Asr,
                    _ => ALUOp::RotR,
                };
                if let Some(c) = const_rhs {
                    let amt = (c & (bits - 1)) as u8;
                    if amt == 0 {
                        self.emit(Inst::Mov { size, rd, rm: rn });
                    } else {
                        self.emit(Inst::AluRRImmShift { op, size, rd, rn, amt });
                    }
                } else {
                    let rm = self.value_reg(args[1]);
                    self.emit(Inst::AluRRR { op, size, rd, rn, rm });
                }
            }
            Opcode::Rotl => {
                // rotl(a, b) == rotr(a, bits - b)
                if let Some(c) = const_rhs {
                    let amt = ((bits - (c & (bits - 1))) & (bits - 1)) as u8;
                    if amt == 0 {
                        self.emit(Inst::Mov { size, rd, rm: rn });
                    } else {
                        self.emit(Inst::AluRRImmShift {
                            op: ALUOp::RotR,
                            size,
                            rd,
                            rn,
                            amt,
                        });
                    }
                } else {
                    let rm = self.value_reg(args[1]);
                    let neg = Writable::from_reg(self.fresh(ty));
                    self.emit(Inst::AluRRR {
                        op: ALUOp::Sub,
                        size,
                        rd: neg,
                        rn: zero_reg(),
                        rm,
                    });
                    self.emit(Inst::AluRRR {
                        op: ALUOp::RotR,
                        size,
                        rd,
                        rn,
                        rm: neg.to_reg(),
                    });
                }
            }
            other => {
                return Err(CompileError::Codegen(format!(
                    "binary opcode {other} cannot be lowered"
                )))
            }
        }
        Ok(())
    }

    /// The constant value of an operand, when its definition is an `iconst`
    /// and folding it into the instruction is the only use we care about.
    fn iconst_arg(&self, v: ssa::Value) -> Option<u64> {
        match self.func.value_def(v) {
            ValueDef::Result(def, 0) => match *self.func.inst_data(def) {
                InstData::Iconst { imm, .. } => Some(imm),
                _ => None,
            },
            _ => None,
        }
    }
}

fn op_size(ty: Type) -> OperandSize {
    match ty {
        Type::I32 => OperandSize::Size32,
        _ => OperandSize::Size64,
    }
}

fn vec_size(lanes: VecLanes) -> VecSize {
    match lanes {
        VecLanes::I8x16 => VecSize::Size8x16,
        VecLanes::I16x8 => VecSize::Size16x8,
        VecLanes::I32x4 | VecLanes::F32x4 => VecSize::Size32x4,
        VecLanes::I64x2 | VecLanes::F64x2 => VecSize::Size64x2,
    }
}

fn fpu_to_int(src: Type, dst: Type, signed: bool) -> FpuToIntOp {
    match (src, dst, signed) {
        (Type::F32, Type::I32, true) => FpuToIntOp::F32ToI32,
        (Type::F32, Type::I32, false) => FpuToIntOp::F32ToU32,
        (Type::F32, Type::I64, true) => FpuToIntOp::F32ToI64,
        (Type::F32, Type::I64, false) => FpuToIntOp::F32ToU64,
        (Type::F64, Type::I32, true) => FpuToIntOp::F64ToI32,
        (Type::F64, Type::I32, false) => FpuToIntOp::F64ToU32,
        (Type::F64, Type::I64, true) => FpuToIntOp::F64ToI64,
        (Type::F64, Type::I64, false) => FpuToIntOp::F64ToU64,
        _ => panic!("bad conversion {src} -> {dst}"),
    }
}

fn int_to_fpu(src: Type, dst: Type, signed: bool) -> IntToFpuOp {
    match (src, dst, signed) {
        (Type::I32, Type::F32, true) => IntToFpuOp::I32ToF32,
        (Type::I32, Type::F32, false) => IntToFpuOp::U32ToF32,
        (Type::I64, Type::F32, true) => IntToFpuOp::I64ToF32,
        (Type::I64, Type::F32, false) => IntToFpuOp::U64ToF32,
        (Type::I32, Type::F64, true) => IntToFpuOp::I32ToF64,
        (Type::I32, Type::F64, false) => IntToFpuOp::U32ToF64,
        (Type::I64, Type::F64, true) => IntToFpuOp::I64ToF64,
        (Type::I64, Type::F64, false) => IntToFpuOp::U64ToF64,
        _ => panic!("bad conversion {src} -> {dst}"),
    }
}

fn trap_exit_code(code: TrapCode) -> ExitCode {
    match code {
        TrapCode::Unreachable => ExitCode::UNREACHABLE,
        TrapCode::MemoryOutOfBounds => ExitCode::MEMORY_OUT_OF_BOUNDS,
        TrapCode::TableOutOfBounds => ExitCode::TABLE_OUT_OF_BOUNDS,
        TrapCode::IndirectCallNullPointer => ExitCode::INDIRECT_CALL_NULL_POINTER,
        TrapCode::IndirectCallTypeMismatch => ExitCode::INDIRECT_CALL_TYPE_MISMATCH,
        TrapCode::IntegerOverflow => ExitCode::INTEGER_OVERFLOW,
        TrapCode::IntegerDivisionByZero => ExitCode::INTEGER_DIVISION_BY_ZERO,
        TrapCode::InvalidConversionToInteger => ExitCode::INVALID_CONVERSION_TO_INTEGER,
    }
}

fn call_result_regs(abi: &ABISig) -> SmallVec<[Reg; 8]> {
    abi.rets
        .iter()
        .filter_map(|r| match r {
            ABIArg::Reg(reg, _) => Some(*reg),
            ABIArg::Stack(..) => None,
        })
        .collect()
}
