//! Linear-scan register allocation.
//!
//! The allocator works on coarse live intervals: one `[start, end]` range per
//! virtual register over the linearized instruction order, widened to block
//! boundaries by a classic backward liveness pass. Intervals that cross a
//! call site only take callee-saved registers (or spill); everything else
//! prefers caller-saved so the prologue stays short.
//!
//! Spilled values are rewritten in place: uses load into reserved scratch
//! registers (x15/x16/x17, v13/v14/v15), definitions store back after the
//! instruction. The argument registers are never allocated, so the fixed
//! moves lowering emits around calls and at entry cannot conflict with
//! allocations.

use log::trace;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::aarch64::args::AMode;
use crate::aarch64::inst::{Inst, RegRole};
use crate::aarch64::regs::{
    is_int_callee_saved, vreg as preg_v, xreg as preg_x, FLOAT_ALLOCATABLE, INT_ALLOCATABLE,
};
use crate::reg::{Reg, RegClass, Writable};
use crate::vcode::VCode;

/// Integer scratch registers for spill rewriting, in assignment order.
const INT_SCRATCH: [u8; 3] = [15, 16, 17];
/// Float scratch registers for spill rewriting.
const FLOAT_SCRATCH: [u8; 3] = [13, 14, 15];

/// Allocation results the ABI layer needs for the frame.
pub struct RegAllocOutput {
    /// Callee-saved integer registers the function must preserve.
    pub clobbered_callee_saved: Vec<u8>,
    /// Total bytes of spill area, 16-byte aligned.
    pub spill_size: u32,
}

#[derive(Clone, Copy, Debug)]
struct Interval {
    vreg: u32,
    class: RegClass,
    start: u32,
    end: u32,
    crosses_call: bool,
}

enum Assignment {
    Reg(Reg),
    /// Byte offset of the slot within the spill area.
    Spill(u32),
}

pub fn run(vcode: &mut VCode) -> RegAllocOutput {
    // Global instruction positions, in block order.
    let mut block_pos = Vec::with_capacity(vcode.blocks.len());
    let mut pos = 0u32;
    for block in &vcode.blocks {
        block_pos.push((pos, pos + block.insts.len() as u32));
        pos += block.insts.len() as u32;
    }

    // Per-block use/def sets and call positions.
    let nint = vcode.num_vregs[0] as usize;
    let nfloat = vcode.num_vregs[1] as usize;
    let key = |r: Reg| -> usize {
        match r.class() {
            RegClass::Int => r.virt_index() as usize,
            RegClass::Float => nint + r.virt_index() as usize,
        }
    };
    let nvregs = nint + nfloat;

    let mut gen_sets: Vec<Vec<bool>> = vec![vec![false; nvregs]; vcode.blocks.len()];
    let mut def_sets: Vec<Vec<bool>> = vec![vec![false; nvregs]; vcode.blocks.len()];
    let mut call_positions: Vec<u32> = Vec::new();
    for (bi, block) in vcode.blocks.iter_mut().enumerate() {
        let (start, _) = block_pos[bi];
        for (ii, inst) in block.insts.iter_mut().enumerate() {
            if inst.is_call() {
                call_positions.push(start + ii as u32);
            }
            let (gen_set, def_set) = (&mut gen_sets[bi], &mut def_sets[bi]);
            inst.visit_regs(&mut |role, reg| {
                if !reg.is_virtual() {
                    return;
                }
                let k = key(*reg);
                match role {
                    RegRole::Use => {
                        if !def_set[k] {
                            gen_set[k] = true;
                        }
                    }
                    RegRole::Def => def_set[k] = true,
                    RegRole::UseDef => {
                        if !def_set[k] {
                            gen_set[k] = true;
                        }
                        def_set[k] = true;
                    }
                }
            });
        }
    }

    // Backward liveness to a fixpoint.
    let mut live_in: Vec<Vec<bool>> = vec![vec![false; nvregs]; vcode.blocks.len()];
    let mut live_out: Vec<Vec<bool>> = vec![vec![false; nvregs]; vcode.blocks.len()];
    let mut changed = true;
    while changed {
        changed = false;
        for bi in (0..vcode.blocks.len()).rev() {
            let mut out = vec![false; nvregs];
            for &s in &vcode.blocks[bi].succs {
                for v in 0..nvregs {
                    if live_in[s][v] {
                        out[v] = true;
                    }
                }
            }
            let mut input = out.clone();
            for v in 0..nvregs {
                if def_sets[bi][v] && !gen_sets[bi][v] {
                    input[v] = false;
                }
                if gen_sets[bi][v] {
                    input[v] = true;
                }
            }
            if input != live_in[bi] {
                live_in[bi] = input;
                changed = true;
            }
            live_out[bi] = out;
        }
    }

    // Coarse intervals.
    let mut starts = vec![u32::MAX; nvregs];
    let mut ends = vec![0u32; nvregs];
    let mut classes = vec![RegClass::Int; nvregs];
    for (bi, block) in vcode.blocks.iter_mut().enumerate() {
        let (bstart, bend) = block_pos[bi];
        for v in 0..nvregs {
            if live_in[bi][v] {
                starts[v] = starts[v].min(bstart);
                ends[v] = ends[v].max(bstart);
            }
            if live_out[bi][v] {
                starts[v] = starts[v].min(bend.saturating_sub(1));
                ends[v] = ends[v].max(bend);
            }
        }
        for (ii, inst) in block.insts.iter_mut().enumerate() {
            let p = bstart + ii as u32;
            inst.visit_regs(&mut |_, reg| {
                if !reg.is_virtual() {
                    return;
                }
                let k = key(*reg);
                classes[k] = reg.class();
                starts[k] = starts[k].min(p);
                ends[k] = ends[k].max(p);
            });
        }
    }

    let mut intervals: Vec<Interval> = (0..nvregs)
        .filter(|&v| starts[v] != u32::MAX)
        .map(|v| {
            let (start, end) = (starts[v], ends[v]);
            let crosses_call = call_positions
                .iter()
                .any(|&c| c > start && c < end);
            Interval {
                vreg: if v < nint { v as u32 } else { (v - nint) as u32 },
                class: if v < nint { RegClass::Int } else { RegClass::Float },
                start,
                end,
                crosses_call,
            }
        })
        .collect();
    intervals.sort_by_key(|iv| iv.start);

    // Scan.
    let mut free_int: Vec<u8> = INT_ALLOCATABLE.to_vec();
    let mut free_float: Vec<u8> = FLOAT_ALLOCATABLE.to_vec();
    let mut active: Vec<(Interval, Reg)> = Vec::new();
    let mut assignment: FxHashMap<(RegClass, u32), Assignment> = FxHashMap::default();
    let mut clobbered_callee_saved: Vec<u8> = Vec::new();
    let mut spill_off = 0u32;

    let mut spill = |vcode: &VCode, iv: &Interval, spill_off: &mut u32| -> Assignment {
        let ci = VCode::class_index(iv.class);
        let bytes = u32::from(vcode.vreg_bytes[ci][iv.vreg as usize]);
        *spill_off = (*spill_off + bytes - 1) & !(bytes - 1);
        let off = *spill_off;
        *spill_off += bytes;
        trace!("spilling {:?}/{} to slot {off}", iv.class, iv.vreg);
        Assignment::Spill(off)
    };

    for iv in &intervals {
        // Expire.
        active.retain(|(a, reg)| {
            if a.end < iv.start {
                match reg.class() {
                    RegClass::Int => free_int.push(reg.hw_enc()),
                    RegClass::Float => free_float.push(reg.hw_enc()),
                }
                false
            } else {
                true
            }
        });

        let pool = match iv.class {
            RegClass::Int => &mut free_int,
            RegClass::Float => &mut free_float,
        };
        let pick = if iv.crosses_call {
            // Only callee-saved integer registers survive calls; floats
            // always spill.
            match iv.class {
                RegClass::Int => {
                    let idx = pool.iter().position(|&e| is_int_callee_saved(e));
                    idx.map(|i| pool.remove(i))
                }
                RegClass::Float => None,
            }
        } else {
            // Prefer caller-saved so the prologue need not save anything.
            let idx = match iv.class {
                RegClass::Int => pool
                    .iter()
                    .position(|&e| !is_int_callee_saved(e))
                    .or_else(|| Some(0).filter(|_| !pool.is_empty())),
                RegClass::Float => Some(0).filter(|_| !pool.is_empty()),
            };
            idx.map(|i| pool.remove(i))
        };

        match pick {
            Some(enc) => {
                let reg = match iv.class {
                    RegClass::Int => preg_x(enc),
                    RegClass::Float => preg_v(enc),
                };
                if iv.class == RegClass::Int
                    && is_int_callee_saved(enc)
                    && !clobbered_callee_saved.contains(&enc)
                {
                    clobbered_callee_saved.push(enc);
                }
                trace!(
                    "assigning {:?} to {:?}/{} [{},{}]",
                    reg, iv.class, iv.vreg, iv.start, iv.end
                );
                assignment.insert((iv.class, iv.vreg), Assignment::Reg(reg));
                active.push((*iv, reg));
            }
            None => {
                let a = spill(vcode, iv, &mut spill_off);
                assignment.insert((iv.class, iv.vreg), a);
            }
        }
    }
    clobbered_callee_saved.sort_unstable();
    let spill_size = (spill_off + 15) & !15;

    // Rewrite pass: map assigned vregs to their registers; spilled vregs go
    // through scratch registers with a load before and a store after each
    // instruction. `SpillOffset` is a placeholder the ABI layer turns into a
    // frame-pointer offset once the callee-saved area size is known.
    let vreg_bytes = vcode.vreg_bytes.clone();
    for block in vcode.blocks.iter_mut() {
        let mut rewritten: Vec<Inst> = Vec::with_capacity(block.insts.len());
        for mut inst in block.insts.drain(..) {
            let mut loads: SmallVec<[Inst; 3]> = SmallVec::new();
            let mut stores: SmallVec<[Inst; 3]> = SmallVec::new();
            // Uses and defs draw scratches independently: a definition may
            // legally share a register with a source, since every
            // instruction reads its operands before writing its
            // destination. This caps the demand at three scratches even for
            // the four-operand multiply-add shapes.
            let mut next_int_use = 0;
            let mut next_float_use = 0;
            let mut next_int_def = 0;
            let mut next_float_def = 0;
            let mut scratch_for: FxHashMap<(RegClass, u32), Reg> = FxHashMap::default();

            inst.visit_regs(&mut |role, reg| {
                if !reg.is_virtual() {
                    return;
                }
                let k = (reg.class(), reg.virt_index());
                match assignment.get(&k) {
                    Some(Assignment::Reg(r)) => *reg = *r,
                    Some(Assignment::Spill(off)) => {
                        let ci = VCode::class_index(reg.class());
                        let bytes = vreg_bytes[ci][reg.virt_index() as usize];
                        let mem = AMode::SpillOffset { off: *off };
                        let scratch = match scratch_for.get(&k) {
                            Some(&s) => s,
                            None => {
                                let is_use = matches!(role, RegRole::Use | RegRole::UseDef);
                                let s = match (reg.class(), is_use) {
                                    (RegClass::Int, true) => {
                                        let s = preg_x(INT_SCRATCH[next_int_use]);
                                        next_int_use += 1;
                                        s
                                    }
                                    (RegClass::Int, false) => {
                                        let s = preg_x(INT_SCRATCH[next_int_def]);
                                        next_int_def += 1;
                                        s
                                    }
                                    (RegClass::Float, true) => {
                                        let s = preg_v(FLOAT_SCRATCH[next_float_use]);
                                        next_float_use += 1;
                                        s
                                    }
                                    (RegClass::Float, false) => {
                                        let s = preg_v(FLOAT_SCRATCH[next_float_def]);
                                        next_float_def += 1;
                                        s
                                    }
                                };
                                scratch_for.insert(k, s);
                                if is_use {
                                    loads.push(load_for(s, bytes, mem));
                                }
                                s
                            }
                        };
                        if matches!(role, RegRole::Def | RegRole::UseDef) {
                            stores.push(store_for(scratch, bytes, mem));
                        }
                        *reg = scratch;
                    }
                    None => {
                        // Never live: an unused definition. Write to scratch.
                        *reg = match reg.class() {
                            RegClass::Int => preg_x(INT_SCRATCH[0]),
                            RegClass::Float => preg_v(FLOAT_SCRATCH[0]),
                        };
                    }
                }
            });
            rewritten.extend(loads);
            rewritten.push(inst);
            rewritten.extend(stores);
        }
        block.insts = rewritten;
    }

    RegAllocOutput {
        clobbered_callee_saved,
        spill_size,
    }
}

fn load_for(scratch: Reg, bytes: u8, mem: AMode) -> Inst {
    let rd = Writable::from_reg(scratch);
    match (scratch.class(), bytes) {
        (RegClass::Int, _) => Inst::ULoad64 { rd, mem },
        (RegClass::Float, 16) => Inst::FpuLoad128 { rd, mem },
        (RegClass::Float, _) => Inst::FpuLoad64 { rd, mem },
    }
}

fn store_for(scratch: Reg, bytes: u8, mem: AMode) -> Inst {
    match (scratch.class(), bytes) {
        (RegClass::Int, _) => Inst::Store64 { rd: scratch, mem },
        (RegClass::Float, 16) => Inst::FpuStore128 { rd: scratch, mem },
        (RegClass::Float, _) => Inst::FpuStore64 { rd: scratch, mem },
    }
}
