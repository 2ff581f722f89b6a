//! Optimization passes: constant folding, branch simplification and
//! inversion, trivial-φ elimination, dead-code removal.
//!
//! These run after construction and before layout. They are deliberately
//! local: no value numbering, no code motion.

use cranelift_entity::{EntityList, SecondaryMap};
use log::trace;

use crate::{Block, Function, Inst, InstData, IntCC, Opcode, Type, Value, ValueDef};

/// Run the full pass pipeline on `func`.
pub fn run_passes(func: &mut Function) {
    fold_constants(func);
    invert_branches(func);
    eliminate_trivial_phis(func);
    remove_dead_code(func);
}

/// The constant an SSA value resolves to, if its definition is an `iconst`.
fn iconst_value(func: &Function, value: Value) -> Option<(Type, u64)> {
    let value = func.resolve_alias(value);
    match func.value_def(value) {
        ValueDef::Result(inst, 0) => match *func.inst_data(inst) {
            InstData::Iconst { ty, imm } => Some((ty, imm)),
            _ => None,
        },
        _ => None,
    }
}

fn mask_to(ty: Type, v: u64) -> u64 {
    match ty {
        Type::I32 => v & 0xffff_ffff,
        _ => v,
    }
}

fn fold_binary(opcode: Opcode, ty: Type, a: u64, b: u64) -> Option<u64> {
    let shift_mask = (ty.bits() - 1) as u64;
    let v = match opcode {
        Opcode::Iadd => a.wrapping_add(b),
        Opcode::Isub => a.wrapping_sub(b),
        Opcode::Imul => a.wrapping_mul(b),
        Opcode::Band => a & b,
        Opcode::Bor => a | b,
        Opcode::Bxor => a ^ b,
        Opcode::Ishl => a << (b & shift_mask),
        Opcode::Ushr => mask_to(ty, a) >> (b & shift_mask),
        Opcode::Sshr => {
            let amt = (b & shift_mask) as u32;
            match ty {
                Type::I32 => ((a as u32 as i32) >> amt) as u32 as u64,
                _ => ((a as i64) >> amt) as u64,
            }
        }
        _ => return None,
    };
    Some(mask_to(ty, v))
}

fn fold_icmp(cond: IntCC, ty: Type, a: u64, b: u64) -> bool {
    let (sa, sb) = match ty {
        Type::I32 => (a as u32 as i32 as i64, b as u32 as i32 as i64),
        _ => (a as i64, b as i64),
    };
    let (ua, ub) = (mask_to(ty, a), mask_to(ty, b));
    match cond {
        IntCC::Eq => ua == ub,
        IntCC::Ne => ua != ub,
        IntCC::Slt => sa < sb,
        IntCC::Sle => sa <= sb,
        IntCC::Sgt => sa > sb,
        IntCC::Sge => sa >= sb,
        IntCC::Ult => ua < ub,
        IntCC::Ule => ua <= ub,
        IntCC::Ugt => ua > ub,
        IntCC::Uge => ua >= ub,
    }
}

/// Fold constant arithmetic and resolve branches on constant conditions.
fn fold_constants(func: &mut Function) {
    // A handful of rounds reaches the fixpoint for chains crossing blocks.
    for _ in 0..4 {
        let mut changed = false;
        for block in func.blocks().collect::<Vec<_>>() {
            let insts = func.block_insts(block).to_vec();
            for inst in insts {
                // A branch fold may have truncated the block; skip anything
                // no longer in it.
                if !func.block_insts(block).contains(&inst) {
                    continue;
                }
                match func.inst_data(inst).clone() {
                    InstData::Binary { opcode, ty, args } => {
                        let (Some((_, a)), Some((_, b))) =
                            (iconst_value(func, args[0]), iconst_value(func, args[1]))
                        else {
                            continue;
                        };
                        if let Some(imm) = fold_binary(opcode, ty, a, b) {
                            trace!("folding {inst} to {imm:#x}");
                            *func.inst_data_mut(inst) = InstData::Iconst { ty, imm };
                            changed = true;
                        }
                    }
                    InstData::IntCompare { cond, args } => {
                        let (Some((ty, a)), Some((_, b))) =
                            (iconst_value(func, args[0]), iconst_value(func, args[1]))
                        else {
                            continue;
                        };
                        let imm = fold_icmp(cond, ty, a, b) as u64;
                        *func.inst_data_mut(inst) = InstData::Iconst { ty: Type::I32, imm };
                        changed = true;
                    }
                    InstData::Brz { arg, dest, args } | InstData::Brnz { arg, dest, args } => {
                        let Some((_, c)) = iconst_value(func, arg) else {
                            continue;
                        };
                        let brz = matches!(func.inst_data(inst), InstData::Brz { .. });
                        let taken = if brz { c == 0 } else { c != 0 };
                        if taken {
                            *func.inst_data_mut(inst) = InstData::Jump { dest, args };
                            truncate_after(func, block, inst);
                        } else {
                            remove_branch(func, block, inst, dest);
                        }
                        changed = true;
                    }
                    _ => {}
                }
            }
        }
        if !changed {
            break;
        }
    }
}

/// Drop every instruction after `inst` in `block` (it became the
/// terminator), unhooking predecessor edges of dropped branches.
fn truncate_after(func: &mut Function, block: Block, inst: Inst) {
    let pos = func
        .block_insts(block)
        .iter()
        .position(|&i| i == inst)
        .unwrap();
    let dropped: Vec<Inst> = func.block_insts(block)[pos + 1..].to_vec();
    for d in dropped {
        for target in func.branch_targets(d) {
            func.blocks[target].preds.retain(|p| p.inst != d);
        }
    }
    func.blocks[block].insts.truncate(pos + 1);
}

/// Remove a never-taken conditional branch.
fn remove_branch(func: &mut Function, block: Block, inst: Inst, dest: Block) {
    func.blocks[dest].preds.retain(|p| p.inst != inst);
    func.blocks[block].insts.retain(|&i| i != inst);
}

/// Invert `brz`/`brnz` followed by `jump` when the conditional target is the
/// immediately following block, so the final jump becomes the fallthrough.
fn invert_branches(func: &mut Function) {
    for block in func.blocks().collect::<Vec<_>>() {
        let insts = func.block_insts(block);
        if insts.len() < 2 {
            continue;
        }
        let cond_inst = insts[insts.len() - 2];
        let jump_inst = insts[insts.len() - 1];
        let next = Block::from_u32(block.as_u32() + 1);

        let (brz, carg, cdest, cargs) = match func.inst_data(cond_inst) {
            InstData::Brz { arg, dest, args } => (true, *arg, *dest, args.clone()),
            InstData::Brnz { arg, dest, args } => (false, *arg, *dest, args.clone()),
            _ => continue,
        };
        let (jdest, jargs) = match func.inst_data(jump_inst) {
            InstData::Jump { dest, args } => (*dest, args.clone()),
            _ => continue,
        };
        if cdest != next || jdest == cdest || next.as_u32() >= func.num_blocks() as u32 {
            continue;
        }

        trace!("inverting branch at end of {block}");
        *func.inst_data_mut(cond_inst) = if brz {
            InstData::Brnz {
                arg: carg,
                dest: jdest,
                args: jargs,
            }
        } else {
            InstData::Brz {
                arg: carg,
                dest: jdest,
                args: jargs,
            }
        };
        *func.inst_data_mut(jump_inst) = InstData::Jump {
            dest: cdest,
            args: cargs,
        };
        for p in func.blocks[cdest].preds.iter_mut() {
            if p.inst == cond_inst {
                p.inst = jump_inst;
            }
        }
        for p in func.blocks[jdest].preds.iter_mut() {
            if p.inst == jump_inst {
                p.inst = cond_inst;
            }
        }
    }
}

/// Remove block parameters that always receive the same value, then rewrite
/// every operand so no alias survives into the back end.
fn eliminate_trivial_phis(func: &mut Function) {
    let entry = func.entry_block();
    loop {
        let mut changed = false;
        for block in func.blocks().collect::<Vec<_>>() {
            if block == entry || func.block_preds(block).is_empty() {
                continue;
            }
            let params = func.block_params(block).to_vec();
            for (i, &param) in params.iter().enumerate() {
                if func.resolve_alias(param) != param {
                    continue; // already aliased away
                }
                let mut same: Option<Value> = None;
                let mut trivial = true;
                for pred in func.block_preds(block) {
                    let args = func.branch_args(pred.inst);
                    if args.len() != params.len() {
                        // Jump-table edge: params cannot be trimmed here.
                        trivial = false;
                        break;
                    }
                    let arg = func.resolve_alias(args[i]);
                    if arg == param || Some(arg) == same {
                        continue;
                    }
                    if same.is_some() {
                        trivial = false;
                        break;
                    }
                    same = Some(arg);
                }
                if let (true, Some(v)) = (trivial, same) {
                    trace!("trivial phi {param} in {block} -> {v}");
                    func.set_alias(param, v);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    // Strip aliased parameters from blocks and from incoming branch args.
    for block in func.blocks().collect::<Vec<_>>() {
        if block == entry {
            continue;
        }
        let params = func.block_params(block).to_vec();
        let keep: Vec<bool> = params
            .iter()
            .map(|&p| func.resolve_alias(p) == p)
            .collect();
        if keep.iter().all(|&k| k) {
            continue;
        }
        let kept: Vec<Value> = params
            .iter()
            .zip(&keep)
            .filter(|&(_, &k)| k)
            .map(|(&p, _)| p)
            .collect();
        func.blocks[block].params = EntityList::from_slice(&kept, &mut func.value_pool);
        // Re-number surviving params.
        for (i, &p) in kept.iter().enumerate() {
            func.values[p].def = ValueDef::Param(block, i as u16);
        }
        let preds = func.block_preds(block).to_vec();
        for pred in preds {
            let args = func.branch_args(pred.inst).to_vec();
            if args.is_empty() {
                continue;
            }
            debug_assert_eq!(args.len(), keep.len());
            let kept_args: Vec<Value> = args
                .iter()
                .zip(&keep)
                .filter(|&(_, &k)| k)
                .map(|(&a, _)| a)
                .collect();
            let list = EntityList::from_slice(&kept_args, &mut func.value_pool);
            match func.inst_data_mut(pred.inst) {
                InstData::Jump { args, .. }
                | InstData::Brz { args, .. }
                | InstData::Brnz { args, .. } => *args = list,
                _ => unreachable!(),
            }
        }
    }

    // Resolve every remaining operand through the alias table.
    for block in func.blocks().collect::<Vec<_>>() {
        for inst in func.block_insts(block).to_vec() {
            let mut mapping = rustc_hash::FxHashMap::default();
            for a in func.inst_args(inst) {
                let r = func.resolve_alias(a);
                if r != a {
                    mapping.insert(a, r);
                }
            }
            if mapping.is_empty() {
                continue;
            }
            func.map_inst_args(inst, &mut |v| *mapping.get(&v).unwrap_or(&v));
        }
    }
}

/// Delete side-effect-free instructions whose results are unused.
fn remove_dead_code(func: &mut Function) {
    let mut uses: SecondaryMap<Value, u32> = SecondaryMap::new();
    let blocks: Vec<Block> = func.blocks().collect();
    for &block in &blocks {
        for &inst in func.block_insts(block) {
            for arg in func.inst_args(inst) {
                uses[arg] += 1;
            }
        }
    }

    let removable = |func: &Function, inst: Inst| !func.inst_data(inst).has_side_effects();
    let unused = |func: &Function, uses: &SecondaryMap<Value, u32>, inst: Inst| {
        func.inst_results(inst).iter().all(|&r| uses[r] == 0)
    };

    let mut removed: SecondaryMap<Inst, bool> = SecondaryMap::new();
    let mut worklist: Vec<Inst> = Vec::new();
    for &block in &blocks {
        for &inst in func.block_insts(block) {
            if removable(func, inst) && unused(func, &uses, inst) {
                worklist.push(inst);
            }
        }
    }
    while let Some(inst) = worklist.pop() {
        if removed[inst] || !removable(func, inst) || !unused(func, &uses, inst) {
            continue;
        }
        removed[inst] = true;
        for arg in func.inst_args(inst) {
            uses[arg] -= 1;
            if uses[arg] == 0 {
                if let ValueDef::Result(def, _) = func.value_def(arg) {
                    if removable(func, def) {
                        worklist.push(def);
                    }
                }
            }
        }
    }
    for &block in &blocks {
        func.blocks[block].insts.retain(|&i| !removed[i]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FunctionBuilder;

    #[test]
    fn folds_arith_chain() {
        let mut func = Function::new();
        let mut fb = FunctionBuilder::new(&mut func);
        let entry = fb.create_block();
        fb.switch_to_block(entry);
        fb.seal_block(entry);
        let a = fb.iconst(Type::I32, 6);
        let b = fb.iconst(Type::I32, 7);
        let m = fb.binary(Opcode::Imul, Type::I32, a, b);
        let c = fb.iconst(Type::I32, 2);
        let s = fb.binary(Opcode::Iadd, Type::I32, m, c);
        fb.return_(&[s]);

        run_passes(&mut func);
        let ret_args = {
            let last = *func.block_insts(entry).last().unwrap();
            func.inst_args(last)
        };
        assert_eq!(iconst_value(&func, ret_args[0]), Some((Type::I32, 44)));
        // The folded chain's feeders are dead now.
        assert!(func.block_insts(entry).len() <= 2);
    }

    #[test]
    fn i32_wrapping_and_masking() {
        assert_eq!(
            fold_binary(Opcode::Iadd, Type::I32, 0xffff_ffff, 1),
            Some(0)
        );
        assert_eq!(
            fold_binary(Opcode::Sshr, Type::I32, 0x8000_0000, 31),
            Some(0xffff_ffff)
        );
        assert_eq!(fold_binary(Opcode::Ishl, Type::I32, 1, 33), Some(2));
        assert!(fold_icmp(IntCC::Slt, Type::I32, 0xffff_ffff, 0));
        assert!(!fold_icmp(IntCC::Ult, Type::I32, 0xffff_ffff, 0));
    }

    #[test]
    fn never_taken_branch_is_removed() {
        let mut func = Function::new();
        let mut fb = FunctionBuilder::new(&mut func);
        let entry = fb.create_block();
        let dead = fb.create_block();
        let out = fb.create_block();
        fb.switch_to_block(entry);
        fb.seal_block(entry);
        let z = fb.iconst(Type::I32, 1);
        fb.brz(z, dead, &[]); // 1 is never zero
        fb.jump(out, &[]);
        fb.switch_to_block(dead);
        fb.jump(out, &[]);
        fb.switch_to_block(out);
        fb.return_(&[]);
        fb.seal_all_blocks();

        run_passes(&mut func);
        assert!(func.block_preds(dead).is_empty());
        // Only the jump survives in the entry block.
        assert_eq!(func.block_insts(entry).len(), 1);
    }

    #[test]
    fn always_taken_branch_becomes_jump() {
        let mut func = Function::new();
        let mut fb = FunctionBuilder::new(&mut func);
        let entry = fb.create_block();
        let taken = fb.create_block();
        let not_taken = fb.create_block();
        fb.switch_to_block(entry);
        fb.seal_block(entry);
        let z = fb.iconst(Type::I32, 0);
        fb.brz(z, taken, &[]);
        fb.jump(not_taken, &[]);
        fb.switch_to_block(taken);
        fb.return_(&[]);
        fb.switch_to_block(not_taken);
        fb.return_(&[]);
        fb.seal_all_blocks();

        run_passes(&mut func);
        assert_eq!(func.block_insts(entry).len(), 1);
        assert!(matches!(
            func.inst_data(func.block_insts(entry)[0]),
            InstData::Jump { dest, .. } if *dest == taken
        ));
        assert!(func.block_preds(not_taken).is_empty());
    }
}
