//! Textual output of functions, for logs and golden tests.

use core::fmt;

use crate::{Block, Function, Inst, InstData};

pub struct DisplayFunction<'a>(&'a Function);

impl Function {
    pub fn display(&self) -> DisplayFunction<'_> {
        DisplayFunction(self)
    }
}

impl fmt::Display for DisplayFunction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let func = self.0;
        write!(f, "function %{}(", func.name)?;
        for (i, ty) in func.signature.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{ty}")?;
        }
        write!(f, ")")?;
        if !func.signature.returns.is_empty() {
            write!(f, " -> ")?;
            for (i, ty) in func.signature.returns.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{ty}")?;
            }
        }
        writeln!(f, " {{")?;
        // Layout order once computed, creation order before that.
        let order: Vec<Block> = if func.layout.is_empty() {
            func.blocks().collect()
        } else {
            func.layout.clone()
        };
        for (i, &block) in order.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write_block(f, func, block)?;
        }
        writeln!(f, "}}")
    }
}

fn write_block(f: &mut fmt::Formatter, func: &Function, block: Block) -> fmt::Result {
    write!(f, "{block}")?;
    let params = func.block_params(block);
    if !params.is_empty() {
        write!(f, "(")?;
        for (i, &p) in params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}: {}", func.value_type(p))?;
        }
        write!(f, ")")?;
    }
    writeln!(f, ":")?;
    for &inst in func.block_insts(block) {
        write_inst(f, func, inst)?;
    }
    Ok(())
}

fn write_args(f: &mut fmt::Formatter, args: &[crate::Value]) -> fmt::Result {
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{a}")?;
    }
    Ok(())
}

fn write_branch_target(
    f: &mut fmt::Formatter,
    dest: Block,
    args: &[crate::Value],
) -> fmt::Result {
    write!(f, "{dest}")?;
    if !args.is_empty() {
        write!(f, "(")?;
        write_args(f, args)?;
        write!(f, ")")?;
    }
    Ok(())
}

fn write_inst(f: &mut fmt::Formatter, func: &Function, inst: Inst) -> fmt::Result {
    write!(f, "    ")?;
    let results = func.inst_results(inst);
    if !results.is_empty() {
        write_args(f, results)?;
        write!(f, " = ")?;
    }
    use InstData::*;
    match func.inst_data(inst) {
        Nop => write!(f, "nop")?,
        GetExecCtx => write!(f, "get_exec_ctx")?,
        Iconst { ty, imm } => write!(f, "iconst.{ty} {imm:#x}")?,
        F32const { bits } => write!(f, "f32const {:#x}", bits)?,
        F64const { bits } => write!(f, "f64const {:#x}", bits)?,
        Vconst { bits } => write!(f, "vconst {bits:#x}")?,
        Unary { opcode, ty, arg } => write!(f, "{opcode}.{ty} {arg}")?,
        Binary { opcode, ty, args } => write!(f, "{opcode}.{ty} {}, {}", args[0], args[1])?,
        IntCompare { cond, args } => write!(f, "icmp {cond} {}, {}", args[0], args[1])?,
        FloatCompare { cond, args } => write!(f, "fcmp {cond} {}, {}", args[0], args[1])?,
        Select { args } => write!(f, "select {}, {}, {}", args[0], args[1], args[2])?,
        Load {
            opcode,
            ty,
            addr,
            offset,
        } => write!(f, "{opcode}.{ty} {addr}+{offset}")?,
        Store { opcode, args, offset } => {
            write!(f, "{opcode} {}, {}+{offset}", args[0], args[1])?
        }
        Splat { lanes, arg } => write!(f, "splat.{} {arg}", lanes.name())?,
        ExtractLane { lanes, lane, arg } => {
            write!(f, "extractlane.{} {arg}, {lane}", lanes.name())?
        }
        InsertLane { lanes, lane, args } => write!(
            f,
            "insertlane.{} {}, {}, {lane}",
            lanes.name(),
            args[0],
            args[1]
        )?,
        VecBinary { opcode, lanes, args } => {
            write!(f, "{opcode}.{} {}, {}", lanes.name(), args[0], args[1])?
        }
        AtomicLoad { ty, addr } => write!(f, "atomic_load.{ty} {addr}")?,
        AtomicStore { ty, args } => write!(f, "atomic_store.{ty} {}, {}", args[0], args[1])?,
        AtomicRmw { op, ty, args } => write!(
            f,
            "atomic_rmw.{ty} {} {}, {}",
            op.name(),
            args[0],
            args[1]
        )?,
        AtomicCas { ty, args } => write!(
            f,
            "atomic_cas.{ty} {}, {}, {}",
            args[0], args[1], args[2]
        )?,
        Fence => write!(f, "fence")?,
        Jump { dest, args } => {
            write!(f, "jump ")?;
            write_branch_target(f, *dest, args.as_slice(&func.value_pool))?;
        }
        Brz { arg, dest, args } => {
            write!(f, "brz {arg}, ")?;
            write_branch_target(f, *dest, args.as_slice(&func.value_pool))?;
        }
        Brnz { arg, dest, args } => {
            write!(f, "brnz {arg}, ")?;
            write_branch_target(f, *dest, args.as_slice(&func.value_pool))?;
        }
        BrTable { arg, table } => {
            let data = &func.jump_tables[*table];
            write!(f, "br_table {arg}, [")?;
            for (i, t) in data.targets.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{t}")?;
            }
            write!(f, "], default {}", data.default)?;
        }
        Call { func: callee, args } => {
            let data = &func.ext_funcs[*callee];
            write!(f, "call fn{}(", data.index)?;
            write_args(f, args.as_slice(&func.value_pool))?;
            write!(f, ")")?;
        }
        CallIndirect { sig, args } => {
            write!(f, "call_indirect {sig}(")?;
            write_args(f, args.as_slice(&func.value_pool))?;
            write!(f, ")")?;
        }
        Return { args } => {
            write!(f, "return")?;
            let args = args.as_slice(&func.value_pool);
            if !args.is_empty() {
                write!(f, " ")?;
                write_args(f, args)?;
            }
        }
        Trap { code } => write!(f, "trap {}", code.name())?,
    }
    writeln!(f)
}

#[cfg(test)]
mod tests {
    use crate::{FunctionBuilder, Function, IntCC, Opcode, Signature, Type};

    #[test]
    fn golden_print() {
        let mut func = Function::new();
        func.name = "demo".to_string();
        func.signature = Signature::new(vec![Type::I64, Type::I32], vec![Type::I32]);
        let mut fb = FunctionBuilder::new(&mut func);
        let entry = fb.create_block();
        let exit = fb.create_block();
        fb.switch_to_block(entry);
        let _ctx = fb.func.append_block_param(entry, Type::I64);
        let n = fb.func.append_block_param(entry, Type::I32);
        fb.seal_block(entry);
        let one = fb.iconst(Type::I32, 1);
        let sum = fb.binary(Opcode::Iadd, Type::I32, n, one);
        let cmp = fb.icmp(IntCC::Eq, sum, one);
        fb.brnz(cmp, exit, &[sum]);
        fb.jump(exit, &[cmp]);
        fb.switch_to_block(exit);
        let r = fb.func.append_block_param(exit, Type::I32);
        fb.return_(&[r]);
        fb.seal_all_blocks();

        let expect = "\
function %demo(i64, i32) -> i32 {
block0(v0: i64, v1: i32):
    v2 = iconst.i32 0x1
    v3 = iadd.i32 v1, v2
    v4 = icmp eq v3, v2
    brnz v4, block1(v3)
    jump block1(v4)

block1(v5: i32):
    return v5
}
";
        assert_eq!(func.display().to_string(), expect);
    }
}
