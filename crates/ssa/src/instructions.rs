//! Instruction formats, opcodes and condition codes.

use core::fmt;

use cranelift_entity::EntityList;

use crate::{Block, FuncRef, JumpTable, Sig, Type, Value};

/// Opcodes for the register-shaped instruction formats. Control flow, calls
/// and constants have dedicated [`InstData`] variants instead.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Opcode {
    // Integer unary.
    Clz,
    Ctz,
    Popcnt,
    /// Zero-extend an i32 to i64.
    UextendI32,
    /// Sign-extend an i32 to i64.
    SextendI32,
    /// Truncate an i64 to i32.
    Ireduce,
    /// Sign-extend the low 8 bits in place.
    ExtendS8,
    /// Sign-extend the low 16 bits in place.
    ExtendS16,
    /// Sign-extend the low 32 bits of an i64 in place.
    ExtendS32,

    // Float unary.
    Fabs,
    Fneg,
    Fsqrt,
    Ceil,
    Floor,
    Trunc,
    Nearest,

    // Conversions. Source type comes from the operand, destination from the
    // instruction's controlling type.
    FcvtToSint,
    FcvtToUint,
    FcvtToSintSat,
    FcvtToUintSat,
    FcvtFromSint,
    FcvtFromUint,
    Fpromote,
    Fdemote,
    Bitcast,

    // Integer binary.
    Iadd,
    Isub,
    Imul,
    Udiv,
    Sdiv,
    Urem,
    Srem,
    Band,
    Bor,
    Bxor,
    Ishl,
    Ushr,
    Sshr,
    Rotl,
    Rotr,

    // Float binary.
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Fmin,
    Fmax,

    // Lane-wise vector binary.
    Viadd,
    Visub,

    // Loads.
    Load,
    Uload8,
    Sload8,
    Uload16,
    Sload16,
    Uload32,
    Sload32,

    // Stores.
    Store,
    Istore8,
    Istore16,
    Istore32,
}

impl Opcode {
    pub fn is_load(self) -> bool {
        matches!(
            self,
            Opcode::Load
                | Opcode::Uload8
                | Opcode::Sload8
                | Opcode::Uload16
                | Opcode::Sload16
                | Opcode::Uload32
                | Opcode::Sload32
        )
    }

    pub fn is_store(self) -> bool {
        matches!(
            self,
            Opcode::Store | Opcode::Istore8 | Opcode::Istore16 | Opcode::Istore32
        )
    }

    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Clz => "clz",
            Ctz => "ctz",
            Popcnt => "popcnt",
            UextendI32 => "uextend",
            SextendI32 => "sextend",
            Ireduce => "ireduce",
            ExtendS8 => "extend8_s",
            ExtendS16 => "extend16_s",
            ExtendS32 => "extend32_s",
            Fabs => "fabs",
            Fneg => "fneg",
            Fsqrt => "fsqrt",
            Ceil => "ceil",
            Floor => "floor",
            Trunc => "trunc",
            Nearest => "nearest",
            FcvtToSint => "fcvt_to_sint",
            FcvtToUint => "fcvt_to_uint",
            FcvtToSintSat => "fcvt_to_sint_sat",
            FcvtToUintSat => "fcvt_to_uint_sat",
            FcvtFromSint => "fcvt_from_sint",
            FcvtFromUint => "fcvt_from_uint",
            Fpromote => "fpromote",
            Fdemote => "fdemote",
            Bitcast => "bitcast",
            Iadd => "iadd",
            Isub => "isub",
            Imul => "imul",
            Udiv => "udiv",
            Sdiv => "sdiv",
            Urem => "urem",
            Srem => "srem",
            Band => "band",
            Bor => "bor",
            Bxor => "bxor",
            Ishl => "ishl",
            Ushr => "ushr",
            Sshr => "sshr",
            Rotl => "rotl",
            Rotr => "rotr",
            Fadd => "fadd",
            Fsub => "fsub",
            Fmul => "fmul",
            Fdiv => "fdiv",
            Fmin => "fmin",
            Fmax => "fmax",
            Viadd => "viadd",
            Visub => "visub",
            Load => "load",
            Uload8 => "uload8",
            Sload8 => "sload8",
            Uload16 => "uload16",
            Sload16 => "sload16",
            Uload32 => "uload32",
            Sload32 => "sload32",
            Store => "store",
            Istore8 => "istore8",
            Istore16 => "istore16",
            Istore32 => "istore32",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Integer comparison condition.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum IntCC {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl IntCC {
    /// The condition that holds exactly when `self` does not.
    pub fn inverse(self) -> IntCC {
        use IntCC::*;
        match self {
            Eq => Ne,
            Ne => Eq,
            Slt => Sge,
            Sge => Slt,
            Sle => Sgt,
            Sgt => Sle,
            Ult => Uge,
            Uge => Ult,
            Ule => Ugt,
            Ugt => Ule,
        }
    }

    pub fn name(self) -> &'static str {
        use IntCC::*;
        match self {
            Eq => "eq",
            Ne => "ne",
            Slt => "slt",
            Sle => "sle",
            Sgt => "sgt",
            Sge => "sge",
            Ult => "ult",
            Ule => "ule",
            Ugt => "ugt",
            Uge => "uge",
        }
    }
}

impl fmt::Display for IntCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Float comparison condition with wasm semantics: all comparisons are false
/// on NaN except `Ne`, which is true.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum FloatCC {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FloatCC {
    pub fn name(self) -> &'static str {
        use FloatCC::*;
        match self {
            Eq => "eq",
            Ne => "ne",
            Lt => "lt",
            Le => "le",
            Gt => "gt",
            Ge => "ge",
        }
    }
}

impl fmt::Display for FloatCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Atomic read-modify-write operation selector.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum AtomicRmwOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Xchg,
}

impl AtomicRmwOp {
    pub fn name(self) -> &'static str {
        match self {
            AtomicRmwOp::Add => "add",
            AtomicRmwOp::Sub => "sub",
            AtomicRmwOp::And => "and",
            AtomicRmwOp::Or => "or",
            AtomicRmwOp::Xor => "xor",
            AtomicRmwOp::Xchg => "xchg",
        }
    }
}

/// Lane interpretation of a v128 value.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum VecLanes {
    I8x16,
    I16x8,
    I32x4,
    I64x2,
    F32x4,
    F64x2,
}

impl VecLanes {
    /// The scalar type of one lane.
    pub fn lane_type(self) -> Type {
        match self {
            VecLanes::I8x16 | VecLanes::I16x8 | VecLanes::I32x4 => Type::I32,
            VecLanes::I64x2 => Type::I64,
            VecLanes::F32x4 => Type::F32,
            VecLanes::F64x2 => Type::F64,
        }
    }

    pub fn lane_count(self) -> u8 {
        match self {
            VecLanes::I8x16 => 16,
            VecLanes::I16x8 => 8,
            VecLanes::I32x4 => 4,
            VecLanes::I64x2 => 2,
            VecLanes::F32x4 => 4,
            VecLanes::F64x2 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            VecLanes::I8x16 => "i8x16",
            VecLanes::I16x8 => "i16x8",
            VecLanes::I32x4 => "i32x4",
            VecLanes::I64x2 => "i64x2",
            VecLanes::F32x4 => "f32x4",
            VecLanes::F64x2 => "f64x2",
        }
    }
}

/// The trap reason carried by a `trap` terminator. The back end turns this
/// into the corresponding runtime exit code.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum TrapCode {
    Unreachable,
    MemoryOutOfBounds,
    TableOutOfBounds,
    IndirectCallNullPointer,
    IndirectCallTypeMismatch,
    IntegerOverflow,
    IntegerDivisionByZero,
    InvalidConversionToInteger,
}

impl TrapCode {
    pub fn name(self) -> &'static str {
        use TrapCode::*;
        match self {
            Unreachable => "unreachable",
            MemoryOutOfBounds => "heap_oob",
            TableOutOfBounds => "table_oob",
            IndirectCallNullPointer => "icall_null",
            IndirectCallTypeMismatch => "bad_sig",
            IntegerOverflow => "int_ovf",
            IntegerDivisionByZero => "int_divz",
            InvalidConversionToInteger => "bad_toint",
        }
    }
}

/// Instruction payload. One variant per operand format.
#[derive(Clone, Debug)]
pub enum InstData {
    Nop,
    /// The execution-context pointer, which rides in a pinned register.
    GetExecCtx,
    Iconst {
        ty: Type,
        imm: u64,
    },
    F32const {
        bits: u32,
    },
    F64const {
        bits: u64,
    },
    Vconst {
        bits: u128,
    },
    Unary {
        opcode: Opcode,
        ty: Type,
        arg: Value,
    },
    Binary {
        opcode: Opcode,
        ty: Type,
        args: [Value; 2],
    },
    IntCompare {
        cond: IntCC,
        args: [Value; 2],
    },
    FloatCompare {
        cond: FloatCC,
        args: [Value; 2],
    },
    /// `select cond, a, b`: `a` if `cond` is non-zero, else `b`.
    Select {
        args: [Value; 3],
    },
    Load {
        opcode: Opcode,
        ty: Type,
        addr: Value,
        offset: u32,
    },
    /// `args` are `[value, addr]`.
    Store {
        opcode: Opcode,
        args: [Value; 2],
        offset: u32,
    },
    Splat {
        lanes: VecLanes,
        arg: Value,
    },
    ExtractLane {
        lanes: VecLanes,
        lane: u8,
        arg: Value,
    },
    /// `args` are `[vector, scalar]`.
    InsertLane {
        lanes: VecLanes,
        lane: u8,
        args: [Value; 2],
    },
    VecBinary {
        opcode: Opcode,
        lanes: VecLanes,
        args: [Value; 2],
    },
    AtomicLoad {
        ty: Type,
        addr: Value,
    },
    /// `args` are `[value, addr]`.
    AtomicStore {
        ty: Type,
        args: [Value; 2],
    },
    /// `args` are `[addr, operand]`; result is the old value.
    AtomicRmw {
        op: AtomicRmwOp,
        ty: Type,
        args: [Value; 2],
    },
    /// `args` are `[addr, expected, replacement]`; result is the old value.
    AtomicCas {
        ty: Type,
        args: [Value; 3],
    },
    Fence,
    Jump {
        dest: Block,
        args: EntityList<Value>,
    },
    /// Branch to `dest` if `arg` is zero.
    Brz {
        arg: Value,
        dest: Block,
        args: EntityList<Value>,
    },
    /// Branch to `dest` if `arg` is non-zero.
    Brnz {
        arg: Value,
        dest: Block,
        args: EntityList<Value>,
    },
    /// Indexed branch; out-of-range indices go to the table's default.
    /// Jump-table edges carry no block arguments.
    BrTable {
        arg: Value,
        table: JumpTable,
    },
    /// Direct call. `args` are `[callee_module_ctx, wasm args...]`.
    Call {
        func: FuncRef,
        args: EntityList<Value>,
    },
    /// Indirect call. `args` are
    /// `[executable_ptr, callee_module_ctx, wasm args...]`.
    CallIndirect {
        sig: Sig,
        args: EntityList<Value>,
    },
    Return {
        args: EntityList<Value>,
    },
    Trap {
        code: TrapCode,
    },
}

impl InstData {
    /// Whether this instruction ends its block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstData::Jump { .. }
                | InstData::BrTable { .. }
                | InstData::Return { .. }
                | InstData::Trap { .. }
        )
    }

    /// Whether this instruction is any kind of branch.
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            InstData::Jump { .. }
                | InstData::Brz { .. }
                | InstData::Brnz { .. }
                | InstData::BrTable { .. }
        )
    }

    /// Whether the instruction must stay even if its results are unused.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            InstData::Store { .. }
                | InstData::AtomicLoad { .. }
                | InstData::AtomicStore { .. }
                | InstData::AtomicRmw { .. }
                | InstData::AtomicCas { .. }
                | InstData::Fence
                | InstData::Jump { .. }
                | InstData::Brz { .. }
                | InstData::Brnz { .. }
                | InstData::BrTable { .. }
                | InstData::Call { .. }
                | InstData::CallIndirect { .. }
                | InstData::Return { .. }
                | InstData::Trap { .. }
        )
    }
}
