//! Whole-pipeline tests: wasm module → SSA → passes → machine code.

use kestrel_environ::{
    BlockType, FuncType, FunctionBody, MemArg, MemoryPlan, Module, ModuleContextOffsets, ModuleId,
    Operator as O, ValType,
};
use kestrel_frontend::{translate_function, TranslationConfig};
use kestrel_ssa::{layout_blocks, passes, DominatorTree, Function, LoopAnalysis};

use crate::aarch64::AArch64;
use crate::Machine;

fn compile(module: &Module, index: u32) -> crate::CompiledFunction {
    let _ = env_logger::builder().is_test(true).try_init();
    let offsets = ModuleContextOffsets::new(module);
    let mut func = Function::new();
    translate_function(
        module,
        &offsets,
        kestrel_environ::DefinedFuncIndex::from_u32(index),
        TranslationConfig::default(),
        &mut func,
    )
    .unwrap();
    passes::run_passes(&mut func);
    let dt = DominatorTree::compute(&func);
    let la = LoopAnalysis::compute(&func, &dt);
    layout_blocks(&mut func, &dt, &la);
    AArch64.compile_function(&func, true).unwrap()
}

fn simple_module(ops: Vec<O>, params: Vec<ValType>, results: Vec<ValType>) -> Module {
    let mut m = Module::new(ModuleId::from_bytes(b"cg"));
    let ty = m.types.push(FuncType::new(params, results));
    m.functions.push(ty);
    m.code.push(FunctionBody {
        locals: vec![],
        operators: ops,
    });
    m
}

#[test]
fn compiles_consts() {
    let m = simple_module(
        vec![
            O::I32Const { value: 1 },
            O::I64Const { value: 2 },
            O::F32Const {
                bits: 32.0f32.to_bits(),
            },
            O::F64Const {
                bits: 64.0f64.to_bits(),
            },
            O::End,
        ],
        vec![],
        vec![ValType::I32, ValType::I64, ValType::F32, ValType::F64],
    );
    let cf = compile(&m, 0);
    assert!(cf.preamble_size > 0);
    assert!(cf.body.len() as u32 > cf.preamble_size);
    assert!(cf.relocs.is_empty());
    assert_eq!(cf.body.len() % 4, 0);
}

#[test]
fn recursive_call_records_relocation() {
    // fib-shaped: two self-calls.
    let m = simple_module(
        vec![
            O::LocalGet { index: 0 },
            O::I32Const { value: 2 },
            O::I32LtS,
            O::If {
                ty: BlockType::Value(ValType::I32),
            },
            O::LocalGet { index: 0 },
            O::Else,
            O::LocalGet { index: 0 },
            O::I32Const { value: 1 },
            O::I32Sub,
            O::Call {
                function: kestrel_environ::FuncIndex::from_u32(0),
            },
            O::LocalGet { index: 0 },
            O::I32Const { value: 2 },
            O::I32Sub,
            O::Call {
                function: kestrel_environ::FuncIndex::from_u32(0),
            },
            O::I32Add,
            O::End,
            O::End,
        ],
        vec![ValType::I32],
        vec![ValType::I32],
    );
    let cf = compile(&m, 0);
    assert_eq!(cf.relocs.len(), 2);
    for r in &cf.relocs {
        assert_eq!(r.target, 0);
        assert!(r.offset < cf.body.len() as u32);
        // The call site holds a `bl` with zero displacement awaiting the
        // engine's patch.
        let word = u32::from_le_bytes(
            cf.body[r.offset as usize..r.offset as usize + 4]
                .try_into()
                .unwrap(),
        );
        assert_eq!(word, 0x9400_0000);
    }
}

#[test]
fn memory_access_compiles_with_bounds_checks() {
    let mut m = simple_module(
        vec![
            O::LocalGet { index: 0 },
            O::I32Load {
                memarg: MemArg { offset: 16 },
            },
            O::End,
        ],
        vec![ValType::I32],
        vec![ValType::I32],
    );
    m.memory = Some(MemoryPlan {
        minimum: 1,
        maximum: None,
        imported: false,
        shared: false,
    });
    let cf = compile(&m, 0);
    // Bounds check plus trap exit sequence make this considerably larger
    // than the load alone.
    assert!(cf.body.len() > 40 * 4);
}

#[test]
fn loops_and_branch_fusion() {
    // Busy loop counting down from the argument.
    let m = simple_module(
        vec![
            O::Block {
                ty: BlockType::Empty,
            },
            O::Loop {
                ty: BlockType::Empty,
            },
            O::LocalGet { index: 0 },
            O::I32Eqz,
            O::BrIf { depth: 1 },
            O::LocalGet { index: 0 },
            O::I32Const { value: 1 },
            O::I32Sub,
            O::LocalSet { index: 0 },
            O::Br { depth: 0 },
            O::End,
            O::End,
            O::LocalGet { index: 0 },
            O::End,
        ],
        vec![ValType::I32],
        vec![ValType::I32],
    );
    let cf = compile(&m, 0);
    assert!(!cf.body.is_empty());
}

#[test]
fn float_arith_and_conversions() {
    let m = simple_module(
        vec![
            O::LocalGet { index: 0 },
            O::F64Sqrt,
            O::LocalGet { index: 1 },
            O::F64Add,
            O::I32TruncF64S,
            O::End,
        ],
        vec![ValType::F64, ValType::F64],
        vec![ValType::I32],
    );
    let cf = compile(&m, 0);
    assert!(!cf.body.is_empty());
}

#[test]
fn div_rem_guards_compile() {
    let m = simple_module(
        vec![
            O::LocalGet { index: 0 },
            O::LocalGet { index: 1 },
            O::I64DivS,
            O::LocalGet { index: 0 },
            O::LocalGet { index: 1 },
            O::I64RemU,
            O::I64Xor,
            O::End,
        ],
        vec![ValType::I64, ValType::I64],
        vec![ValType::I64],
    );
    let cf = compile(&m, 0);
    assert!(!cf.body.is_empty());
}

#[test]
fn simd_subset_compiles() {
    let m = simple_module(
        vec![
            O::LocalGet { index: 0 },
            O::I32x4Splat,
            O::LocalGet { index: 0 },
            O::I32x4Splat,
            O::I32x4Add,
            O::I32x4ExtractLane { lane: 2 },
            O::End,
        ],
        vec![ValType::I32],
        vec![ValType::I32],
    );
    let cf = compile(&m, 0);
    assert!(!cf.body.is_empty());
}

#[test]
fn br_table_compiles() {
    let m = simple_module(
        vec![
            O::Block {
                ty: BlockType::Empty,
            },
            O::Block {
                ty: BlockType::Empty,
            },
            O::Block {
                ty: BlockType::Empty,
            },
            O::LocalGet { index: 0 },
            O::BrTable {
                targets: vec![0, 1],
                default: 2,
            },
            O::End,
            O::I32Const { value: 10 },
            O::Return,
            O::End,
            O::I32Const { value: 20 },
            O::Return,
            O::End,
            O::I32Const { value: 30 },
            O::End,
        ],
        vec![ValType::I32],
        vec![ValType::I32],
    );
    let cf = compile(&m, 0);
    assert!(!cf.body.is_empty());
}

#[test]
fn unsupported_target_is_rejected() {
    let triple: target_lexicon::Triple = "x86_64-unknown-linux-gnu".parse().unwrap();
    assert!(crate::lookup(&triple).is_err());
}
