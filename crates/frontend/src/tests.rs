use kestrel_environ::{
    BlockType, FuncType, FunctionBody, MemArg, MemoryPlan, Module, ModuleContextOffsets, ModuleId,
    Operator as O, ValType,
};
use kestrel_ssa::{layout_blocks, passes, DominatorTree, Function, LoopAnalysis};

use crate::{translate_function, TranslationConfig};

fn one_function_module(
    params: Vec<ValType>,
    results: Vec<ValType>,
    operators: Vec<O>,
) -> Module {
    let mut m = Module::new(ModuleId::from_bytes(b"test"));
    let ty = m.types.push(FuncType::new(params, results));
    m.functions.push(ty);
    m.code.push(FunctionBody {
        locals: vec![],
        operators,
    });
    m
}

fn translate(module: &Module) -> Function {
    let _ = env_logger::builder().is_test(true).try_init();
    let offsets = ModuleContextOffsets::new(module);
    let mut func = Function::new();
    translate_function(
        module,
        &offsets,
        kestrel_environ::DefinedFuncIndex::from_u32(0),
        TranslationConfig::default(),
        &mut func,
    )
    .unwrap();
    func
}

fn finish(func: &mut Function) {
    passes::run_passes(func);
    let dt = DominatorTree::compute(func);
    let la = LoopAnalysis::compute(func, &dt);
    layout_blocks(func, &dt, &la);
}

#[test]
fn add_function() {
    let m = one_function_module(
        vec![ValType::I32, ValType::I32],
        vec![ValType::I32],
        vec![
            O::LocalGet { index: 0 },
            O::LocalGet { index: 1 },
            O::I32Add,
            O::End,
        ],
    );
    let mut func = translate(&m);
    finish(&mut func);
    // The exit block's parameter is a single-predecessor φ, so the pass
    // pipeline folds it away.
    let expect = "\
function %$0(i64, i32, i32) -> i32 {
block0(v0: i64, v1: i32, v2: i32):
    v3 = iadd.i32 v1, v2
    jump block1

block1:
    return v3
}
";
    assert_eq!(func.display().to_string(), expect);
}

#[test]
fn if_else_lowers_to_diamond() {
    // max(a, b) via if/else.
    let m = one_function_module(
        vec![ValType::I32, ValType::I32],
        vec![ValType::I32],
        vec![
            O::LocalGet { index: 0 },
            O::LocalGet { index: 1 },
            O::I32GtS,
            O::If {
                ty: BlockType::Value(ValType::I32),
            },
            O::LocalGet { index: 0 },
            O::Else,
            O::LocalGet { index: 1 },
            O::End,
            O::End,
        ],
    );
    let mut func = translate(&m);
    finish(&mut func);
    let printed = func.display().to_string();
    assert!(printed.contains("icmp sgt"), "{printed}");
    assert!(printed.contains("brz"), "{printed}");
    // The if-result merge block carries one parameter.
    let order = func.layout_order().to_vec();
    let merge = order
        .iter()
        .find(|&&b| func.block_preds(b).len() == 2)
        .copied()
        .expect("diamond merge exists");
    assert_eq!(func.block_params(merge).len(), 1);
}

#[test]
fn loop_sums_with_header_phis() {
    // sum = 0; i = n; while (i != 0) { sum += i; i -= 1 } return sum
    let m = {
        let mut m = Module::new(ModuleId::from_bytes(b"loop"));
        let ty = m.types.push(FuncType::new(vec![ValType::I32], vec![ValType::I32]));
        m.functions.push(ty);
        m.code.push(FunctionBody {
            locals: vec![(2, ValType::I32)], // sum, i
            operators: vec![
                O::LocalGet { index: 0 },
                O::LocalSet { index: 2 }, // i = n
                O::Block {
                    ty: BlockType::Empty,
                },
                O::Loop {
                    ty: BlockType::Empty,
                },
                O::LocalGet { index: 2 },
                O::I32Eqz,
                O::BrIf { depth: 1 },
                O::LocalGet { index: 1 },
                O::LocalGet { index: 2 },
                O::I32Add,
                O::LocalSet { index: 1 },
                O::LocalGet { index: 2 },
                O::I32Const { value: 1 },
                O::I32Sub,
                O::LocalSet { index: 2 },
                O::Br { depth: 0 },
                O::End,
                O::End,
                O::LocalGet { index: 1 },
                O::End,
            ],
        });
        m
    };
    let mut func = translate(&m);
    finish(&mut func);
    let printed = func.display().to_string();
    // The loop header must carry φ parameters for sum and i.
    let dt = DominatorTree::compute(&func);
    let la = LoopAnalysis::compute(&func, &dt);
    let header = la.headers()[0];
    assert_eq!(func.block_params(header).len(), 2, "{printed}");
}

#[test]
fn memory_load_emits_bounds_check() {
    let mut m = one_function_module(
        vec![ValType::I32],
        vec![ValType::I32],
        vec![
            O::LocalGet { index: 0 },
            O::I32Load {
                memarg: MemArg { offset: 4 },
            },
            O::End,
        ],
    );
    m.memory = Some(MemoryPlan {
        minimum: 1,
        maximum: None,
        imported: false,
        shared: false,
    });
    let mut func = translate(&m);
    finish(&mut func);
    let printed = func.display().to_string();
    assert!(printed.contains("trap heap_oob"), "{printed}");
    assert!(printed.contains("icmp ugt"), "{printed}");
    assert!(printed.contains("load.i32"), "{printed}");
}

#[test]
fn division_guards() {
    let m = one_function_module(
        vec![ValType::I32, ValType::I32],
        vec![ValType::I32],
        vec![
            O::LocalGet { index: 0 },
            O::LocalGet { index: 1 },
            O::I32DivS,
            O::End,
        ],
    );
    let mut func = translate(&m);
    finish(&mut func);
    let printed = func.display().to_string();
    assert!(printed.contains("trap int_divz"), "{printed}");
    assert!(printed.contains("trap int_ovf"), "{printed}");
    assert!(printed.contains("sdiv"), "{printed}");
}

#[test]
fn br_table_goes_through_case_blocks() {
    let m = one_function_module(
        vec![ValType::I32],
        vec![ValType::I32],
        vec![
            O::Block {
                ty: BlockType::Empty,
            },
            O::Block {
                ty: BlockType::Empty,
            },
            O::LocalGet { index: 0 },
            O::BrTable {
                targets: vec![0, 1],
                default: 1,
            },
            O::End,
            O::I32Const { value: 7 },
            O::Return,
            O::End,
            O::I32Const { value: 8 },
            O::End,
        ],
    );
    let mut func = translate(&m);
    finish(&mut func);
    let printed = func.display().to_string();
    assert!(printed.contains("br_table"), "{printed}");
}

#[test]
fn unreachable_code_is_skipped() {
    let m = one_function_module(
        vec![],
        vec![ValType::I32],
        vec![
            O::I32Const { value: 1 },
            O::Return,
            // Dead code after return, still well-nested.
            O::Block {
                ty: BlockType::Empty,
            },
            O::I32Const { value: 2 },
            O::Drop,
            O::End,
            O::End,
        ],
    );
    let mut func = translate(&m);
    finish(&mut func);
    let printed = func.display().to_string();
    assert!(printed.contains("return"), "{printed}");
}
