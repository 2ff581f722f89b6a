//! End-to-end execution scenarios. These enter generated code, so they run
//! only on aarch64 hosts.

use std::sync::Arc;

use kestrel_environ::{
    BlockType, FuncIndex, FuncType, MemArg, Operator as O, TableIndex, ValType,
};
use kestrel_runtime::{Engine, EngineConfig, HostFunction, RuntimeError};

use crate::helpers::{engine, engine_with, ModuleBuilder};

#[test]
fn consts() {
    let e = engine();
    let mut b = ModuleBuilder::new(b"consts");
    let ty = b.ty(
        vec![],
        vec![ValType::I32, ValType::I64, ValType::F32, ValType::F64],
    );
    b.func(
        ty,
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
    );
    let m = b.build();
    e.compile_module(m.clone()).unwrap();
    let inst = e.new_module_engine(&m).unwrap();
    let mut f = inst.new_function(FuncIndex::from_u32(0)).unwrap();
    let results = f.call(&[]).unwrap();
    assert_eq!(results, vec![1, 2, 0x42000000, 0x4050000000000000]);
    // Determinism: a second independent instance returns the same values.
    let inst2 = e.new_module_engine(&m).unwrap();
    let mut f2 = inst2.new_function(FuncIndex::from_u32(0)).unwrap();
    assert_eq!(f2.call(&[]).unwrap(), results);
}

fn fib_module() -> Arc<kestrel_environ::Module> {
    let mut b = ModuleBuilder::new(b"fib");
    let ty = b.ty(vec![ValType::I32], vec![ValType::I32]);
    let f = b.func(
        ty,
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
                function: FuncIndex::from_u32(0),
            },
            O::LocalGet { index: 0 },
            O::I32Const { value: 2 },
            O::I32Sub,
            O::Call {
                function: FuncIndex::from_u32(0),
            },
            O::I32Add,
            O::End,
            O::End,
        ],
    );
    b.name_func(f, "fib");
    b.build()
}

#[test]
fn recursive_fibonacci() {
    let e = engine();
    let m = fib_module();
    e.compile_module(m.clone()).unwrap();
    let inst = e.new_module_engine(&m).unwrap();
    let mut fib = inst.new_function(FuncIndex::from_u32(0)).unwrap();
    for (n, expect) in [(0, 0), (1, 1), (10, 55), (20, 6765), (30, 0xcb228)] {
        assert_eq!(fib.call(&[n]).unwrap(), vec![expect], "fib({n})");
    }
}

#[test]
fn fibonacci_from_cache() {
    let cache = Arc::new(kestrel_runtime::InMemoryCache::new());
    let m = fib_module();
    {
        let e = engine_with(EngineConfig {
            cache: Some(cache.clone()),
            ..Default::default()
        });
        e.compile_module(m.clone()).unwrap();
    }
    let e = engine_with(EngineConfig {
        cache: Some(cache),
        ..Default::default()
    });
    e.compile_module(m.clone()).unwrap();
    let inst = e.new_module_engine(&m).unwrap();
    let mut fib = inst.new_function(FuncIndex::from_u32(0)).unwrap();
    assert_eq!(fib.call(&[20]).unwrap(), vec![6765]);
}

#[test]
fn unbounded_recursion_reports_stack_overflow_and_stays_usable() {
    let e = engine_with(EngineConfig {
        call_stack_ceiling: 100_000,
        ..Default::default()
    });
    let mut b = ModuleBuilder::new(b"overflow");
    let ty = b.ty(vec![], vec![]);
    let f = b.func(
        ty,
        vec![
            O::Call {
                function: FuncIndex::from_u32(0),
            },
            O::End,
        ],
    );
    b.name_func(f, "main");
    let m = b.build();
    e.compile_module(m.clone()).unwrap();
    let inst = e.new_module_engine(&m).unwrap();
    let mut main = inst.new_function(FuncIndex::from_u32(0)).unwrap();
    for _ in 0..3 {
        let err = main.call(&[]).unwrap_err();
        assert_eq!(err.to_string(), "wasm error: stack overflow");
    }
}

#[test]
fn imported_host_functions() {
    let e = engine();
    let host = e
        .new_host_module(
            "env",
            vec![
                HostFunction::new(
                    "square",
                    FuncType::new(
                        vec![ValType::I32, ValType::I64, ValType::F32, ValType::F64],
                        vec![ValType::I32, ValType::I64, ValType::F32, ValType::F64],
                    ),
                    |stack| {
                        let a = stack[0] as u32;
                        let b = stack[1];
                        let c = f32::from_bits(stack[2] as u32);
                        let d = f64::from_bits(stack[3]);
                        stack[0] = u64::from(a * a);
                        stack[1] = b * b;
                        stack[2] = u64::from((c * c).to_bits());
                        stack[3] = (d * d).to_bits();
                    },
                ),
                HostFunction::new(
                    "root",
                    FuncType::new(vec![ValType::F64], vec![ValType::F64]),
                    |stack| {
                        let d = f64::from_bits(stack[0]);
                        stack[0] = d.sqrt().to_bits();
                    },
                ),
            ],
        )
        .unwrap();

    let mut b = ModuleBuilder::new(b"host-calls");
    let square_ty = b.ty(
        vec![ValType::I32, ValType::I64, ValType::F32, ValType::F64],
        vec![ValType::I32, ValType::I64, ValType::F32, ValType::F64],
    );
    let root_ty = b.ty(vec![ValType::F64], vec![ValType::F64]);
    let square = b.import_func("env", "square", square_ty);
    let root = b.import_func("env", "root", root_ty);
    let main_ty = b.ty(
        vec![ValType::I32, ValType::I64, ValType::F32, ValType::F64],
        vec![
            ValType::I32,
            ValType::I64,
            ValType::F32,
            ValType::F64,
            ValType::F64,
        ],
    );
    b.func(
        main_ty,
        vec![
            O::LocalGet { index: 0 },
            O::LocalGet { index: 1 },
            O::LocalGet { index: 2 },
            O::LocalGet { index: 3 },
            O::Call { function: square },
            O::LocalGet { index: 3 },
            O::Call { function: root },
            O::End,
        ],
    );
    let m = b.build();
    e.compile_module(m.clone()).unwrap();
    let inst = e.new_module_engine(&m).unwrap();
    inst.resolve_imported_function(0, FuncIndex::from_u32(0), &host)
        .unwrap();
    inst.resolve_imported_function(1, FuncIndex::from_u32(1), &host)
        .unwrap();
    let mut main = inst.new_function(FuncIndex::from_u32(2)).unwrap();
    let results = main
        .call(&[
            2,
            100,
            u64::from(15.0f32.to_bits()),
            35.0f64.to_bits(),
        ])
        .unwrap();
    assert_eq!(results[0], 4);
    assert_eq!(results[1], 10000);
    assert_eq!(results[2] as u32, 225.0f32.to_bits());
    assert_eq!(results[3], 1225.0f64.to_bits());
    assert_eq!(f64::from_bits(results[4]), 5.916079783099616);
}

#[test]
fn call_indirect_through_a_table() {
    let e = engine();
    let mut b = ModuleBuilder::new(b"indirect");
    let ty_i32 = b.ty(vec![], vec![ValType::I32]);
    let ty_i64 = b.ty(vec![], vec![ValType::I64]);
    let wrong = b.func(ty_i64, vec![O::I64Const { value: 5 }, O::End]);
    let ten = b.func(ty_i32, vec![O::I32Const { value: 10 }, O::End]);
    let twenty = b.func(ty_i32, vec![O::I32Const { value: 20 }, O::End]);
    let thirty = b.func(ty_i32, vec![O::I32Const { value: 30 }, O::End]);
    let main_ty = b.ty(vec![ValType::I32], vec![ValType::I32]);
    b.func(
        main_ty,
        vec![
            O::LocalGet { index: 0 },
            O::CallIndirect {
                ty: ty_i32,
                table: TableIndex::from_u32(0),
            },
            O::End,
        ],
    );
    let table = b.table(1000);
    b.elements(
        table,
        0,
        vec![Some(wrong), Some(ten), Some(twenty), Some(thirty)],
    );
    let m = b.build();
    e.compile_module(m.clone()).unwrap();
    let inst = e.new_module_engine(&m).unwrap();
    let mut main = inst.new_function(FuncIndex::from_u32(4)).unwrap();

    assert_eq!(main.call(&[1]).unwrap(), vec![10]);
    assert_eq!(main.call(&[2]).unwrap(), vec![20]);
    assert_eq!(main.call(&[3]).unwrap(), vec![30]);
    // Element 0 holds a function of the wrong signature.
    let err = main.call(&[0]).unwrap_err();
    assert_eq!(
        err.trap(),
        Some(kestrel_environ::Trap::IndirectCallTypeMismatch)
    );
    // Element 10 is in range but was never initialized.
    let err = main.call(&[10]).unwrap_err();
    assert_eq!(
        err.trap(),
        Some(kestrel_environ::Trap::IndirectCallNullPointer)
    );
    // u32::MAX is out of range entirely.
    let err = main.call(&[u64::from(u32::MAX)]).unwrap_err();
    assert_eq!(err.trap(), Some(kestrel_environ::Trap::TableOutOfBounds));
}

#[test]
fn host_panic_backtrace() {
    let e = engine();
    let host = e
        .new_host_module(
            "host",
            vec![HostFunction::new(
                "cause_unreachable",
                FuncType::new(vec![], vec![]),
                |_| panic!("panic in host function"),
            )],
        )
        .unwrap();

    let mut b = ModuleBuilder::new(b"panics");
    let ty = b.ty(vec![], vec![]);
    let imported = b.import_func("host", "cause_unreachable", ty);
    // Defined in call order: main -> one -> two -> host.
    let main = b.func(
        ty,
        vec![
            O::Call {
                function: FuncIndex::from_u32(2),
            },
            O::End,
        ],
    );
    let one = b.func(
        ty,
        vec![
            O::Call {
                function: FuncIndex::from_u32(3),
            },
            O::End,
        ],
    );
    let two = b.func(ty, vec![O::Call { function: imported }, O::End]);
    b.name_func(main, "main");
    b.name_func(one, "one");
    b.name_func(two, "two");
    let m = b.build();
    e.compile_module(m.clone()).unwrap();
    let inst = e.new_module_engine(&m).unwrap();
    inst.resolve_imported_function(0, FuncIndex::from_u32(0), &host)
        .unwrap();
    let mut main = inst.new_function(main).unwrap();
    let err = main.call(&[]).unwrap_err();
    let expect = "panic in host function (recovered by kestrel)\n\
wasm stack trace:\n\
\thost.cause_unreachable()\n\
\t.two()\n\
\t.one()\n\
\t.main()";
    assert_eq!(err.to_string(), expect);
}

#[test]
fn traps_carry_guest_backtraces() {
    let e = engine();
    let mut b = ModuleBuilder::new(b"traps");
    let ty = b.ty(vec![], vec![]);
    let inner = b.func(ty, vec![O::Unreachable, O::End]);
    let outer = b.func(
        ty,
        vec![O::Call { function: inner }, O::End],
    );
    b.name_func(inner, "boom");
    b.name_func(outer, "outer");
    let m = b.build();
    e.compile_module(m.clone()).unwrap();
    let inst = e.new_module_engine(&m).unwrap();
    let mut outer = inst.new_function(outer).unwrap();
    let err = outer.call(&[]).unwrap_err();
    assert_eq!(err.trap(), Some(kestrel_environ::Trap::Unreachable));
    let trace = err.backtrace().unwrap();
    assert_eq!(trace.frames(), &[".boom()".to_string(), ".outer()".to_string()]);
}

#[test]
fn memory_loads_stores_and_growth() {
    let e = engine();
    let mut b = ModuleBuilder::new(b"memory");
    b.memory(1, Some(4));
    let store_ty = b.ty(vec![ValType::I32, ValType::I32], vec![]);
    let store = b.func(
        store_ty,
        vec![
            O::LocalGet { index: 0 },
            O::LocalGet { index: 1 },
            O::I32Store {
                memarg: MemArg { offset: 0 },
            },
            O::End,
        ],
    );
    let load_ty = b.ty(vec![ValType::I32], vec![ValType::I32]);
    let load = b.func(
        load_ty,
        vec![
            O::LocalGet { index: 0 },
            O::I32Load {
                memarg: MemArg { offset: 0 },
            },
            O::End,
        ],
    );
    let grow_ty = b.ty(vec![ValType::I32], vec![ValType::I32, ValType::I32]);
    let grow = b.func(
        grow_ty,
        vec![
            O::LocalGet { index: 0 },
            O::MemoryGrow,
            O::MemorySize,
            O::End,
        ],
    );
    let m = b.build();
    e.compile_module(m.clone()).unwrap();
    let inst = e.new_module_engine(&m).unwrap();

    let mut store = inst.new_function(store).unwrap();
    let mut load = inst.new_function(load).unwrap();
    let mut grow = inst.new_function(grow).unwrap();

    store.call(&[64, 0xdeadbeef]).unwrap();
    assert_eq!(load.call(&[64]).unwrap(), vec![0xdeadbeef]);

    // grow(2): old size 1 page, new size 3; the wasm-visible size reloads
    // after growth.
    assert_eq!(grow.call(&[2]).unwrap(), vec![1, 3]);
    // Contents survive the growth and the new pages are addressable.
    assert_eq!(load.call(&[64]).unwrap(), vec![0xdeadbeef]);
    store.call(&[3 * 65536 - 4, 7]).unwrap();
    assert_eq!(load.call(&[3 * 65536 - 4]).unwrap(), vec![7]);
    // Growing past the maximum fails with -1.
    assert_eq!(
        grow.call(&[100]).unwrap(),
        vec![u64::from(u32::MAX), 3]
    );

    // Out-of-bounds accesses trap.
    let err = load.call(&[3 * 65536]).unwrap_err();
    assert_eq!(err.trap(), Some(kestrel_environ::Trap::MemoryOutOfBounds));
}

#[test]
fn division_traps() {
    let e = engine();
    let mut b = ModuleBuilder::new(b"divide");
    let ty = b.ty(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    b.func(
        ty,
        vec![
            O::LocalGet { index: 0 },
            O::LocalGet { index: 1 },
            O::I32DivS,
            O::End,
        ],
    );
    let m = b.build();
    e.compile_module(m.clone()).unwrap();
    let inst = e.new_module_engine(&m).unwrap();
    let mut div = inst.new_function(FuncIndex::from_u32(0)).unwrap();

    assert_eq!(div.call(&[42, 7]).unwrap(), vec![6]);
    assert_eq!(
        div.call(&[(-42i32) as u32 as u64, 7]).unwrap(),
        vec![(-6i32) as u32 as u64]
    );
    let err = div.call(&[1, 0]).unwrap_err();
    assert_eq!(
        err.trap(),
        Some(kestrel_environ::Trap::IntegerDivisionByZero)
    );
    let err = div
        .call(&[i32::MIN as u32 as u64, (-1i32) as u32 as u64])
        .unwrap_err();
    assert_eq!(err.trap(), Some(kestrel_environ::Trap::IntegerOverflow));
}

#[test]
fn float_conversions_trap_on_nan_and_overflow() {
    let e = engine();
    let mut b = ModuleBuilder::new(b"trunc");
    let ty = b.ty(vec![ValType::F64], vec![ValType::I32]);
    b.func(
        ty,
        vec![O::LocalGet { index: 0 }, O::I32TruncF64S, O::End],
    );
    let m = b.build();
    e.compile_module(m.clone()).unwrap();
    let inst = e.new_module_engine(&m).unwrap();
    let mut trunc = inst.new_function(FuncIndex::from_u32(0)).unwrap();

    assert_eq!(trunc.call(&[(-3.7f64).to_bits()]).unwrap(), vec![(-3i32) as u32 as u64]);
    let err = trunc.call(&[f64::NAN.to_bits()]).unwrap_err();
    assert_eq!(
        err.trap(),
        Some(kestrel_environ::Trap::InvalidConversionToInteger)
    );
    let err = trunc.call(&[1e12f64.to_bits()]).unwrap_err();
    assert_eq!(err.trap(), Some(kestrel_environ::Trap::IntegerOverflow));
}

#[test]
fn loops_and_locals() {
    // sum(n) = n*(n+1)/2 by iteration.
    let e = engine();
    let mut b = ModuleBuilder::new(b"loops");
    let ty = b.ty(vec![ValType::I32], vec![ValType::I32]);
    b.func_with_locals(
        ty,
        vec![(1, ValType::I32)], // accumulator
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
            O::LocalGet { index: 1 },
            O::LocalGet { index: 0 },
            O::I32Add,
            O::LocalSet { index: 1 },
            O::LocalGet { index: 0 },
            O::I32Const { value: 1 },
            O::I32Sub,
            O::LocalSet { index: 0 },
            O::Br { depth: 0 },
            O::End,
            O::End,
            O::LocalGet { index: 1 },
            O::End,
        ],
    );
    let m = b.build();
    e.compile_module(m.clone()).unwrap();
    let inst = e.new_module_engine(&m).unwrap();
    let mut sum = inst.new_function(FuncIndex::from_u32(0)).unwrap();
    assert_eq!(sum.call(&[0]).unwrap(), vec![0]);
    assert_eq!(sum.call(&[10]).unwrap(), vec![55]);
    assert_eq!(sum.call(&[1000]).unwrap(), vec![500500]);
}

#[test]
fn globals_and_atomics() {
    let e = engine();
    let mut b = ModuleBuilder::new(b"state");
    b.memory(1, None);
    {
        // One mutable counter global.
        let m = b.build_module_mut();
        m.globals.push(kestrel_environ::Global {
            ty: ValType::I64,
            mutable: true,
            initializer: kestrel_environ::GlobalInit::I64(5),
        });
    }
    let bump_ty = b.ty(vec![], vec![ValType::I64]);
    let bump = b.func(
        bump_ty,
        vec![
            O::GlobalGet {
                index: kestrel_environ::GlobalIndex::from_u32(0),
            },
            O::I64Const { value: 1 },
            O::I64Add,
            O::GlobalSet {
                index: kestrel_environ::GlobalIndex::from_u32(0),
            },
            O::GlobalGet {
                index: kestrel_environ::GlobalIndex::from_u32(0),
            },
            O::End,
        ],
    );
    let rmw_ty = b.ty(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    let rmw = b.func(
        rmw_ty,
        vec![
            O::LocalGet { index: 0 },
            O::LocalGet { index: 1 },
            O::I32AtomicRmw {
                op: kestrel_environ::AtomicRmwOp::Add,
                memarg: MemArg { offset: 0 },
            },
            O::End,
        ],
    );
    let m = b.build();
    e.compile_module(m.clone()).unwrap();
    let inst = e.new_module_engine(&m).unwrap();

    let mut bump = inst.new_function(bump).unwrap();
    assert_eq!(bump.call(&[]).unwrap(), vec![6]);
    assert_eq!(bump.call(&[]).unwrap(), vec![7]);

    let mut rmw = inst.new_function(rmw).unwrap();
    assert_eq!(rmw.call(&[16, 40]).unwrap(), vec![0]);
    assert_eq!(rmw.call(&[16, 2]).unwrap(), vec![40]);
    assert_eq!(rmw.call(&[16, 0]).unwrap(), vec![42]);
}

#[test]
fn wasm_to_wasm_imports_and_memory_identity() {
    let e = engine();
    // Exporter: owns memory, exports double().
    let mut a = ModuleBuilder::new(b"exporter");
    a.memory(1, None);
    let double_ty = a.ty(vec![ValType::I32], vec![ValType::I32]);
    let double = a.func(
        double_ty,
        vec![
            O::LocalGet { index: 0 },
            O::LocalGet { index: 0 },
            O::I32Add,
            O::End,
        ],
    );
    let ma = a.build();
    e.compile_module(ma.clone()).unwrap();
    let inst_a = e.new_module_engine(&ma).unwrap();

    // Importer: imports the function and the memory.
    let mut b = ModuleBuilder::new(b"importer");
    {
        let m = b.build_module_mut();
        m.memory = Some(kestrel_environ::MemoryPlan {
            minimum: 1,
            maximum: None,
            imported: true,
            shared: false,
        });
    }
    let double_ty_b = b.ty(vec![ValType::I32], vec![ValType::I32]);
    let imported = b.import_func("exporter", "double", double_ty_b);
    let main_ty = b.ty(vec![ValType::I32], vec![ValType::I32]);
    b.func(
        main_ty,
        vec![
            // double(load(addr))
            O::LocalGet { index: 0 },
            O::I32Load {
                memarg: MemArg { offset: 0 },
            },
            O::Call { function: imported },
            O::End,
        ],
    );
    let mb = b.build();
    e.compile_module(mb.clone()).unwrap();
    let inst_b = e.new_module_engine(&mb).unwrap();
    inst_b
        .resolve_imported_function(0, double, &inst_a)
        .unwrap();
    inst_b.resolve_imported_memory(&inst_a).unwrap();

    // Write through the exporter's memory, read through the importer.
    inst_a
        .with_memory(|mem| mem.data_mut()[100..104].copy_from_slice(&21u32.to_le_bytes()))
        .unwrap();
    let mut main = inst_b.new_function(FuncIndex::from_u32(1)).unwrap();
    assert_eq!(main.call(&[100]).unwrap(), vec![42]);
}
