//! Structural engine behavior that holds on any host architecture: these
//! compile for aarch64 but never execute guest code.

use std::sync::Arc;

use kestrel_environ::{FuncIndex, FuncType, Operator as O, TableIndex, ValType};
use kestrel_runtime::{EngineConfig, HostFunction, InMemoryCache, RuntimeError};

use crate::helpers::{engine, engine_with, ModuleBuilder};

fn answer_module(id: &[u8]) -> Arc<kestrel_environ::Module> {
    let mut b = ModuleBuilder::new(id);
    let ty = b.ty(vec![], vec![ValType::I32]);
    let f = b.func(ty, vec![O::I32Const { value: 42 }, O::End]);
    b.name_func(f, "answer");
    b.build()
}

#[test]
fn compile_is_idempotent_and_counted() {
    let engine = engine();
    let m = answer_module(b"idem");
    assert_eq!(engine.compiled_module_count(), 0);
    engine.compile_module(m.clone()).unwrap();
    engine.compile_module(m.clone()).unwrap();
    assert_eq!(engine.compiled_module_count(), 1);

    let m2 = answer_module(b"idem2");
    engine.compile_module(m2.clone()).unwrap();
    assert_eq!(engine.compiled_module_count(), 2);

    engine.delete_compiled_module(&m.id);
    assert_eq!(engine.compiled_module_count(), 1);
    engine.close();
    assert_eq!(engine.compiled_module_count(), 0);
}

#[test]
fn instantiation_requires_compilation() {
    let engine = engine();
    let m = answer_module(b"uncompiled");
    assert!(engine.new_module_engine(&m).is_err());
}

#[test]
fn cache_round_trip_through_engine() {
    let cache = Arc::new(InMemoryCache::new());
    let m = answer_module(b"cached");

    let first = engine_with(EngineConfig {
        cache: Some(cache.clone()),
        ..Default::default()
    });
    first.compile_module(m.clone()).unwrap();
    assert_eq!(cache.len(), 1);

    // A second engine with the same cache materializes without compiling.
    let second = engine_with(EngineConfig {
        cache: Some(cache.clone()),
        ..Default::default()
    });
    second.compile_module(m.clone()).unwrap();
    assert_eq!(second.compiled_module_count(), 1);
    // Instantiation works from the cached executable.
    let instance = second.new_module_engine(&m).unwrap();
    assert!(instance.exported_function("nope").is_err());
    instance.new_function(FuncIndex::from_u32(0)).unwrap();
}

#[test]
fn corrupt_cache_entry_is_an_error() {
    let cache = Arc::new(InMemoryCache::new());
    let m = answer_module(b"corrupt");
    {
        let e = engine_with(EngineConfig {
            cache: Some(cache.clone()),
            ..Default::default()
        });
        e.compile_module(m.clone()).unwrap();
    }
    // Truncate the stored entry.
    let bytes = kestrel_runtime::Cache::get(&*cache, &m.id).unwrap();
    kestrel_runtime::Cache::add(&*cache, &m.id, &bytes[..bytes.len() / 2]);

    let e = engine_with(EngineConfig {
        cache: Some(cache),
        ..Default::default()
    });
    assert!(e.compile_module(m).is_err());
}

#[test]
fn arity_mismatch_fails_before_execution() {
    let engine = engine();
    let mut b = ModuleBuilder::new(b"arity");
    let ty = b.ty(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    b.func(
        ty,
        vec![
            O::LocalGet { index: 0 },
            O::LocalGet { index: 1 },
            O::I32Add,
            O::End,
        ],
    );
    let m = b.build();
    engine.compile_module(m.clone()).unwrap();
    let instance = engine.new_module_engine(&m).unwrap();
    let mut f = instance.new_function(FuncIndex::from_u32(0)).unwrap();

    let err = f.call(&[1, 2, 3, 4]).unwrap_err();
    assert_eq!(err.to_string(), "expected 2 params, but passed 4");
    let err = f.call(&[]).unwrap_err();
    assert_eq!(err.to_string(), "expected 2 params, but passed 0");

    let mut too_small = [0u64; 1];
    assert!(f.call_with_stack(&mut too_small).is_err());
}

#[test]
fn closed_module_rejects_calls() {
    let engine = engine();
    let m = answer_module(b"closed");
    engine.compile_module(m.clone()).unwrap();
    let instance = engine.new_module_engine(&m).unwrap();
    instance.close_with("module closed with exit_code(7)");
    let mut f = instance.new_function(FuncIndex::from_u32(0)).unwrap();
    match f.call(&[]) {
        Err(RuntimeError::Closed(reason)) => {
            assert_eq!(reason, "module closed with exit_code(7)")
        }
        other => panic!("expected closed error, got {other:?}"),
    }
}

#[test]
fn lookup_function_checks_table_accesses() {
    let engine = engine();
    let mut b = ModuleBuilder::new(b"table-lookup");
    let ty_i32 = b.ty(vec![], vec![ValType::I32]);
    let ty_i64 = b.ty(vec![], vec![ValType::I64]);
    let f10 = b.func(ty_i32, vec![O::I32Const { value: 10 }, O::End]);
    let g = b.func(ty_i64, vec![O::I64Const { value: 9 }, O::End]);
    let table = b.table(1000);
    b.elements(table, 0, vec![Some(g), Some(f10)]);
    let m = b.build();
    engine.compile_module(m.clone()).unwrap();
    let instance = engine.new_module_engine(&m).unwrap();

    let want = engine.type_id(&FuncType::new(vec![], vec![ValType::I32]));
    // In range and well-typed.
    let ce = instance.lookup_function(TableIndex::from_u32(0), want, 1).unwrap();
    assert_eq!(ce.ty().results, vec![ValType::I32]);
    // Wrong signature.
    let err = instance
        .lookup_function(TableIndex::from_u32(0), want, 0)
        .unwrap_err();
    assert_eq!(err.to_string(), "wasm error: indirect call type mismatch");
    // In range but never initialized: a null element.
    let err = instance
        .lookup_function(TableIndex::from_u32(0), want, 10)
        .unwrap_err();
    assert_eq!(err.to_string(), "wasm error: invalid table access");
    // Out of range.
    let err = instance
        .lookup_function(TableIndex::from_u32(0), want, u32::MAX)
        .unwrap_err();
    assert_eq!(err.to_string(), "wasm error: invalid table access");
}

#[test]
fn funcref_round_trips_through_a_table_slot() {
    let engine = engine();
    let m = answer_module(b"funcref");
    engine.compile_module(m.clone()).unwrap();
    let instance = engine.new_module_engine(&m).unwrap();
    let r1 = instance.function_instance_reference(FuncIndex::from_u32(0));
    let r2 = instance.function_instance_reference(FuncIndex::from_u32(0));
    assert_ne!(r1, 0);
    // The handle is stable and survives a u64 round trip.
    assert_eq!(r1, r2);
    let through_u64: u64 = r1;
    assert_eq!(through_u64, r1);
}

#[test]
fn host_module_exposes_named_functions() {
    let engine = engine();
    let host = engine
        .new_host_module(
            "env",
            vec![HostFunction::new(
                "add1",
                FuncType::new(vec![ValType::I32], vec![ValType::I32]),
                |stack| stack[0] = (stack[0] as u32 + 1) as u64,
            )],
        )
        .unwrap();
    assert_eq!(host.module().name.as_deref(), Some("env"));
    assert_eq!(
        host.module().function_name(FuncIndex::from_u32(0)),
        "add1"
    );
}

#[test]
fn symbolic_frames_resolve_only_inside_modules() {
    let engine = engine();
    let m = answer_module(b"frames");
    engine.compile_module(m.clone()).unwrap();
    let instance = engine.new_module_engine(&m).unwrap();
    // A function-instance record stores the guest entry; that address must
    // symbolize to the function, and a stack address must not.
    let fi_record = instance.function_instance_reference(FuncIndex::from_u32(0));
    let executable =
        unsafe { (fi_record as *const kestrel_environ::FunctionInstance).read() }.executable;
    let frame = engine.symbolic_frame(executable as usize).unwrap();
    assert_eq!(frame, ".answer() i32");
    let local = 0u64;
    assert!(engine.symbolic_frame(&local as *const u64 as usize).is_none());
}
