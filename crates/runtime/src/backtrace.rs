//! Guest stack unwinding and symbolic frame formatting.
//!
//! Frames are discovered by walking the saved frame-pointer chain inside the
//! guest stack: every prologue pushes a `(saved fp, saved lr)` record and
//! points fp at it, so `[fp+8]` is a return address and `[fp]` the caller's
//! record. The walk stays within the captured `[sp, stack_top)` window and
//! stops at the first record that leaves it: the host frame underneath the
//! outermost guest function. Return addresses are resolved to
//! `(module, function)` through the engine's by-address table.

use std::sync::Arc;

use kestrel_environ::{FuncIndex, Module};

use crate::engine::Engine;
use crate::error::WasmBacktrace;

/// Build a backtrace from the state a structured exit captured.
///
/// `leaf_addrs` are candidate innermost return addresses (the exit pc for
/// traps, the parked link register for host calls); addresses that do not
/// resolve to compiled code are skipped. `host_leaf` is prepended verbatim
/// when the innermost frame is a host function.
pub(crate) fn capture(
    engine: &Engine,
    leaf_addrs: &[u64],
    fp: u64,
    sp: u64,
    stack_top: u64,
    host_leaf: Option<String>,
) -> WasmBacktrace {
    let mut frames = Vec::new();
    if let Some(leaf) = host_leaf {
        frames.push(leaf);
    }
    for &addr in leaf_addrs {
        push_frame(engine, addr, &mut frames);
    }

    let mut cur = fp;
    while cur >= sp && cur + 16 <= stack_top {
        let ret = unsafe { ((cur + 8) as *const u64).read() };
        if !push_frame(engine, ret, &mut frames) {
            break;
        }
        let next = unsafe { (cur as *const u64).read() };
        if next <= cur {
            break;
        }
        cur = next;
    }
    WasmBacktrace::new(frames)
}

/// Resolve `addr` and append its frame. Returns false when the walk should
/// stop: the address is outside compiled code, or inside a host-entry
/// preamble, whose record below it belongs to the host.
fn push_frame(engine: &Engine, addr: u64, frames: &mut Vec<String>) -> bool {
    let Some(cm) = engine.module_of_addr(addr as usize) else {
        return false;
    };
    let Some(def) = cm.function_index_of(addr as usize) else {
        return false;
    };
    let info = cm.functions[def];
    let off = addr as usize - cm.base();
    if (off as u32) < info.offset + info.preamble_size {
        // Inside the preamble: the return into the host entry, not a guest
        // frame.
        return false;
    }
    let index = cm
        .module
        .func_index(kestrel_environ::DefinedFuncIndex::from_u32(def as u32));
    frames.push(format_frame_of(&cm.module, index));
    true
}

/// `{module}.{function}({param-types}) {result-types}` with the name-section
/// name, or `$index` when absent.
pub(crate) fn format_frame_of(module: &Arc<Module>, index: FuncIndex) -> String {
    let ty = module.func_type(index);
    let name = module.function_name(index);
    let module_name = module.name.clone().unwrap_or_default();
    let params = ty
        .params
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let mut out = format!("{module_name}.{name}({params})");
    match ty.results.len() {
        0 => {}
        1 => {
            out.push(' ');
            out.push_str(&ty.results[0].to_string());
        }
        _ => {
            let results = ty
                .results
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&format!(" ({results})"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_environ::{FuncType, FunctionBody, ModuleId, ValType};

    #[test]
    fn frame_formatting() {
        let mut m = Module::new(ModuleId::from_bytes(b"bt"));
        m.name = Some("env".to_string());
        let ty = m.types.push(FuncType::new(
            vec![ValType::I32, ValType::F64],
            vec![ValType::F64],
        ));
        let f = m.functions.push(ty);
        m.code.push(FunctionBody::default());
        m.function_names.insert(f, "square".to_string());
        let m = Arc::new(m);
        assert_eq!(format_frame_of(&m, f), "env.square(i32,f64) f64");

        let mut anon = Module::new(ModuleId::from_bytes(b"bt2"));
        let ty = anon.types.push(FuncType::default());
        let f = anon.functions.push(ty);
        anon.code.push(FunctionBody::default());
        let anon = Arc::new(anon);
        assert_eq!(format_frame_of(&anon, f), ".$0()");
    }
}
