//! Host modules: named host functions callable from wasm.
//!
//! Host functions exchange values through a flat u64 slot buffer, exactly
//! the marshalling area the generated trampolines fill: parameters arrive in
//! the leading slots, results are written back over them. The closure table
//! is a plain tagged union owned by the host module engine; nothing about a
//! closure's representation ever crosses into generated code, which only
//! ever sees the trampoline address and the host module's context pointer.

use kestrel_environ::FuncType;

use crate::module_engine::ModuleEngine;

/// The two host-function shapes the exit-code protocol distinguishes.
pub enum HostFuncKind {
    /// `fn(param_result_slots)`.
    Plain(Box<dyn Fn(&mut [u64]) + Send + Sync>),
    /// Like `Plain`, with access to the host module instance.
    WithModule(Box<dyn Fn(&ModuleEngine, &mut [u64]) + Send + Sync>),
}

/// One function of a host module.
pub struct HostFunction {
    pub name: String,
    pub ty: FuncType,
    pub kind: HostFuncKind,
}

impl HostFunction {
    pub fn new(
        name: impl Into<String>,
        ty: FuncType,
        f: impl Fn(&mut [u64]) + Send + Sync + 'static,
    ) -> HostFunction {
        HostFunction {
            name: name.into(),
            ty,
            kind: HostFuncKind::Plain(Box::new(f)),
        }
    }

    pub fn with_module(
        name: impl Into<String>,
        ty: FuncType,
        f: impl Fn(&ModuleEngine, &mut [u64]) + Send + Sync + 'static,
    ) -> HostFunction {
        HostFunction {
            name: name.into(),
            ty,
            kind: HostFuncKind::WithModule(Box::new(f)),
        }
    }
}
