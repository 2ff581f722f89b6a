//! The Kestrel execution engine.
//!
//! This crate owns everything after SSA lowering and instruction selection:
//! the [`Engine`] that orchestrates compilation and keeps the by-address
//! table of compiled modules, executable memory management, the on-disk
//! compiled-module cache, per-instance [`ModuleEngine`]s with their packed
//! module-context buffers, and the [`CallEngine`] dispatch loop that enters
//! native code and services structured exits (stack growth, memory growth,
//! host calls, termination checks) until the call completes or traps.

mod backtrace;
mod cache;
mod call_engine;
mod code_memory;
mod engine;
mod error;
mod exec_context;
mod host;
mod module_engine;

pub use cache::{Cache, InMemoryCache};
pub use call_engine::CallEngine;
pub use engine::{Engine, EngineConfig};
pub use error::{RuntimeError, WasmBacktrace};
pub use exec_context::ExecutionContext;
pub use host::{HostFuncKind, HostFunction};
pub use module_engine::{MemoryInstance, ModuleEngine};
