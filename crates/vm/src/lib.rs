//! Brio Virtual Machine
//!
//! A stack-based bytecode VM for the Brio scripting language.
//!
//! Design goals:
//! - Proper tail calls - tail-recursive programs run in constant frame depth
//! - Closures with shared upvalue cells, closed on scope exit
//! - Mark-and-sweep GC over an index-addressed arena (no raw pointers)
//! - Weak string interning - equal content, one object
//! - No global state - any number of independent `Vm` instances
//!
//! The compiler front-end produces a [`gc::GcFunction`] wrapping a
//! [`chunk::Chunk`] and hands it to [`vm::Vm::interpret`]; everything at
//! runtime happens inside that `Vm` value.

pub mod chunk;
pub mod gc;
pub mod inspect;
pub mod table;
pub mod value;
pub mod vm;

pub use chunk::{Chunk, OpCode};
pub use gc::{GcConfig, GcPtr, GcStats, GcUpvalue, Heap, UpvalueList};
pub use table::Table;
pub use value::{format_number, RuntimeError, Value};
pub use vm::{CallFrame, NativeFn, Vm, VmConfig};
