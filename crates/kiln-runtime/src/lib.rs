//! Kiln Runtime - embeddable runtime core
//!
//! This library provides the low-level machinery a hosted language runtime
//! is built on:
//! - Call frames, the frame dispatcher and the multiple-values channel
//! - Foreign calls built at runtime from type declarations, and callback
//!   trampolines for native code calling back in
//! - Interrupt delivery at safe points, with a guarded operand stack
//! - The lock domain: a global registry lock and per-table locks

/// Kiln runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod bignum;
pub mod context;
pub mod error;
pub mod events;
pub mod ffi;
pub mod frame;
pub mod heap;
pub mod interrupt;
pub mod locks;
pub mod runtime;
pub mod stack;
pub mod value;

// Re-export commonly used types
pub use context::{ContextId, ExecutionContext, FrameCounters};
pub use error::{fatal, RuntimeError, RuntimeResult};
pub use events::{
    EventEntry, EventLogger, MemoryEventLogger, NullEventLogger, RuntimeEvent, StderrEventLogger,
};
pub use ffi::{
    EntryPoint, FfiError, ForeignCallBuilder, ForeignFunction, ForeignSignature, ForeignType,
    ForeignValue, Trampoline,
};
pub use frame::{
    CallFrame, Callee, FrameBase, FrameDispatcher, FrameError, FrameState, MultipleValues,
    NativeFunction,
};
pub use heap::{ArenaHeap, Collector, HeapError, ObjectTag};
pub use interrupt::{ArithmeticTrap, Condition, InterruptHandle, InterruptKind};
pub use locks::{HashTable, LockDomain, LockError, LockName, SharedHashTable};
pub use runtime::{GlobalRegistry, Runtime, RuntimeBuilder};
pub use value::{Handle, Value};
