//! Foreign Function Interface
//!
//! Calls native functions whose signatures are only known at runtime:
//! - Foreign types and signatures built from hosted type declarations
//! - Platform ABI tables for argument classification
//! - Value marshaling (hosted ↔ native scalars)
//! - `ForeignCallBuilder`: accumulates a call image and executes it through libffi
//! - Callback trampolines for native → hosted calls
//! - Dynamic library loading and symbol resolution
//!
//! # Safety
//!
//! Executing a foreign call trusts the signature: a mismatch with the real
//! native function is undefined behaviour, not a catchable error. Everything
//! that can be checked is checked before control leaves the runtime.

pub mod abi;
pub mod builder;
pub mod callbacks;
pub mod caller;
pub mod loader;
pub mod marshal;
pub mod types;

pub use abi::{AbiTable, ArgClass, ArgLocation, RegisterCursor};
pub use builder::{ArgSlot, ForeignCallBuilder, FFI_BUFFER_LIMIT};
pub use callbacks::Trampoline;
pub use caller::ForeignFunction;
pub use loader::{EntryPoint, LibraryLoader, LoadError, SymbolTable};
pub use marshal::{MarshalContext, MarshalError};
pub use types::{CallingConvention, ForeignSignature, ForeignType, ForeignValue, Repr};

use thiserror::Error;

/// Foreign call errors, all raised before control transfers to native code
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FfiError {
    #[error("Unsupported foreign type {0}")]
    UnsupportedType(String),

    #[error("Unknown calling convention {0}")]
    UnknownConvention(String),

    #[error(":void is not a valid type for parameter {0}")]
    VoidParameter(usize),

    #[error("Variadic start {start} is past the {count} declared parameters")]
    VariadicStart { start: usize, count: usize },

    #[error("{convention} calls are not supported on {abi}")]
    UnsupportedConvention {
        convention: CallingConvention,
        abi: &'static str,
    },

    #[error("Variadic calls are not supported on {0}")]
    UnsupportedVariadic(&'static str),

    #[error("Call image overflow: {needed} bytes needed, limit is {limit}")]
    BufferOverflow { needed: usize, limit: usize },

    #[error("Parameter {index} takes {expected} bytes, got {got}")]
    SizeMismatch {
        index: usize,
        expected: usize,
        got: usize,
    },

    #[error("Alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    #[error("Expected {expected} arguments, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("No foreign call prepared")]
    NotPrepared,

    #[error("Return type {got} does not match prepared {expected}")]
    ReturnTypeMismatch {
        expected: ForeignType,
        got: ForeignType,
    },

    #[error("No execution context registered on this thread")]
    NoContext,

    #[error(transparent)]
    Marshal(#[from] MarshalError),
}
