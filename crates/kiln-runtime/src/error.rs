//! Runtime error types
//!
//! Every component reports recoverable failures through its own error enum;
//! `RuntimeError` aggregates them for the dispatcher and the embedder.
//! Unrecoverable conditions go through [`fatal`] instead.

use crate::events::{EventLogger, RuntimeEvent};
use crate::ffi::{FfiError, LoadError, MarshalError};
use crate::frame::FrameError;
use crate::heap::HeapError;
use crate::interrupt::Condition;
use crate::locks::LockError;
use kiln_config::ConfigError;
use thiserror::Error;

/// Recoverable runtime errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Ffi(#[from] FfiError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Heap(#[from] HeapError),

    /// A delivered interrupt
    #[error(transparent)]
    Condition(#[from] Condition),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Operating system error: {0}")]
    Os(#[from] std::io::Error),

    #[error("Type error: expected {expected}, got {got}")]
    TypeError {
        expected: &'static str,
        got: &'static str,
    },

    #[error("{name}: expected {expected} arguments, got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },

    /// Error signalled by a native function body
    #[error("{0}")]
    Signalled(String),

    #[error("Runtime has been shut down")]
    ShutDown,

    #[error("Cannot shut down: {0} execution contexts still alive")]
    ContextsActive(usize),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Terminate on an unrecoverable runtime state
///
/// The message is logged as a `Fatal` event first. Release builds abort on
/// panic, so nothing past this point runs.
pub fn fatal(events: &dyn EventLogger, message: impl Into<String>) -> ! {
    let message = message.into();
    events.log(RuntimeEvent::Fatal {
        message: message.clone(),
    });
    panic!("kiln: fatal error: {}", message)
}
