//! Call frames
//!
//! A `CallFrame` is a small copyable index into its context's frame chain:
//! position plus serial number, so a frame that has been closed (or a slot
//! reused by a later frame) is detected rather than dereferenced.
//!
//! Frames with fewer arguments than the small-call threshold keep their
//! arguments in the context's values buffer; larger frames take a slice at
//! the top of the operand stack. Either way argument access is an indexed
//! read at a fixed stride from the base.

pub mod dispatch;
pub mod values;

pub use dispatch::{Callee, FrameDispatcher, NativeFunction};
pub use values::MultipleValues;

use thiserror::Error;

/// Where a frame's arguments live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBase {
    /// The context's multiple-values buffer, from slot 0
    Values,
    /// Operand stack slots starting at `offset`
    Stack { offset: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Open,
    Active,
    Closed,
}

/// One call boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrame {
    pub(crate) index: usize,
    pub(crate) serial: u64,
    pub(crate) argc: usize,
    pub(crate) base: FrameBase,
    /// Values-buffer epoch at open; only meaningful for `FrameBase::Values`
    pub(crate) epoch: u64,
}

impl CallFrame {
    pub fn argc(&self) -> usize {
        self.argc
    }

    pub fn base(&self) -> FrameBase {
        self.base
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Depth of this frame in its context's chain, 0 for the outermost
    pub fn depth(&self) -> usize {
        self.index
    }

    pub fn is_buffer_backed(&self) -> bool {
        self.base == FrameBase::Values
    }
}

/// Entry in a context's frame arena
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameRecord {
    pub serial: u64,
    pub state: FrameState,
    /// Stack top before this frame opened
    pub stack_mark: usize,
}

/// Frame errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Call with {argc} arguments exceeds the limit of {limit}")]
    TooManyArguments { argc: usize, limit: usize },

    #[error("Arguments of frame {serial} were overwritten by a later call")]
    Stale { serial: u64 },

    #[error("Frame {serial} is closed")]
    Closed { serial: u64 },

    #[error("Argument index {index} out of range for {argc} arguments")]
    ArgumentIndex { index: usize, argc: usize },

    #[error("Cannot return {count} values; the limit is {limit}")]
    TooManyValues { count: usize, limit: usize },

    #[error("Operand stack overflow: requested {requested} slots, {available} available")]
    StackOverflow { requested: usize, available: usize },
}
