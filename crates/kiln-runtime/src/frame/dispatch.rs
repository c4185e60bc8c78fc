//! Call protocol shared by the evaluator, the bytecode dispatcher, compiled
//! closures and foreign calls.

use crate::context::ExecutionContext;
use crate::error::RuntimeError;
use crate::frame::CallFrame;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Anything that can be invoked on an open frame
///
/// `invoke` reads its arguments through the context, writes its results to
/// the values channel and returns how many it wrote.
pub trait Callee: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(&self, ctx: &mut ExecutionContext, frame: CallFrame) -> Result<usize, RuntimeError>;
}

type NativeBody =
    dyn Fn(&mut ExecutionContext, CallFrame) -> Result<usize, RuntimeError> + Send + Sync;

/// A runtime builtin or compiled closure
#[derive(Clone)]
pub struct NativeFunction {
    name: String,
    min_args: usize,
    max_args: Option<usize>,
    body: Arc<NativeBody>,
}

impl NativeFunction {
    /// Function taking `min_args` up to `max_args` arguments (`None`: unbounded)
    pub fn new<F>(name: impl Into<String>, min_args: usize, max_args: Option<usize>, body: F) -> Self
    where
        F: Fn(&mut ExecutionContext, CallFrame) -> Result<usize, RuntimeError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            min_args,
            max_args,
            body: Arc::new(body),
        }
    }

    pub fn fixed<F>(name: impl Into<String>, arity: usize, body: F) -> Self
    where
        F: Fn(&mut ExecutionContext, CallFrame) -> Result<usize, RuntimeError>
            + Send
            + Sync
            + 'static,
    {
        Self::new(name, arity, Some(arity), body)
    }

    fn expected(&self) -> String {
        match self.max_args {
            Some(max) if max == self.min_args => format!("exactly {}", max),
            Some(max) => format!("{} to {}", self.min_args, max),
            None => format!("at least {}", self.min_args),
        }
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("min_args", &self.min_args)
            .field("max_args", &self.max_args)
            .finish()
    }
}

impl Callee for NativeFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, ctx: &mut ExecutionContext, frame: CallFrame) -> Result<usize, RuntimeError> {
        let argc = frame.argc();
        if argc < self.min_args || self.max_args.map_or(false, |max| argc > max) {
            return Err(RuntimeError::Arity {
                name: self.name.clone(),
                expected: self.expected(),
                got: argc,
            });
        }
        (self.body)(ctx, frame)
    }
}

pub struct FrameDispatcher;

impl FrameDispatcher {
    /// Call `callee` with `args`, returning the number of values it reported
    ///
    /// Pending interrupts are delivered before the frame opens and after it
    /// closes. The frame is closed whether or not the callee succeeds.
    pub fn funcall(
        ctx: &mut ExecutionContext,
        callee: &dyn Callee,
        args: &[Value],
    ) -> Result<usize, RuntimeError> {
        ctx.safe_point()?;
        let frame = ctx.open_frame_with(args)?;
        Self::apply(ctx, callee, frame)
    }

    /// Run `callee` on a frame the caller opened and filled
    pub fn apply(
        ctx: &mut ExecutionContext,
        callee: &dyn Callee,
        frame: CallFrame,
    ) -> Result<usize, RuntimeError> {
        let result = ctx
            .activate(frame)
            .map_err(RuntimeError::from)
            .and_then(|()| callee.invoke(ctx, frame));
        ctx.close_frame(frame);
        let count = result?;
        ctx.safe_point()?;
        Ok(count)
    }
}
