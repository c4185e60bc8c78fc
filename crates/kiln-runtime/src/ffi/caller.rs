//! Foreign function calls through the frame protocol
//!
//! A `ForeignFunction` is a resolved entry point plus its signature. Invoking
//! it marshals the frame's arguments into a fresh builder, runs the native
//! call with interrupts disabled and reports the result as a single value
//! (zero values for `:void`).

use crate::context::{self, ExecutionContext};
use crate::error::RuntimeError;
use crate::events::RuntimeEvent;
use crate::ffi::builder::ForeignCallBuilder;
use crate::ffi::loader::EntryPoint;
use crate::ffi::types::ForeignSignature;
use crate::ffi::FfiError;
use crate::frame::{CallFrame, Callee};
use crate::value::Value;
use std::sync::Arc;

/// Native function callable from hosted code
#[derive(Debug, Clone)]
pub struct ForeignFunction {
    name: String,
    entry: EntryPoint,
    signature: ForeignSignature,
}

impl ForeignFunction {
    /// Wrap `entry` as a callee with `signature`
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `entry` points to a native function that stays loaded while this
    ///   value is alive
    /// - The function's real signature matches `signature`
    pub unsafe fn new(name: impl Into<String>, entry: EntryPoint, signature: ForeignSignature) -> Self {
        Self {
            name: name.into(),
            entry,
            signature,
        }
    }

    pub fn entry(&self) -> EntryPoint {
        self.entry
    }

    pub fn signature(&self) -> &ForeignSignature {
        &self.signature
    }

    /// Call with `args` and return the primary value
    pub fn call(&self, ctx: &mut ExecutionContext, args: &[Value]) -> Result<Value, RuntimeError> {
        ctx.funcall(self, args)?;
        Ok(ctx.primary_value())
    }
}

impl Callee for ForeignFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, ctx: &mut ExecutionContext, frame: CallFrame) -> Result<usize, RuntimeError> {
        let expected = self.signature.params().len();
        if frame.argc() != expected {
            return Err(FfiError::ArityMismatch {
                expected,
                got: frame.argc(),
            }
            .into());
        }

        let args = ctx.args(frame)?;
        let heap = Arc::clone(ctx.runtime().heap());
        let mut builder = ForeignCallBuilder::new();
        builder.prepare(&self.signature)?;
        for arg in &args {
            builder.push_arg(arg, heap.as_ref())?;
        }

        ctx.runtime().events().log(RuntimeEvent::ForeignCall {
            symbol: self.name.clone(),
            argc: args.len(),
        });
        let ret = self.signature.ret();
        let entry = self.entry;
        ctx.without_interrupts(|ctx| {
            let _entered = context::enter(ctx);
            // SAFETY: `new` requires the entry point to match the signature.
            unsafe { builder.execute(entry, ret) }
        })?;

        match builder.result_value(heap.as_ref())? {
            Some(value) => Ok(ctx.set_value(value)),
            None => Ok(ctx.clear_values()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::types::ForeignType;
    use crate::runtime::Runtime;
    use kiln_config::RuntimeConfig;
    use std::os::raw::{c_double, c_int};

    extern "C" fn test_add(a: c_int, b: c_int) -> c_int {
        a + b
    }

    extern "C" fn test_half(x: c_double) -> c_double {
        x / 2.0
    }

    extern "C" fn test_nothing() {}

    fn function(name: &str, f: usize, params: Vec<ForeignType>, ret: ForeignType) -> ForeignFunction {
        let sig = ForeignSignature::new(params, ret).unwrap();
        unsafe { ForeignFunction::new(name, EntryPoint::from_addr(f), sig) }
    }

    #[test]
    fn test_call_add() {
        let runtime = Runtime::init(RuntimeConfig::default()).unwrap();
        let mut ctx = ExecutionContext::new(&runtime).unwrap();
        let add = function(
            "add",
            test_add as usize,
            vec![ForeignType::Int32, ForeignType::Int32],
            ForeignType::Int32,
        );
        let result = add.call(&mut ctx, &[Value::Fixnum(2), Value::Fixnum(3)]);
        assert_eq!(result.unwrap(), Value::Fixnum(5));
        assert_eq!(ctx.value_count(), 1);
        assert!(!ctx.interrupts_disabled());
    }

    #[test]
    fn test_call_double() {
        let runtime = Runtime::init(RuntimeConfig::default()).unwrap();
        let mut ctx = ExecutionContext::new(&runtime).unwrap();
        let half = function(
            "half",
            test_half as usize,
            vec![ForeignType::Double],
            ForeignType::Double,
        );
        assert_eq!(
            half.call(&mut ctx, &[Value::Fixnum(21)]).unwrap(),
            Value::Double(10.5)
        );
    }

    #[test]
    fn test_void_reports_no_values() {
        let runtime = Runtime::init(RuntimeConfig::default()).unwrap();
        let mut ctx = ExecutionContext::new(&runtime).unwrap();
        let nothing = function("nothing", test_nothing as usize, vec![], ForeignType::Void);
        assert_eq!(ctx.funcall(&nothing, &[]).unwrap(), 0);
        assert_eq!(ctx.primary_value(), Value::Nil);
    }

    #[test]
    fn test_arity_mismatch() {
        let runtime = Runtime::init(RuntimeConfig::default()).unwrap();
        let mut ctx = ExecutionContext::new(&runtime).unwrap();
        let add = function(
            "add",
            test_add as usize,
            vec![ForeignType::Int, ForeignType::Int],
            ForeignType::Int,
        );
        let result = ctx.funcall(&add, &[Value::Fixnum(10)]);
        assert!(matches!(
            result,
            Err(RuntimeError::Ffi(FfiError::ArityMismatch {
                expected: 2,
                got: 1
            }))
        ));
        assert_eq!(ctx.frame_depth(), 0);
    }
}
