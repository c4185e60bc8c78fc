//! Callback trampolines - native code calling hosted functions
//!
//! A `Trampoline` is a libffi closure whose code pointer can be handed to
//! native code. When called it:
//! 1. Decodes the native arguments under its signature
//! 2. Calls the hosted callee through the frame protocol on the context
//!    that entered the enclosing foreign call
//! 3. Marshals the primary value back as the native result
//!
//! Errors cannot propagate through native frames. A failing callback returns
//! zero to its caller, logs the failure and keeps the error for
//! [`Trampoline::take_error`].

use crate::context;
use crate::error::RuntimeError;
use crate::events::{EventLogger, RuntimeEvent};
use crate::ffi::loader::EntryPoint;
use crate::ffi::marshal::MarshalContext;
use crate::ffi::types::{ForeignSignature, ForeignType, ForeignValue, Repr};
use crate::ffi::FfiError;
use crate::frame::Callee;
use crate::runtime::Runtime;
use crate::value::Value;
use libffi::low;
use libffi::middle::{Cif, Closure};
use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

struct CallbackData {
    signature: ForeignSignature,
    label: String,
    callee: Arc<dyn Callee>,
    events: Arc<dyn EventLogger>,
    /// Keeps `:cstring` results alive until the next invocation on the
    /// same thread
    returned: Mutex<HashMap<ThreadId, MarshalContext>>,
    last_error: Mutex<Option<RuntimeError>>,
}

impl CallbackData {
    fn dispatch(&self, args: *const *const c_void) -> ForeignValue {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            context::with_current(|ctx| self.run(ctx, args))
        }));
        match outcome {
            Ok(Some(Ok(value))) => value,
            Ok(Some(Err(err))) => self.fail(err),
            Ok(None) => self.fail(FfiError::NoContext.into()),
            Err(_) => {
                // Unwinding into the native caller is not an option.
                self.events.log(RuntimeEvent::Fatal {
                    message: format!("panic inside callback {}", self.label),
                });
                std::process::abort()
            }
        }
    }

    fn run(
        &self,
        ctx: &mut context::ExecutionContext,
        args: *const *const c_void,
    ) -> Result<ForeignValue, RuntimeError> {
        let heap = Arc::clone(ctx.runtime().heap());
        let decoder = MarshalContext::new();
        let mut values = Vec::with_capacity(self.signature.params().len());
        for (i, ty) in self.signature.params().iter().enumerate() {
            // SAFETY: libffi passes one argument pointer per declared
            // parameter, each valid for the parameter's size.
            let native = unsafe { ForeignValue::read_from(ty.repr(), *args.add(i) as *const u8) };
            // SAFETY: a `:cstring` argument is the native caller's string,
            // alive for the duration of this call.
            let value = unsafe { decoder.to_hosted(native, *ty, heap.as_ref())? };
            values.push(value.unwrap_or(Value::Nil));
        }

        self.events.log(RuntimeEvent::CallbackInvoked {
            signature: self.label.clone(),
        });
        ctx.funcall(self.callee.as_ref(), &values)?;

        let ret = self.signature.ret();
        if ret == ForeignType::Void {
            return Ok(ForeignValue::Void);
        }
        let mut returned = self.returned.lock().unwrap_or_else(|e| e.into_inner());
        let strings = returned.entry(thread::current().id()).or_default();
        strings.clear();
        Ok(strings.to_foreign(&ctx.primary_value(), ret, heap.as_ref())?)
    }

    fn fail(&self, err: RuntimeError) -> ForeignValue {
        self.events.log(RuntimeEvent::CallbackFailed {
            signature: self.label.clone(),
            error: err.to_string(),
        });
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
        ForeignValue::from_return_word(self.signature.ret().repr(), 0)
    }
}

/// Native result storage for one return representation
trait ReturnSlot {
    fn store(&mut self, value: ForeignValue);
}

/// Integer and pointer results fill a whole return register
impl ReturnSlot for usize {
    fn store(&mut self, value: ForeignValue) {
        *self = value.to_return_word() as usize;
    }
}

impl ReturnSlot for f32 {
    fn store(&mut self, value: ForeignValue) {
        if let ForeignValue::F32(x) = value {
            *self = x;
        }
    }
}

impl ReturnSlot for f64 {
    fn store(&mut self, value: ForeignValue) {
        if let ForeignValue::F64(x) = value {
            *self = x;
        }
    }
}

impl ReturnSlot for () {
    fn store(&mut self, _value: ForeignValue) {}
}

unsafe extern "C" fn trampoline_entry<R: ReturnSlot>(
    _cif: &low::ffi_cif,
    result: &mut R,
    args: *const *const c_void,
    data: &CallbackData,
) {
    let value = data.dispatch(args);
    result.store(value);
}

/// A native-callable entry point for a hosted function
pub struct Trampoline {
    closure: ManuallyDrop<Closure<'static>>,
    data: *mut CallbackData,
}

// SAFETY: the closure's code and the callback data are immutable after
// construction apart from the mutex-guarded fields.
unsafe impl Send for Trampoline {}
unsafe impl Sync for Trampoline {}

impl Trampoline {
    /// Build a trampoline calling `callee` for native callers of `signature`
    ///
    /// Variadic callbacks are not supported.
    pub fn new(
        runtime: &Arc<Runtime>,
        signature: ForeignSignature,
        callee: Arc<dyn Callee>,
    ) -> Result<Self, FfiError> {
        if signature.variadic_from().is_some() {
            return Err(FfiError::UnsupportedVariadic("callbacks"));
        }
        let cif = Cif::new(
            signature.params().iter().map(|ty| ty.ffi_type()),
            signature.ret().ffi_type(),
        );
        let label = format!("{} {}", callee.name(), signature);
        let data = Box::into_raw(Box::new(CallbackData {
            signature,
            label,
            callee,
            events: Arc::clone(runtime.events_handle()),
            returned: Mutex::new(HashMap::new()),
            last_error: Mutex::new(None),
        }));
        // SAFETY: `data` stays allocated until after the closure is dropped.
        let userdata: &'static CallbackData = unsafe { &*data };

        let ret = userdata.signature.ret().repr();
        let closure = match ret {
            Repr::Void => Closure::new(cif, trampoline_entry::<()>, userdata),
            Repr::F32 => Closure::new(cif, trampoline_entry::<f32>, userdata),
            Repr::F64 => Closure::new(cif, trampoline_entry::<f64>, userdata),
            _ => Closure::new(cif, trampoline_entry::<usize>, userdata),
        };
        Ok(Self {
            closure: ManuallyDrop::new(closure),
            data,
        })
    }

    /// Address to hand to native code
    pub fn code_ptr(&self) -> EntryPoint {
        EntryPoint::from_addr(*self.closure.code_ptr() as usize)
    }

    pub fn signature(&self) -> &ForeignSignature {
        // SAFETY: `data` is alive for the life of `self`.
        unsafe { &(*self.data).signature }
    }

    /// Number of `:cstring` results kept alive for each calling thread
    #[cfg(test)]
    fn kept_results(&self) -> Vec<usize> {
        // SAFETY: `data` is alive for the life of `self`.
        let data = unsafe { &*self.data };
        let returned = data.returned.lock().unwrap_or_else(|e| e.into_inner());
        returned.values().map(MarshalContext::live_strings).collect()
    }

    /// Take the error recorded by the most recent failed invocation
    pub fn take_error(&self) -> Option<RuntimeError> {
        // SAFETY: `data` is alive for the life of `self`.
        let data = unsafe { &*self.data };
        data.last_error.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        // SAFETY: the closure borrows `data`, so it goes first; nothing else
        // holds either once the trampoline is dropped.
        unsafe {
            ManuallyDrop::drop(&mut self.closure);
            drop(Box::from_raw(self.data));
        }
    }
}
