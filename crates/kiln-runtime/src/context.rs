//! Execution contexts
//!
//! One `ExecutionContext` per OS thread. It owns the operand stack, the
//! multiple-values buffer, the frame chain and the interrupt guard; nothing
//! in it is touched from another thread. Other threads reach a context only
//! through its [`InterruptHandle`].

use crate::error::{fatal, RuntimeError};
use crate::events::{EventLogger, RuntimeEvent};
use crate::frame::{CallFrame, Callee, FrameBase, FrameDispatcher, FrameError, FrameRecord, FrameState, MultipleValues};
use crate::interrupt::{ArithmeticTrap, Condition, Fault, InterruptGuard, InterruptHandle, InterruptKind};
use crate::runtime::Runtime;
use crate::stack::{OperandStack, StackExhausted};
use crate::value::Value;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

/// Identity of a context within its runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub(crate) u64);

impl ContextId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context {}", self.0)
    }
}

/// Frame and stack usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounters {
    pub buffer_frames: u64,
    pub stack_frames: u64,
    pub stack_reservations: u64,
    pub stack_releases: u64,
}

thread_local! {
    static CURRENT: Cell<*mut ExecutionContext> = Cell::new(std::ptr::null_mut());
}

/// Marks a context as the thread's current one until dropped
pub(crate) struct Entered {
    previous: *mut ExecutionContext,
}

/// Make `ctx` reachable from callbacks running on this thread
pub(crate) fn enter(ctx: &mut ExecutionContext) -> Entered {
    let previous = CURRENT.with(|current| current.replace(ctx as *mut ExecutionContext));
    Entered { previous }
}

impl Drop for Entered {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(self.previous));
    }
}

/// Run `f` on the context that entered a foreign call on this thread
pub(crate) fn with_current<R>(f: impl FnOnce(&mut ExecutionContext) -> R) -> Option<R> {
    let ptr = CURRENT.with(Cell::get);
    if ptr.is_null() {
        return None;
    }
    // SAFETY: the pointer was published by `enter` from a live `&mut`
    // borrow, and that borrow is suspended inside the foreign call that is
    // now calling back. Contexts are `!Send`, so this is the owning thread.
    Some(f(unsafe { &mut *ptr }))
}

/// Per-thread execution state
pub struct ExecutionContext {
    id: ContextId,
    runtime: Arc<Runtime>,
    stack: OperandStack,
    values: MultipleValues,
    frames: Vec<FrameRecord>,
    next_serial: u64,
    small_call_threshold: usize,
    call_arguments_limit: usize,
    guard: InterruptGuard,
    buffer_frames: u64,
    stack_frames: u64,
    _not_send: PhantomData<Rc<()>>,
}

impl ExecutionContext {
    /// Create a context for the calling thread and install its guard
    pub fn new(runtime: &Arc<Runtime>) -> Result<Self, RuntimeError> {
        let config = runtime.config();
        let stack = OperandStack::new(
            config.operand_stack_slots(),
            config.guard_slots(),
            config.guard_page(),
        )?;
        let guard = InterruptGuard::new(config.deliver_immediately());
        let id = runtime.register_context(guard.handle())?;

        let events = runtime.events();
        events.log(RuntimeEvent::ContextCreated {
            context: id.0,
            stack_slots: stack.capacity(),
        });
        events.log(RuntimeEvent::GuardInstalled {
            context: id.0,
            guard_slots: stack.guard_slots(),
            protected: stack.is_protected(),
        });

        if config.signal_handlers() {
            runtime.route_console_interrupt(id, &guard.handle());
        }

        Ok(Self {
            id,
            runtime: Arc::clone(runtime),
            stack,
            values: MultipleValues::new(config.multiple_values_limit()),
            frames: Vec::new(),
            next_serial: 0,
            small_call_threshold: config.small_call_threshold(),
            call_arguments_limit: config.call_arguments_limit(),
            guard,
            buffer_frames: 0,
            stack_frames: 0,
            _not_send: PhantomData,
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn events(&self) -> &dyn EventLogger {
        self.runtime.events()
    }

    // Frames

    /// Open a frame for `argc` arguments, all initialized to `Nil`
    pub fn open_frame(&mut self, argc: usize) -> Result<CallFrame, FrameError> {
        if argc > self.call_arguments_limit {
            return Err(FrameError::TooManyArguments {
                argc,
                limit: self.call_arguments_limit,
            });
        }

        let stack_mark = self.stack.top();
        let (base, epoch) = if argc < self.small_call_threshold {
            let epoch = self.values.begin_frame(argc);
            self.buffer_frames += 1;
            (FrameBase::Values, epoch)
        } else {
            let offset = match self.stack.reserve(argc) {
                Ok(offset) => offset,
                Err(exhausted) => return Err(self.stack_exhausted(exhausted)),
            };
            self.stack_frames += 1;
            (FrameBase::Stack { offset }, self.values.epoch())
        };

        let serial = self.next_serial;
        self.next_serial += 1;
        let index = self.frames.len();
        self.frames.push(FrameRecord {
            serial,
            state: FrameState::Open,
            stack_mark,
        });
        Ok(CallFrame {
            index,
            serial,
            argc,
            base,
            epoch,
        })
    }

    /// Open a frame and copy `args` into it
    pub fn open_frame_with(&mut self, args: &[Value]) -> Result<CallFrame, FrameError> {
        let frame = self.open_frame(args.len())?;
        for (index, value) in args.iter().enumerate() {
            self.write_slot(frame, index, *value);
        }
        Ok(frame)
    }

    fn stack_exhausted(&mut self, exhausted: StackExhausted) -> FrameError {
        match exhausted {
            StackExhausted::Overflow {
                requested,
                available,
            } => {
                if let Err(double) = self.guard.signal_fault(Fault::StackOverflow) {
                    fatal(self.events(), double.to_string());
                }
                self.events().log(RuntimeEvent::StackOverflow {
                    context: self.id.0,
                    requested,
                    available,
                });
                FrameError::StackOverflow {
                    requested,
                    available,
                }
            }
            StackExhausted::Exhausted {
                requested,
                available,
            } => fatal(
                self.events(),
                format!(
                    "operand stack exhausted on {}: requested {} slots with {} left in the safety area",
                    self.id, requested, available
                ),
            ),
        }
    }

    /// Close the innermost frame
    ///
    /// Closing any other frame, or closing twice, means the frame chain is
    /// corrupted and is fatal.
    pub fn close_frame(&mut self, frame: CallFrame) {
        let innermost = self.frames.len().checked_sub(1);
        match self.frames.get(frame.index) {
            Some(record) if record.serial == frame.serial => {
                if innermost != Some(frame.index) {
                    fatal(
                        self.events(),
                        format!(
                            "frame {} closed with {} inner frames still open on {}",
                            frame.serial,
                            self.frames.len() - frame.index - 1,
                            self.id
                        ),
                    );
                }
            }
            _ => fatal(
                self.events(),
                format!("frame {} closed twice on {}", frame.serial, self.id),
            ),
        }

        if let Some(record) = self.frames.pop() {
            if let FrameBase::Stack { .. } = frame.base {
                self.stack.release_to(record.stack_mark);
            }
        }
        self.settle_stack();
    }

    /// End stack-overflow recovery once usage is back below the logical end
    fn settle_stack(&mut self) {
        self.stack.settle();
        if !self.stack.is_safety_open() {
            self.guard.recover_stack();
        }
    }

    fn record(&self, frame: CallFrame) -> Result<&FrameRecord, FrameError> {
        self.frames
            .get(frame.index)
            .filter(|record| record.serial == frame.serial)
            .ok_or(FrameError::Closed {
                serial: frame.serial,
            })
    }

    /// Mark a frame as running its callee
    pub fn activate(&mut self, frame: CallFrame) -> Result<(), FrameError> {
        self.record(frame)?;
        self.frames[frame.index].state = FrameState::Active;
        Ok(())
    }

    pub fn frame_state(&self, frame: CallFrame) -> FrameState {
        self.record(frame)
            .map_or(FrameState::Closed, |record| record.state)
    }

    /// Number of open frames
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    fn check_access(&self, frame: CallFrame, index: usize) -> Result<(), FrameError> {
        self.record(frame)?;
        if index >= frame.argc {
            return Err(FrameError::ArgumentIndex {
                index,
                argc: frame.argc,
            });
        }
        if frame.base == FrameBase::Values && frame.epoch != self.values.epoch() {
            return Err(FrameError::Stale {
                serial: frame.serial,
            });
        }
        Ok(())
    }

    fn read_slot(&self, frame: CallFrame, index: usize) -> Value {
        match frame.base {
            FrameBase::Values => self.values.slot(index),
            FrameBase::Stack { offset } => self.stack.get(offset + index).unwrap_or(Value::Nil),
        }
    }

    fn write_slot(&mut self, frame: CallFrame, index: usize, value: Value) {
        match frame.base {
            FrameBase::Values => self.values.set_slot(index, value),
            FrameBase::Stack { offset } => {
                self.stack.set(offset + index, value);
            }
        }
    }

    pub fn arg(&self, frame: CallFrame, index: usize) -> Result<Value, FrameError> {
        self.check_access(frame, index)?;
        Ok(self.read_slot(frame, index))
    }

    pub fn set_arg(&mut self, frame: CallFrame, index: usize, value: Value) -> Result<(), FrameError> {
        self.check_access(frame, index)?;
        self.write_slot(frame, index, value);
        Ok(())
    }

    /// Copy out all arguments of `frame`
    pub fn args(&self, frame: CallFrame) -> Result<Vec<Value>, FrameError> {
        if frame.argc == 0 {
            self.record(frame)?;
            return Ok(Vec::new());
        }
        self.check_access(frame, 0)?;
        Ok((0..frame.argc).map(|i| self.read_slot(frame, i)).collect())
    }

    // Multiple values

    /// Report `values` as the result of the running call
    pub fn set_values(&mut self, values: &[Value]) -> Result<usize, FrameError> {
        self.values.set(values)
    }

    /// Report exactly one value
    pub fn set_value(&mut self, value: Value) -> usize {
        self.values.set_single(value);
        1
    }

    /// Report no values
    pub fn clear_values(&mut self) -> usize {
        self.values.clear();
        0
    }

    pub fn primary_value(&self) -> Value {
        self.values.primary()
    }

    pub fn value(&self, index: usize) -> Value {
        self.values.get(index)
    }

    pub fn value_count(&self) -> usize {
        self.values.count()
    }

    pub fn values(&self) -> &[Value] {
        self.values.as_slice()
    }

    // Operand stack

    pub fn stack_top(&self) -> usize {
        self.stack.top()
    }

    pub fn stack_peak(&self) -> usize {
        self.stack.peak()
    }

    pub fn stack(&self) -> &OperandStack {
        &self.stack
    }

    pub fn counters(&self) -> FrameCounters {
        FrameCounters {
            buffer_frames: self.buffer_frames,
            stack_frames: self.stack_frames,
            stack_reservations: self.stack.reservations(),
            stack_releases: self.stack.releases(),
        }
    }

    pub fn small_call_threshold(&self) -> usize {
        self.small_call_threshold
    }

    // Interrupts

    /// Deliver the highest-priority pending interrupt, if delivery is enabled
    pub fn safe_point(&mut self) -> Result<(), Condition> {
        self.settle_stack();
        match self.guard.poll() {
            Some(kind) => Err(self.delivered(kind)),
            None => Ok(()),
        }
    }

    fn delivered(&self, kind: InterruptKind) -> Condition {
        self.events().log(RuntimeEvent::InterruptDelivered {
            context: self.id.0,
            kind: kind.to_string(),
        });
        kind.into()
    }

    /// Raise an interrupt on this context from its own thread
    ///
    /// Delivered at once only when configured for immediate delivery and
    /// interrupts are enabled; otherwise left pending for the next safe point.
    pub fn raise_interrupt(&mut self, kind: InterruptKind) -> Result<(), Condition> {
        if let Some(kind) = self.guard.raise(kind) {
            return Err(self.delivered(kind));
        }
        let event = if self.guard.is_disabled() {
            RuntimeEvent::InterruptDeferred {
                context: self.id.0,
                kind: kind.to_string(),
            }
        } else {
            RuntimeEvent::InterruptPosted {
                context: self.id.0,
                kind: kind.to_string(),
            }
        };
        self.events().log(event);
        Ok(())
    }

    /// Record an arithmetic trap taken by code running on this context
    ///
    /// A trap taken while another fault is still being recovered is fatal.
    pub fn signal_trap(&mut self, trap: ArithmeticTrap) -> Result<(), Condition> {
        if let Err(double) = self.guard.signal_fault(Fault::Arithmetic(trap)) {
            fatal(self.events(), double.to_string());
        }
        if self.runtime.config().deliver_immediately() {
            self.safe_point()
        } else {
            Ok(())
        }
    }

    /// Run `f` with interrupt delivery disabled; regions nest
    pub fn without_interrupts<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.guard.disable();
        let result = f(self);
        self.guard.enable();
        result
    }

    pub fn interrupts_disabled(&self) -> bool {
        self.guard.is_disabled()
    }

    pub fn pending_interrupt(&self) -> Option<InterruptKind> {
        self.guard.peek()
    }

    pub fn fault_in_flight(&self) -> Option<Fault> {
        self.guard.fault_in_flight()
    }

    /// Handle for posting interrupts from other threads
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.guard.handle()
    }

    /// Call `callee` through the frame protocol
    pub fn funcall(&mut self, callee: &dyn Callee, args: &[Value]) -> Result<usize, RuntimeError> {
        FrameDispatcher::funcall(self, callee, args)
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        let events = self.runtime.events();
        events.log(RuntimeEvent::GuardRemoved { context: self.id.0 });
        events.log(RuntimeEvent::ContextDestroyed { context: self.id.0 });
        self.runtime.unregister_context(self.id);
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("frames", &self.frames.len())
            .field("stack_top", &self.stack.top())
            .field("values", &self.values.count())
            .finish()
    }
}
