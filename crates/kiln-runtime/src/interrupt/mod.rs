//! Interrupt delivery
//!
//! Asynchronous events never run at the point they are raised. They are
//! recorded as bits in a per-context pending word and delivered as a
//! [`Condition`] at the next safe point: a frame boundary or an explicit
//! poll. Foreign calls run with delivery disabled, so nothing is delivered
//! while native code owns the thread.
//!
//! Synchronous faults (arithmetic traps, guard-region hits) are tracked
//! separately: at most one may be in flight per thread.

pub mod os;

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Floating-point and integer arithmetic traps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ArithmeticTrap {
    DivisionByZero,
    FloatingOverflow,
    FloatingUnderflow,
    FloatingInvalid,
    FloatingInexact,
}

impl ArithmeticTrap {
    const ALL: [ArithmeticTrap; 5] = [
        ArithmeticTrap::DivisionByZero,
        ArithmeticTrap::FloatingOverflow,
        ArithmeticTrap::FloatingUnderflow,
        ArithmeticTrap::FloatingInvalid,
        ArithmeticTrap::FloatingInexact,
    ];

    fn index(self) -> u32 {
        match self {
            ArithmeticTrap::DivisionByZero => 0,
            ArithmeticTrap::FloatingOverflow => 1,
            ArithmeticTrap::FloatingUnderflow => 2,
            ArithmeticTrap::FloatingInvalid => 3,
            ArithmeticTrap::FloatingInexact => 4,
        }
    }
}

impl fmt::Display for ArithmeticTrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArithmeticTrap::DivisionByZero => "division-by-zero",
            ArithmeticTrap::FloatingOverflow => "floating-point-overflow",
            ArithmeticTrap::FloatingUnderflow => "floating-point-underflow",
            ArithmeticTrap::FloatingInvalid => "floating-point-invalid-operation",
            ArithmeticTrap::FloatingInexact => "floating-point-inexact",
        };
        f.write_str(name)
    }
}

/// An interrupt that can be left pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InterruptKind {
    /// Explicit interrupt from another thread or the console
    User,
    Arithmetic(ArithmeticTrap),
}

/// Pending-word bit of a user interrupt
pub(crate) const USER_BIT: u32 = 1;

impl InterruptKind {
    pub(crate) fn bit(self) -> u32 {
        match self {
            InterruptKind::User => USER_BIT,
            InterruptKind::Arithmetic(trap) => 1 << (1 + trap.index()),
        }
    }
}

impl fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptKind::User => f.write_str("user interrupt"),
            InterruptKind::Arithmetic(trap) => write!(f, "{}", trap),
        }
    }
}

/// A synchronous fault on the owning thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    StackOverflow,
    Arithmetic(ArithmeticTrap),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::StackOverflow => f.write_str("stack overflow"),
            Fault::Arithmetic(trap) => write!(f, "{}", trap),
        }
    }
}

/// A fault raised while another is still being recovered from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleFault {
    pub first: Fault,
    pub second: Fault,
}

impl fmt::Display for DoubleFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} while recovering from {}",
            self.second, self.first
        )
    }
}

/// A delivered interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Condition {
    #[error("Interactive interrupt")]
    Interrupt,

    #[error("Arithmetic error: {0}")]
    Arithmetic(ArithmeticTrap),
}

impl From<InterruptKind> for Condition {
    fn from(kind: InterruptKind) -> Self {
        match kind {
            InterruptKind::User => Condition::Interrupt,
            InterruptKind::Arithmetic(trap) => Condition::Arithmetic(trap),
        }
    }
}

/// Cross-thread handle to a context's pending word
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    pending: Arc<AtomicU32>,
}

impl InterruptHandle {
    /// Record `kind` as pending; it is delivered at the owner's next safe point
    pub fn post(&self, kind: InterruptKind) {
        self.pending.fetch_or(kind.bit(), Ordering::AcqRel);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    pub(crate) fn pending_word(&self) -> &Arc<AtomicU32> {
        &self.pending
    }
}

/// Per-context delivery state
#[derive(Debug)]
pub struct InterruptGuard {
    pending: Arc<AtomicU32>,
    disabled: u32,
    deliver_immediately: bool,
    fault_in_flight: Option<Fault>,
}

impl InterruptGuard {
    pub fn new(deliver_immediately: bool) -> Self {
        Self {
            pending: Arc::new(AtomicU32::new(0)),
            disabled: 0,
            deliver_immediately,
            fault_in_flight: None,
        }
    }

    pub fn handle(&self) -> InterruptHandle {
        InterruptHandle {
            pending: Arc::clone(&self.pending),
        }
    }

    /// Record an interrupt raised on the owning thread
    ///
    /// Returns the interrupt when it may be delivered right away: immediate
    /// delivery is configured and interrupts are enabled.
    pub fn raise(&mut self, kind: InterruptKind) -> Option<InterruptKind> {
        self.pending.fetch_or(kind.bit(), Ordering::AcqRel);
        if self.deliver_immediately && self.disabled == 0 {
            self.poll()
        } else {
            None
        }
    }

    /// Take the highest-priority pending interrupt, if delivery is enabled
    ///
    /// Arithmetic traps are delivered before user interrupts.
    pub fn poll(&mut self) -> Option<InterruptKind> {
        if self.disabled > 0 {
            return None;
        }
        let word = self.pending.load(Ordering::Acquire);
        if word == 0 {
            return None;
        }
        let kind = ArithmeticTrap::ALL
            .iter()
            .map(|trap| InterruptKind::Arithmetic(*trap))
            .find(|kind| word & kind.bit() != 0)
            .unwrap_or(InterruptKind::User);
        self.pending.fetch_and(!kind.bit(), Ordering::AcqRel);
        if let InterruptKind::Arithmetic(trap) = kind {
            if self.fault_in_flight == Some(Fault::Arithmetic(trap)) {
                self.fault_in_flight = None;
            }
        }
        Some(kind)
    }

    /// Peek at the highest-priority pending interrupt without taking it
    pub fn peek(&self) -> Option<InterruptKind> {
        let word = self.pending.load(Ordering::Acquire);
        if word == 0 {
            return None;
        }
        ArithmeticTrap::ALL
            .iter()
            .map(|trap| InterruptKind::Arithmetic(*trap))
            .find(|kind| word & kind.bit() != 0)
            .or(Some(InterruptKind::User))
    }

    pub fn disable(&mut self) {
        self.disabled += 1;
    }

    pub fn enable(&mut self) {
        self.disabled = self.disabled.saturating_sub(1);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled > 0
    }

    /// Record a synchronous fault
    ///
    /// Arithmetic traps also become pending. A fault raised while another is
    /// in flight is returned as a [`DoubleFault`].
    pub fn signal_fault(&mut self, fault: Fault) -> Result<(), DoubleFault> {
        if let Some(first) = self.fault_in_flight {
            return Err(DoubleFault {
                first,
                second: fault,
            });
        }
        self.fault_in_flight = Some(fault);
        if let Fault::Arithmetic(trap) = fault {
            self.pending
                .fetch_or(InterruptKind::Arithmetic(trap).bit(), Ordering::AcqRel);
        }
        Ok(())
    }

    /// Stack usage fell back below the logical end
    pub fn recover_stack(&mut self) {
        if self.fault_in_flight == Some(Fault::StackOverflow) {
            self.fault_in_flight = None;
        }
    }

    pub fn fault_in_flight(&self) -> Option<Fault> {
        self.fault_in_flight
    }
}
