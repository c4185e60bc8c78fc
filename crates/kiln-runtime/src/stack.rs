//! Operand stack
//!
//! A fixed block of value slots with a logical end `guard_slots` short of
//! its real end. Growth is checked against the logical end; crossing it opens
//! the safety area (the slots between the logical and real end) so recovery
//! code can still run, and the area closes again once usage drops back below
//! the logical end. A no-access page sits past the real end where the
//! platform allows it.

use crate::interrupt::os::GuardedRegion;
use crate::value::Value;
use std::io;
use std::mem;

/// Reservation refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackExhausted {
    /// Crossed the logical end; the safety area is now open
    Overflow { requested: usize, available: usize },
    /// Crossed the real end with the safety area already open
    Exhausted { requested: usize, available: usize },
}

pub struct OperandStack {
    region: GuardedRegion,
    capacity: usize,
    logical_end: usize,
    safety_open: bool,
    top: usize,
    peak: usize,
    reservations: u64,
    releases: u64,
}

impl OperandStack {
    pub fn new(slots: usize, guard_slots: usize, protect: bool) -> io::Result<Self> {
        if guard_slots >= slots {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "guard slots must be fewer than stack slots",
            ));
        }
        let bytes = slots
            .checked_mul(mem::size_of::<Value>())
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(Self {
            region: GuardedRegion::new(bytes, protect)?,
            capacity: slots,
            logical_end: slots - guard_slots,
            safety_open: false,
            top: 0,
            peak: 0,
            reservations: 0,
            releases: 0,
        })
    }

    fn slots(&self) -> *mut Value {
        self.region.as_ptr() as *mut Value
    }

    fn limit(&self) -> usize {
        if self.safety_open {
            self.capacity
        } else {
            self.logical_end
        }
    }

    /// Reserve `n` slots on top, initialized to `Nil`; returns their offset
    pub fn reserve(&mut self, n: usize) -> Result<usize, StackExhausted> {
        let available = self.limit() - self.top;
        if n > available {
            if self.safety_open {
                return Err(StackExhausted::Exhausted {
                    requested: n,
                    available,
                });
            }
            self.safety_open = true;
            return Err(StackExhausted::Overflow {
                requested: n,
                available,
            });
        }
        let offset = self.top;
        for i in offset..offset + n {
            // SAFETY: i < limit <= capacity, inside the region.
            unsafe { self.slots().add(i).write(Value::Nil) };
        }
        self.top += n;
        self.peak = self.peak.max(self.top);
        self.reservations += 1;
        Ok(offset)
    }

    /// Drop everything at and above `offset`
    ///
    /// Returns true if this closed the safety area.
    pub fn release_to(&mut self, offset: usize) -> bool {
        if offset < self.top {
            self.top = offset;
            self.releases += 1;
        }
        self.settle()
    }

    /// Close the safety area if usage is back below the logical end
    ///
    /// Returns true if this closed it.
    pub fn settle(&mut self) -> bool {
        if self.safety_open && self.top < self.logical_end {
            self.safety_open = false;
            return true;
        }
        false
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        if index < self.top {
            // SAFETY: slots below top were initialized by `reserve`.
            Some(unsafe { self.slots().add(index).read() })
        } else {
            None
        }
    }

    pub fn set(&mut self, index: usize, value: Value) -> bool {
        if index < self.top {
            // SAFETY: index < top <= capacity.
            unsafe { self.slots().add(index).write(value) };
            true
        } else {
            false
        }
    }

    /// High-water mark: number of slots in use
    pub fn top(&self) -> usize {
        self.top
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn logical_end(&self) -> usize {
        self.logical_end
    }

    pub fn guard_slots(&self) -> usize {
        self.capacity - self.logical_end
    }

    pub fn is_safety_open(&self) -> bool {
        self.safety_open
    }

    pub fn is_protected(&self) -> bool {
        self.region.is_protected()
    }

    pub fn reservations(&self) -> u64 {
        self.reservations
    }

    pub fn releases(&self) -> u64 {
        self.releases
    }
}
