//! Multiple-values channel
//!
//! A fixed-capacity buffer per context. Callees write 0..K values and report
//! K; callers read the primary value or up to K values explicitly. The same
//! buffer backs the arguments of small frames, so every write that can
//! clobber those arguments advances the epoch.

use crate::frame::FrameError;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct MultipleValues {
    slots: Box<[Value]>,
    count: usize,
    epoch: u64,
}

impl MultipleValues {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: vec![Value::Nil; limit.max(1)].into_boxed_slice(),
            count: 0,
            epoch: 0,
        }
    }

    /// Replace the reported values with `values`
    pub fn set(&mut self, values: &[Value]) -> Result<usize, FrameError> {
        if values.len() > self.slots.len() {
            return Err(FrameError::TooManyValues {
                count: values.len(),
                limit: self.slots.len(),
            });
        }
        self.slots[..values.len()].copy_from_slice(values);
        self.count = values.len();
        self.epoch += 1;
        Ok(self.count)
    }

    /// Report exactly one value
    pub fn set_single(&mut self, value: Value) {
        self.slots[0] = value;
        self.count = 1;
        self.epoch += 1;
    }

    /// Report zero values
    pub fn clear(&mut self) {
        self.count = 0;
        self.epoch += 1;
    }

    /// The conventional primary value, `Nil` when no values were reported
    pub fn primary(&self) -> Value {
        if self.count == 0 {
            Value::Nil
        } else {
            self.slots[0]
        }
    }

    /// Value `index`, or `NoValue` past the reported count
    pub fn get(&self, index: usize) -> Value {
        if index < self.count {
            self.slots[index]
        } else {
            Value::NoValue
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.slots[..self.count]
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Claim slots `0..argc` for a new frame's arguments
    pub(crate) fn begin_frame(&mut self, argc: usize) -> u64 {
        self.slots[..argc].fill(Value::Nil);
        self.count = 0;
        self.epoch += 1;
        self.epoch
    }

    pub(crate) fn slot(&self, index: usize) -> Value {
        self.slots[index]
    }

    pub(crate) fn set_slot(&mut self, index: usize, value: Value) {
        self.slots[index] = value;
    }
}
