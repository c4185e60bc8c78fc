//! Runtime value representation
//!
//! Values are small `Copy` words shared by the evaluator, the bytecode
//! dispatcher and compiled closures.
//! - Nil, fixnums, floats, characters, foreign pointers: immediate values
//! - Strings, bignums, byte vectors: heap objects reached through a `Handle`
//! - `NoValue`: sentinel for reads past the reported value count

use crate::bignum::Bignum;
use crate::heap::{Collector, HeapError, ObjectTag};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of a fixnum in bits (two bits are reserved for the word tag)
pub const FIXNUM_BITS: u32 = 62;
/// Largest integer representable as a fixnum
pub const MOST_POSITIVE_FIXNUM: i64 = (1 << (FIXNUM_BITS - 1)) - 1;
/// Smallest integer representable as a fixnum
pub const MOST_NEGATIVE_FIXNUM: i64 = -(1 << (FIXNUM_BITS - 1));

/// Identity of a collector-managed object
///
/// Handles stay valid for as long as they are referenced from a frame slot,
/// the values channel or the operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(u64);

impl Handle {
    pub const fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<object {}>", self.0)
    }
}

/// A hosted-language value
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Fixnum(i64),
    Single(f32),
    Double(f64),
    Character(char),
    /// Raw foreign address
    Pointer(usize),
    Object(Handle),
    /// Returned when reading past the last value; never produced by evaluation
    NoValue,
}

impl Value {
    /// Build a fixnum, or `None` if `n` is outside the fixnum range
    pub fn fixnum(n: i64) -> Option<Value> {
        if (MOST_NEGATIVE_FIXNUM..=MOST_POSITIVE_FIXNUM).contains(&n) {
            Some(Value::Fixnum(n))
        } else {
            None
        }
    }

    /// Build an integer value, allocating a bignum when `n` does not fit a fixnum
    pub fn integer(n: i128, heap: &dyn Collector) -> Result<Value, HeapError> {
        if let Ok(small) = i64::try_from(n) {
            if let Some(v) = Value::fixnum(small) {
                return Ok(v);
            }
        }
        let handle = Bignum::from_i128(n).store(heap)?;
        Ok(Value::Object(handle))
    }

    /// Read any integer value (fixnum or bignum) as an `i128`
    ///
    /// Returns `Ok(None)` for non-integers and for bignums wider than 128 bits.
    pub fn as_integer(&self, heap: &dyn Collector) -> Result<Option<i128>, HeapError> {
        match self {
            Value::Fixnum(n) => Ok(Some(*n as i128)),
            Value::Object(h) if heap.tag_of(*h)? == ObjectTag::Bignum => {
                Ok(Bignum::load(heap, *h)?.to_i128())
            }
            _ => Ok(None),
        }
    }

    /// Read any real value as an `f64`
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Fixnum(n) => Some(*n as f64),
            Value::Single(x) => Some(*x as f64),
            Value::Double(x) => Some(*x),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// True only for the past-the-end sentinel
    pub fn is_no_value(&self) -> bool {
        matches!(self, Value::NoValue)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Fixnum(_) => "fixnum",
            Value::Single(_) => "single-float",
            Value::Double(_) => "double-float",
            Value::Character(_) => "character",
            Value::Pointer(_) => "foreign-pointer",
            Value::Object(_) => "object",
            Value::NoValue => "no-value",
        }
    }

    /// Encode as a tagged machine word for the `:object` foreign type
    ///
    /// Layout (low two bits): `00` nil (word 0), `01` fixnum, `10` character,
    /// `11` heap object. Floats, pointers and the sentinel have no word form.
    pub fn to_word(&self) -> Option<u64> {
        match self {
            Value::Nil => Some(0),
            Value::Fixnum(n) => Some(((*n as u64) << 2) | 0b01),
            Value::Character(c) => Some(((*c as u64) << 2) | 0b10),
            Value::Object(h) => {
                if h.to_raw() >> 62 != 0 {
                    None
                } else {
                    Some((h.to_raw() << 2) | 0b11)
                }
            }
            _ => None,
        }
    }

    /// Decode a word produced by [`Value::to_word`]
    pub fn from_word(word: u64) -> Option<Value> {
        match word & 0b11 {
            0b00 if word == 0 => Some(Value::Nil),
            0b00 => None,
            0b01 => Some(Value::Fixnum((word as i64) >> 2)),
            0b10 => u32::try_from(word >> 2)
                .ok()
                .and_then(char::from_u32)
                .map(Value::Character),
            _ => Some(Value::Object(Handle::from_raw(word >> 2))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Fixnum(n) => write!(f, "{}", n),
            Value::Single(x) => write!(f, "{}f0", x),
            Value::Double(x) => write!(f, "{}d0", x),
            Value::Character(c) => write!(f, "#\\{}", c),
            Value::Pointer(p) => write!(f, "#<foreign {:#x}>", p),
            Value::Object(h) => write!(f, "{}", h),
            Value::NoValue => write!(f, "#<no value>"),
        }
    }
}
