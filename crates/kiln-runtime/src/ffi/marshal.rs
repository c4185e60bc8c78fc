//! Value marshaling - hosted values ↔ native scalars
//!
//! - `MarshalContext::to_foreign()`: convert a hosted value for a declared parameter tag
//! - `MarshalContext::to_hosted()`: convert a native result back to a hosted value
//!
//! # Memory Safety
//!
//! - NUL-terminated copies made for `:cstring` arguments are owned by the
//!   context and live until `clear()` or drop
//! - Null `:cstring` results become `nil`
//! - Integer arguments are range-checked against the tag's width

use crate::bignum::Bignum;
use crate::ffi::types::{ForeignType, ForeignValue};
use crate::heap::{Collector, HeapError, ObjectTag};
use crate::value::Value;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use thiserror::Error;

/// Marshal error types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MarshalError {
    #[error("Type mismatch: {ty} expects {expected}, got {got}")]
    TypeMismatch {
        ty: ForeignType,
        expected: &'static str,
        got: &'static str,
    },

    #[error("Integer {value} out of range for {ty}")]
    OutOfRange { value: String, ty: ForeignType },

    #[error("Character {0:?} has no single-byte code")]
    CharacterOutOfRange(char),

    #[error("String has an interior NUL byte at {0}")]
    InteriorNul(usize),

    #[error("Foreign string is not valid UTF-8")]
    InvalidString,

    #[error("Word {0:#x} does not encode a value")]
    InvalidWord(u64),

    #[error(transparent)]
    Heap(#[from] HeapError),
}

/// Per-call marshaling state
///
/// Tracks the C strings handed to native code.
#[derive(Debug, Default)]
pub struct MarshalContext {
    allocated_strings: Vec<CString>,
}

impl MarshalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release the C strings of the previous call
    pub fn clear(&mut self) {
        self.allocated_strings.clear();
    }

    pub fn live_strings(&self) -> usize {
        self.allocated_strings.len()
    }

    /// Marshal a hosted value for a parameter declared as `ty`
    pub fn to_foreign(
        &mut self,
        value: &Value,
        ty: ForeignType,
        heap: &dyn Collector,
    ) -> Result<ForeignValue, MarshalError> {
        let mismatch = |expected| MarshalError::TypeMismatch {
            ty,
            expected,
            got: value.type_name(),
        };

        if ty.is_integer() {
            let n = match value {
                Value::Fixnum(n) => *n as i128,
                Value::Object(h) if heap.tag_of(*h)? == ObjectTag::Bignum => Bignum::load(heap, *h)?
                    .to_i128()
                    .ok_or_else(|| MarshalError::OutOfRange {
                        value: "bignum".to_string(),
                        ty,
                    })?,
                _ => return Err(mismatch("integer")),
            };
            return ForeignValue::from_integer(ty.repr(), n).ok_or(MarshalError::OutOfRange {
                value: n.to_string(),
                ty,
            });
        }

        match ty {
            ForeignType::Char | ForeignType::UnsignedChar => match value {
                Value::Character(c) => {
                    let code = u8::try_from(*c as u32)
                        .map_err(|_| MarshalError::CharacterOutOfRange(*c))?;
                    Ok(if ty == ForeignType::Char {
                        ForeignValue::I8(code as i8)
                    } else {
                        ForeignValue::U8(code)
                    })
                }
                _ => Err(mismatch("character")),
            },
            ForeignType::Float => value
                .as_real()
                .map(|x| ForeignValue::F32(x as f32))
                .ok_or_else(|| mismatch("real")),
            ForeignType::Double => value
                .as_real()
                .map(ForeignValue::F64)
                .ok_or_else(|| mismatch("real")),
            ForeignType::PointerVoid => match value {
                Value::Pointer(p) => Ok(ForeignValue::Pointer(*p)),
                Value::Nil => Ok(ForeignValue::Pointer(0)),
                _ => Err(mismatch("foreign pointer or nil")),
            },
            ForeignType::CString => match value {
                Value::Nil => Ok(ForeignValue::Pointer(0)),
                Value::Object(h) => {
                    let s = match heap.string(*h) {
                        Ok(s) => s,
                        Err(HeapError::WrongTag { .. }) => return Err(mismatch("string or nil")),
                        Err(e) => return Err(e.into()),
                    };
                    let c_string =
                        CString::new(s).map_err(|e| MarshalError::InteriorNul(e.nul_position()))?;
                    let ptr = c_string.as_ptr();
                    self.allocated_strings.push(c_string);
                    Ok(ForeignValue::Pointer(ptr as usize))
                }
                _ => Err(mismatch("string or nil")),
            },
            ForeignType::Object => value
                .to_word()
                .map(ForeignValue::U64)
                .ok_or_else(|| mismatch("fixnum, character, nil or object")),
            _ => Err(mismatch("no value")),
        }
    }

    /// Marshal a native result declared as `ty`; `None` for `:void`
    ///
    /// # Safety
    ///
    /// For `:cstring`, a non-null pointer must reference a NUL-terminated
    /// string that stays valid for the duration of the call.
    pub unsafe fn to_hosted(
        &self,
        raw: ForeignValue,
        ty: ForeignType,
        heap: &dyn Collector,
    ) -> Result<Option<Value>, MarshalError> {
        if ty == ForeignType::Void {
            return Ok(None);
        }
        if ty.is_integer() {
            let n = raw.as_integer().unwrap_or(0);
            return Ok(Some(Value::integer(n, heap)?));
        }
        let value = match (ty, raw) {
            (ForeignType::Char, ForeignValue::I8(b)) => Value::Character(char::from(b as u8)),
            (ForeignType::UnsignedChar, ForeignValue::U8(b)) => Value::Character(char::from(b)),
            (ForeignType::Float, ForeignValue::F32(x)) => Value::Single(x),
            (ForeignType::Double, ForeignValue::F64(x)) => Value::Double(x),
            (ForeignType::PointerVoid, ForeignValue::Pointer(p)) => Value::Pointer(p),
            (ForeignType::CString, ForeignValue::Pointer(0)) => Value::Nil,
            (ForeignType::CString, ForeignValue::Pointer(p)) => {
                let s = CStr::from_ptr(p as *const c_char)
                    .to_str()
                    .map_err(|_| MarshalError::InvalidString)?;
                Value::Object(heap.make_string(s)?)
            }
            (ForeignType::Object, ForeignValue::U64(word)) => {
                Value::from_word(word).ok_or(MarshalError::InvalidWord(word))?
            }
            (ty, raw) => {
                // Representation disagrees with the tag: reinterpret the bits
                let narrowed = ForeignValue::from_return_word(ty.repr(), raw.to_return_word());
                return self.to_hosted(narrowed, ty, heap);
            }
        };
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ArenaHeap;
    use rstest::rstest;

    #[rstest]
    #[case(ForeignType::Int, Value::Fixnum(42), ForeignValue::I32(42))]
    #[case(ForeignType::UnsignedByte, Value::Fixnum(255), ForeignValue::U8(255))]
    #[case(ForeignType::Int16, Value::Fixnum(-300), ForeignValue::I16(-300))]
    #[case(ForeignType::Char, Value::Character('A'), ForeignValue::I8(65))]
    #[case(ForeignType::UnsignedChar, Value::Character('é'), ForeignValue::U8(0xe9))]
    #[case(ForeignType::Double, Value::Fixnum(3), ForeignValue::F64(3.0))]
    #[case(ForeignType::Float, Value::Double(0.5), ForeignValue::F32(0.5))]
    #[case(ForeignType::PointerVoid, Value::Nil, ForeignValue::Pointer(0))]
    #[case(ForeignType::PointerVoid, Value::Pointer(0x1000), ForeignValue::Pointer(0x1000))]
    #[case(ForeignType::Object, Value::Fixnum(1), ForeignValue::U64(0b101))]
    fn test_marshal_argument(
        #[case] ty: ForeignType,
        #[case] value: Value,
        #[case] expected: ForeignValue,
    ) {
        let heap = ArenaHeap::new();
        let mut ctx = MarshalContext::new();
        assert_eq!(ctx.to_foreign(&value, ty, &heap).unwrap(), expected);
    }

    #[test]
    fn test_integer_out_of_range() {
        let heap = ArenaHeap::new();
        let mut ctx = MarshalContext::new();
        let err = ctx
            .to_foreign(&Value::Fixnum(256), ForeignType::Uint8, &heap)
            .unwrap_err();
        assert_eq!(err.to_string(), "Integer 256 out of range for :uint8-t");
    }

    #[test]
    fn test_bignum_argument() {
        let heap = ArenaHeap::new();
        let mut ctx = MarshalContext::new();
        let big = Value::integer(u64::MAX as i128, &heap).unwrap();
        assert_eq!(
            ctx.to_foreign(&big, ForeignType::Uint64, &heap).unwrap(),
            ForeignValue::U64(u64::MAX)
        );
        assert!(matches!(
            ctx.to_foreign(&big, ForeignType::Int64, &heap),
            Err(MarshalError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_character_needs_single_byte() {
        let heap = ArenaHeap::new();
        let mut ctx = MarshalContext::new();
        assert_eq!(
            ctx.to_foreign(&Value::Character('λ'), ForeignType::Char, &heap),
            Err(MarshalError::CharacterOutOfRange('λ'))
        );
    }

    #[test]
    fn test_type_mismatch() {
        let heap = ArenaHeap::new();
        let mut ctx = MarshalContext::new();
        let s = Value::Object(heap.make_string("x").unwrap());
        assert!(matches!(
            ctx.to_foreign(&s, ForeignType::Int, &heap),
            Err(MarshalError::TypeMismatch { expected: "integer", got: "object", .. })
        ));
        assert!(matches!(
            ctx.to_foreign(&Value::Fixnum(1), ForeignType::CString, &heap),
            Err(MarshalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_cstring_kept_alive() {
        let heap = ArenaHeap::new();
        let mut ctx = MarshalContext::new();
        let s = Value::Object(heap.make_string("hello").unwrap());
        let ForeignValue::Pointer(ptr) = ctx.to_foreign(&s, ForeignType::CString, &heap).unwrap()
        else {
            panic!("expected pointer");
        };
        assert_eq!(ctx.live_strings(), 1);
        let text = unsafe { CStr::from_ptr(ptr as *const c_char) };
        assert_eq!(text.to_str().unwrap(), "hello");
        ctx.clear();
        assert_eq!(ctx.live_strings(), 0);
    }

    #[test]
    fn test_cstring_interior_nul() {
        let heap = ArenaHeap::new();
        let mut ctx = MarshalContext::new();
        let s = Value::Object(heap.make_string("a\0b").unwrap());
        assert_eq!(
            ctx.to_foreign(&s, ForeignType::CString, &heap),
            Err(MarshalError::InteriorNul(1))
        );
    }

    #[test]
    fn test_results() {
        let heap = ArenaHeap::new();
        let ctx = MarshalContext::new();
        unsafe {
            assert_eq!(
                ctx.to_hosted(ForeignValue::I32(5), ForeignType::Int32, &heap).unwrap(),
                Some(Value::Fixnum(5))
            );
            assert_eq!(
                ctx.to_hosted(ForeignValue::Void, ForeignType::Void, &heap).unwrap(),
                None
            );
            assert_eq!(
                ctx.to_hosted(ForeignValue::U8(b'z'), ForeignType::UnsignedChar, &heap)
                    .unwrap(),
                Some(Value::Character('z'))
            );
            assert_eq!(
                ctx.to_hosted(ForeignValue::Pointer(0), ForeignType::CString, &heap)
                    .unwrap(),
                Some(Value::Nil)
            );
        }
    }

    #[test]
    fn test_wide_result_becomes_bignum() {
        let heap = ArenaHeap::new();
        let ctx = MarshalContext::new();
        let v = unsafe {
            ctx.to_hosted(ForeignValue::U64(u64::MAX), ForeignType::Uint64, &heap)
                .unwrap()
                .unwrap()
        };
        assert!(matches!(v, Value::Object(_)));
        assert_eq!(v.as_integer(&heap).unwrap(), Some(u64::MAX as i128));
    }

    #[test]
    fn test_cstring_result_copied_to_heap() {
        let heap = ArenaHeap::new();
        let ctx = MarshalContext::new();
        let native = CString::new("from C").unwrap();
        let v = unsafe {
            ctx.to_hosted(
                ForeignValue::Pointer(native.as_ptr() as usize),
                ForeignType::CString,
                &heap,
            )
            .unwrap()
            .unwrap()
        };
        let Value::Object(h) = v else {
            panic!("expected string object");
        };
        assert_eq!(heap.string(h).unwrap(), "from C");
    }
}
